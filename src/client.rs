//! Client endpoint.
//!
//! Connects a single link to a server, registers commands and subscribers
//! the same way the server does, and adds request/response correlation on
//! top of the shared dispatch machinery:
//!
//! ```ignore
//! use framewire::{Client, NetConfig};
//! use framewire::transport::tcp::TcpTransport;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = Client::new(NetConfig::default());
//!     assert!(client.connect(&TcpTransport, "127.0.0.1", 7000).await);
//!     let pong = client
//!         .ping(b"are you there", Duration::from_secs(1))
//!         .await
//!         .unwrap();
//!     assert_eq!(&pong[..], b"are you there");
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::codec::WireMessage;
use crate::config::NetConfig;
use crate::connection::{
    close_writer, dispatch_loop_client, receive_loop, ConnState, Link, FRAME_QUEUE_DEPTH,
};
use crate::dispatch::{Delivery, DispatchTable, SubscriberId};
use crate::error::{DisconnectReason, NetError, RequestError, Result, SendError};
use crate::pool::{self, EventPool};
use crate::protocol::wire::{is_reserved_command, CMD_CONNECT, CMD_DISCONNECT, CMD_PING};
use crate::protocol::Reassembler;
use crate::response::ResponseRouter;
use crate::ring::RingBuffer;
use crate::transport::Connector;
use crate::writer::{spawn_writer_task, WriterConfig};

type DisconnectHandler = Arc<dyn Fn(DisconnectReason) + Send + Sync>;

struct Session {
    link: Link,
    shutdown: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

struct ClientInner {
    config: NetConfig,
    dispatch: Arc<DispatchTable>,
    router: Arc<ResponseRouter>,
    events: EventPool,
    state: Arc<ConnState>,
    session: Mutex<Option<Session>>,
    pending_reason: Mutex<Option<DisconnectReason>>,
    disconnected_handlers: Mutex<Vec<DisconnectHandler>>,
}

/// Single-link client endpoint.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client with the given configuration.
    pub fn new(config: NetConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                dispatch: Arc::new(DispatchTable::with_capacity(
                    config.initial_callback_table_size,
                )),
                router: Arc::new(ResponseRouter::new()),
                events: EventPool::with_capacity(config.pooled_buffer_count),
                state: Arc::new(ConnState::new()),
                session: Mutex::new(None),
                pending_reason: Mutex::new(None),
                disconnected_handlers: Mutex::new(Vec::new()),
                config,
            }),
        }
    }

    /// Register a user command with `M`'s decoder. Idempotent.
    pub fn add_command<M: WireMessage>(&self, command: u16) -> Result<()> {
        self.inner.dispatch.add_command::<M>(command)
    }

    /// Remove a command and its subscribers.
    pub fn remove_command(&self, command: u16) -> bool {
        self.inner.dispatch.remove_command(command)
    }

    /// Subscribe to a registered command.
    pub fn add_subscriber<M, F, Fut>(&self, command: u16, handler: F) -> Result<SubscriberId>
    where
        M: WireMessage,
        F: Fn(Delivery<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.dispatch.add_subscriber::<M, F, Fut>(command, handler)
    }

    /// Remove a subscriber by its token.
    pub fn remove_subscriber(&self, command: u16, id: SubscriberId) -> bool {
        self.inner.dispatch.remove_subscriber(command, id)
    }

    /// Subscribe to the at-most-once disconnect notification.
    pub fn on_disconnected(&self, handler: impl Fn(DisconnectReason) + Send + Sync + 'static) {
        self.inner.disconnected_handlers.lock().push(Arc::new(handler));
    }

    /// Whether a live session exists.
    pub fn is_connected(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    /// Connect to a server and complete the CONNECT handshake.
    ///
    /// Returns true on success (or when already connected); false when the
    /// transport or the handshake fails.
    pub async fn connect<C: Connector + ?Sized>(&self, connector: &C, host: &str, port: u16) -> bool {
        if self.is_connected() {
            return true;
        }
        let stream = match connector.connect(host, port).await {
            Ok(s) => s,
            Err(e) => {
                error!(host, port, error = %e, "transport connect failed");
                return false;
            }
        };

        self.inner.state.activate();
        *self.inner.pending_reason.lock() = None;

        let (read_half, write_half) = tokio::io::split(stream);
        let (writer_handle, writer_task) = spawn_writer_task(write_half, WriterConfig::default());
        let link = Link::new(
            Arc::clone(&self.inner.state),
            writer_handle.clone(),
            self.inner.events.clone(),
            self.inner.config.max_packet_size,
        );

        let ring = RingBuffer::with_capacity(self.inner.config.effective_ring_capacity());
        let reassembler = Reassembler::new(self.inner.config.max_packet_size, pool::global());
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reader = tokio::spawn(receive_loop(
            read_half,
            Arc::clone(&self.inner.state),
            shutdown_rx,
            ring,
            reassembler,
            frame_tx,
        ));

        let supervisor = tokio::spawn(supervise(
            Arc::clone(&self.inner),
            link.clone(),
            frame_rx,
            reader,
            writer_handle,
            writer_task,
        ));

        *self.inner.session.lock() = Some(Session {
            link: link.clone(),
            shutdown: shutdown_tx,
            supervisor,
        });

        // CONNECT handshake: request/response over the system command
        let id = self.inner.router.allocate();
        let rx = self.inner.router.register(id);
        if link.send(CMD_CONNECT, &[], id).await.is_err() {
            self.disconnect(DisconnectReason::Error).await;
            return false;
        }
        match tokio::time::timeout(self.inner.config.close_timeout(), rx).await {
            Ok(Ok(Ok(_))) => {
                info!(host, port, "connected");
                true
            }
            _ => {
                self.inner.router.cancel(id);
                error!(host, port, "handshake failed");
                self.disconnect(DisconnectReason::Error).await;
                false
            }
        }
    }

    /// Tear the session down. Idempotent; sends a best-effort DISCONNECT
    /// frame, clears the state bits, shuts the transport down within the
    /// close timeout, and drains pending waiters with `Aborted`.
    pub async fn disconnect(&self, reason: DisconnectReason) {
        let session = { self.inner.session.lock().take() };
        let Some(session) = session else {
            return;
        };
        *self.inner.pending_reason.lock() = Some(reason);

        if reason == DisconnectReason::Graceful {
            let _ = session.link.send(CMD_DISCONNECT, &[], 0).await;
        }
        self.inner.state.clear_all();
        let _ = session.shutdown.send(true);
        let _ = tokio::time::timeout(self.inner.config.close_timeout(), session.supervisor).await;
    }

    /// Fire-and-forget send on a user command.
    pub async fn send(&self, command: u16, payload: &[u8]) -> std::result::Result<(), SendError> {
        if is_reserved_command(command) {
            return Err(SendError::Invalid);
        }
        let Some(link) = self.link() else {
            return Err(SendError::Disposed);
        };
        link.send(command, payload, 0).await
    }

    /// Typed overload of [`Client::send`].
    pub async fn send_message<M: WireMessage>(&self, command: u16, message: &M) -> Result<()> {
        let payload = message.encode()?;
        self.send(command, &payload).await.map_err(NetError::Send)
    }

    /// Send a request on a user command and wait for its correlated
    /// response payload.
    pub async fn send_request_raw(
        &self,
        command: u16,
        payload: &[u8],
        timeout: Duration,
    ) -> std::result::Result<Bytes, RequestError> {
        if is_reserved_command(command) {
            return Err(RequestError::Send(SendError::Invalid));
        }
        self.request(command, payload, timeout).await
    }

    /// Typed request/response: encode `M`, decode the response as `R`.
    ///
    /// A response whose payload does not decode as `R` surfaces as
    /// [`RequestError::Decode`].
    pub async fn send_request<M: WireMessage, R: WireMessage>(
        &self,
        command: u16,
        message: &M,
        timeout: Duration,
    ) -> Result<R> {
        let payload = message.encode()?;
        let response = self
            .send_request_raw(command, &payload, timeout)
            .await
            .map_err(NetError::Request)?;
        R::decode(&response).map_err(|_| NetError::Request(RequestError::Decode))
    }

    /// Round-trip an echo probe through the server.
    pub async fn ping(
        &self,
        payload: &[u8],
        timeout: Duration,
    ) -> std::result::Result<Bytes, RequestError> {
        self.request(CMD_PING, payload, timeout).await
    }

    async fn request(
        &self,
        command: u16,
        payload: &[u8],
        timeout: Duration,
    ) -> std::result::Result<Bytes, RequestError> {
        let Some(link) = self.link() else {
            return Err(RequestError::Aborted);
        };
        let id = self.inner.router.allocate();
        let rx = self.inner.router.register(id);
        if let Err(e) = link.send(command, payload, id).await {
            self.inner.router.cancel(id);
            return Err(RequestError::Send(e));
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::Aborted),
            Err(_) => {
                // the waiter may still be registered; responses arriving
                // after this point are dropped as duplicates
                self.inner.router.cancel(id);
                Err(RequestError::Timeout)
            }
        }
    }

    fn link(&self) -> Option<Link> {
        self.inner.session.lock().as_ref().map(|s| s.link.clone())
    }
}

/// Owns the dispatch loop and the teardown sequence for one session.
async fn supervise(
    inner: Arc<ClientInner>,
    link: Link,
    frame_rx: mpsc::Receiver<crate::protocol::InboundFrame>,
    reader: JoinHandle<DisconnectReason>,
    writer_handle: crate::writer::WriterHandle,
    writer_task: JoinHandle<std::io::Result<()>>,
) {
    let frame_reason = dispatch_loop_client(
        frame_rx,
        link,
        Arc::clone(&inner.dispatch),
        Arc::clone(&inner.router),
    )
    .await;

    let loop_reason = match frame_reason {
        Some(r) => {
            reader.abort();
            let _ = reader.await;
            r
        }
        None => reader.await.unwrap_or(DisconnectReason::Error),
    };
    let reason = inner.pending_reason.lock().take().unwrap_or(loop_reason);

    inner.state.clear_all();
    close_writer(&writer_handle, writer_task, inner.config.close_timeout()).await;
    inner.router.fail_all();
    // remote-driven teardown: the session slot may still hold us
    inner.session.lock().take();

    let handlers = inner.disconnected_handlers.lock().clone();
    for handler in handlers {
        handler(reason);
    }
    debug!(?reason, "client session ended");
}
