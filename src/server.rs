//! Server endpoint.
//!
//! Composes the accept loop, per-peer connections, the dispatch table, and
//! the peer registry behind a small public surface:
//!
//! ```ignore
//! use framewire::{NetConfig, Server};
//! use framewire::transport::tcp::TcpTransport;
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::new(NetConfig::default());
//!     server.add_command::<Vec<u8>>(42).unwrap();
//!     server
//!         .add_subscriber::<Vec<u8>, _, _>(42, |d| async move {
//!             let _ = d.reply_raw(42, &d.message).await;
//!         })
//!         .unwrap();
//!     assert!(server.run(&TcpTransport, 7000).await);
//! }
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::WireMessage;
use crate::config::NetConfig;
use crate::connection::{
    close_writer, dispatch_loop_server, receive_loop, ConnState, Link, ServerRole,
    FRAME_QUEUE_DEPTH,
};
use crate::dispatch::{Delivery, DispatchTable, SubscriberId};
use crate::error::{DisconnectReason, NetError, Result, SendError};
use crate::peer::{accept_all_factory, Peer, PeerFactory, PeerHooks, PeerKey, PeerRegistry};
use crate::pool::{self, EventPool};
use crate::protocol::Reassembler;
use crate::ring::RingBuffer;
use crate::transport::{AcceptedPeer, Acceptor, ServerTransport};
use crate::writer::{spawn_writer_task, WriterConfig};

struct ServerInner {
    config: NetConfig,
    dispatch: Arc<DispatchTable>,
    registry: Arc<PeerRegistry>,
    factory: Mutex<PeerFactory>,
    hooks: Arc<PeerHooks>,
    events: EventPool,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// Multi-peer server endpoint.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a server with the given configuration.
    pub fn new(config: NetConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ServerInner {
                dispatch: Arc::new(DispatchTable::with_capacity(
                    config.initial_callback_table_size,
                )),
                registry: Arc::new(PeerRegistry::with_capacity(config.initial_peer_table_size)),
                factory: Mutex::new(accept_all_factory()),
                hooks: Arc::new(PeerHooks::default()),
                events: EventPool::with_capacity(config.pooled_buffer_count),
                running: AtomicBool::new(false),
                local_addr: Mutex::new(None),
                shutdown,
                accept_task: Mutex::new(None),
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

    /// Replace the peer-creation factory consulted on CONNECT.
    pub fn set_peer_factory(&self, factory: PeerFactory) {
        *self.inner.factory.lock() = factory;
    }

    /// Subscribe to peer registration events.
    pub fn on_peer_connected(&self, handler: impl Fn(&Arc<Peer>) + Send + Sync + 'static) {
        self.inner.hooks.on_connected(handler);
    }

    /// Subscribe to peer removal events.
    pub fn on_peer_disconnected(
        &self,
        handler: impl Fn(&Arc<Peer>, DisconnectReason) + Send + Sync + 'static,
    ) {
        self.inner.hooks.on_disconnected(handler);
    }

    /// Bind the transport and start accepting peers.
    ///
    /// Idempotent: calling again while running returns true without
    /// rebinding. Returns false when the transport fails to bind.
    pub async fn run<T: ServerTransport + ?Sized>(&self, transport: &T, port: u16) -> bool {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return true;
        }
        let acceptor = match transport.listen(port).await {
            Ok(a) => a,
            Err(e) => {
                error!(port, error = %e, "transport bind failed");
                self.inner.running.store(false, Ordering::Release);
                return false;
            }
        };
        *self.inner.local_addr.lock() = acceptor.local_addr();
        info!(port, "server running");

        let inner = Arc::clone(&self.inner);
        let shutdown = self.inner.shutdown.subscribe();
        let task = tokio::spawn(accept_loop(acceptor, inner, shutdown));
        *self.inner.accept_task.lock() = Some(task);
        true
    }

    /// Whether the accept loop is up.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Bound address, when the transport reports one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Registered peer count.
    pub fn peer_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Snapshot of the registered peers.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.inner.registry.snapshot()
    }

    /// Look up one peer.
    pub fn peer(&self, key: PeerKey) -> Option<Arc<Peer>> {
        self.inner.registry.get(key)
    }

    /// Send a frame to one registered peer.
    pub async fn send_to(
        &self,
        peer: PeerKey,
        command: u16,
        payload: &[u8],
        response_id: u32,
    ) -> std::result::Result<(), SendError> {
        let Some(p) = self.inner.registry.get(peer) else {
            return Err(SendError::Invalid);
        };
        p.sink().send_frame(command, payload, response_id).await
    }

    /// Typed overload of [`Server::send_to`].
    pub async fn send_message_to<M: WireMessage>(
        &self,
        peer: PeerKey,
        command: u16,
        message: &M,
    ) -> Result<()> {
        let payload = message.encode()?;
        self.send_to(peer, command, &payload, 0)
            .await
            .map_err(NetError::Send)
    }

    /// Broadcast a frame to every peer present at the snapshot instant.
    ///
    /// Per-peer send failures are logged and swallowed; they never abort
    /// the broadcast. Returns the number of peers attempted.
    pub async fn send_to_all(&self, command: u16, payload: &[u8]) -> usize {
        let snapshot = self.inner.registry.snapshot();
        let attempted = snapshot.len();
        for peer in snapshot {
            if let Err(e) = peer.sink().send_frame(command, payload, 0).await {
                warn!(peer = %peer.key(), error = %e, "broadcast send failed");
            }
        }
        attempted
    }

    /// Typed overload of [`Server::send_to_all`].
    pub async fn send_message_to_all<M: WireMessage>(
        &self,
        command: u16,
        message: &M,
    ) -> Result<usize> {
        let payload = message.encode()?;
        Ok(self.send_to_all(command, &payload).await)
    }

    /// Stop accepting, close every connection with `Aborted`, and release
    /// the bound transport.
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.shutdown.send(true);
        if let Some(task) = self.inner.accept_task.lock().take() {
            task.abort();
            let _ = task.await;
        }
        for peer in self.inner.registry.drain() {
            self.inner
                .hooks
                .notify_disconnected(&peer, DisconnectReason::Aborted);
        }
        *self.inner.local_addr.lock() = None;
        // let fresh connections observe a fresh signal
        let _ = self.inner.shutdown.send_replace(false);
    }
}

async fn accept_loop(
    mut acceptor: Box<dyn Acceptor>,
    inner: Arc<ServerInner>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            accepted = acceptor.accept() => match accepted {
                Ok(peer) => spawn_connection(Arc::clone(&inner), peer),
                Err(e) => {
                    error!(error = %e, "accept failed, stopping accept loop");
                    return;
                }
            },
        }
    }
}

fn spawn_connection(inner: Arc<ServerInner>, accepted: AcceptedPeer) {
    tokio::spawn(async move {
        let AcceptedPeer {
            key,
            remote_addr,
            stream,
        } = accepted;
        debug!(%key, ?remote_addr, "peer transport accepted");

        let state = Arc::new(ConnState::new());
        state.activate();

        let (read_half, write_half) = tokio::io::split(stream);
        let (writer_handle, writer_task) = spawn_writer_task(write_half, WriterConfig::default());
        let link = Link::new(
            Arc::clone(&state),
            writer_handle.clone(),
            inner.events.clone(),
            inner.config.max_packet_size,
        );

        let ring = RingBuffer::with_capacity(inner.config.effective_ring_capacity());
        let reassembler = Reassembler::new(inner.config.max_packet_size, pool::global());
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let reader = tokio::spawn(receive_loop(
            read_half,
            Arc::clone(&state),
            inner.shutdown.subscribe(),
            ring,
            reassembler,
            frame_tx,
        ));

        let role = ServerRole {
            registry: Arc::clone(&inner.registry),
            factory: inner.factory.lock().clone(),
            hooks: Arc::clone(&inner.hooks),
            key,
            remote_addr,
        };
        let (peer, frame_reason) =
            dispatch_loop_server(frame_rx, link.clone(), Arc::clone(&inner.dispatch), role).await;

        let reason = match frame_reason {
            Some(r) => {
                reader.abort();
                let _ = reader.await;
                r
            }
            None => reader.await.unwrap_or(DisconnectReason::Error),
        };

        state.clear_all();
        close_writer(&writer_handle, writer_task, inner.config.close_timeout()).await;

        if let Some(p) = peer {
            // the registry removal winner sends the at-most-once
            // notification; server shutdown may have beaten us to it
            if let Some(p) = inner.registry.remove(p.key()) {
                inner.hooks.notify_disconnected(&p, reason);
            }
        }
        debug!(%key, ?reason, "connection closed");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mem::mem_link;

    #[tokio::test]
    async fn run_is_idempotent_while_running() {
        let (transport, _connector) = mem_link();
        let server = Server::new(NetConfig::default());

        assert!(server.run(&transport, 0).await);
        assert!(server.is_running());
        // second call returns true without rebinding (a rebind would fail,
        // the memory transport only listens once)
        assert!(server.run(&transport, 0).await);

        server.shutdown().await;
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn run_reports_bind_failure() {
        let (transport, _connector) = mem_link();
        let _held = transport.listen(0).await.unwrap();

        let server = Server::new(NetConfig::default());
        assert!(!server.run(&transport, 0).await);
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn send_to_unknown_peer_is_invalid() {
        let server = Server::new(NetConfig::default());
        let result = server.send_to(PeerKey::next(), 1, b"x", 0).await;
        assert_eq!(result, Err(SendError::Invalid));
    }

    #[tokio::test]
    async fn broadcast_with_no_peers_attempts_nothing() {
        let server = Server::new(NetConfig::default());
        assert_eq!(server.send_to_all(1, b"x").await, 0);
    }
}
