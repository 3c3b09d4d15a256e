//! Connection lifecycle: state flags, the send link, and the receive and
//! dispatch loops shared by server and client endpoints.
//!
//! Each connection runs three tasks:
//!
//! - a receive task that reads transport bytes, writes them into the ring,
//!   reassembles frames, and hands them off (the minimum work on the I/O
//!   completion path);
//! - a dispatch task that consumes reassembled frames, handles the system
//!   commands (PING, CONNECT, DISCONNECT), and fans user frames out through
//!   the dispatch table;
//! - the writer task (see [`crate::writer`]).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::dispatch::{DispatchTable, FrameSink};
use crate::error::{DisconnectReason, SendError};
use crate::peer::{Peer, PeerFactory, PeerHooks, PeerKey, PeerRegistry};
use crate::pool::EventPool;
use crate::protocol::wire::{
    serialize_into, WireMode, CMD_CONNECT, CMD_DISCONNECT, CMD_PING, USER_COMMAND_LIMIT,
};
use crate::protocol::{InboundFrame, Reassembler};
use crate::response::ResponseRouter;
use crate::ring::RingBuffer;
use crate::writer::WriterHandle;

/// Receive loop runs while this bit is set.
pub const RECEIVE: u8 = 0x01;

/// Sends are accepted while this bit is set.
pub const SEND: u8 = 0x02;

/// How many reassembled frames may queue between the receive and dispatch
/// tasks before the receive task waits.
pub(crate) const FRAME_QUEUE_DEPTH: usize = 256;

/// Transport read chunk size.
const READ_CHUNK: usize = 16 * 1024;

/// One atomic byte holding the [`RECEIVE`] and [`SEND`] bits.
pub struct ConnState(AtomicU8);

impl ConnState {
    /// All bits clear.
    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Set both bits; the connection is live.
    pub fn activate(&self) {
        self.0.store(RECEIVE | SEND, Ordering::Release);
    }

    /// Clear the given bits, returning the previous value.
    pub fn clear(&self, bits: u8) -> u8 {
        self.0.fetch_and(!bits, Ordering::AcqRel)
    }

    /// Clear everything, returning the previous value. Disposing a
    /// connection does this, preventing further I/O.
    pub fn clear_all(&self) -> u8 {
        self.0.swap(0, Ordering::AcqRel)
    }

    /// Whether the receive bit is set.
    pub fn is_receiving(&self) -> bool {
        self.0.load(Ordering::Acquire) & RECEIVE != 0
    }

    /// Whether the send bit is set.
    pub fn is_sending(&self) -> bool {
        self.0.load(Ordering::Acquire) & SEND != 0
    }
}

impl Default for ConnState {
    fn default() -> Self {
        Self::new()
    }
}

/// The sending half of a connection: frames staged into pooled events and
/// queued onto the writer task. Cheaply cloneable; every handler reply and
/// server broadcast goes through one of these.
#[derive(Clone)]
pub struct Link {
    state: Arc<ConnState>,
    writer: WriterHandle,
    events: EventPool,
    max_packet: u16,
}

impl Link {
    pub(crate) fn new(
        state: Arc<ConnState>,
        writer: WriterHandle,
        events: EventPool,
        max_packet: u16,
    ) -> Self {
        Self {
            state,
            writer,
            events,
            max_packet,
        }
    }

    /// Send a frame with no encryption or compression mode bits.
    pub async fn send(
        &self,
        command: u16,
        payload: &[u8],
        response_id: u32,
    ) -> Result<(), SendError> {
        self.send_with_mode(command, payload, response_id, WireMode::PLAIN)
            .await
    }

    /// Send a frame carrying explicit mode bits.
    pub async fn send_with_mode(
        &self,
        command: u16,
        payload: &[u8],
        response_id: u32,
        mode: WireMode,
    ) -> Result<(), SendError> {
        if !self.state.is_sending() {
            return Err(SendError::Invalid);
        }
        let mut event = self.events.rent();
        serialize_into(
            event.buffer_mut(),
            command,
            payload,
            response_id,
            mode,
            self.max_packet,
        )
        .map_err(|_| SendError::Invalid)?;
        // the event returns to its pool when the writer (or a failure path)
        // drops it
        self.writer.send(event).await
    }
}

#[async_trait]
impl FrameSink for Link {
    async fn send_frame(
        &self,
        command: u16,
        payload: &[u8],
        response_id: u32,
    ) -> Result<(), SendError> {
        self.send(command, payload, response_id).await
    }
}

/// Read transport bytes into the ring and emit reassembled frames until the
/// stream ends, the shutdown signal fires, or the receive bit clears.
pub(crate) async fn receive_loop<R>(
    mut reader: R,
    state: Arc<ConnState>,
    mut shutdown: watch::Receiver<bool>,
    ring: RingBuffer,
    mut reassembler: Reassembler,
    frames: mpsc::Sender<InboundFrame>,
) -> DisconnectReason
where
    R: AsyncRead + Unpin,
{
    let mut scratch = vec![0u8; READ_CHUNK];
    loop {
        if !state.is_receiving() {
            return DisconnectReason::Aborted;
        }
        let n = tokio::select! {
            _ = shutdown.changed() => return DisconnectReason::Aborted,
            read = reader.read(&mut scratch) => match read {
                // a remote that vanishes without saying DISCONNECT counts
                // as a transport failure
                Ok(0) => return DisconnectReason::Error,
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "transport read failed");
                    return DisconnectReason::Error;
                }
            },
        };
        let written = ring.write(&scratch[..n]);
        if written < n {
            warn!(dropped = n - written, "receive ring overflow");
            reassembler.on_overflow();
        }
        while let Some(frame) = reassembler.next(&ring) {
            if frames.send(frame).await.is_err() {
                return DisconnectReason::Aborted;
            }
        }
    }
}

/// Server-side collaborators for one connection's dispatch loop.
pub(crate) struct ServerRole {
    pub registry: Arc<PeerRegistry>,
    pub factory: PeerFactory,
    pub hooks: Arc<PeerHooks>,
    pub key: PeerKey,
    pub remote_addr: Option<SocketAddr>,
}

/// Consume frames for a server connection. Returns the peer (if the
/// handshake completed) and `Some(reason)` when a frame ended the
/// connection, or `None` when the frame stream dried up.
pub(crate) async fn dispatch_loop_server(
    mut frames: mpsc::Receiver<InboundFrame>,
    link: Link,
    dispatch: Arc<DispatchTable>,
    role: ServerRole,
) -> (Option<Arc<Peer>>, Option<DisconnectReason>) {
    let sink: Arc<dyn FrameSink> = Arc::new(link.clone());
    let mut peer: Option<Arc<Peer>> = None;

    while let Some(frame) = frames.recv().await {
        if let Some(p) = &peer {
            p.touch();
        }
        match frame.command() {
            CMD_PING => {
                let _ = link
                    .send(CMD_PING, frame.payload(), frame.response_id())
                    .await;
            }
            CMD_CONNECT => {
                if peer.is_some() {
                    // repeat handshake, echo again
                    let _ = link
                        .send(CMD_CONNECT, frame.payload(), frame.response_id())
                        .await;
                    continue;
                }
                match (role.factory)(role.key, role.remote_addr) {
                    Some(seed) => {
                        let p = Arc::new(Peer::new(
                            role.key,
                            role.remote_addr,
                            seed.attachment,
                            Arc::new(link.clone()),
                        ));
                        if role.registry.insert(Arc::clone(&p)) {
                            role.hooks.notify_connected(&p);
                        }
                        peer = Some(p);
                        let _ = link
                            .send(CMD_CONNECT, frame.payload(), frame.response_id())
                            .await;
                    }
                    None => {
                        warn!(key = %role.key, "peer factory rejected handshake");
                        return (None, Some(DisconnectReason::Unspecified));
                    }
                }
            }
            CMD_DISCONNECT => {
                return (peer, Some(DisconnectReason::Graceful));
            }
            command if command <= USER_COMMAND_LIMIT => {
                let Some(p) = &peer else {
                    debug!(command, "frame before handshake dropped");
                    continue;
                };
                dispatch
                    .dispatch(
                        Some(p.key()),
                        frame.response_id(),
                        Arc::clone(&sink),
                        command,
                        frame.payload(),
                    )
                    .await;
            }
            command => {
                debug!(command, "unknown system command dropped");
            }
        }
    }
    (peer, None)
}

/// Consume frames for a client connection. Response-bit frames matching a
/// waiter complete it and go no further.
pub(crate) async fn dispatch_loop_client(
    mut frames: mpsc::Receiver<InboundFrame>,
    link: Link,
    dispatch: Arc<DispatchTable>,
    router: Arc<ResponseRouter>,
) -> Option<DisconnectReason> {
    let sink: Arc<dyn FrameSink> = Arc::new(link.clone());

    while let Some(frame) = frames.recv().await {
        if frame.header().has_response()
            && frame.response_id() != 0
            && router.complete(frame.response_id(), Bytes::copy_from_slice(frame.payload()))
        {
            continue;
        }
        match frame.command() {
            CMD_PING => {
                let _ = link
                    .send(CMD_PING, frame.payload(), frame.response_id())
                    .await;
            }
            CMD_CONNECT => {
                debug!("stray CONNECT echo dropped");
            }
            CMD_DISCONNECT => {
                return Some(DisconnectReason::Graceful);
            }
            command if command <= USER_COMMAND_LIMIT => {
                dispatch
                    .dispatch(
                        None,
                        frame.response_id(),
                        Arc::clone(&sink),
                        command,
                        frame.payload(),
                    )
                    .await;
            }
            command => {
                debug!(command, "unknown system command dropped");
            }
        }
    }
    None
}

/// Bounded writer shutdown: give queued frames until the close timeout to
/// drain, then stop the task.
pub(crate) async fn close_writer(
    handle: &WriterHandle,
    task: JoinHandle<std::io::Result<()>>,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    while handle.pending_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    task.abort();
    let _ = task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool;
    use crate::protocol::wire::{split_frame, PACKET_SIZE_MAX};
    use crate::writer::{spawn_writer_task, WriterConfig};
    use tokio::io::duplex;

    #[test]
    fn state_bits_lifecycle() {
        let state = ConnState::new();
        assert!(!state.is_receiving());
        assert!(!state.is_sending());

        state.activate();
        assert!(state.is_receiving());
        assert!(state.is_sending());

        state.clear(RECEIVE);
        assert!(!state.is_receiving());
        assert!(state.is_sending());

        let prev = state.clear_all();
        assert_eq!(prev, SEND);
        assert!(!state.is_sending());
    }

    fn test_link<W>(writer: W) -> (Link, Arc<ConnState>, JoinHandle<std::io::Result<()>>)
    where
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let state = Arc::new(ConnState::new());
        state.activate();
        let (handle, task) = spawn_writer_task(writer, WriterConfig::default());
        let link = Link::new(
            Arc::clone(&state),
            handle,
            EventPool::with_capacity(4),
            PACKET_SIZE_MAX,
        );
        (link, state, task)
    }

    #[tokio::test]
    async fn link_send_produces_a_parseable_frame() {
        let (client, mut server) = duplex(4096);
        let (link, _state, _task) = test_link(client);

        link.send(42, b"ping", 9).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut buf = vec![0u8; 128];
        let n = server.read(&mut buf).await.unwrap();
        let frame = split_frame(&buf[..n], PACKET_SIZE_MAX).unwrap();
        assert_eq!(frame.header.command, 42);
        assert_eq!(frame.payload, b"ping");
        assert_eq!(frame.response_id, 9);
    }

    #[tokio::test]
    async fn link_send_with_send_bit_clear_is_invalid() {
        let (client, _server) = duplex(4096);
        let (link, state, _task) = test_link(client);

        state.clear(SEND);
        assert_eq!(link.send(1, b"x", 0).await, Err(SendError::Invalid));
    }

    #[tokio::test]
    async fn link_rejects_oversize_payload() {
        let (client, _server) = duplex(4096);
        let (link, _state, _task) = test_link(client);

        let big = vec![0u8; PACKET_SIZE_MAX as usize + 1];
        assert_eq!(link.send(1, &big, 0).await, Err(SendError::Invalid));
    }

    #[tokio::test]
    async fn receive_loop_emits_reassembled_frames() {
        let (mut remote, local) = duplex(4096);
        let state = Arc::new(ConnState::new());
        state.activate();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (frame_tx, mut frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);

        let ring = RingBuffer::with_capacity(4096);
        let reassembler = Reassembler::new(PACKET_SIZE_MAX, pool::global());
        let task = tokio::spawn(receive_loop(
            local,
            Arc::clone(&state),
            shutdown_rx,
            ring,
            reassembler,
            frame_tx,
        ));

        let mut staged = bytes::BytesMut::new();
        serialize_into(&mut staged, 7, b"hello", 0, WireMode::PLAIN, PACKET_SIZE_MAX).unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut remote, &staged)
            .await
            .unwrap();

        let frame = frame_rx.recv().await.unwrap();
        assert_eq!(frame.command(), 7);
        assert_eq!(frame.payload(), b"hello");

        // remote hangup without DISCONNECT reads as a transport failure
        drop(remote);
        assert_eq!(task.await.unwrap(), DisconnectReason::Error);
    }

    #[tokio::test]
    async fn receive_loop_honors_shutdown_signal() {
        let (_remote, local) = duplex(4096);
        let state = Arc::new(ConnState::new());
        state.activate();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (frame_tx, _frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);

        let ring = RingBuffer::with_capacity(4096);
        let reassembler = Reassembler::new(PACKET_SIZE_MAX, pool::global());
        let task = tokio::spawn(receive_loop(
            local,
            state,
            shutdown_rx,
            ring,
            reassembler,
            frame_tx,
        ));

        shutdown_tx.send(true).unwrap();
        assert_eq!(task.await.unwrap(), DisconnectReason::Aborted);
    }

    #[tokio::test]
    async fn close_writer_drains_then_stops() {
        let (client, mut server) = duplex(4096);
        let (link, _state, task) = test_link(client);

        link.send(1, b"last words", 0).await.unwrap();
        let handle = link.writer.clone();
        close_writer(&handle, task, Duration::from_secs(1)).await;

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        let frame = split_frame(&buf[..n], PACKET_SIZE_MAX).unwrap();
        assert_eq!(frame.payload, b"last words");
    }
}
