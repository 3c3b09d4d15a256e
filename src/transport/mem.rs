//! In-process transport over `tokio::io::duplex` pipes.
//!
//! [`mem_link`] returns a server transport and a connector wired to each
//! other: every `connect` hands the acceptor one half of a fresh duplex
//! pipe. Tests and single-process compositions use this to run the full
//! stack without sockets.

use std::io;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::duplex;
use tokio::sync::mpsc;

use super::{AcceptedPeer, Acceptor, ByteStream, Connector, ServerTransport};
use crate::peer::PeerKey;

/// Pipe buffer size per direction.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Build a connected in-memory transport pair.
pub fn mem_link() -> (MemServer, MemConnector) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemServer {
            incoming: Mutex::new(Some(rx)),
        },
        MemConnector { tx },
    )
}

/// Server half: owns the queue of inbound pipe halves.
pub struct MemServer {
    incoming: Mutex<Option<mpsc::UnboundedReceiver<Box<dyn ByteStream>>>>,
}

/// Client half: each connect produces a fresh pipe.
#[derive(Clone)]
pub struct MemConnector {
    tx: mpsc::UnboundedSender<Box<dyn ByteStream>>,
}

struct MemAcceptor {
    incoming: mpsc::UnboundedReceiver<Box<dyn ByteStream>>,
}

#[async_trait]
impl ServerTransport for MemServer {
    async fn listen(&self, _port: u16) -> io::Result<Box<dyn Acceptor>> {
        let incoming = self.incoming.lock().take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrInUse, "memory transport already listening")
        })?;
        Ok(Box::new(MemAcceptor { incoming }))
    }
}

#[async_trait]
impl Acceptor for MemAcceptor {
    async fn accept(&mut self) -> io::Result<AcceptedPeer> {
        let stream = self.incoming.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "all connectors dropped")
        })?;
        Ok(AcceptedPeer {
            key: PeerKey::next(),
            remote_addr: None,
            stream,
        })
    }
}

#[async_trait]
impl Connector for MemConnector {
    async fn connect(&self, _host: &str, _port: u16) -> io::Result<Box<dyn ByteStream>> {
        let (ours, theirs) = duplex(PIPE_CAPACITY);
        self.tx.send(Box::new(theirs)).map_err(|_| {
            io::Error::new(io::ErrorKind::NotConnected, "memory listener is gone")
        })?;
        Ok(Box::new(ours))
    }
}
