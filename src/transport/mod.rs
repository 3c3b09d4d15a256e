//! Transport seam.
//!
//! The runtime core never names a concrete socket type. Servers consume an
//! [`Acceptor`] that yields keyed byte streams; clients consume a
//! [`Connector`]. The TCP implementation lives in [`tcp`]; [`mem`] provides
//! an in-process transport used heavily by the test suite.
//!
//! A datagram-style transport plugs in through the same seam by presenting
//! each remote peer as one byte stream.

pub mod mem;
pub mod tcp;

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::peer::PeerKey;

/// A bidirectional byte stream the runtime can read and write.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// One accepted remote endpoint.
pub struct AcceptedPeer {
    /// Fresh transport key for this peer.
    pub key: PeerKey,
    /// Remote address, when the transport knows one.
    pub remote_addr: Option<SocketAddr>,
    /// The peer's byte stream.
    pub stream: Box<dyn ByteStream>,
}

/// Yields accepted peers for a listening server.
#[async_trait]
pub trait Acceptor: Send {
    /// Wait for the next peer.
    async fn accept(&mut self) -> std::io::Result<AcceptedPeer>;

    /// The bound local address, when the transport has one.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Binds a listener for [`crate::Server::run`].
#[async_trait]
pub trait ServerTransport: Send + Sync {
    /// Bind and return the acceptor.
    async fn listen(&self, port: u16) -> std::io::Result<Box<dyn Acceptor>>;
}

/// Establishes outbound connections for [`crate::Client::connect`].
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the given endpoint.
    async fn connect(&self, host: &str, port: u16) -> std::io::Result<Box<dyn ByteStream>>;
}
