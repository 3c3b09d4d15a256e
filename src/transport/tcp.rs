//! TCP transport.
//!
//! The stream-oriented reference transport: a thin layer over
//! `tokio::net::{TcpListener, TcpStream}` with Nagle disabled, mapping each
//! accepted socket to a fresh peer key.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use super::{AcceptedPeer, Acceptor, ByteStream, Connector, ServerTransport};
use crate::peer::PeerKey;

/// TCP server and client transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

/// Listening socket wrapper produced by [`TcpTransport::listen`].
pub struct TcpAcceptor {
    listener: TcpListener,
    local_addr: Option<SocketAddr>,
}

#[async_trait]
impl ServerTransport for TcpTransport {
    async fn listen(&self, port: u16) -> std::io::Result<Box<dyn Acceptor>> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr().ok();
        debug!(?local_addr, "tcp listener bound");
        Ok(Box::new(TcpAcceptor {
            listener,
            local_addr,
        }))
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> std::io::Result<AcceptedPeer> {
        let (stream, remote_addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(AcceptedPeer {
            key: PeerKey::next(),
            remote_addr: Some(remote_addr),
            stream: Box::new(stream),
        })
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

#[async_trait]
impl Connector for TcpTransport {
    async fn connect(&self, host: &str, port: u16) -> std::io::Result<Box<dyn ByteStream>> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn listen_connect_and_exchange_bytes() {
        let transport = TcpTransport;
        let mut acceptor = transport.listen(0).await.unwrap();
        let port = acceptor.local_addr().unwrap().port();

        let connect = tokio::spawn(async move {
            let mut stream = TcpTransport.connect("127.0.0.1", port).await.unwrap();
            stream.write_all(b"knock").await.unwrap();
            stream
        });

        let mut accepted = acceptor.accept().await.unwrap();
        assert!(accepted.remote_addr.is_some());

        let mut buf = [0u8; 5];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"knock");
        drop(connect.await.unwrap());
    }

    #[tokio::test]
    async fn accepted_peers_get_distinct_keys() {
        let transport = TcpTransport;
        let mut acceptor = transport.listen(0).await.unwrap();
        let port = acceptor.local_addr().unwrap().port();

        let c1 = tokio::spawn(async move { TcpTransport.connect("127.0.0.1", port).await });
        let a1 = acceptor.accept().await.unwrap();
        let c2 = tokio::spawn(async move { TcpTransport.connect("127.0.0.1", port).await });
        let a2 = acceptor.accept().await.unwrap();

        assert_ne!(a1.key, a2.key);
        let _ = (c1.await, c2.await);
    }
}
