//! # framewire
//!
//! Framed-message client/server networking runtime. Many logical commands
//! multiplex onto a single connection; incoming packets demultiplex to
//! user-registered subscribers; requests correlate to responses through a
//! trailing response id.
//!
//! ## Architecture
//!
//! - **Wire format**: 7-byte header (flags, command ∥ length word,
//!   checksum), optional big-endian response id after the payload.
//! - **Receive path**: transport bytes → ring buffer → reassembler →
//!   dispatch table → subscriber fan-out on the worker pool.
//! - **Send path**: payload → pooled send event → writer task → transport;
//!   the event returns to its pool when the write completes, on every path.
//!
//! ## Example
//!
//! ```ignore
//! use framewire::{Client, NetConfig, Server};
//! use framewire::transport::tcp::TcpTransport;
//! use std::time::Duration;
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
//!     server.run(&TcpTransport, 7000).await;
//!
//!     let client = Client::new(NetConfig::default());
//!     client.connect(&TcpTransport, "127.0.0.1", 7000).await;
//!     let echoed = client
//!         .send_request_raw(42, b"hello", Duration::from_secs(1))
//!         .await
//!         .unwrap();
//!     assert_eq!(&echoed[..], b"hello");
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod peer;
pub mod pool;
pub mod protocol;
pub mod response;
pub mod ring;
pub mod transport;
pub mod writer;

mod client;
mod server;

pub use client::Client;
pub use codec::{MsgPackCodec, WireMessage};
pub use config::NetConfig;
pub use dispatch::{Delivery, DispatchTable, FrameSink, SubscriberId};
pub use error::{DisconnectReason, NetError, RequestError, Result, SendError, WireError};
pub use peer::{Peer, PeerFactory, PeerKey, PeerRegistry, PeerSeed};
pub use protocol::wire::{
    CMD_CONNECT, CMD_DISCONNECT, CMD_PING, PACKET_SIZE_MAX, USER_COMMAND_LIMIT,
};
pub use server::Server;
