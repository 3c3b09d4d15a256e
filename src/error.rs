//! Error types for framewire.

use thiserror::Error;

/// Main error type for all framewire operations.
#[derive(Debug, Error)]
pub enum NetError {
    /// I/O error during transport operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload serialization error.
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Payload deserialization error.
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Wire-level framing error.
    #[error("framing error: {0}")]
    Wire(#[from] WireError),

    /// Command id lies in the reserved system range.
    #[error("command {0} is reserved for system use")]
    ReservedCommand(u16),

    /// Subscriber registration against a command nobody added.
    #[error("command {0} is not registered")]
    UnknownCommand(u16),

    /// Connection closed while an operation was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send-path failure.
    #[error("send failed: {0}")]
    Send(SendError),

    /// Request/response failure.
    #[error("request failed: {0}")]
    Request(#[from] RequestError),
}

/// Result type alias using NetError.
pub type Result<T> = std::result::Result<T, NetError>;

/// Framing errors. These recover locally (skip a byte and resynchronise);
/// they never tear down the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    /// Header checksum did not verify.
    #[error("header checksum mismatch")]
    Checksum,

    /// Claimed payload length exceeds the configured limit.
    #[error("payload length {len} exceeds limit {max}")]
    Oversize { len: usize, max: usize },

    /// Reserved flag bits were nonzero.
    #[error("reserved flag bits set")]
    ReservedBits,

    /// Buffer too short for the frame it claims to hold.
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
}

/// Send-path error taxonomy surfaced to callers.
///
/// The "no error" case is expressed as `Ok(())` on the send methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The transport reported an error.
    #[error("transport error")]
    Socket,

    /// The endpoint has been closed.
    #[error("endpoint disposed")]
    Disposed,

    /// Send flag clear or arguments rejected.
    #[error("send rejected")]
    Invalid,

    /// Unclassified failure (e.g. the write queue stayed full past its bound).
    #[error("unknown send failure")]
    Unknown,
}

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote side said goodbye with a DISCONNECT frame.
    Graceful,
    /// The endpoint was disposed mid-operation.
    Aborted,
    /// The transport reported an error.
    Error,
    /// The stream ended without an identifiable cause.
    Unspecified,
}

/// Request/response failures observed by `send_request` callers.
#[derive(Debug, Error)]
pub enum RequestError {
    /// No response arrived within the request's timeout.
    #[error("response timed out")]
    Timeout,

    /// The connection was torn down while the request was pending.
    #[error("connection aborted")]
    Aborted,

    /// The request could not be sent.
    #[error("send failed: {0}")]
    Send(SendError),

    /// The response arrived but its payload failed to decode.
    #[error("response decode failed")]
    Decode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_error_display() {
        let e = WireError::Oversize { len: 9000, max: 8192 };
        assert!(e.to_string().contains("9000"));
        assert!(e.to_string().contains("8192"));
    }

    #[test]
    fn send_error_variants_are_distinct() {
        assert_ne!(SendError::Socket, SendError::Disposed);
        assert_ne!(SendError::Invalid, SendError::Unknown);
    }

    #[test]
    fn net_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let e: NetError = io.into();
        assert!(matches!(e, NetError::Io(_)));
    }
}
