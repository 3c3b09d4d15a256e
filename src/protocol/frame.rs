//! Inbound frame holder.
//!
//! A reassembled frame keeps its bytes in a pool-rented buffer; dropping the
//! frame returns the buffer. Accessors slice into the buffer rather than
//! copying.

use crate::pool::PooledBuf;
use crate::protocol::wire::{is_reserved_command, RawHeader, HEADER_SIZE, RESPONSE_ID_SIZE};

/// One complete frame lifted off the wire.
pub struct InboundFrame {
    header: RawHeader,
    data: PooledBuf,
}

impl InboundFrame {
    /// Wrap a validated header and the full frame bytes backing it.
    pub(crate) fn new(header: RawHeader, data: PooledBuf) -> Self {
        debug_assert_eq!(data.len(), header.frame_len());
        Self { header, data }
    }

    /// The validated header.
    #[inline]
    pub fn header(&self) -> &RawHeader {
        &self.header
    }

    /// Command id.
    #[inline]
    pub fn command(&self) -> u16 {
        self.header.command
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data[HEADER_SIZE..HEADER_SIZE + self.header.data_len as usize]
    }

    /// Trailing response id, or 0 when the response bit is clear.
    pub fn response_id(&self) -> u32 {
        if !self.header.has_response() {
            return 0;
        }
        let at = HEADER_SIZE + self.header.data_len as usize;
        let mut id = [0u8; RESPONSE_ID_SIZE];
        id.copy_from_slice(&self.data[at..at + RESPONSE_ID_SIZE]);
        u32::from_be_bytes(id)
    }

    /// Total on-wire length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the frame holds zero bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the command id lies in the reserved system range.
    #[inline]
    pub fn is_system(&self) -> bool {
        is_reserved_command(self.header.command)
    }
}

impl std::fmt::Debug for InboundFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundFrame")
            .field("command", &self.header.command)
            .field("data_len", &self.header.data_len)
            .field("response_id", &self.response_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {

    use bytes::BytesMut;

    use super::*;
    use crate::pool::BufferPool;
    use crate::protocol::wire::{serialize_into, split_frame, WireMode, PACKET_SIZE_MAX};

    fn make_frame(command: u16, payload: &[u8], response_id: u32) -> InboundFrame {
        let mut staged = BytesMut::new();
        serialize_into(
            &mut staged,
            command,
            payload,
            response_id,
            WireMode::PLAIN,
            PACKET_SIZE_MAX,
        )
        .unwrap();
        let header = split_frame(&staged, PACKET_SIZE_MAX).unwrap().header;

        let pool = BufferPool::new();
        let mut data = pool.rent(staged.len());
        data.extend_from_slice(&staged);
        InboundFrame::new(header, data)
    }

    #[test]
    fn accessors_slice_the_backing_buffer() {
        let frame = make_frame(42, b"payload", 0);
        assert_eq!(frame.command(), 42);
        assert_eq!(frame.payload(), b"payload");
        assert_eq!(frame.response_id(), 0);
        assert!(!frame.is_system());
    }

    #[test]
    fn response_id_read_back_big_endian() {
        let frame = make_frame(42, b"x", 0x01020304);
        assert_eq!(frame.response_id(), 0x01020304);
        assert_eq!(frame.len(), HEADER_SIZE + 1 + RESPONSE_ID_SIZE);
    }

    #[test]
    fn system_range_detected() {
        let frame = make_frame(crate::protocol::wire::CMD_PING, b"", 0);
        assert!(frame.is_system());
    }
}
