//! Wire format encoding and decoding.
//!
//! Implements the 7-byte header format:
//! ```text
//! ┌───────┬──────────────────────┬──────────┐
//! │ Flags │ Command ∥ DataLength │ Checksum │
//! │ 1 byte│ 4 bytes (u32 LE)     │ 2 B (LE) │
//! └───────┴──────────────────────┴──────────┘
//! ```
//!
//! - Flags: bits 0..2 encrypt mode, bits 3..5 compress mode, bit 6 response
//!   bit, bit 7 reserved (must be 0).
//! - The packed word carries the command id in its high 16 bits and the
//!   payload length in its low 16 bits.
//! - The checksum covers bytes 0..4: Fletcher-16 folded to 15 bits with bit
//!   15 forced set. The forced bit puts a guaranteed high bit in the
//!   checksum's high byte (offset 6), giving the reassembler a cheap resync
//!   mark.
//!
//! When the response bit is set, a 4-byte big-endian response id trails the
//! payload; total frame = 7 + data_len + 4.

use bytes::BytesMut;

use crate::error::WireError;

/// Header size in bytes (fixed, exactly 7).
pub const HEADER_SIZE: usize = 7;

/// Size of the trailing response id when the response bit is set.
pub const RESPONSE_ID_SIZE: usize = 4;

/// Default upper bound on a frame's payload length.
pub const PACKET_SIZE_MAX: u16 = 8192;

/// Inclusive upper bound of user-addressable command ids. Everything above
/// is reserved for system commands.
pub const USER_COMMAND_LIMIT: u16 = 65500;

/// System command: graceful goodbye.
pub const CMD_DISCONNECT: u16 = 0xFFFD;

/// System command: connection handshake.
pub const CMD_CONNECT: u16 = 0xFFFE;

/// System command: echo probe.
pub const CMD_PING: u16 = 0xFFFF;

/// The bit guaranteed set in header byte 6 (checksum high byte) of every
/// valid frame. The reassembler scans for it when resynchronising.
pub const SYNC_MASK: u8 = 0x80;

/// Flag byte layout.
pub mod flags {
    /// Bits 0..2: encryption mode (0..7; the transform itself is external).
    pub const ENCRYPT_MASK: u8 = 0b0000_0111;
    /// Bits 3..5: compression mode (0..7).
    pub const COMPRESS_MASK: u8 = 0b0011_1000;
    /// Shift to move a compress mode into position.
    pub const COMPRESS_SHIFT: u32 = 3;
    /// Bit 6: a 4-byte response id trails the payload.
    pub const RESPONSE_BIT: u8 = 0b0100_0000;
    /// Bit 7: reserved, must be 0.
    pub const RESERVED_BIT: u8 = 0b1000_0000;
}

/// Encrypt/compress mode pair carried in the flags byte. The core only
/// routes these bits; the transforms live outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireMode {
    /// Encryption mode, 0..7.
    pub encrypt: u8,
    /// Compression mode, 0..7.
    pub compress: u8,
}

impl WireMode {
    /// No encryption, no compression.
    pub const PLAIN: WireMode = WireMode {
        encrypt: 0,
        compress: 0,
    };
}

/// Fletcher-16 over `data`, low byte = sum1, high byte = sum2.
fn fletcher16(data: &[u8]) -> u16 {
    let mut sum1: u16 = 0;
    let mut sum2: u16 = 0;
    for &b in data {
        sum1 = (sum1 + u16::from(b)) % 255;
        sum2 = (sum2 + sum1) % 255;
    }
    (sum2 << 8) | sum1
}

/// Checksum stored in header bytes 5..6: Fletcher-16 of bytes 0..4 folded
/// to 15 bits, bit 15 forced set.
pub fn header_checksum(prefix: &[u8; HEADER_SIZE - 2]) -> u16 {
    (fletcher16(prefix) & 0x7FFF) | (u16::from(SYNC_MASK) << 8)
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
    /// Flags byte (see [`flags`]).
    pub flags: u8,
    /// Command identifier.
    pub command: u16,
    /// Payload length, excluding header and trailing response id.
    pub data_len: u16,
    /// Stored checksum over bytes 0..4.
    pub checksum: u16,
}

impl RawHeader {
    /// Build a header with a freshly computed checksum.
    pub fn new(command: u16, data_len: u16, encrypt: u8, compress: u8, response: bool) -> Self {
        let mut fl = (encrypt & flags::ENCRYPT_MASK)
            | ((compress << flags::COMPRESS_SHIFT) & flags::COMPRESS_MASK);
        if response {
            fl |= flags::RESPONSE_BIT;
        }
        let mut header = Self {
            flags: fl,
            command,
            data_len,
            checksum: 0,
        };
        let bytes = header.encode();
        let mut prefix = [0u8; HEADER_SIZE - 2];
        prefix.copy_from_slice(&bytes[..HEADER_SIZE - 2]);
        header.checksum = header_checksum(&prefix);
        header
    }

    /// Parse header fields from raw bytes without validating anything.
    pub fn parse(buf: &[u8; HEADER_SIZE]) -> Self {
        let word = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
        Self {
            flags: buf[0],
            command: (word >> 16) as u16,
            data_len: (word & 0xFFFF) as u16,
            checksum: u16::from_le_bytes([buf[5], buf[6]]),
        }
    }

    /// Parse a header from the front of `buf`, or `None` if too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&buf[..HEADER_SIZE]);
        Some(Self::parse(&raw))
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.flags;
        let word = (u32::from(self.command) << 16) | u32::from(self.data_len);
        buf[1..5].copy_from_slice(&word.to_le_bytes());
        buf[5..7].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Validate checksum, reserved bit, and payload bound.
    pub fn verify(&self, max_packet: u16) -> Result<(), WireError> {
        if self.flags & flags::RESERVED_BIT != 0 {
            return Err(WireError::ReservedBits);
        }
        let bytes = self.encode();
        let mut prefix = [0u8; HEADER_SIZE - 2];
        prefix.copy_from_slice(&bytes[..HEADER_SIZE - 2]);
        if header_checksum(&prefix) != self.checksum {
            return Err(WireError::Checksum);
        }
        if self.data_len > max_packet {
            return Err(WireError::Oversize {
                len: self.data_len as usize,
                max: max_packet as usize,
            });
        }
        Ok(())
    }

    /// Whether a response id trails the payload.
    #[inline]
    pub fn has_response(&self) -> bool {
        self.flags & flags::RESPONSE_BIT != 0
    }

    /// Encryption mode bits.
    #[inline]
    pub fn encrypt_mode(&self) -> u8 {
        self.flags & flags::ENCRYPT_MASK
    }

    /// Compression mode bits.
    #[inline]
    pub fn compress_mode(&self) -> u8 {
        (self.flags & flags::COMPRESS_MASK) >> flags::COMPRESS_SHIFT
    }

    /// Total on-wire frame length this header describes.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE
            + self.data_len as usize
            + if self.has_response() {
                RESPONSE_ID_SIZE
            } else {
                0
            }
    }
}

/// Whether `command` lies in the system range above [`USER_COMMAND_LIMIT`].
#[inline]
pub fn is_reserved_command(command: u16) -> bool {
    command > USER_COMMAND_LIMIT
}

/// Serialize a frame into `buf`: header, payload, then the big-endian
/// response id when `response_id` is non-zero. Returns the frame length.
pub fn serialize_into(
    buf: &mut BytesMut,
    command: u16,
    payload: &[u8],
    response_id: u32,
    mode: WireMode,
    max_packet: u16,
) -> Result<usize, WireError> {
    if payload.len() > max_packet as usize {
        return Err(WireError::Oversize {
            len: payload.len(),
            max: max_packet as usize,
        });
    }
    let response = response_id != 0;
    let header = RawHeader::new(
        command,
        payload.len() as u16,
        mode.encrypt,
        mode.compress,
        response,
    );
    let total = header.frame_len();
    buf.reserve(total);
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    if response {
        buf.extend_from_slice(&response_id.to_be_bytes());
    }
    Ok(total)
}

/// A parsed frame borrowing its payload from the source buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef<'a> {
    /// Validated header.
    pub header: RawHeader,
    /// Payload bytes.
    pub payload: &'a [u8],
    /// Trailing response id, or 0 when the response bit is clear.
    pub response_id: u32,
}

/// Validate and split a complete frame sitting at the front of `buf`.
pub fn split_frame(buf: &[u8], max_packet: u16) -> Result<FrameRef<'_>, WireError> {
    let header = RawHeader::decode(buf).ok_or(WireError::Truncated {
        need: HEADER_SIZE,
        have: buf.len(),
    })?;
    header.verify(max_packet)?;
    let total = header.frame_len();
    if buf.len() < total {
        return Err(WireError::Truncated {
            need: total,
            have: buf.len(),
        });
    }
    let payload = &buf[HEADER_SIZE..HEADER_SIZE + header.data_len as usize];
    let response_id = if header.has_response() {
        let at = HEADER_SIZE + header.data_len as usize;
        u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
    } else {
        0
    };
    Ok(FrameRef {
        header,
        payload,
        response_id,
    })
}
