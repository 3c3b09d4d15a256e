//! Frame reassembly over the receive ring.
//!
//! A state machine with three states reconstructs frames from a byte stream
//! whose boundaries do not align with application messages:
//!
//! - `Seek` - initial and resynchronisation state; the ring may hold
//!   garbage. Scans for the checksum sync mark (the guaranteed high bit at
//!   header offset 6) and positions the tail at the candidate header.
//! - `ReadHeader` - peeks 7 bytes and validates them. A bad checksum,
//!   oversize length, or reserved bit skips one byte and reseeks.
//! - `ReadBody` - waits for the full frame, reads it into a pool-rented
//!   buffer, and emits it.
//!
//! The scan never steps past a valid header: a frame starting at ring
//! offset `q` always carries its sync mark at `q + 6`, so the first marked
//! byte found is at or before it. False positives (payload bytes with the
//! high bit set) are weeded out by header validation, one skipped byte at a
//! time.
//!
//! Reassembly runs in the connection's receive task; it is the single
//! consumer on the ring.


use tracing::trace;

use crate::pool::BufferPool;
use crate::protocol::frame::InboundFrame;
use crate::protocol::wire::{RawHeader, HEADER_SIZE, SYNC_MASK};
use crate::ring::RingBuffer;

#[derive(Debug, Clone, Copy)]
enum State {
    Seek,
    ReadHeader,
    ReadBody { header: RawHeader, need: usize },
}

/// Reconstructs frames from the ring.
pub struct Reassembler {
    state: State,
    max_packet: u16,
    pool: BufferPool,
}

impl Reassembler {
    /// Create a reassembler enforcing `max_packet` on payload lengths and
    /// renting frame buffers from `pool`.
    pub fn new(max_packet: u16, pool: BufferPool) -> Self {
        Self {
            state: State::Seek,
            max_packet,
            pool,
        }
    }

    /// The producer dropped bytes (ring overflow). Whatever is buffered can
    /// no longer be trusted to be frame-aligned.
    pub fn on_overflow(&mut self) {
        trace!("ring overflow, resynchronising");
        self.state = State::Seek;
    }

    /// Pull the next complete frame off the ring, or `None` when more bytes
    /// are needed.
    pub fn next(&mut self, ring: &RingBuffer) -> Option<InboundFrame> {
        loop {
            match self.state {
                State::Seek => {
                    let count = ring.len();
                    if count < HEADER_SIZE {
                        return None;
                    }
                    let mark = (HEADER_SIZE - 1..count)
                        .find(|&p| matches!(ring.peek_byte(p), Some(b) if b & SYNC_MASK != 0));
                    match mark {
                        Some(p) => {
                            ring.skip(p - (HEADER_SIZE - 1));
                            self.state = State::ReadHeader;
                        }
                        None => {
                            // No header can start before count - 6.
                            ring.skip(count - (HEADER_SIZE - 1));
                            return None;
                        }
                    }
                }
                State::ReadHeader => {
                    let header = ring.peek_header(0)?;
                    match header.verify(self.max_packet) {
                        Ok(()) => {
                            self.state = State::ReadBody {
                                header,
                                need: header.frame_len(),
                            };
                        }
                        Err(e) => {
                            trace!(error = %e, "header rejected, skipping one byte");
                            ring.skip(1);
                            self.state = State::Seek;
                        }
                    }
                }
                State::ReadBody { header, need } => {
                    if ring.len() < need {
                        return None;
                    }
                    let mut data = self.pool.rent(need);
                    data.resize(need, 0);
                    let got = ring.read(&mut data[..], 0);
                    debug_assert_eq!(got, need);
                    self.state = State::ReadHeader;
                    return Some(InboundFrame::new(header, data));
                }
            }
        }
    }
}
