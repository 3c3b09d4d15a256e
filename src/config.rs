//! Runtime configuration.
//!
//! [`NetConfig`] carries the tunables the runtime recognizes. It is a plain
//! value struct: no file loading, no environment variables. Construct it with
//! [`Default::default`] and override fields, or deserialize it from whatever
//! source the embedding application uses.

use std::time::Duration;

use serde::Deserialize;

use crate::protocol::wire::{HEADER_SIZE, PACKET_SIZE_MAX, RESPONSE_ID_SIZE};

/// Default number of close-timeout units (seconds) to wait on shutdown.
pub const DEFAULT_CLOSE_TIMEOUT_SECS: u64 = 10;

/// Default initial capacity of the command dispatch table.
pub const DEFAULT_CALLBACK_TABLE_SIZE: usize = 16;

/// Default initial capacity of the peer registry.
pub const DEFAULT_PEER_TABLE_SIZE: usize = 32;

/// Default number of pre-populated send events in the event pool.
pub const DEFAULT_POOLED_BUFFER_COUNT: usize = 32;

/// Default receive ring capacity in bytes (rounded up to a power of two).
pub const DEFAULT_RING_CAPACITY: usize = 64 * 1024;

/// Configuration recognized by the runtime.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Upper bound on a frame's payload length in bytes.
    pub max_packet_size: u16,
    /// Bounded wait on transport shutdown, in seconds.
    pub close_timeout_secs: u64,
    /// Initial capacity of the dispatch table.
    pub initial_callback_table_size: usize,
    /// Initial capacity of the peer registry.
    pub initial_peer_table_size: usize,
    /// Send-event pool size.
    pub pooled_buffer_count: usize,
    /// Receive ring capacity per connection, in bytes.
    pub ring_capacity: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            max_packet_size: PACKET_SIZE_MAX,
            close_timeout_secs: DEFAULT_CLOSE_TIMEOUT_SECS,
            initial_callback_table_size: DEFAULT_CALLBACK_TABLE_SIZE,
            initial_peer_table_size: DEFAULT_PEER_TABLE_SIZE,
            pooled_buffer_count: DEFAULT_POOLED_BUFFER_COUNT,
            ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }
}

impl NetConfig {
    /// Bounded close timeout as a [`Duration`].
    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    /// Largest complete frame this configuration admits:
    /// header + payload + trailing response id.
    pub fn max_frame_len(&self) -> usize {
        HEADER_SIZE + self.max_packet_size as usize + RESPONSE_ID_SIZE
    }

    /// Ring capacity, clamped so a maximal frame always fits.
    pub fn effective_ring_capacity(&self) -> usize {
        self.ring_capacity
            .max(self.max_frame_len())
            .next_power_of_two()
    }
}
