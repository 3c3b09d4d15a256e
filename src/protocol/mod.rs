//! Protocol module - wire format, frames, and reassembly.
//!
//! - 7-byte header encoding/decoding with checksum
//! - [`InboundFrame`] holding a reassembled frame in a pooled buffer
//! - [`Reassembler`] state machine over the receive ring

pub mod frame;
pub mod reassembler;
pub mod wire;

pub use frame::InboundFrame;
pub use reassembler::Reassembler;
pub use wire::{
    is_reserved_command, serialize_into, split_frame, FrameRef, RawHeader, WireMode,
    CMD_CONNECT, CMD_DISCONNECT, CMD_PING, HEADER_SIZE, PACKET_SIZE_MAX, RESPONSE_ID_SIZE,
    USER_COMMAND_LIMIT,
};
