//! Wire protocols.
//!
//! Producers speak a line-oriented event-frame protocol ([`EventCodec`]).
//! Consumers speak single-frame WebSocket ([`FrameCodec`]) after an HTTP
//! upgrade handled in [`handshake`].

pub mod error;
pub mod event;
pub mod frame;
pub mod handshake;

pub use error::ProtocolError;
pub use event::{Event, EventCodec};
pub use frame::{Frame, FrameCodec, Role};
