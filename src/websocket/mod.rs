//! WebSocket protocol layer.
//!
//! # Data Flow
//! ```text
//! HTTP request with Upgrade: websocket
//!     → handshake.rs (validate headers, hijack, write 101)
//!     → client.rs (framed read/write/close over the hijacked transport)
//!     → room.rs (optional: registry + broadcast event loop)
//!
//! frame.rs encodes and decodes the wire frames for all of the above.
//! ```
//!
//! # Design Decisions
//! - Frames are never fragmented on send and never auto-answered on receive
//! - No extension or subprotocol negotiation

pub mod client;
pub mod frame;
pub mod handshake;
pub mod room;

pub use client::{Client, ClientId};
pub use frame::{CloseCode, Frame, FrameError, Opcode};
pub use handshake::{accept_key, Upgrader, WsError};
pub use room::{Room, RoomError, RoomMessage, RoomOptions};
