//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (lifecycle tracking)
//!     → backend (hands the stream to the HTTP layer)
//!
//! tls.rs loads certificates for the delegated backend.
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Transient accept errors never stop a listener

pub mod connection;
pub mod listener;
pub mod tls;
