//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (method, host, path)
//!     → router.rs (route lookup, 404/405)
//!     → matcher.rs (pattern parsing and matching)
//!     → matched handler (possibly files.rs)
//! ```
//!
//! # Design Decisions
//! - Routes registered before serving, immutable at runtime
//! - No regex in the hot path (exact and prefix matching only)
//! - Most specific pattern wins, independent of registration order

pub mod files;
pub mod matcher;
pub mod router;

pub use files::{FileServer, StripPrefix};
pub use matcher::{Pattern, PatternError};
pub use router::Router;
