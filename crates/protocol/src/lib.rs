//! Wire and API types for the Herald outbound messaging session.
//!
//! Covers the gateway envelope spoken by the transport, the lifecycle and
//! addressing types shared by every crate, and the JSON bodies of the
//! operator HTTP surface.

pub mod api;
pub mod constants;
pub mod envelope;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use envelope::{ErrorInfo, Message};
pub use types::{Address, ConnectionState, TargetKind};
