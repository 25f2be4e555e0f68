//! Outbound messaging session.
//!
//! Owns the connection lifecycle against the messaging gateway, device
//! pairing, credential persistence, and the paced delivery queue.

pub mod controller;
pub mod error;
pub mod gateway;
pub(crate) mod handshake;
pub mod machine;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub(crate) mod pumps;
pub mod queue;
pub(crate) mod supervisor;
pub mod transport;
pub mod types;

pub use controller::SessionController;
pub use error::{SessionError, TransportError};
pub use gateway::{GatewayConnector, GatewayLink};
pub use machine::{ConnectionMachine, normalize_phone};
pub use queue::{DeliveryQueue, Outbound, QueueTiming};
pub use transport::{Connector, DisconnectReason, Handshake, Link, LinkEvent, OpenedLink};
pub use types::{
    Ack, DropReason, OutboundMessage, PairingInfo, ReconnectConfig, SendRequest, SessionConfig,
    SessionEvent, SessionStatus, StartParams,
};
