//! Seam between the session core and the messaging network.
//!
//! A [`Connector`] opens one [`Link`] per handshake. The link is the only
//! channel to the network; everything it observes on its own (rotated
//! credentials, pairing confirmation, drops) arrives as [`LinkEvent`]s on
//! the receiver handed out with it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

use herald_credentials::CredentialBundle;
use herald_protocol::Address;

use crate::error::TransportError;

/// A boxed future returned by transport methods.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Outcome of the initial handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Handshake {
    /// Stored credentials were accepted.
    Authenticated,
    /// The device is not linked. A pairing code may be requested, or the
    /// challenge scanned.
    PairingRequired { challenge: Option<Vec<u8>> },
}

/// Why a link went away.
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectReason {
    /// The remote logged this device out. Credentials are void.
    LoggedOut,
    /// Network drop, keepalive timeout, or server restart.
    Lost(String),
    /// The transport cannot continue and reconnecting will not help.
    Fatal(String),
}

impl DisconnectReason {
    pub fn should_reconnect(&self) -> bool {
        matches!(self, Self::Lost(_))
    }
}

/// Notifications pushed by a live link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Keys rotated; persist them.
    CredentialsUpdated(CredentialBundle),
    /// A new scannable challenge replaced the previous one.
    Challenge(Vec<u8>),
    /// The remote device confirmed pairing; the session is authenticated.
    Paired,
    /// The link is gone. Always the last event.
    Closed(DisconnectReason),
}

/// A freshly opened link and its event stream.
pub struct OpenedLink {
    pub link: Arc<dyn Link>,
    pub handshake: Handshake,
    pub events: mpsc::Receiver<LinkEvent>,
}

/// Opens links to the messaging network.
pub trait Connector: Send + Sync + 'static {
    /// Connects and performs the handshake, presenting `credentials` when
    /// the device was linked before.
    fn open(&self, credentials: Option<CredentialBundle>) -> TransportFuture<'_, OpenedLink>;
}

/// One live connection to the messaging network.
///
/// Sends are not safe to interleave on the network side; callers keep at
/// most one in flight.
pub trait Link: Send + Sync + 'static {
    /// Requests a one-time code the user types on their phone to link this
    /// device. `phone_number` is digits only.
    fn request_pairing_code<'a>(&'a self, phone_number: &'a str) -> TransportFuture<'a, String>;

    /// Sends a text message.
    fn send_text<'a>(&'a self, to: &'a Address, text: &'a str) -> TransportFuture<'a, ()>;

    /// Closes the connection. Idempotent.
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}
