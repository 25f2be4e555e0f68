use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bound for opening a link and completing the handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound for a single outbound send.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(60);

/// How long the drain loop waits before rechecking a non-active session.
pub const QUEUE_PAUSE_INTERVAL: Duration = Duration::from_secs(10);

/// Delay after a failed send before the head is retried (or the next
/// message is attempted).
pub const SEND_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Time to wait for a pong response (or any incoming message).
///
/// If nothing arrives within this window the gateway link is considered
/// dead and the drop is treated as recoverable.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often to send keepalive pings on the gateway link.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(20);

/// Maximum gateway message size in bytes (16 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Timeout for request/response operations on the gateway link.
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Close code the gateway sends when the device was logged out remotely.
///
/// Credentials are presumed invalid and the session must not reconnect.
pub const WS_CLOSE_LOGGED_OUT: u16 = 4401;

/// Namespace suffix for an individual contact address.
pub const INDIVIDUAL_SUFFIX: &str = "@s.whatsapp.net";

/// Namespace suffix for a group address.
pub const GROUP_SUFFIX: &str = "@g.us";

/// Shortest accepted phone number after stripping non-digits.
pub const PHONE_MIN_DIGITS: usize = 10;

/// Longest accepted phone number after stripping non-digits.
pub const PHONE_MAX_DIGITS: usize = 15;

/// Gateway message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Handshake
    #[serde(rename = "hello")]
    Hello,
    #[serde(rename = "authenticated")]
    Authenticated,
    #[serde(rename = "pairing_required")]
    PairingRequired,

    // Requests from client to gateway
    #[serde(rename = "request_pairing_code")]
    RequestPairingCode,
    #[serde(rename = "send_text")]
    SendText,

    // Responses from gateway to client
    #[serde(rename = "pairing_code")]
    PairingCode,
    #[serde(rename = "send_ack")]
    SendAck,
    #[serde(rename = "error")]
    Error,

    // Events from gateway to client (push notifications)
    #[serde(rename = "credentials_update")]
    CredentialsUpdate,
    #[serde(rename = "challenge")]
    Challenge,
    #[serde(rename = "paired")]
    Paired,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Common gateway error codes.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
pub const WS_ERR_CODE_UNAUTHORIZED: i32 = 401;
pub const WS_ERR_CODE_RATE_LIMITED: i32 = 429;
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
