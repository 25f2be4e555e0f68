use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{GROUP_SUFFIX, INDIVIDUAL_SUFFIX};

/// Lifecycle state of the outbound session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No link and no reconnect in progress.
    #[default]
    Disconnected,
    /// Handshake in progress (or waiting for pairing to be requested).
    Connecting,
    /// A pairing code was issued; waiting for the device to confirm.
    Pairing,
    /// Authenticated; messages may be sent.
    Active,
    /// Operator-initiated teardown in progress.
    Closing,
    /// Unrecoverable transport fault. Requires an explicit connect.
    Errored,
}

impl ConnectionState {
    /// Returns `true` while a session is running or being established.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Connecting | Self::Pairing | Self::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Pairing => "pairing",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Errored => "errored",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of recipient a target identifier names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    Individual,
    Group,
}

/// Fully qualified recipient address, as routed by the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Qualifies a raw phone number or group identifier with the namespace
    /// suffix for its kind.
    pub fn resolve(target_id: &str, kind: TargetKind) -> Self {
        let suffix = match kind {
            TargetKind::Individual => INDIVIDUAL_SUFFIX,
            TargetKind::Group => GROUP_SUFFIX,
        };
        Self(format!("{target_id}{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::Active).unwrap(),
            "\"active\""
        );
        let s: ConnectionState = serde_json::from_str("\"errored\"").unwrap();
        assert_eq!(s, ConnectionState::Errored);
    }

    #[test]
    fn connection_state_display_matches_serde() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Pairing,
            ConnectionState::Active,
            ConnectionState::Closing,
            ConnectionState::Errored,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
    }

    #[test]
    fn running_states() {
        assert!(ConnectionState::Connecting.is_running());
        assert!(ConnectionState::Pairing.is_running());
        assert!(ConnectionState::Active.is_running());
        assert!(!ConnectionState::Disconnected.is_running());
        assert!(!ConnectionState::Errored.is_running());
        assert!(!ConnectionState::Closing.is_running());
    }

    #[test]
    fn resolve_individual_address() {
        let addr = Address::resolve("15551234567", TargetKind::Individual);
        assert_eq!(addr.as_str(), "15551234567@s.whatsapp.net");
    }

    #[test]
    fn resolve_group_address() {
        let addr = Address::resolve("120363025246125486", TargetKind::Group);
        assert_eq!(addr.to_string(), "120363025246125486@g.us");
    }

    #[test]
    fn target_kind_deserializes() {
        let k: TargetKind = serde_json::from_str("\"group\"").unwrap();
        assert_eq!(k, TargetKind::Group);
    }
}
