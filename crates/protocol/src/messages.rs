use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Opens a session. Carries the stored credentials when there are any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloRequest {
    pub device_id: String,
    pub client_version: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes_opt"
    )]
    pub credentials: Option<Vec<u8>>,
}

/// Asks the gateway for a one-time code to link this device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingCodeRequest {
    pub phone_number: String,
}

/// Sends a plain text message to a fully qualified address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendTextRequest {
    pub jid: String,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Returned instead of `authenticated` when the device must be linked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PairingRequiredResponse {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes_opt"
    )]
    pub challenge: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingCodeResponse {
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAckResponse {
    #[serde(default)]
    pub message_id: String,
}

// ---------------------------------------------------------------------------
// Push events
// ---------------------------------------------------------------------------

/// Updated session keys; must be persisted so the next hello authenticates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialsUpdateEvent {
    #[serde(with = "base64_bytes")]
    pub credentials: Vec<u8>,
}

/// A fresh scannable challenge (rotates while the device is unlinked).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeEvent {
    #[serde(with = "base64_bytes")]
    pub challenge: Vec<u8>,
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

mod base64_bytes_opt {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        data: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        data.as_ref()
            .map(|d| STANDARD.encode(d))
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| STANDARD.decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
