//! JSON bodies exchanged with the operator's HTTP client.
//!
//! The operator form posts every field as a string, so numeric and boolean
//! fields accept either their native JSON type or a string spelling.

use serde::{Deserialize, Serialize};

use crate::types::{ConnectionState, TargetKind};

/// `GET /api/status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub state: ConnectionState,
    pub pairing_code: Option<String>,
    /// Base64 of the current scannable challenge, if any.
    pub qr_code: Option<String>,
    #[serde(default)]
    pub queued: usize,
}

/// `POST /api/pairing`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
    #[serde(default)]
    pub phone_number: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingResponse {
    pub pairing_code: String,
}

/// Where the message body of a start request comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageInputType {
    #[default]
    Text,
    File,
}

/// `POST /api/start`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(default)]
    pub user_phone: Option<String>,
    #[serde(default)]
    pub target_type: TargetKind,
    /// Comma-separated phone numbers or group identifiers.
    #[serde(default)]
    pub target_phones: String,
    #[serde(default)]
    pub message_input_type: MessageInputType,
    #[serde(default)]
    pub message_text: Option<String>,
    /// Contents of the uploaded message file.
    #[serde(default)]
    pub message_file: Option<String>,
    #[serde(default, with = "flexible::u64_opt")]
    pub message_delay: Option<u64>,
    #[serde(default, with = "flexible::truthy")]
    pub enable_retry: bool,
    #[serde(default, with = "flexible::u32_opt")]
    pub max_retries: Option<u32>,
    /// Base64 of an operator-supplied credentials backup.
    #[serde(default)]
    pub creds_file: Option<String>,
}

impl StartRequest {
    /// Delay between messages when the form leaves it empty.
    pub const DEFAULT_DELAY_SECS: u64 = 1;
    /// Retry budget when the form leaves it empty.
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// Splits `target_phones` on commas, trimming and skipping blanks.
    pub fn targets(&self) -> Vec<String> {
        self.target_phones
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Picks the message body according to `message_input_type`.
    pub fn body(&self) -> Option<&str> {
        match self.message_input_type {
            MessageInputType::File => self
                .message_file
                .as_deref()
                .or(self.message_text.as_deref()),
            MessageInputType::Text => self.message_text.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: String,
}

mod flexible {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Num(u64),
        Str(String),
    }

    fn parse_num<E: serde::de::Error>(raw: Option<Raw>) -> Result<Option<u64>, E> {
        match raw {
            None => Ok(None),
            Some(Raw::Num(n)) => Ok(Some(n)),
            Some(Raw::Str(s)) if s.trim().is_empty() => Ok(None),
            Some(Raw::Str(s)) => s.trim().parse().map(Some).map_err(E::custom),
            Some(Raw::Bool(_)) => Err(E::custom("expected a number")),
        }
    }

    pub mod u64_opt {
        use super::*;

        pub fn serialize<S: Serializer>(v: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
            v.serialize(s)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
            parse_num(Option::<Raw>::deserialize(d)?)
        }
    }

    pub mod u32_opt {
        use super::*;

        pub fn serialize<S: Serializer>(v: &Option<u32>, s: S) -> Result<S::Ok, S::Error> {
            v.serialize(s)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
            parse_num(Option::<Raw>::deserialize(d)?)?
                .map(|n| u32::try_from(n).map_err(serde::de::Error::custom))
                .transpose()
        }
    }

    pub mod truthy {
        use super::*;

        pub fn serialize<S: Serializer>(v: &bool, s: S) -> Result<S::Ok, S::Error> {
            v.serialize(s)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
            match Option::<Raw>::deserialize(d)? {
                None => Ok(false),
                Some(Raw::Bool(b)) => Ok(b),
                Some(Raw::Num(n)) => Ok(n != 0),
                Some(Raw::Str(s)) => Ok(matches!(s.trim(), "true" | "on" | "1")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_request_from_form_strings() {
        let req: StartRequest = serde_json::from_str(
            r#"{
                "userPhone": "15550000000",
                "targetType": "individual",
                "targetPhones": " 15551111111, ,15552222222 ",
                "messageInputType": "text",
                "messageText": "hi",
                "messageDelay": "2",
                "enableRetry": "true",
                "maxRetries": "4"
            }"#,
        )
        .unwrap();
        assert_eq!(req.targets(), vec!["15551111111", "15552222222"]);
        assert_eq!(req.message_delay, Some(2));
        assert!(req.enable_retry);
        assert_eq!(req.max_retries, Some(4));
        assert_eq!(req.body(), Some("hi"));
    }

    #[test]
    fn start_request_native_types_and_defaults() {
        let req: StartRequest = serde_json::from_str(
            r#"{"targetType":"group","targetPhones":"g1","messageText":"x","messageDelay":0,"enableRetry":false}"#,
        )
        .unwrap();
        assert_eq!(req.target_type, TargetKind::Group);
        assert_eq!(req.message_delay, Some(0));
        assert!(!req.enable_retry);
        assert_eq!(req.max_retries, None);
        assert!(req.creds_file.is_none());
    }

    #[test]
    fn start_request_blank_numbers_are_absent() {
        let req: StartRequest =
            serde_json::from_str(r#"{"messageDelay":"","maxRetries":" "}"#).unwrap();
        assert_eq!(req.message_delay, None);
        assert_eq!(req.max_retries, None);
    }

    #[test]
    fn start_request_rejects_garbage_number() {
        let result: Result<StartRequest, _> = serde_json::from_str(r#"{"messageDelay":"soon"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn file_input_prefers_file_contents() {
        let req = StartRequest {
            message_input_type: MessageInputType::File,
            message_text: Some("typed".into()),
            message_file: Some("from file".into()),
            ..StartRequest::default()
        };
        assert_eq!(req.body(), Some("from file"));
    }

    #[test]
    fn status_response_shape() {
        let resp = StatusResponse {
            state: ConnectionState::Connecting,
            pairing_code: Some("ABCD-EFGH".into()),
            qr_code: None,
            queued: 2,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["state"], "connecting");
        assert_eq!(json["pairingCode"], "ABCD-EFGH");
        assert!(json["qrCode"].is_null());
        assert_eq!(json["queued"], 2);
    }
}
