use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::MessageType;

/// Rejection reason the gateway attaches to a failed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: i32,
    pub message: String,
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// One frame of the gateway protocol.
///
/// Requests and their replies share an `id`; pushes from the gateway carry
/// an id nobody is waiting on. The `payload` stays raw until the receiver
/// knows which type to read it as.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<serde_json::value::RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Message {
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let payload = payload
            .map(serde_json::value::to_raw_value)
            .transpose()?;
        Ok(Self {
            id: id.into(),
            msg_type,
            payload,
            error: None,
        })
    }

    /// Reads the payload as `T`. `None` when the frame has no payload.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        self.payload
            .as_ref()
            .map(|raw| serde_json::from_str(raw.get()))
            .transpose()
    }

    /// A gateway rejection of request `id`.
    pub fn error(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            msg_type: MessageType::Error,
            payload: None,
            error: Some(ErrorInfo {
                code,
                message: message.into(),
            }),
        }
    }

    /// A reply to this frame, correlated by id.
    pub fn reply<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Message::new(&self.id, msg_type, payload)
    }

    /// Splits a rejection from a regular reply.
    ///
    /// A frame of type `error` without details still counts as a rejection.
    pub fn into_result(self) -> Result<Self, ErrorInfo> {
        match (self.error, self.msg_type) {
            (Some(err), _) => Err(err),
            (None, MessageType::Error) => Err(ErrorInfo {
                code: crate::constants::WS_ERR_CODE_INTERNAL,
                message: "unspecified gateway error".into(),
            }),
            (None, msg_type) => Ok(Self {
                error: None,
                msg_type,
                ..self
            }),
        }
    }
}
