use std::fmt;

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};

use herald_protocol::api::ErrorResponse;
use herald_session::SessionError;

/// A failed API call: what was attempted plus the session error behind it.
#[derive(Debug)]
pub struct ApiError {
    action: &'static str,
    source: SessionError,
}

impl ApiError {
    pub fn new(action: &'static str, source: SessionError) -> Self {
        Self { action, source }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.action, self.source)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self.source {
            SessionError::Validation(_) => StatusCode::BAD_REQUEST,
            SessionError::InvalidState { .. } => StatusCode::CONFLICT,
            SessionError::Storage(_) | SessionError::Transport(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.action.to_string(),
            details: self.source.to_string(),
        })
    }
}
