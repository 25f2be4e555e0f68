//! Route handlers. Each one is a thin translation between the JSON bodies
//! and the session controller.

use actix_web::{HttpResponse, web};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use tracing::info;

use herald_protocol::api::{
    PairingRequest, PairingResponse, StartRequest, StatusResponse, SuccessResponse,
};
use herald_session::{SendRequest, SessionController, SessionError, StartParams};

use crate::error::ApiError;

/// GET /api/status
pub async fn status(session: web::Data<SessionController>) -> HttpResponse {
    let status = session.status();
    HttpResponse::Ok().json(StatusResponse {
        state: status.state,
        pairing_code: status.pairing_code,
        qr_code: status.challenge.map(|c| BASE64.encode(c)),
        queued: status.queued,
    })
}

/// POST /api/pairing
pub async fn pairing(
    session: web::Data<SessionController>,
    req: web::Json<PairingRequest>,
) -> Result<HttpResponse, ApiError> {
    const ACTION: &str = "Failed to generate pairing code";

    if req.phone_number.trim().is_empty() {
        return Err(ApiError::new(
            ACTION,
            SessionError::Validation("phone number is required".into()),
        ));
    }
    let pairing_code = session
        .request_pairing(&req.phone_number)
        .await
        .map_err(|e| ApiError::new(ACTION, e))?;
    Ok(HttpResponse::Ok().json(PairingResponse { pairing_code }))
}

/// POST /api/start
pub async fn start(
    session: web::Data<SessionController>,
    req: web::Json<StartRequest>,
) -> Result<HttpResponse, ApiError> {
    const ACTION: &str = "Failed to start session";

    let params = start_params(&req).map_err(|e| ApiError::new(ACTION, e))?;
    info!(
        targets = params.batch.iter().map(|r| r.targets.len()).sum::<usize>(),
        has_credentials = params.credential_blob.is_some(),
        input = ?req.message_input_type,
        "start requested"
    );
    session.start(params).map_err(|e| ApiError::new(ACTION, e))?;
    Ok(HttpResponse::Ok().json(SuccessResponse {
        success: true,
        message: "Started messaging session".into(),
    }))
}

/// POST /api/stop
pub async fn stop(session: web::Data<SessionController>) -> Result<HttpResponse, ApiError> {
    session
        .stop()
        .await
        .map_err(|e| ApiError::new("Failed to stop session", e))?;
    Ok(HttpResponse::Ok().json(SuccessResponse {
        success: true,
        message: "Messaging session stopped".into(),
    }))
}

/// GET /health
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

/// Builds controller input from the operator form, applying its defaults.
///
/// A missing or zero `maxRetries` falls back to
/// [`StartRequest::DEFAULT_MAX_RETRIES`]. `messageDelay` only defaults when
/// missing: an explicit `0` sends back to back. This departs from the form's
/// historical handling, which turned `0` into the one-second default.
pub fn start_params(req: &StartRequest) -> Result<StartParams, SessionError> {
    let credential_blob = match req.creds_file.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(encoded) => Some(BASE64.decode(encoded).map_err(|e| {
            SessionError::Validation(format!("credentials file is not valid base64: {e}"))
        })?),
    };

    let request = SendRequest {
        targets: req.targets(),
        target_kind: req.target_type,
        body: req.body().unwrap_or_default().to_string(),
        delay_after_secs: req
            .message_delay
            .unwrap_or(StartRequest::DEFAULT_DELAY_SECS),
        retry_enabled: req.enable_retry,
        max_retries: req
            .max_retries
            .filter(|&n| n > 0)
            .unwrap_or(StartRequest::DEFAULT_MAX_RETRIES),
    };

    Ok(StartParams {
        credential_blob,
        batch: vec![request],
    })
}

#[cfg(test)]
mod tests {
    use herald_protocol::TargetKind;
    use herald_protocol::api::MessageInputType;

    use super::*;

    #[test]
    fn form_defaults_apply() {
        let req = StartRequest {
            target_phones: "111, 222".into(),
            message_text: Some("hi".into()),
            ..StartRequest::default()
        };
        let params = start_params(&req).unwrap();
        assert!(params.credential_blob.is_none());

        let batch = &params.batch[0];
        assert_eq!(batch.targets, vec!["111", "222"]);
        assert_eq!(batch.target_kind, TargetKind::Individual);
        assert_eq!(batch.delay_after_secs, 1);
        assert!(!batch.retry_enabled);
        assert_eq!(batch.max_retries, 3);
    }

    #[test]
    fn explicit_values_win() {
        let req = StartRequest {
            target_type: TargetKind::Group,
            target_phones: "g1".into(),
            message_input_type: MessageInputType::File,
            message_file: Some("from file".into()),
            message_delay: Some(0),
            enable_retry: true,
            max_retries: Some(5),
            ..StartRequest::default()
        };
        let batch = &start_params(&req).unwrap().batch[0];
        assert_eq!(batch.body, "from file");
        assert_eq!(batch.delay_after_secs, 0);
        assert!(batch.retry_enabled);
        assert_eq!(batch.max_retries, 5);
    }

    #[test]
    fn zero_max_retries_falls_back_to_default() {
        let req = StartRequest {
            target_phones: "111".into(),
            message_text: Some("hi".into()),
            enable_retry: true,
            max_retries: Some(0),
            message_delay: Some(0),
            ..StartRequest::default()
        };
        let batch = &start_params(&req).unwrap().batch[0];
        assert_eq!(batch.max_retries, StartRequest::DEFAULT_MAX_RETRIES);
        assert_eq!(batch.delay_after_secs, 0);
    }

    #[test]
    fn credentials_are_base64_decoded() {
        let req = StartRequest {
            creds_file: Some(BASE64.encode(b"{\"keys\":1}")),
            ..StartRequest::default()
        };
        let params = start_params(&req).unwrap();
        assert_eq!(params.credential_blob.as_deref(), Some(&b"{\"keys\":1}"[..]));

        let req = StartRequest {
            creds_file: Some("  ".into()),
            ..StartRequest::default()
        };
        assert!(start_params(&req).unwrap().credential_blob.is_none());
    }

    #[test]
    fn bad_base64_is_a_validation_error() {
        let req = StartRequest {
            creds_file: Some("not base64!".into()),
            ..StartRequest::default()
        };
        assert!(matches!(
            start_params(&req),
            Err(SessionError::Validation(_))
        ));
    }
}
