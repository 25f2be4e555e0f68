//! Gateway hello and pairing-code exchanges.

use herald_protocol::constants::{MessageType, WS_ERR_CODE_UNAUTHORIZED};
use herald_protocol::messages::{
    HelloRequest, PairingCodeRequest, PairingCodeResponse, PairingRequiredResponse,
};

use crate::error::TransportError;
use crate::gateway::GatewayLink;
use crate::transport::Handshake;

/// Sends `hello` on a fresh link.
///
/// Returns [`Handshake::Authenticated`] when the presented credentials were
/// accepted, or [`Handshake::PairingRequired`] when the device must be
/// linked first. The link stays open either way. A `hello` refused as
/// unauthorized means the presented credentials were logged out.
pub(crate) async fn perform_handshake(
    link: &GatewayLink,
    hello: &HelloRequest,
) -> Result<Handshake, TransportError> {
    let resp = link
        .send_request(MessageType::Hello, Some(hello))
        .await
        .map_err(|err| match err {
            TransportError::Rejected { code, .. } if code == WS_ERR_CODE_UNAUTHORIZED => {
                TransportError::LoggedOut
            }
            other => other,
        })?;

    match resp.msg_type {
        MessageType::Authenticated => Ok(Handshake::Authenticated),
        MessageType::PairingRequired => {
            let pairing = resp
                .parse_payload::<PairingRequiredResponse>()?
                .unwrap_or_default();
            Ok(Handshake::PairingRequired {
                challenge: pairing.challenge,
            })
        }
        other => Err(TransportError::Fatal(format!(
            "unexpected handshake reply {other:?}"
        ))),
    }
}

/// Asks the gateway for a pairing code for `phone_number` (digits only).
pub(crate) async fn request_pairing_code(
    link: &GatewayLink,
    phone_number: &str,
) -> Result<String, TransportError> {
    let req = PairingCodeRequest {
        phone_number: phone_number.to_string(),
    };
    let resp = link
        .send_request(MessageType::RequestPairingCode, Some(&req))
        .await?;

    match resp.msg_type {
        MessageType::PairingCode => {
            let code = resp
                .parse_payload::<PairingCodeResponse>()?
                .ok_or_else(|| TransportError::PairingFailed("empty response".into()))?
                .code;
            if code.trim().is_empty() {
                return Err(TransportError::PairingFailed("empty pairing code".into()));
            }
            Ok(code)
        }
        _ => Err(TransportError::PairingFailed("unexpected response".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::answer_next;
    use herald_protocol::envelope::Message;

    fn hello() -> HelloRequest {
        HelloRequest {
            device_id: "dev-1".into(),
            client_version: "0.1.0".into(),
            credentials: Some(b"keys".to_vec()),
        }
    }

    #[tokio::test]
    async fn authenticated_hello() {
        let (link, write_rx, pending) = GatewayLink::detached();
        let server = answer_next(write_rx, pending, |req| {
            req.reply::<()>(MessageType::Authenticated, None).unwrap()
        });

        let result = perform_handshake(&link, &hello()).await.unwrap();
        assert_eq!(result, Handshake::Authenticated);

        let req = server.await.unwrap();
        assert_eq!(req.msg_type, MessageType::Hello);
        let sent: HelloRequest = req.parse_payload().unwrap().unwrap();
        assert_eq!(sent.credentials.as_deref(), Some(&b"keys"[..]));
    }

    #[tokio::test]
    async fn unlinked_device_needs_pairing() {
        let (link, write_rx, pending) = GatewayLink::detached();
        let _server = answer_next(write_rx, pending, |req| {
            req.reply(
                MessageType::PairingRequired,
                Some(&PairingRequiredResponse {
                    challenge: Some(vec![9, 9]),
                }),
            )
            .unwrap()
        });

        let result = perform_handshake(&link, &hello()).await.unwrap();
        assert_eq!(
            result,
            Handshake::PairingRequired {
                challenge: Some(vec![9, 9])
            }
        );
    }

    #[tokio::test]
    async fn unauthorized_hello_is_logged_out() {
        let (link, write_rx, pending) = GatewayLink::detached();
        let _server = answer_next(write_rx, pending, |req| {
            Message::error(req.id.clone(), WS_ERR_CODE_UNAUTHORIZED, "credentials revoked")
        });

        let err = perform_handshake(&link, &hello()).await.unwrap_err();
        assert!(matches!(err, TransportError::LoggedOut));
    }

    #[tokio::test]
    async fn pairing_code_is_returned() {
        let (link, write_rx, pending) = GatewayLink::detached();
        let server = answer_next(write_rx, pending, |req| {
            req.reply(
                MessageType::PairingCode,
                Some(&PairingCodeResponse {
                    code: "WXYZ-1234".into(),
                }),
            )
            .unwrap()
        });

        let code = request_pairing_code(&link, "15551234567").await.unwrap();
        assert_eq!(code, "WXYZ-1234");

        let req = server.await.unwrap();
        let sent: PairingCodeRequest = req.parse_payload().unwrap().unwrap();
        assert_eq!(sent.phone_number, "15551234567");
    }

    #[tokio::test]
    async fn unexpected_pairing_reply_fails() {
        let (link, write_rx, pending) = GatewayLink::detached();
        let _server = answer_next(write_rx, pending, |req| {
            req.reply::<()>(MessageType::Paired, None).unwrap()
        });

        let err = request_pairing_code(&link, "15551234567").await.unwrap_err();
        assert!(matches!(err, TransportError::PairingFailed(_)));
    }
}
