//! WebSocket read pump. Routes responses and turns pushes into link events.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use herald_credentials::CredentialBundle;
use herald_protocol::constants::{
    MessageType, WS_CLOSE_LOGGED_OUT, WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT,
};
use herald_protocol::envelope::Message;
use herald_protocol::messages::{ChallengeEvent, CredentialsUpdateEvent};

use crate::gateway::PendingMap;
use crate::transport::{DisconnectReason, LinkEvent};

/// Reads frames from the WebSocket until the link dies.
///
/// Any incoming frame resets the pong deadline; if nothing arrives within
/// [`WS_PONG_WAIT`] the link is considered dead. On exit every pending
/// request is failed and a final [`LinkEvent::Closed`] is emitted.
///
/// A logged-out close sets `logged_out` before the pending requests fail,
/// so their waiters can tell it apart from a plain drop.
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: PendingMap,
    events: mpsc::Sender<LinkEvent>,
    device_id: String,
    write_tx: mpsc::Sender<tungstenite::Message>,
    logged_out: Arc<AtomicBool>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break DisconnectReason::Lost("link closed".into()),

            () = &mut pong_deadline => {
                warn!("pong timeout, gateway link dead");
                break DisconnectReason::Lost("pong timeout".into());
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                handle_text_message(&text, &pending, &events, &device_id).await;
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received pong");
                            }
                            tungstenite::Message::Close(frame) => {
                                break close_reason(frame.as_ref());
                            }
                            _ => {} // Binary is not part of the protocol.
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break DisconnectReason::Lost(e.to_string());
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break DisconnectReason::Lost("stream ended".into());
                    }
                }
            }
        }
    };

    if reason == DisconnectReason::LoggedOut {
        logged_out.store(true, Ordering::Release);
    }
    // Dropping the senders fails every waiting request.
    pending.lock().await.clear();
    let _ = events.send(LinkEvent::Closed(reason)).await;
}

fn close_reason(frame: Option<&tungstenite::protocol::CloseFrame>) -> DisconnectReason {
    match frame {
        Some(f) if u16::from(f.code) == WS_CLOSE_LOGGED_OUT => {
            debug!("gateway logged this device out (close code {WS_CLOSE_LOGGED_OUT})");
            DisconnectReason::LoggedOut
        }
        Some(f) => {
            debug!(code = u16::from(f.code), reason = f.reason.as_str(), "received close frame");
            DisconnectReason::Lost(format!("closed by gateway ({})", u16::from(f.code)))
        }
        None => {
            debug!("received close frame");
            DisconnectReason::Lost("closed by gateway".into())
        }
    }
}

/// Handles a text frame: a response goes to its waiter, a push becomes an
/// event.
async fn handle_text_message(
    text: &str,
    pending: &PendingMap,
    events: &mpsc::Sender<LinkEvent>,
    device_id: &str,
) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes), dropping", text.len());
        return;
    }

    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse message: {e}");
            return;
        }
    };

    trace!(msg_type = ?msg.msg_type, id = %msg.id, "received message");

    let mut map = pending.lock().await;
    if let Some(tx) = map.remove(&msg.id) {
        let _ = tx.send(msg);
        return;
    }
    drop(map);

    let event = match push_event(&msg, device_id) {
        Ok(Some(event)) => event,
        Ok(None) => {
            debug!(msg_type = ?msg.msg_type, id = %msg.id, "ignoring unsolicited message");
            return;
        }
        Err(e) => {
            warn!(msg_type = ?msg.msg_type, "malformed push payload: {e}");
            return;
        }
    };
    let _ = events.send(event).await;
}

fn push_event(msg: &Message, device_id: &str) -> Result<Option<LinkEvent>, serde_json::Error> {
    let event = match msg.msg_type {
        MessageType::CredentialsUpdate => msg
            .parse_payload::<CredentialsUpdateEvent>()?
            .map(|e| LinkEvent::CredentialsUpdated(CredentialBundle::new(device_id, e.credentials))),
        MessageType::Challenge => msg
            .parse_payload::<ChallengeEvent>()?
            .map(|e| LinkEvent::Challenge(e.challenge)),
        MessageType::Paired => Some(LinkEvent::Paired),
        _ => None,
    };
    Ok(event)
}
