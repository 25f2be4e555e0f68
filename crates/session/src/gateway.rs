//! WebSocket transport to the messaging gateway.
//!
//! Implements request-response with UUID correlation, ping/pong keepalive,
//! and forwarding of push events as [`LinkEvent`]s.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use herald_credentials::CredentialBundle;
use herald_protocol::Address;
use herald_protocol::constants::{
    MessageType, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_REQUEST_TIMEOUT,
};
use herald_protocol::envelope::Message;
use herald_protocol::messages::{HelloRequest, SendAckResponse, SendTextRequest};

use crate::error::TransportError;
use crate::transport::{Connector, Link, LinkEvent, OpenedLink, TransportFuture};

/// Requests awaiting a response, keyed by message id.
pub(crate) type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;

/// Opens [`GatewayLink`]s to a gateway URL.
#[derive(Debug, Clone)]
pub struct GatewayConnector {
    url: String,
    device_id: String,
    client_version: String,
    keepalive: Duration,
}

impl GatewayConnector {
    pub fn new(url: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            device_id: device_id.into(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            keepalive: WS_PING_PERIOD,
        }
    }

    /// Sets the ping period of opened links. Zero keeps the default; values
    /// must stay below the pong deadline for the link to survive idling.
    pub fn with_keepalive(mut self, period: Duration) -> Self {
        if !period.is_zero() {
            self.keepalive = period;
        }
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for GatewayConnector {
    fn open(&self, credentials: Option<CredentialBundle>) -> TransportFuture<'_, OpenedLink> {
        Box::pin(async move {
            let hello = HelloRequest {
                device_id: self.device_id.clone(),
                client_version: self.client_version.clone(),
                credentials: credentials.map(|c| c.blob),
            };
            let (link, events) =
                GatewayLink::connect(&self.url, &self.device_id, self.keepalive).await?;
            let handshake = crate::handshake::perform_handshake(&link, &hello).await?;
            Ok(OpenedLink {
                link: Arc::new(link),
                handshake,
                events,
            })
        })
    }
}

/// One WebSocket connection to the gateway.
pub struct GatewayLink {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: PendingMap,
    /// Set by the read pump when the gateway closed with the logged-out code.
    logged_out: Arc<AtomicBool>,
    cancel: CancellationToken,
    read_handle: tokio::task::JoinHandle<()>,
    write_handle: tokio::task::JoinHandle<()>,
    ping_handle: tokio::task::JoinHandle<()>,
}

impl GatewayLink {
    /// Opens the WebSocket and starts the pumps. The handshake is left to
    /// the caller.
    pub(crate) async fn connect(
        url: &str,
        device_id: &str,
        keepalive: Duration,
    ) -> Result<(Self, mpsc::Receiver<LinkEvent>), TransportError> {
        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
        let (write, read) = ws_stream.split();
        debug!(url, "gateway socket open");

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(256);
        let (events_tx, events_rx) = mpsc::channel::<LinkEvent>(64);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let logged_out = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(crate::pumps::write::write_pump(
            write,
            write_rx,
            cancel.clone(),
        ));

        let read_handle = tokio::spawn(crate::pumps::read::read_pump(
            read,
            pending.clone(),
            events_tx,
            device_id.to_string(),
            write_tx.clone(),
            logged_out.clone(),
            cancel.clone(),
        ));

        let ping_handle = tokio::spawn(crate::pumps::ping::ping_pump(
            write_tx.clone(),
            keepalive,
            cancel.clone(),
        ));

        let link = Self {
            write_tx,
            pending,
            logged_out,
            cancel,
            read_handle,
            write_handle,
            ping_handle,
        };
        Ok((link, events_rx))
    }

    /// Sends a request and waits for the response.
    pub(crate) async fn send_request<T: serde::Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Message, TransportError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, msg_type, payload)?;
        let json = serde_json::to_string(&msg)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if self
            .write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(self.closed_error());
        }

        let result = tokio::time::timeout(WS_REQUEST_TIMEOUT, rx).await;

        // Clean up pending entry on any exit path.
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(resp)) => resp.into_result().map_err(|err| TransportError::Rejected {
                code: err.code,
                message: err.message,
            }),
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// What a request on a dead link fails with.
    fn closed_error(&self) -> TransportError {
        if self.logged_out.load(Ordering::Acquire) {
            TransportError::LoggedOut
        } else {
            TransportError::Closed
        }
    }
}

impl Link for GatewayLink {
    fn request_pairing_code<'a>(&'a self, phone_number: &'a str) -> TransportFuture<'a, String> {
        Box::pin(crate::handshake::request_pairing_code(self, phone_number))
    }

    fn send_text<'a>(&'a self, to: &'a Address, text: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let req = SendTextRequest {
                jid: to.as_str().to_string(),
                text: text.to_string(),
            };
            let resp = self.send_request(MessageType::SendText, Some(&req)).await?;
            if resp.msg_type != MessageType::SendAck {
                return Err(TransportError::Rejected {
                    code: 500,
                    message: format!("unexpected reply {:?} to send_text", resp.msg_type),
                });
            }
            if let Some(ack) = resp.parse_payload::<SendAckResponse>()? {
                debug!(jid = %to, message_id = %ack.message_id, "gateway acknowledged send");
            }
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let _ = self.write_tx.try_send(tungstenite::Message::Close(None));
            self.cancel.cancel();
        })
    }
}

impl Drop for GatewayLink {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.write_handle.abort();
        self.ping_handle.abort();
    }
}

#[cfg(test)]
impl GatewayLink {
    /// A link wired to in-memory channels instead of a socket.
    pub(crate) fn detached() -> (Self, mpsc::Receiver<tungstenite::Message>, PendingMap) {
        let (write_tx, write_rx) = mpsc::channel(16);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let link = Self {
            write_tx,
            pending: pending.clone(),
            logged_out: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            read_handle: tokio::spawn(async {}),
            write_handle: tokio::spawn(async {}),
            ping_handle: tokio::spawn(async {}),
        };
        (link, write_rx, pending)
    }
}

/// Answers the next request on `write_rx` with `reply(request)`.
#[cfg(test)]
pub(crate) fn answer_next(
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    pending: PendingMap,
    reply: impl FnOnce(&Message) -> Message + Send + 'static,
) -> tokio::task::JoinHandle<Message> {
    tokio::spawn(async move {
        let frame = write_rx.recv().await.unwrap();
        let tungstenite::Message::Text(text) = frame else {
            panic!("expected text frame, got {frame:?}");
        };
        let req: Message = serde_json::from_str(&text).unwrap();
        let resp = reply(&req);
        let tx = pending.lock().await.remove(&req.id).unwrap();
        tx.send(resp).unwrap();
        req
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::net::TcpListener;
    use tungstenite::protocol::CloseFrame;
    use tungstenite::protocol::frame::coding::CloseCode;

    use super::*;
    use crate::machine::ConnectionMachine;
    use crate::types::SessionConfig;
    use herald_credentials::{CredentialStore, MemoryCredentialStore};
    use herald_protocol::constants::WS_CLOSE_LOGGED_OUT;
    use herald_protocol::{ConnectionState, TargetKind};

    #[tokio::test]
    async fn send_text_correlates_ack() {
        let (link, write_rx, pending) = GatewayLink::detached();
        let server = answer_next(write_rx, pending.clone(), |req| {
            req.reply(
                MessageType::SendAck,
                Some(&SendAckResponse {
                    message_id: "wamid-1".into(),
                }),
            )
            .unwrap()
        });

        let to = Address::resolve("15551234567", TargetKind::Individual);
        link.send_text(&to, "hello").await.unwrap();

        let req = server.await.unwrap();
        assert_eq!(req.msg_type, MessageType::SendText);
        let body: SendTextRequest = req.parse_payload().unwrap().unwrap();
        assert_eq!(body.jid, "15551234567@s.whatsapp.net");
        assert_eq!(body.text, "hello");
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn gateway_error_becomes_rejected() {
        let (link, write_rx, pending) = GatewayLink::detached();
        let _server = answer_next(write_rx, pending, |req| {
            Message::error(req.id.clone(), 429, "slow down")
        });

        let to = Address::resolve("120363", TargetKind::Group);
        let err = link.send_text(&to, "hello").await.unwrap_err();
        match err {
            TransportError::Rejected { code, message } => {
                assert_eq!(code, 429);
                assert_eq!(message, "slow down");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_waiter_reports_closed() {
        let (link, mut write_rx, pending) = GatewayLink::detached();
        let to = Address::resolve("15551234567", TargetKind::Individual);

        let cleaner = tokio::spawn(async move {
            write_rx.recv().await.unwrap();
            pending.lock().await.clear();
        });
        let err = link.send_text(&to, "hello").await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        cleaner.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let (link, _write_rx, pending) = GatewayLink::detached();
        let to = Address::resolve("15551234567", TargetKind::Individual);
        let err = link.send_text(&to, "hello").await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn dropped_waiter_after_logout_reports_logged_out() {
        let (link, mut write_rx, pending) = GatewayLink::detached();
        let flag = link.logged_out.clone();
        let to = Address::resolve("15551234567", TargetKind::Individual);

        let cleaner = tokio::spawn(async move {
            write_rx.recv().await.unwrap();
            flag.store(true, Ordering::Release);
            pending.lock().await.clear();
        });
        let err = link.send_text(&to, "hello").await.unwrap_err();
        assert!(matches!(err, TransportError::LoggedOut));
        cleaner.await.unwrap();
    }

    /// Gateway that answers every `hello` by closing with `code`.
    async fn closing_gateway(code: u16) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/gateway", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            loop {
                let (tcp, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                    while let Some(Ok(frame)) = ws.next().await {
                        if frame.is_text() {
                            let _ = ws
                                .close(Some(CloseFrame {
                                    code: CloseCode::from(code),
                                    reason: String::from("logged out").into(),
                                }))
                                .await;
                            break;
                        }
                    }
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });
        (url, accepted)
    }

    #[tokio::test]
    async fn logged_out_close_during_hello_fails_open() {
        let (url, _) = closing_gateway(WS_CLOSE_LOGGED_OUT).await;
        let connector = GatewayConnector::new(url, "dev-1");
        let stale = CredentialBundle::new("dev-1", b"stale".to_vec());

        match connector.open(Some(stale)).await {
            Err(TransportError::LoggedOut) => {}
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("open succeeded against a logged-out gateway"),
        }
    }

    #[tokio::test]
    async fn logged_out_gateway_is_not_retried() {
        let (url, accepted) = closing_gateway(WS_CLOSE_LOGGED_OUT).await;
        let store = Arc::new(MemoryCredentialStore::new("dev-1"));
        store
            .save(&CredentialBundle::new("dev-1", b"stale".to_vec()))
            .unwrap();
        let (events, _) = tokio::sync::broadcast::channel(16);
        let machine = ConnectionMachine::new(
            Arc::new(GatewayConnector::new(url, "dev-1")),
            store,
            SessionConfig::default(),
            events,
        );

        machine.connect().unwrap();
        let mut state = machine.watch_state();
        tokio::time::timeout(
            Duration::from_secs(10),
            state.wait_for(|s| *s == ConnectionState::Disconnected),
        )
        .await
        .expect("session stopped")
        .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn keepalive_override() {
        let connector = GatewayConnector::new("ws://127.0.0.1:1/gateway", "dev-1");
        assert_eq!(connector.keepalive, WS_PING_PERIOD);
        let connector = connector.with_keepalive(Duration::ZERO);
        assert_eq!(connector.keepalive, WS_PING_PERIOD);
        let connector = connector.with_keepalive(Duration::from_secs(5));
        assert_eq!(connector.keepalive, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn close_queues_close_frame() {
        let (link, mut write_rx, _pending) = GatewayLink::detached();
        link.close().await;
        assert!(matches!(
            write_rx.recv().await,
            Some(tungstenite::Message::Close(None))
        ));
        assert!(link.cancel.is_cancelled());
    }
}
