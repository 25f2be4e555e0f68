//! Scripted in-memory transport for tests.
//!
//! [`MockConnector`] opens [`MockLink`]s that record every call and let the
//! test inject failures and link events.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;

use herald_credentials::CredentialBundle;
use herald_protocol::Address;

use crate::error::TransportError;
use crate::transport::{
    Connector, DisconnectReason, Handshake, Link, LinkEvent, OpenedLink, TransportFuture,
};

/// Pairing code every mock link hands out.
pub const MOCK_PAIRING_CODE: &str = "ABCD-1234";

/// Challenge sent by an unpaired mock handshake.
pub const MOCK_CHALLENGE: &[u8] = b"mock-challenge";

/// Connector whose links are driven by the test.
#[derive(Clone, Default)]
pub struct MockConnector {
    inner: Arc<MockInner>,
}

#[derive(Default)]
struct MockInner {
    authenticated: AtomicBool,
    open_failures: Mutex<VecDeque<TransportError>>,
    opens: Mutex<Vec<Option<CredentialBundle>>>,
    send_failures: AtomicU32,
    send_delay: Mutex<Duration>,
    close_delay: Mutex<Duration>,
    sent: Mutex<Vec<(String, String)>>,
    pairing_requests: Mutex<Vec<String>>,
    closes: AtomicU32,
    current: Mutex<Option<mpsc::Sender<LinkEvent>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockConnector {
    /// Links authenticate on hello.
    pub fn authenticated() -> Self {
        let mock = Self::default();
        mock.set_authenticated(true);
        mock
    }

    /// Links require pairing and send [`MOCK_CHALLENGE`].
    pub fn unpaired() -> Self {
        Self::default()
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.inner.authenticated.store(authenticated, Ordering::SeqCst);
    }

    /// Makes the next opens fail with `errors`, in order.
    pub fn fail_next_opens(&self, errors: impl IntoIterator<Item = TransportError>) {
        lock(&self.inner.open_failures).extend(errors);
    }

    /// Makes the next `n` sends fail with a retryable gateway error.
    pub fn fail_next_sends(&self, n: u32) {
        self.inner.send_failures.store(n, Ordering::SeqCst);
    }

    /// Makes every send take `delay` before completing.
    pub fn set_send_delay(&self, delay: Duration) {
        *lock(&self.inner.send_delay) = delay;
    }

    /// Makes closing a link take `delay`.
    pub fn set_close_delay(&self, delay: Duration) {
        *lock(&self.inner.close_delay) = delay;
    }

    /// Delivered messages as `(jid, text)`.
    pub fn sent(&self) -> Vec<(String, String)> {
        lock(&self.inner.sent).clone()
    }

    /// Number of opens attempted, failed ones included.
    pub fn opens(&self) -> usize {
        lock(&self.inner.opens).len()
    }

    /// Credentials presented on each open.
    pub fn presented_credentials(&self) -> Vec<Option<CredentialBundle>> {
        lock(&self.inner.opens).clone()
    }

    pub fn pairing_requests(&self) -> Vec<String> {
        lock(&self.inner.pairing_requests).clone()
    }

    /// Number of links closed from the session side.
    pub fn closes(&self) -> u32 {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Pushes `event` on the most recently opened link. Returns `false` when
    /// no link is listening.
    pub async fn emit(&self, event: LinkEvent) -> bool {
        let tx = lock(&self.inner.current).clone();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Confirms pairing on the current link; later opens authenticate.
    pub async fn pair(&self) -> bool {
        self.set_authenticated(true);
        self.emit(LinkEvent::Paired).await
    }

    /// Drops the current link from the network side.
    pub async fn drop_link(&self, reason: DisconnectReason) -> bool {
        let tx = lock(&self.inner.current).take();
        match tx {
            Some(tx) => tx.send(LinkEvent::Closed(reason)).await.is_ok(),
            None => false,
        }
    }
}

impl Connector for MockConnector {
    fn open(&self, credentials: Option<CredentialBundle>) -> TransportFuture<'_, OpenedLink> {
        Box::pin(async move {
            lock(&self.inner.opens).push(credentials);
            if let Some(err) = lock(&self.inner.open_failures).pop_front() {
                return Err(err);
            }

            let (tx, events) = mpsc::channel(64);
            *lock(&self.inner.current) = Some(tx.clone());

            let handshake = if self.inner.authenticated.load(Ordering::SeqCst) {
                Handshake::Authenticated
            } else {
                Handshake::PairingRequired {
                    challenge: Some(MOCK_CHALLENGE.to_vec()),
                }
            };
            let link = MockLink {
                inner: self.inner.clone(),
                closed: AtomicBool::new(false),
                events: tx,
            };
            Ok(OpenedLink {
                link: Arc::new(link),
                handshake,
                events,
            })
        })
    }
}

/// Link opened by [`MockConnector`].
pub struct MockLink {
    inner: Arc<MockInner>,
    closed: AtomicBool,
    events: mpsc::Sender<LinkEvent>,
}

impl Link for MockLink {
    fn request_pairing_code<'a>(&'a self, phone_number: &'a str) -> TransportFuture<'a, String> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            lock(&self.inner.pairing_requests).push(phone_number.to_string());
            Ok(MOCK_PAIRING_CODE.to_string())
        })
    }

    fn send_text<'a>(&'a self, to: &'a Address, text: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let delay = *lock(&self.inner.send_delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            let failures = &self.inner.send_failures;
            if failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TransportError::Rejected {
                    code: 503,
                    message: "unavailable".into(),
                });
            }
            lock(&self.inner.sent).push((to.as_str().to_string(), text.to_string()));
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let delay = *lock(&self.inner.close_delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.inner.closes.fetch_add(1, Ordering::SeqCst);
                let _ = self
                    .events
                    .try_send(LinkEvent::Closed(DisconnectReason::Lost("link closed".into())));
            }
        })
    }
}
