//! Session controller: the one entry point the I/O layer talks to.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use herald_credentials::CredentialStore;

use crate::error::SessionError;
use crate::machine::ConnectionMachine;
use crate::queue::{DeliveryQueue, QueueTiming};
use crate::transport::Connector;
use crate::types::{Ack, SessionConfig, SessionEvent, SessionStatus, StartParams};

/// Capacity of the session event feed.
const EVENT_CAPACITY: usize = 256;

/// Owns the connection machine and the delivery queue of one session.
pub struct SessionController {
    machine: Arc<ConnectionMachine>,
    queue: DeliveryQueue,
    store: Arc<dyn CredentialStore>,
    events: broadcast::Sender<SessionEvent>,
    watcher: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SessionController {
    pub fn new(
        connector: Arc<dyn Connector>,
        store: Arc<dyn CredentialStore>,
        config: SessionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let timing = QueueTiming::from(&config);
        let machine = Arc::new(ConnectionMachine::new(
            connector,
            store.clone(),
            config,
            events.clone(),
        ));
        let queue = DeliveryQueue::new(
            machine.clone(),
            machine.watch_state(),
            timing,
            events.clone(),
        );
        Self {
            machine,
            queue,
            store,
            events,
            watcher: Mutex::new(None),
        }
    }

    /// Validates the batch, imports the credential backup, connects unless
    /// already running, and queues one message per target. Returns without
    /// waiting for delivery.
    pub fn start(&self, params: StartParams) -> Result<Ack, SessionError> {
        let messages = params.expand()?;

        if let Some(blob) = params.credential_blob.as_deref() {
            self.store.import_external(blob)?;
            info!(bytes = blob.len(), "imported credentials backup");
        }

        self.machine.connect()?;
        self.ensure_watcher();

        let queued = messages.len();
        self.queue.enqueue_all(messages);
        info!(queued, "send batch accepted");
        Ok(Ack {
            queued,
            discarded: 0,
        })
    }

    /// Disconnects and discards every queued message. Idempotent.
    pub async fn stop(&self) -> Result<Ack, SessionError> {
        let mut discarded = self.queue.clear();
        self.machine.disconnect().await;
        discarded += self.queue.clear();
        info!(discarded, "session stopped");
        Ok(Ack {
            queued: 0,
            discarded,
        })
    }

    /// Snapshot of the session. No side effects.
    pub fn status(&self) -> SessionStatus {
        let pairing = self.machine.pairing_info();
        SessionStatus {
            state: self.machine.state(),
            pairing_code: pairing.code,
            challenge: pairing.challenge,
            queued: self.queue.len(),
        }
    }

    pub async fn request_pairing(&self, phone_number: &str) -> Result<String, SessionError> {
        self.machine.request_pairing(phone_number).await
    }

    /// Live feed of session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Stops the session and the state watcher.
    pub async fn shutdown(&self) {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((cancel, handle)) = watcher {
            cancel.cancel();
            let _ = handle.await;
        }
        let _ = self.stop().await;
    }

    fn ensure_watcher(&self) {
        let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        if watcher.as_ref().is_some_and(|(_, h)| !h.is_finished()) {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = self.queue.watch_state(cancel.clone());
        *watcher = Some((cancel, handle));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::{MOCK_PAIRING_CODE, MockConnector};
    use crate::types::SendRequest;
    use herald_credentials::MemoryCredentialStore;
    use herald_protocol::{ConnectionState, TargetKind};

    fn controller(connector: &MockConnector) -> (SessionController, Arc<MemoryCredentialStore>) {
        let store = Arc::new(MemoryCredentialStore::new("dev-1"));
        let ctl = SessionController::new(
            Arc::new(connector.clone()),
            store.clone(),
            SessionConfig::default(),
        );
        (ctl, store)
    }

    fn batch(targets: &[&str], delay: u64, retry: bool, max_retries: u32) -> StartParams {
        StartParams {
            credential_blob: None,
            batch: vec![SendRequest {
                targets: targets.iter().map(|t| t.to_string()).collect(),
                target_kind: TargetKind::Individual,
                body: "hello".into(),
                delay_after_secs: delay,
                retry_enabled: retry,
                max_retries,
            }],
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_delivers_batch() {
        let connector = MockConnector::authenticated();
        let (ctl, _store) = controller(&connector);

        let ack = ctl.start(batch(&["111", "222"], 0, false, 3)).unwrap();
        assert_eq!(ack.queued, 2);
        settle().await;

        let jids: Vec<String> = connector.sent().into_iter().map(|(jid, _)| jid).collect();
        assert_eq!(jids, vec!["111@s.whatsapp.net", "222@s.whatsapp.net"]);
        assert_eq!(ctl.status().queued, 0);
        assert_eq!(ctl.status().state, ConnectionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_batch_has_no_side_effects() {
        let connector = MockConnector::authenticated();
        let (ctl, store) = controller(&connector);

        let mut params = batch(&[" ", ""], 0, false, 3);
        params.credential_blob = Some(b"backup".to_vec());
        let err = ctl.start(params).unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));

        settle().await;
        assert_eq!(connector.opens(), 0);
        assert_eq!(ctl.status().state, ConnectionState::Disconnected);
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn credential_backup_is_presented_on_open() {
        let connector = MockConnector::authenticated();
        let (ctl, _store) = controller(&connector);

        let mut params = batch(&["111"], 0, false, 3);
        params.credential_blob = Some(b"backup".to_vec());
        ctl.start(params).unwrap();
        settle().await;

        let presented = connector.presented_credentials();
        assert_eq!(presented.len(), 1);
        assert_eq!(presented[0].as_ref().map(|b| b.blob.clone()), Some(b"backup".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_reuses_session() {
        let connector = MockConnector::authenticated();
        let (ctl, _store) = controller(&connector);

        ctl.start(batch(&["111"], 0, false, 3)).unwrap();
        settle().await;
        ctl.start(batch(&["222"], 0, false, 3)).unwrap();
        settle().await;

        assert_eq!(connector.opens(), 1);
        assert_eq!(connector.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_wait_for_pairing() {
        let connector = MockConnector::unpaired();
        let (ctl, _store) = controller(&connector);

        ctl.start(batch(&["111"], 0, false, 3)).unwrap();
        let code = ctl.request_pairing("15551234567").await.unwrap();
        assert_eq!(code, MOCK_PAIRING_CODE);

        let status = ctl.status();
        assert_eq!(status.state, ConnectionState::Pairing);
        assert_eq!(status.pairing_code.as_deref(), Some(MOCK_PAIRING_CODE));
        assert_eq!(status.queued, 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(connector.sent().is_empty());

        connector.pair().await;
        settle().await;
        assert_eq!(connector.sent().len(), 1);
        assert_eq!(ctl.status().pairing_code, None);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_pauses_across_reconnect() {
        let connector = MockConnector::authenticated();
        let (ctl, _store) = controller(&connector);

        ctl.start(batch(&["111", "222", "333"], 1, false, 3)).unwrap();
        settle().await;
        assert_eq!(connector.sent().len(), 1);

        connector.fail_next_opens([crate::error::TransportError::Closed]);
        connector
            .drop_link(crate::transport::DisconnectReason::Lost("reset".into()))
            .await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(connector.opens(), 3);
        assert_eq!(connector.sent().len(), 3);
        assert_eq!(ctl.status().state, ConnectionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_backoff_is_prompt() {
        let connector = MockConnector::authenticated();
        connector.fail_next_sends(100);
        let (ctl, _store) = controller(&connector);

        ctl.start(batch(&["111", "222"], 0, true, 5)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ctl.status().queued, 2);

        let started = tokio::time::Instant::now();
        let ack = ctl.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(ack.discarded, 2);

        let status = ctl.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.queued, 0);
        assert_eq!(connector.closes(), 1);

        let ack = ctl.stop().await.unwrap();
        assert_eq!(ack.discarded, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_in_flight_send() {
        let connector = MockConnector::authenticated();
        connector.set_send_delay(Duration::from_secs(30));
        let (ctl, _store) = controller(&connector);

        ctl.start(batch(&["111"], 0, true, 3)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        ctl.stop().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(connector.sent().is_empty());
        assert_eq!(ctl.status().state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn events_report_delivery() {
        let connector = MockConnector::authenticated();
        let (ctl, _store) = controller(&connector);
        let mut rx = ctl.subscribe();

        ctl.start(batch(&["111"], 0, false, 3)).unwrap();
        settle().await;

        let mut delivered = 0;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, SessionEvent::Delivered { attempts: 1, .. }) {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_clean() {
        let connector = MockConnector::authenticated();
        let (ctl, _store) = controller(&connector);
        ctl.start(batch(&["111"], 0, false, 3)).unwrap();
        settle().await;
        ctl.shutdown().await;
        ctl.shutdown().await;
        assert_eq!(ctl.status().state, ConnectionState::Disconnected);
    }
}
