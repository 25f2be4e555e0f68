//! Sequential delivery queue.
//!
//! Messages are sent strictly one at a time, in FIFO order, and only while
//! the session is [`ConnectionState::Active`]. A failed send bumps the
//! head's attempt counter in place; the head is dropped once its attempt
//! budget is spent. Exactly one drain loop runs at a time.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use herald_protocol::{Address, ConnectionState};

use crate::error::TransportError;
use crate::transport::TransportFuture;
use crate::types::{DropReason, OutboundMessage, SessionConfig, SessionEvent};

/// Where the queue hands messages for delivery.
pub trait Outbound: Send + Sync + 'static {
    fn deliver<'a>(&'a self, to: &'a Address, text: &'a str) -> TransportFuture<'a, ()>;
}

/// Timing of the drain loop.
#[derive(Debug, Clone)]
pub struct QueueTiming {
    pub send_timeout: Duration,
    pub retry_backoff: Duration,
    pub pause: Duration,
}

impl From<&SessionConfig> for QueueTiming {
    fn from(config: &SessionConfig) -> Self {
        Self {
            send_timeout: config.send_timeout,
            retry_backoff: config.retry_backoff,
            pause: config.queue_pause,
        }
    }
}

/// Handle to the delivery queue. Clones share the same queue.
#[derive(Clone)]
pub struct DeliveryQueue {
    shared: Arc<QueueShared>,
}

struct QueueShared {
    items: Mutex<VecDeque<OutboundMessage>>,
    draining: AtomicBool,
    /// Replaced on every `clear`, so a cancelled loop never sees a fresh token.
    cancel: Mutex<CancellationToken>,
    outbound: Arc<dyn Outbound>,
    state: watch::Receiver<ConnectionState>,
    timing: QueueTiming,
    events: broadcast::Sender<SessionEvent>,
}

/// Clears the in-progress flag however the drain task ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DeliveryQueue {
    pub fn new(
        outbound: Arc<dyn Outbound>,
        state: watch::Receiver<ConnectionState>,
        timing: QueueTiming,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                items: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
                outbound,
                state,
                timing,
                events,
            }),
        }
    }

    /// Appends a message. Starts a drain loop when the session is active
    /// and none is running, returning its handle.
    pub fn enqueue(&self, msg: OutboundMessage) -> Option<JoinHandle<()>> {
        self.enqueue_all(std::iter::once(msg))
    }

    /// Appends messages in order under a single lock.
    pub fn enqueue_all(
        &self,
        msgs: impl IntoIterator<Item = OutboundMessage>,
    ) -> Option<JoinHandle<()>> {
        {
            let mut items = self.shared.lock_items();
            let before = items.len();
            items.extend(msgs);
            debug!(added = items.len() - before, queued = items.len(), "enqueued");
        }
        if self.shared.is_active() {
            self.drain()
        } else {
            None
        }
    }

    /// Starts the consumer loop. A no-op returning `None` while a loop is
    /// already running; never blocks.
    pub fn drain(&self) -> Option<JoinHandle<()>> {
        if !self.shared.try_claim() {
            return None;
        }
        let shared = self.shared.clone();
        Some(tokio::spawn(run_drain(shared)))
    }

    /// Discards every queued message and stops the running loop, including
    /// any sleep or send in progress. Returns the number discarded.
    pub fn clear(&self) -> usize {
        let old = {
            let mut cancel = self
                .shared
                .cancel
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *cancel, CancellationToken::new())
        };
        old.cancel();

        let mut items = self.shared.lock_items();
        let discarded = items.len();
        items.clear();
        if discarded > 0 {
            info!(discarded, "queue cleared");
        }
        discarded
    }

    pub fn len(&self) -> usize {
        self.shared.lock_items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock_items().is_empty()
    }

    pub fn is_draining(&self) -> bool {
        self.shared.draining.load(Ordering::Acquire)
    }

    /// Copy of the queued messages, head first.
    pub fn snapshot(&self) -> Vec<OutboundMessage> {
        self.shared.lock_items().iter().cloned().collect()
    }

    /// Spawns a task that starts draining whenever the session becomes
    /// active with messages waiting.
    pub fn watch_state(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let queue = self.clone();
        let mut rx = self.shared.state.clone();
        tokio::spawn(async move {
            loop {
                let state = *rx.borrow_and_update();
                if state == ConnectionState::Active && !queue.is_empty() {
                    queue.drain();
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        })
    }
}

impl QueueShared {
    fn lock_items(&self) -> MutexGuard<'_, VecDeque<OutboundMessage>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_cancel(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn is_active(&self) -> bool {
        *self.state.borrow() == ConnectionState::Active
    }

    fn try_claim(&self) -> bool {
        self.draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Pops the head if it is still `id`.
    fn pop_head(&self, id: Uuid) -> bool {
        let mut items = self.lock_items();
        if items.front().is_some_and(|m| m.id == id) {
            items.pop_front();
            true
        } else {
            false
        }
    }

    /// Counts a failed attempt against the head if it is still `id`, and
    /// pops it when no attempts remain.
    fn record_failure(&self, id: Uuid) -> Option<(u32, DropReason)> {
        let mut items = self.lock_items();
        let head = items.front_mut().filter(|m| m.id == id)?;
        head.attempts_made += 1;
        let attempts = head.attempts_made;
        let reason = if !head.retry_enabled {
            DropReason::RetryDisabled
        } else if attempts >= head.attempt_limit() {
            DropReason::RetriesExhausted
        } else {
            return None;
        };
        items.pop_front();
        Some((attempts, reason))
    }
}

async fn run_drain(shared: Arc<QueueShared>) {
    loop {
        {
            let _guard = DrainGuard(&shared.draining);
            let cancel = shared.current_cancel();
            debug!("drain loop started");
            drain_loop(&shared, &cancel).await;
            debug!("drain loop finished");
        }

        // Messages enqueued while the flag was still set would be stranded.
        if shared.lock_items().is_empty() || !shared.try_claim() {
            return;
        }
    }
}

async fn drain_loop(shared: &QueueShared, cancel: &CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let mut state_rx = shared.state.clone();
        let state = *state_rx.borrow_and_update();
        if state != ConnectionState::Active {
            debug!(%state, "session not active, delivery paused");
            let state_changed = async {
                if state_rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(shared.timing.pause) => {}
                _ = state_changed => {}
            }
            continue;
        }

        let Some(msg) = shared.lock_items().front().cloned() else {
            return;
        };

        if msg.attempts_made >= msg.attempt_limit() {
            if shared.pop_head(msg.id) {
                warn!(target_id = %msg.target_id, attempts = msg.attempts_made, "retries exhausted, dropping");
                shared.emit(SessionEvent::Dropped {
                    id: msg.id,
                    target_id: msg.target_id.clone(),
                    attempts: msg.attempts_made,
                    reason: DropReason::RetriesExhausted,
                });
            }
            continue;
        }

        let to = msg.address();
        let attempt = msg.attempts_made + 1;
        debug!(jid = %to, attempt, "sending");

        let send = AssertUnwindSafe(tokio::time::timeout(
            shared.timing.send_timeout,
            shared.outbound.deliver(&to, &msg.body),
        ))
        .catch_unwind();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = send => outcome,
        };
        let result = match outcome {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(_elapsed)) => Err(TransportError::Timeout.to_string()),
            Err(panic) => Err(panic_message(panic.as_ref())),
        };

        match result {
            Ok(()) => {
                shared.pop_head(msg.id);
                info!(jid = %to, attempt, "delivered");
                shared.emit(SessionEvent::Delivered {
                    id: msg.id,
                    to,
                    attempts: attempt,
                });

                if msg.delay_after_secs > 0 && !shared.lock_items().is_empty() {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(msg.delay_after_secs)) => {}
                    }
                }
            }
            Err(error) => {
                warn!(jid = %to, attempt, %error, "send failed");
                shared.emit(SessionEvent::AttemptFailed {
                    id: msg.id,
                    to,
                    attempt,
                    error,
                });
                if let Some((attempts, reason)) = shared.record_failure(msg.id) {
                    warn!(target_id = %msg.target_id, attempts, ?reason, "giving up on message");
                    shared.emit(SessionEvent::Dropped {
                        id: msg.id,
                        target_id: msg.target_id.clone(),
                        attempts,
                        reason,
                    });
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(shared.timing.retry_backoff) => {}
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown".into());
    format!("send panicked: {detail}")
}
