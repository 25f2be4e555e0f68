//! Public types for the session core.

use std::time::Duration;

use uuid::Uuid;

use herald_protocol::constants::{
    CONNECT_TIMEOUT, QUEUE_PAUSE_INTERVAL, SEND_RETRY_BACKOFF, SEND_TIMEOUT,
};
use herald_protocol::{Address, ConnectionState, TargetKind};

use crate::error::SessionError;

/// One requested delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub id: Uuid,
    /// Raw phone number or group identifier, not namespace-qualified.
    pub target_id: String,
    pub target_kind: TargetKind,
    pub body: String,
    /// Pause after a successful send before the next message.
    pub delay_after_secs: u64,
    pub retry_enabled: bool,
    pub max_retries: u32,
    pub attempts_made: u32,
}

impl OutboundMessage {
    pub fn new(target_id: impl Into<String>, target_kind: TargetKind, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_id: target_id.into(),
            target_kind,
            body: body.into(),
            delay_after_secs: 0,
            retry_enabled: false,
            max_retries: 1,
            attempts_made: 0,
        }
    }

    pub fn with_delay(mut self, secs: u64) -> Self {
        self.delay_after_secs = secs;
        self
    }

    pub fn with_retries(mut self, enabled: bool, max_retries: u32) -> Self {
        self.retry_enabled = enabled;
        self.max_retries = max_retries;
        self
    }

    /// Number of send attempts this message may consume.
    ///
    /// Without retry a message is attempted exactly once. With retry the
    /// budget is `max_retries` itself, so a budget of zero drops the message
    /// unsent.
    pub fn attempt_limit(&self) -> u32 {
        if self.retry_enabled {
            self.max_retries
        } else {
            1
        }
    }

    pub fn address(&self) -> Address {
        Address::resolve(&self.target_id, self.target_kind)
    }
}

/// One entry of a send batch: the same body to every target.
#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    pub targets: Vec<String>,
    pub target_kind: TargetKind,
    pub body: String,
    pub delay_after_secs: u64,
    pub retry_enabled: bool,
    pub max_retries: u32,
}

/// Arguments of [`SessionController::start`](crate::SessionController::start).
#[derive(Debug, Clone, Default)]
pub struct StartParams {
    /// Operator-supplied credentials backup, imported before connecting.
    pub credential_blob: Option<Vec<u8>>,
    pub batch: Vec<SendRequest>,
}

impl StartParams {
    /// Validates the batch and expands it into one message per target.
    pub fn expand(&self) -> Result<Vec<OutboundMessage>, SessionError> {
        if self.batch.is_empty() {
            return Err(SessionError::Validation("send batch is empty".into()));
        }

        let mut messages = Vec::new();
        for req in &self.batch {
            if req.body.trim().is_empty() {
                return Err(SessionError::Validation("message body is empty".into()));
            }
            let targets: Vec<&str> = req
                .targets
                .iter()
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .collect();
            if targets.is_empty() {
                return Err(SessionError::Validation("no targets given".into()));
            }
            messages.extend(targets.into_iter().map(|target| {
                OutboundMessage::new(target, req.target_kind, req.body.clone())
                    .with_delay(req.delay_after_secs)
                    .with_retries(req.retry_enabled, req.max_retries)
            }));
        }
        Ok(messages)
    }
}

/// Acknowledgement of a controller operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ack {
    /// Messages added to the queue.
    pub queued: usize,
    /// Messages discarded from the queue.
    pub discarded: usize,
}

/// Read-only view of the session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub pairing_code: Option<String>,
    pub challenge: Option<Vec<u8>>,
    pub queued: usize,
}

/// Pairing material shown to the operator while the device is unlinked.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PairingInfo {
    pub code: Option<String>,
    pub challenge: Option<Vec<u8>>,
}

/// Why the queue gave up on a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The retry budget is spent.
    RetriesExhausted,
    /// The single allowed attempt failed.
    RetryDisabled,
}

/// Events published by the session for logs and observers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    PairingCode(String),
    ChallengeUpdated,
    CredentialsSaved,
    /// A failed open is being retried after `next_retry_secs`.
    Reconnecting { attempt: u32, next_retry_secs: f64 },
    Delivered { id: Uuid, to: Address, attempts: u32 },
    AttemptFailed { id: Uuid, to: Address, attempt: u32, error: String },
    Dropped { id: Uuid, target_id: String, attempts: u32, reason: DropReason },
}

/// Configuration for reopening after failed connection attempts.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before the first reopen after a failure.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Calculates the delay for a given attempt number (1-based),
    /// with ±25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.25;
        let offset = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / u32::MAX as f64)
            * 2.0
            - 1.0; // [-1.0, 1.0)
        let with_jitter = (capped + jitter * offset).max(0.05);
        Duration::from_secs_f64(with_jitter)
    }
}

/// Timing knobs of the session core.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound for opening a link, the handshake, and pairing requests.
    pub connect_timeout: Duration,
    /// Upper bound for one send.
    pub send_timeout: Duration,
    /// Recheck interval while the session is not active.
    pub queue_pause: Duration,
    /// Sleep after a failed send.
    pub retry_backoff: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            send_timeout: SEND_TIMEOUT,
            queue_pause: QUEUE_PAUSE_INTERVAL,
            retry_backoff: SEND_RETRY_BACKOFF,
            reconnect: ReconnectConfig::default(),
        }
    }
}
