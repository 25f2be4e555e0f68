//! Connection lifecycle of the single session.
//!
//! [`ConnectionMachine`] owns the authoritative [`ConnectionState`] and the
//! live link. Opening, reconnecting and reacting to link events happen in a
//! supervisor task (see [`crate::supervisor`]); the machine starts and stops
//! it and serves pairing requests against the link it installed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use herald_credentials::CredentialStore;
use herald_protocol::constants::{PHONE_MAX_DIGITS, PHONE_MIN_DIGITS};
use herald_protocol::{Address, ConnectionState};

use crate::error::{SessionError, TransportError};
use crate::queue::Outbound;
use crate::transport::{Connector, Link, TransportFuture};
use crate::types::{PairingInfo, SessionConfig, SessionEvent};

/// How long `disconnect` waits for the supervisor before aborting it.
const SUPERVISOR_GRACE: Duration = Duration::from_secs(5);

/// The installed link and whether it passed authentication.
#[derive(Clone)]
pub(crate) struct LiveLink {
    pub(crate) link: Arc<dyn Link>,
    pub(crate) authenticated: bool,
}

/// Shared state handed to the supervisor task.
#[derive(Clone)]
pub(crate) struct MachineContext {
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) store: Arc<dyn CredentialStore>,
    pub(crate) config: SessionConfig,
    pub(crate) state: Arc<watch::Sender<ConnectionState>>,
    pub(crate) pairing: Arc<watch::Sender<PairingInfo>>,
    pub(crate) link: Arc<watch::Sender<Option<LiveLink>>>,
    pub(crate) events: broadcast::Sender<SessionEvent>,
}

impl MachineContext {
    /// Updates the state and emits an event when it changed.
    ///
    /// Pairing material is only meaningful while linking is in progress, so
    /// it is cleared on entering any other state. `closing` holds until
    /// [`ConnectionMachine::disconnect`] finishes; a supervisor winding down
    /// cannot move the session out of it.
    pub(crate) fn set_state(&self, new_state: ConnectionState) {
        self.transition(new_state, false);
    }

    fn transition(&self, new_state: ConnectionState, leave_closing: bool) {
        let old = *self.state.borrow();
        let changed = self.state.send_if_modified(|s| {
            if *s == new_state || (*s == ConnectionState::Closing && !leave_closing) {
                false
            } else {
                *s = new_state;
                true
            }
        });
        if !changed {
            return;
        }
        if new_state != ConnectionState::Pairing {
            self.pairing.send_if_modified(|p| {
                let had = p.code.is_some() || p.challenge.is_some();
                *p = PairingInfo::default();
                had
            });
        }
        info!(from = %old, state = %new_state, "connection state changed");
        self.emit(SessionEvent::StateChanged(new_state));
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn set_challenge(&self, challenge: Vec<u8>) {
        debug!(bytes = challenge.len(), "pairing challenge updated");
        self.pairing.send_modify(|p| p.challenge = Some(challenge));
        self.emit(SessionEvent::ChallengeUpdated);
    }

    pub(crate) fn install_link(&self, link: Arc<dyn Link>, authenticated: bool) {
        self.link.send_replace(Some(LiveLink {
            link,
            authenticated,
        }));
    }

    pub(crate) fn mark_authenticated(&self) {
        self.link.send_modify(|live| {
            if let Some(live) = live {
                live.authenticated = true;
            }
        });
    }

    pub(crate) fn take_link(&self) -> Option<LiveLink> {
        self.link.send_replace(None)
    }

    /// Uninstalls `link` if it is still the current one, then closes it.
    pub(crate) async fn release_link(&self, link: &Arc<dyn Link>) {
        self.link.send_if_modified(|live| {
            if live.as_ref().is_some_and(|l| Arc::ptr_eq(&l.link, link)) {
                *live = None;
                true
            } else {
                false
            }
        });
        link.close().await;
    }
}

struct Supervisor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Authoritative lifecycle of the one messaging session.
pub struct ConnectionMachine {
    ctx: MachineContext,
    supervisor: Mutex<Option<Supervisor>>,
}

impl ConnectionMachine {
    pub fn new(
        connector: Arc<dyn Connector>,
        store: Arc<dyn CredentialStore>,
        config: SessionConfig,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (pairing, _) = watch::channel(PairingInfo::default());
        let (link, _) = watch::channel(None);
        Self {
            ctx: MachineContext {
                connector,
                store,
                config,
                state: Arc::new(state),
                pairing: Arc::new(pairing),
                link: Arc::new(link),
                events,
            },
            supervisor: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.ctx.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.ctx.state.subscribe()
    }

    pub fn pairing_info(&self) -> PairingInfo {
        self.ctx.pairing.borrow().clone()
    }

    /// Starts the session unless one is already running.
    ///
    /// While `connecting`, `pairing` or `active` this reuses the running
    /// session. From `disconnected` or `errored` any leftover link is closed
    /// first, so at most one link ever exists.
    pub fn connect(&self) -> Result<(), SessionError> {
        let mut supervisor = self.supervisor.lock().unwrap_or_else(|e| e.into_inner());
        let state = self.state();

        let alive = supervisor
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished());
        if state.is_running() && alive {
            debug!(%state, "session already running");
            return Ok(());
        }
        if state == ConnectionState::Closing {
            return Err(SessionError::InvalidState {
                operation: "connect",
                state,
            });
        }

        if let Some(old) = supervisor.take() {
            old.cancel.cancel();
        }
        if let Some(stale) = self.ctx.take_link() {
            warn!("closing leftover link before reconnecting");
            tokio::spawn(async move { stale.link.close().await });
        }

        self.ctx.set_state(ConnectionState::Connecting);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(crate::supervisor::run(self.ctx.clone(), cancel.clone()));
        *supervisor = Some(Supervisor { cancel, handle });
        Ok(())
    }

    /// Requests a pairing code for `phone_number` on the current link.
    ///
    /// Only valid while `connecting` with an unlinked device. Waits up to
    /// the connect timeout for the handshake to produce a link.
    pub async fn request_pairing(&self, phone_number: &str) -> Result<String, SessionError> {
        let digits = normalize_phone(phone_number)?;
        let state = self.state();
        if state != ConnectionState::Connecting {
            return Err(SessionError::InvalidState {
                operation: "request_pairing",
                state,
            });
        }

        let link = self.wait_for_unpaired_link().await?;
        let code = tokio::time::timeout(
            self.ctx.config.connect_timeout,
            link.request_pairing_code(&digits),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        let state = self.state();
        if state != ConnectionState::Connecting {
            return Err(SessionError::InvalidState {
                operation: "request_pairing",
                state,
            });
        }
        self.ctx
            .pairing
            .send_modify(|p| p.code = Some(code.clone()));
        self.ctx.set_state(ConnectionState::Pairing);
        info!("pairing code issued");
        self.ctx.emit(SessionEvent::PairingCode(code.clone()));
        Ok(code)
    }

    async fn wait_for_unpaired_link(&self) -> Result<Arc<dyn Link>, SessionError> {
        let mut link_rx = self.ctx.link.subscribe();
        let mut state_rx = self.ctx.state.subscribe();
        let deadline = tokio::time::sleep(self.ctx.config.connect_timeout);
        tokio::pin!(deadline);

        loop {
            let live = link_rx.borrow_and_update().clone();
            if let Some(live) = live {
                if live.authenticated {
                    return Err(SessionError::InvalidState {
                        operation: "request_pairing",
                        state: ConnectionState::Active,
                    });
                }
                return Ok(live.link);
            }
            let state = *state_rx.borrow_and_update();
            if state != ConnectionState::Connecting {
                return Err(SessionError::InvalidState {
                    operation: "request_pairing",
                    state,
                });
            }

            tokio::select! {
                () = &mut deadline => return Err(TransportError::Timeout.into()),
                changed = link_rx.changed() => {
                    if changed.is_err() {
                        return Err(TransportError::Closed.into());
                    }
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Err(TransportError::Closed.into());
                    }
                }
            }
        }
    }

    /// Stops the session: cancels the supervisor, closes the link even with
    /// a send in flight, and ends in `disconnected`. Idempotent.
    pub async fn disconnect(&self) {
        let supervisor = {
            let mut guard = self.supervisor.lock().unwrap_or_else(|e| e.into_inner());
            let supervisor = guard.take();
            let has_link = self.ctx.link.borrow().is_some();
            if supervisor.is_none() && !has_link && self.state() == ConnectionState::Disconnected
            {
                return;
            }
            // Entered under the lock so a racing `connect` sees it.
            self.ctx.set_state(ConnectionState::Closing);
            supervisor
        };

        if let Some(Supervisor { cancel, mut handle }) = supervisor {
            cancel.cancel();
            if tokio::time::timeout(SUPERVISOR_GRACE, &mut handle)
                .await
                .is_err()
            {
                warn!("supervisor did not stop in time, aborting");
                handle.abort();
            }
        }
        if let Some(live) = self.ctx.take_link() {
            live.link.close().await;
        }
        self.ctx.transition(ConnectionState::Disconnected, true);
    }
}

impl Outbound for ConnectionMachine {
    fn deliver<'a>(&'a self, to: &'a Address, text: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let live = self.ctx.link.borrow().clone();
            match live {
                Some(live) => live.link.send_text(to, text).await,
                None => Err(TransportError::Closed),
            }
        })
    }
}

/// Strips every non-digit and checks the length of what remains.
pub fn normalize_phone(raw: &str) -> Result<String, SessionError> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if (PHONE_MIN_DIGITS..=PHONE_MAX_DIGITS).contains(&digits.len()) {
        Ok(digits)
    } else {
        Err(SessionError::Validation(format!(
            "phone number must have {PHONE_MIN_DIGITS}-{PHONE_MAX_DIGITS} digits, got {}",
            digits.len()
        )))
    }
}
