//! Supervisor task: open, handshake, pump link events, reconnect.
//!
//! Runs until cancelled, logged out, or hit by an unrecoverable fault. A
//! lost link is reopened immediately; consecutive failed opens back off
//! exponentially with no attempt limit.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use herald_protocol::ConnectionState;

use crate::error::TransportError;
use crate::machine::MachineContext;
use crate::transport::{DisconnectReason, Handshake, LinkEvent, OpenedLink};
use crate::types::SessionEvent;

pub(crate) async fn run(ctx: MachineContext, cancel: CancellationToken) {
    let mut failures: u32 = 0;

    loop {
        ctx.set_state(ConnectionState::Connecting);

        let credentials = match ctx.store.load() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to load credentials, connecting as a new device");
                None
            }
        };
        debug!(has_credentials = credentials.is_some(), "opening link");

        let opened = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("supervisor cancelled while opening");
                return;
            }
            r = tokio::time::timeout(ctx.config.connect_timeout, ctx.connector.open(credentials)) => {
                r.unwrap_or(Err(TransportError::Timeout))
            }
        };

        let OpenedLink {
            link,
            handshake,
            mut events,
        } = match opened {
            Ok(opened) => {
                failures = 0;
                opened
            }
            Err(TransportError::LoggedOut) => {
                warn!("gateway reports this device logged out");
                ctx.set_state(ConnectionState::Disconnected);
                return;
            }
            Err(e) if e.is_recoverable() => {
                failures = failures.saturating_add(1);
                let delay = ctx.config.reconnect.delay_for_attempt(failures);
                let delay_secs = delay.as_secs_f64();
                warn!(
                    attempt = failures,
                    error = %e,
                    delay_secs = format_args!("{delay_secs:.1}"),
                    "connect failed, retrying"
                );
                ctx.emit(SessionEvent::Reconnecting {
                    attempt: failures,
                    next_retry_secs: delay_secs,
                });
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
            Err(e) => {
                error!(error = %e, "unrecoverable transport fault");
                ctx.set_state(ConnectionState::Errored);
                return;
            }
        };

        match handshake {
            Handshake::Authenticated => {
                ctx.install_link(link.clone(), true);
                ctx.set_state(ConnectionState::Active);
            }
            Handshake::PairingRequired { challenge } => {
                info!("device not linked, waiting for pairing");
                if let Some(challenge) = challenge {
                    ctx.set_challenge(challenge);
                }
                ctx.install_link(link.clone(), false);
            }
        }

        let reason = tokio::select! {
            _ = cancel.cancelled() => {
                ctx.release_link(&link).await;
                debug!("supervisor cancelled");
                return;
            }
            reason = pump_events(&ctx, &mut events) => reason,
        };
        ctx.release_link(&link).await;

        match reason {
            DisconnectReason::Lost(why) => {
                warn!(reason = %why, "link lost, reconnecting");
            }
            DisconnectReason::LoggedOut => {
                warn!("logged out remotely, not reconnecting");
                ctx.set_state(ConnectionState::Disconnected);
                return;
            }
            DisconnectReason::Fatal(why) => {
                error!(reason = %why, "link failed");
                ctx.set_state(ConnectionState::Errored);
                return;
            }
        }
    }
}

/// Handles link events until the link closes.
async fn pump_events(
    ctx: &MachineContext,
    events: &mut mpsc::Receiver<LinkEvent>,
) -> DisconnectReason {
    loop {
        let Some(event) = events.recv().await else {
            return DisconnectReason::Lost("event stream ended".into());
        };
        match event {
            LinkEvent::CredentialsUpdated(bundle) => match ctx.store.save(&bundle) {
                Ok(()) => {
                    debug!("credentials persisted");
                    ctx.emit(SessionEvent::CredentialsSaved);
                }
                Err(e) => warn!(error = %e, "failed to persist credentials"),
            },
            LinkEvent::Challenge(challenge) => ctx.set_challenge(challenge),
            LinkEvent::Paired => {
                info!("device paired");
                ctx.mark_authenticated();
                ctx.set_state(ConnectionState::Active);
            }
            LinkEvent::Closed(reason) => return reason,
        }
    }
}
