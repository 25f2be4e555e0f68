//! Herald service entry point: config, logging, the session, and the HTTP
//! API.

mod config;

use std::sync::Arc;
use std::time::Duration;

use actix_web::web;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use herald_credentials::FileCredentialStore;
use herald_session::{GatewayConnector, SessionController, SessionEvent};

use config::Config;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Config::load()?;
    let credentials_root = cfg.credentials_root()?;
    let store = Arc::new(FileCredentialStore::new(credentials_root, cfg.device_id.as_str())?);
    let connector = Arc::new(
        GatewayConnector::new(cfg.gateway_url.as_str(), cfg.device_id.as_str())
            .with_keepalive(Duration::from_secs(cfg.keepalive_secs)),
    );
    info!(
        bind = %cfg.bind,
        gateway = %cfg.gateway_url,
        device_id = %cfg.device_id,
        credentials = %store.path().display(),
        "starting herald"
    );

    let session = web::Data::new(SessionController::new(
        connector,
        store,
        cfg.session_config(),
    ));
    let event_log = tokio::spawn(log_events(session.subscribe()));

    herald_web::create_http_server(session.clone(), &cfg.bind)?.await?;

    info!("shutting down");
    session.shutdown().await;
    event_log.abort();
    Ok(())
}

/// Writes the session event feed to the log.
async fn log_events(mut rx: broadcast::Receiver<SessionEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                warn!(skipped = n, "event log lagged");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        match event {
            SessionEvent::StateChanged(state) => debug!(%state, "session state"),
            SessionEvent::PairingCode(_) => info!("pairing code ready, enter it on the phone"),
            SessionEvent::ChallengeUpdated => debug!("pairing challenge rotated"),
            SessionEvent::CredentialsSaved => debug!("credentials saved"),
            SessionEvent::Reconnecting {
                attempt,
                next_retry_secs,
            } => info!(attempt, next_retry_secs, "reconnecting"),
            SessionEvent::Delivered { to, attempts, .. } => {
                info!(jid = %to, attempts, "message delivered")
            }
            SessionEvent::AttemptFailed {
                to, attempt, error, ..
            } => warn!(jid = %to, attempt, %error, "send attempt failed"),
            SessionEvent::Dropped {
                target_id,
                attempts,
                reason,
                ..
            } => warn!(target = %target_id, attempts, ?reason, "message dropped"),
        }
    }
}
