//! Service configuration.
//!
//! Reads TOML at `~/.config/herald/herald.toml` (Linux) or
//! `%APPDATA%\herald\herald.toml` (Windows). A missing file is created with
//! the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use herald_session::{ReconnectConfig, SessionConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP API listens on.
    pub bind: String,
    /// WebSocket URL of the messaging gateway.
    pub gateway_url: String,
    /// Identity this host presents to the gateway.
    pub device_id: String,
    /// Root of the credential store. Defaults to the platform data dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_dir: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    pub send_timeout_secs: u64,
    pub queue_pause_secs: u64,
    pub retry_backoff_secs: u64,
    /// Ping period on the gateway link.
    pub keepalive_secs: u64,
}

fn default_device_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "herald".into())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".into(),
            gateway_url: "ws://127.0.0.1:8765/gateway".into(),
            device_id: default_device_id(),
            credentials_dir: None,
            connect_timeout_secs: 60,
            send_timeout_secs: 60,
            queue_pause_secs: 10,
            retry_backoff_secs: 5,
            keepalive_secs: 20,
        }
    }
}

impl Config {
    /// Loads the configuration from the default location, then applies the
    /// `PORT` override.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from(&config_file_path())?;
        config.apply_port_override(std::env::var("PORT").ok().as_deref())?;
        Ok(config)
    }

    /// Loads `path`, writing the defaults there first if it does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            tracing::info!(path = %path.display(), "wrote default configuration");
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        set_permissions_0600(path);
        Ok(())
    }

    /// Replaces the port of `bind` with `port`, if given.
    pub fn apply_port_override(&mut self, port: Option<&str>) -> anyhow::Result<()> {
        let Some(port) = port.map(str::trim).filter(|p| !p.is_empty()) else {
            return Ok(());
        };
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid PORT value {port:?}"))?;
        let host = self
            .bind
            .rsplit_once(':')
            .map_or(self.bind.as_str(), |(host, _)| host);
        self.bind = format!("{host}:{port}");
        Ok(())
    }

    pub fn credentials_root(&self) -> anyhow::Result<PathBuf> {
        self.credentials_dir
            .clone()
            .or_else(herald_credentials::default_credentials_dir)
            .context("no credentials directory configured and no platform data dir found")
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            queue_pause: Duration::from_secs(self.queue_pause_secs),
            retry_backoff: Duration::from_secs(self.retry_backoff_secs),
            reconnect: ReconnectConfig::default(),
        }
    }
}

fn set_permissions_0600(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

fn config_file_path() -> PathBuf {
    config_base_dir().join("herald").join("herald.toml")
}

fn config_base_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config")
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        PathBuf::from("/tmp")
    }
}
