//! Console configuration.
//!
//! Read from `<data_dir>/config.toml`; every key is optional. CLI flags are
//! applied on top by the binary.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid server URL: {0}")]
    ServerUrl(String),
}

/// Which host environment materializes popped-out windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum HostKind {
    /// Same-origin browser windows addressed by session id
    #[default]
    Browser,
    /// Desktop host runtime with an "open window" capability
    Desktop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub server_url: String,
    pub retry_interval_ms: u64,
    pub watchdog_ms: u64,
    pub resize_interval_ms: u64,
    pub host: HostKind,
    /// Base URL popped-out browser windows are opened under; defaults to `server_url`.
    pub popout_base_url: Option<String>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:6989".to_string(),
            retry_interval_ms: 3_000,
            watchdog_ms: 5_000,
            resize_interval_ms: 300,
            host: HostKind::Browser,
            popout_base_url: None,
        }
    }
}

impl ConsoleConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(toml::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }

    pub fn resize_interval(&self) -> Duration {
        Duration::from_millis(self.resize_interval_ms)
    }

    /// `ws://` / `wss://` origin derived from `server_url`, without a trailing slash.
    pub fn ws_base(&self) -> Result<String, ConfigError> {
        let base = self.server_url.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("https://") {
            Ok(format!("wss://{rest}"))
        } else if let Some(rest) = base.strip_prefix("http://") {
            Ok(format!("ws://{rest}"))
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            Ok(base.to_string())
        } else {
            Err(ConfigError::ServerUrl(self.server_url.clone()))
        }
    }

    /// Origin popped-out browser windows are opened under.
    pub fn popout_base(&self) -> &str {
        self.popout_base_url
            .as_deref()
            .unwrap_or(&self.server_url)
            .trim_end_matches('/')
    }
}
