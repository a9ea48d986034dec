//! Durable credential storage and client identifiers.
//!
//! Two fixed keys live in `credentials.json`: `sessionToken` and an optional
//! `overrideToken`. The override wins when present. Clearing both is logout.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential store is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_token: Option<String>,
}

impl Credentials {
    /// The token sockets authenticate with.
    pub fn active_token(&self) -> Option<&str> {
        self.override_token
            .as_deref()
            .or(self.session_token.as_deref())
            .filter(|t| !t.is_empty())
    }
}

/// File-backed key-value store for the console's credentials.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored credentials. A missing file means logged out.
    pub fn load(&self) -> Result<Credentials, CredentialError> {
        match std::fs::read(&self.path) {
            Ok(raw) if raw.is_empty() => Ok(Credentials::default()),
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Credentials::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn active_token(&self) -> Option<String> {
        match self.load() {
            Ok(creds) => creds.active_token().map(str::to_string),
            Err(e) => {
                warn!(
                    component = "credentials",
                    event = "credentials.load_failed",
                    path = %self.path.display(),
                    error = %e,
                    "Failed to read credential store"
                );
                None
            }
        }
    }

    pub fn set_session_token(&self, token: &str) -> Result<(), CredentialError> {
        let mut creds = self.load().unwrap_or_default();
        creds.session_token = Some(token.to_string());
        self.write(&creds)
    }

    pub fn set_override_token(&self, token: Option<&str>) -> Result<(), CredentialError> {
        let mut creds = self.load().unwrap_or_default();
        creds.override_token = token.map(str::to_string);
        self.write(&creds)
    }

    /// Remove both keys.
    pub fn clear(&self) -> Result<(), CredentialError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(
            component = "credentials",
            event = "credentials.cleared",
            path = %self.path.display(),
            "Cleared stored credentials"
        );
        Ok(())
    }

    fn write(&self, creds: &Credentials) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(creds)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Identifiers the state endpoint uses to scope `CONNECTIONS` pushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Fresh per process (one "tab")
    pub tab_id: String,
    /// Stable per installation (one "browser")
    pub browser_id: String,
}

impl ClientIdentity {
    /// New tab id, browser id read from (or created at) `browser_id_path`.
    pub fn load(browser_id_path: &Path) -> Result<Self, CredentialError> {
        let browser_id = match std::fs::read_to_string(browser_id_path) {
            Ok(existing) if !existing.trim().is_empty() => existing.trim().to_string(),
            Ok(_) => Self::create_browser_id(browser_id_path)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Self::create_browser_id(browser_id_path)?
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            tab_id: termfleet_protocol::new_id(),
            browser_id,
        })
    }

    fn create_browser_id(path: &Path) -> Result<String, CredentialError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let id = termfleet_protocol::new_id();
        std::fs::write(path, &id)?;
        Ok(id)
    }
}
