//! Where the console keeps its files.
//!
//! The binary picks the data directory once (`--data-dir`, then
//! `TERMFLEET_DATA_DIR`, then `~/.termfleet`). Library types take explicit
//! paths and never read this global.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Resolve the data directory without installing it globally.
pub fn resolve_data_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        p.to_path_buf()
    } else if let Ok(env_val) = std::env::var("TERMFLEET_DATA_DIR") {
        PathBuf::from(env_val)
    } else {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".termfleet")
    }
}

/// Initialize the global data directory. Returns the resolved path.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = resolve_data_dir(explicit);
    let mut guard = DATA_DIR.write().unwrap_or_else(|e| e.into_inner());
    *guard = Some(dir.clone());
    dir
}

/// Return the current data directory, falling back to the default resolution
/// when `init_data_dir` hasn't been called.
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .unwrap_or_else(|| resolve_data_dir(None))
}

pub fn config_path() -> PathBuf {
    data_dir().join("config.toml")
}

pub fn credentials_path() -> PathBuf {
    data_dir().join("credentials.json")
}

pub fn browser_id_path() -> PathBuf {
    data_dir().join("browser-id")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}
