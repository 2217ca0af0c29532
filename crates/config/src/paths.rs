//! Data directory layout

use std::path::{Path, PathBuf};

/// Root data directory (~/.warden), falling back to a relative one without a home
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".warden"))
        .unwrap_or_else(|| PathBuf::from(".warden"))
}

/// Configuration file location
pub fn config_path() -> PathBuf {
    data_dir().join("config.json")
}

/// Default workspace location
pub fn workspace_path() -> PathBuf {
    data_dir().join("workspace")
}

/// Session transcripts
pub fn sessions_dir() -> PathBuf {
    data_dir().join("sessions")
}

/// Ensure directory exists
pub async fn ensure_dir(path: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(path).await
}

/// Sanitize a session id or job name for use as a file name
pub fn safe_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            _ => c,
        })
        .collect()
}
