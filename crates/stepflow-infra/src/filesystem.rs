//! Data directory resolution.
//!
//! Stepflow keeps its database and `config.toml` in one directory:
//! `STEPFLOW_DATA_DIR` when set, otherwise `~/.stepflow`.

use std::path::{Path, PathBuf};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "STEPFLOW_DATA_DIR";

/// Resolve the data directory without touching the filesystem.
pub fn resolve_data_dir() -> PathBuf {
    data_dir_from(std::env::var_os(DATA_DIR_ENV).map(PathBuf::from))
}

fn data_dir_from(env_value: Option<PathBuf>) -> PathBuf {
    match env_value {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".stepflow"),
    }
}

/// Create the data directory (and parents) if it does not exist yet.
pub async fn ensure_data_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}
