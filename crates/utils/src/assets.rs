use std::{env, path::PathBuf};

use directories::ProjectDirs;

const ASSET_DIR_ENV: &str = "AGENT_SERVER_ASSET_DIR";

/// Directory holding the SQLite database and other runtime state.
///
/// Overridable via `AGENT_SERVER_ASSET_DIR`; defaults to the platform data
/// directory (e.g. `~/.local/share/agent-server` on Linux).
pub fn asset_dir() -> PathBuf {
    if let Ok(dir) = env::var(ASSET_DIR_ENV) {
        return PathBuf::from(dir);
    }

    ProjectDirs::from("ai", "agent-server", "agent-server")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".agent-server"))
}
