//! Runtime state persisted across restarts: the last monitor selection.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    pub last_monitor_id: u32,
}

/// `runtime_state.json` next to the executable, falling back to the working
/// directory when the executable path is unavailable.
pub fn default_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("runtime_state.json")
}

/// Restores the last monitor selection. Failures are non-fatal; a fresh
/// install simply has no state yet.
pub fn load(path: &Path) -> Option<u32> {
    let data = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<RuntimeState>(&data) {
        Ok(state) => {
            tracing::info!("restored last monitor selection: {}", state.last_monitor_id);
            Some(state.last_monitor_id)
        }
        Err(e) => {
            tracing::warn!("ignoring unreadable runtime state: {e}");
            None
        }
    }
}

/// Written after every monitor switch.
pub fn save(path: &Path, last_monitor_id: u32) -> Result<()> {
    let state = RuntimeState { last_monitor_id };
    let data = serde_json::to_string(&state)?;
    std::fs::write(path, data)
        .with_context(|| format!("failed to write runtime state to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_state.json");
        save(&path, 3).unwrap();
        assert_eq!(load(&path), Some(3));
        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw, r#"{"last_monitor_id":3}"#);
    }

    #[test]
    fn test_missing_and_corrupt_state_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_state.json");
        assert_eq!(load(&path), None);
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(load(&path), None);
    }
}
