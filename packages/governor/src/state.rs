//! Advisory persisted state.
//!
//! Written so a restart does not thrash re-attaching to the same
//! processes; the kernel is authoritative, the file is a hint. Unreadable
//! or future-versioned state is discarded with a warning, never fatal.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedProcess {
    pub pid: i32,
    pub target: String,
    pub attached_at: DateTime<Utc>,
    /// False when permissions downgraded the attachment to observation.
    pub limited: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    #[serde(default)]
    pub tracked: HashMap<i32, TrackedProcess>,
    #[serde(default)]
    pub last_scan_at: Option<DateTime<Utc>>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            tracked: HashMap::new(),
            last_scan_at: None,
        }
    }
}

/// Load state, tolerating absence and corruption.
pub fn load(path: &Path) -> PersistedState {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return PersistedState::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "state file unreadable, starting fresh");
            return PersistedState::default();
        }
    };
    match serde_json::from_str::<PersistedState>(&raw) {
        Ok(state) if state.version <= STATE_VERSION => state,
        Ok(state) => {
            warn!(
                path = %path.display(),
                version = state.version,
                "state file from a newer daemon, starting fresh"
            );
            PersistedState::default()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "state file corrupt, starting fresh");
            PersistedState::default()
        }
    }
}

/// Atomic write: temp file beside the target, then rename.
pub fn save(path: &Path, state: &PersistedState) -> std::io::Result<()> {
    let body = serde_json::to_vec_pretty(state)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("governor-state.json");

        let mut state = PersistedState::default();
        state.tracked.insert(
            42,
            TrackedProcess {
                pid: 42,
                target: "ffmpeg".into(),
                attached_at: Utc::now(),
                limited: true,
            },
        );
        state.last_scan_at = Some(Utc::now());
        save(&path, &state).unwrap();

        let loaded = load(&path);
        assert_eq!(loaded.version, STATE_VERSION);
        assert_eq!(loaded.tracked.len(), 1);
        assert_eq!(loaded.tracked[&42].target, "ffmpeg");
        assert!(loaded.last_scan_at.is_some());
    }

    #[test]
    fn test_missing_file_is_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = load(&dir.path().join("absent.json"));
        assert!(state.tracked.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        let state = load(&path);
        assert!(state.tracked.is_empty());
    }

    #[test]
    fn test_newer_version_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"version": 99, "tracked": {}}"#).unwrap();
        let state = load(&path);
        assert_eq!(state.version, STATE_VERSION);
    }
}
