//! Persisted sync state.
//!
//! The state file is JSON with an explicit `version`. Files without one are
//! version 1 (before failure counters and speed metadata existed); every field
//! added since is default-filled on load.

use crate::error::{MirrorError, Result};
use crate::mirror::Mirror;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const STATE_VERSION: u32 = 2;

fn legacy_version() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(default = "legacy_version")]
    pub version: u32,
    #[serde(default, with = "chrono::serde::ts_seconds")]
    pub last_mirror_sync: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_seconds")]
    pub next_mirror_sync: DateTime<Utc>,
    /// Freshness of the local copy.
    #[serde(default, with = "chrono::serde::ts_seconds")]
    pub current_sync: DateTime<Utc>,
    #[serde(default)]
    pub mirrors: Vec<Mirror>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            last_mirror_sync: DateTime::<Utc>::default(),
            next_mirror_sync: DateTime::<Utc>::default(),
            current_sync: DateTime::<Utc>::default(),
            mirrors: Vec::new(),
        }
    }
}

/// Reads and writes the state file at a fixed path.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state. A missing file yields a fresh default state.
    pub fn load(&self) -> Result<SyncState> {
        if !self.path.exists() {
            tracing::info!("No state file at {:?}, starting fresh", self.path);
            return Ok(SyncState::default());
        }

        let content = fs::read_to_string(&self.path)
            .map_err(|e| MirrorError::Persistence(format!("cannot read {:?}: {}", self.path, e)))?;
        let mut state: SyncState = serde_json::from_str(&content)
            .map_err(|e| MirrorError::Persistence(format!("cannot parse {:?}: {}", self.path, e)))?;

        if state.version > STATE_VERSION {
            return Err(MirrorError::Persistence(format!(
                "{:?} has state version {}, this build understands up to {}",
                self.path, state.version, STATE_VERSION
            )));
        }
        if state.version < STATE_VERSION {
            tracing::info!(
                "Upgrading state file from version {} to {}",
                state.version,
                STATE_VERSION
            );
            state.version = STATE_VERSION;
        }

        Ok(state)
    }

    /// Replace the state file as a whole.
    ///
    /// Writes into a temporary file in the same directory and renames it over
    /// the target, so a failed save never leaves a truncated file behind.
    pub fn save(&self, state: &SyncState) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .map_err(|e| MirrorError::Persistence(format!("cannot create {:?}: {}", dir, e)))?;

        let json = serde_json::to_string_pretty(state)?;

        let mut tmp = NamedTempFile::new_in(&dir)
            .map_err(|e| MirrorError::Persistence(format!("cannot write in {:?}: {}", dir, e)))?;
        tmp.write_all(json.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| MirrorError::Persistence(format!("cannot write {:?}: {}", self.path, e)))?;
        tmp.persist(&self.path)
            .map_err(|e| MirrorError::Persistence(format!("cannot replace {:?}: {}", self.path, e.error)))?;

        tracing::debug!("State saved to {:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SizeClass, Status};
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_missing_file_gives_default() -> Result<()> {
        let dir = tempdir()?;
        let store = StateStore::new(dir.path().join("state.json"));

        let state = store.load()?;
        assert_eq!(state, SyncState::default());
        assert!(state.mirrors.is_empty());
        Ok(())
    }

    #[test]
    fn test_roundtrip_preserves_mirror_state() -> Result<()> {
        let dir = tempdir()?;
        let store = StateStore::new(dir.path().join("nested").join("state.json"));

        let mut m = Mirror::new("kernel", "United States");
        m.http_servers = vec!["https://mirrors.example.org/distro/".into()];
        m.rsync_servers = vec!["rsync://mirrors.example.org/distro/".into()];
        m.connectivity = Status::Unreachable;
        m.throughput = Status::Online;
        m.failed_checks = 3;
        m.next_check = at(1_700_000_123);
        m.timestamp = Some(at(1_699_999_000));
        m.next_timestamp_check = at(1_700_003_600);
        m.last_rate_speed = Some(42_000_000);
        m.last_rate_speed_source = Some(SizeClass::Medium);
        m.next_rate_check = at(1_700_086_400);
        m.resolved.insert(
            "https://mirrors.example.org/distro/".into(),
            "https://cdn.example.org/distro".into(),
        );

        let state = SyncState {
            version: STATE_VERSION,
            last_mirror_sync: at(1_699_000_000),
            next_mirror_sync: at(1_699_086_400),
            current_sync: at(1_699_998_000),
            mirrors: vec![m],
        };

        store.save(&state)?;
        let loaded = store.load()?;
        assert_eq!(loaded, state);
        Ok(())
    }

    #[test]
    fn test_subsecond_precision_is_dropped() -> Result<()> {
        let dir = tempdir()?;
        let store = StateStore::new(dir.path().join("state.json"));

        let mut state = SyncState::default();
        state.current_sync = Utc.timestamp_opt(1_000, 999_000_000).unwrap();
        store.save(&state)?;

        assert_eq!(store.load()?.current_sync, at(1_000));
        Ok(())
    }

    #[test]
    fn test_legacy_file_is_default_filled() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("state.json");
        fs::write(
            &path,
            r#"{
                "last_mirror_sync": 100,
                "next_mirror_sync": 86500,
                "current_sync": 90,
                "mirrors": [{
                    "name": "old",
                    "country": "Germany",
                    "http_servers": ["http://old.example.org/distro/"],
                    "status": "online",
                    "next_check": 2000,
                    "timestamp": 95
                }]
            }"#,
        )?;

        let state = StateStore::new(&path).load()?;

        assert_eq!(state.version, STATE_VERSION);
        assert_eq!(state.current_sync, at(90));
        let m = &state.mirrors[0];
        assert_eq!(m.connectivity, Status::Online);
        assert_eq!(m.throughput, Status::Unknown);
        assert_eq!(m.failed_checks, 0);
        assert_eq!(m.timestamp, Some(at(95)));
        assert_eq!(m.last_rate_speed, None);
        assert_eq!(m.next_rate_check, DateTime::<Utc>::default());
        Ok(())
    }

    #[test]
    fn test_newer_version_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"version": 99, "mirrors": []}"#)?;

        let err = StateStore::new(&path).load().unwrap_err();
        assert!(matches!(err, MirrorError::Persistence(_)));
        Ok(())
    }

    #[test]
    fn test_corrupt_file_is_persistence_error_and_untouched() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json")?;

        let err = StateStore::new(&path).load().unwrap_err();
        assert!(matches!(err, MirrorError::Persistence(_)));
        assert_eq!(fs::read_to_string(&path)?, "{ not json");
        Ok(())
    }
}
