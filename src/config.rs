use crate::error::{MirrorError, Result};
use crate::types::{Protocol, RankWeights, SizeClass};
use chrono::Duration;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const APP_NAME: &str = "repomirror";

/// Re-probe connectivity at most this often while a mirror is healthy.
pub const CONNECTION_CHECK_SECS: u64 = 6 * 3600;
pub const TIMESTAMP_CHECK_SECS: u64 = 3600;
pub const RATE_CHECK_SECS: u64 = 24 * 3600;
pub const MIRROR_SYNC_SECS: u64 = 24 * 3600;
/// Upper bound for every configurable interval.
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 3600;
/// The first failure re-checks this much earlier than a healthy mirror would.
const FIRST_FAILURE_SHORTENING_SECS: u64 = 30 * 60;

/// Gates, backoff and probe paths used by the per-mirror checks.
#[derive(Debug, Clone)]
pub struct CheckPolicy {
    pub connection_interval: Duration,
    /// Subtracted from the connection interval after the first failure.
    pub first_failure_shortening: Duration,
    pub backoff_step: Duration,
    pub max_backoff_steps: u32,
    pub timestamp_interval: Duration,
    pub rate_interval: Duration,
    /// File whose modification time marks the mirror's freshness.
    pub timestamp_path: String,
    pub small_file: String,
    pub medium_file: String,
    pub large_file: String,
}

impl Default for CheckPolicy {
    fn default() -> Self {
        Settings::default().check_policy()
    }
}

impl CheckPolicy {
    pub fn size_path(&self, size: SizeClass) -> &str {
        match size {
            SizeClass::Small => &self.small_file,
            SizeClass::Medium => &self.medium_file,
            SizeClass::Large => &self.large_file,
        }
    }

    /// Delay until the next connectivity check after `failed_checks` consecutive failures.
    pub fn failure_delay(&self, failed_checks: u32) -> Duration {
        if failed_checks <= 1 {
            return self.connection_interval - self.first_failure_shortening;
        }
        let steps = (failed_checks - 1).min(self.max_backoff_steps);
        self.connection_interval + self.backoff_step * steps as i32
    }
}

/// User settings, read from `config.toml`.
///
/// Every field has a default so a partial (or missing) file is fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cache_path: Option<PathBuf>,
    /// URL or file path of the JSON mirror list. `None` uses the built-in list.
    pub mirror_list: Option<String>,
    pub timestamp_path: String,
    pub small_file: String,
    pub medium_file: String,
    pub large_file: String,
    pub protocol: Protocol,
    pub probe_concurrency: usize,
    /// Speed test size run during a sync cycle. `None` disables it.
    pub rate_size: Option<SizeClass>,
    pub erase_extraneous: bool,
    pub transfer_attempts: usize,
    pub transfer_backoff_ms: u64,
    pub rsync_program: String,
    pub rsync_contimeout_secs: u64,
    pub rsync_timeout_secs: u64,
    pub freshness_weight: f64,
    pub speed_weight: f64,
    pub connection_check_secs: u64,
    pub timestamp_check_secs: u64,
    pub rate_check_secs: u64,
    pub mirror_sync_secs: u64,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub download_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_path: None,
            mirror_list: None,
            timestamp_path: "lastsync".to_string(),
            small_file: "core/os/x86_64/core.db".to_string(),
            medium_file: "extra/os/x86_64/extra.db".to_string(),
            large_file: "extra/os/x86_64/extra.files".to_string(),
            protocol: Protocol::Rsync,
            probe_concurrency: 8,
            rate_size: Some(SizeClass::Small),
            erase_extraneous: false,
            transfer_attempts: 2,
            transfer_backoff_ms: 2000,
            rsync_program: "rsync".to_string(),
            rsync_contimeout_secs: 10,
            rsync_timeout_secs: 600,
            freshness_weight: 1.0,
            speed_weight: 1.0,
            connection_check_secs: CONNECTION_CHECK_SECS,
            timestamp_check_secs: TIMESTAMP_CHECK_SECS,
            rate_check_secs: RATE_CHECK_SECS,
            mirror_sync_secs: MIRROR_SYNC_SECS,
            connect_timeout_ms: 1000,
            read_timeout_ms: 2000,
            download_timeout_ms: 10_000,
        }
    }
}

impl Settings {
    /// Load settings.
    /// Strategy:
    /// 1. An explicit path must exist and parse
    /// 2. Otherwise try ~/.config/repomirror/config.toml
    /// 3. Fallback to defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(p) => {
                if !p.exists() {
                    return Err(MirrorError::Config(format!(
                        "Config file not found: {:?}",
                        p
                    )));
                }
                Some(p.to_path_buf())
            }
            None => default_config_path().filter(|p| p.exists()),
        };

        let settings = match path {
            Some(p) => {
                let content = fs::read_to_string(&p)?;
                let parsed: Settings = toml::from_str(&content)?;
                tracing::debug!("Loaded settings from {:?}", p);
                parsed
            }
            None => Settings::default(),
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.probe_concurrency == 0 {
            return Err(MirrorError::Config(
                "probe_concurrency must be at least 1".to_string(),
            ));
        }
        if self.transfer_attempts == 0 {
            return Err(MirrorError::Config(
                "transfer_attempts must be at least 1".to_string(),
            ));
        }
        if !self.freshness_weight.is_finite() || !self.speed_weight.is_finite() {
            return Err(MirrorError::Config(
                "ranking weights must be finite numbers".to_string(),
            ));
        }
        if self.timestamp_path.trim().is_empty() {
            return Err(MirrorError::Config("timestamp_path is empty".to_string()));
        }

        // 每次探测都必须把对应的闸门推到未来
        if self.connection_check_secs <= FIRST_FAILURE_SHORTENING_SECS {
            return Err(MirrorError::Config(format!(
                "connection_check_secs must be greater than {}",
                FIRST_FAILURE_SHORTENING_SECS
            )));
        }
        let intervals = [
            ("connection_check_secs", self.connection_check_secs),
            ("timestamp_check_secs", self.timestamp_check_secs),
            ("rate_check_secs", self.rate_check_secs),
            ("mirror_sync_secs", self.mirror_sync_secs),
        ];
        for (name, value) in intervals {
            if value == 0 || value > MAX_INTERVAL_SECS {
                return Err(MirrorError::Config(format!(
                    "{} must be between 1 and {}, got {}",
                    name, MAX_INTERVAL_SECS, value
                )));
            }
        }
        Ok(())
    }

    pub fn cache_path(&self) -> PathBuf {
        if let Some(ref path) = self.cache_path {
            return path.clone();
        }
        ProjectDirs::from("", "", APP_NAME)
            .map(|dirs| dirs.cache_dir().join("state.json"))
            .unwrap_or_else(|| PathBuf::from(".").join("repomirror-state.json"))
    }

    pub fn check_policy(&self) -> CheckPolicy {
        CheckPolicy {
            connection_interval: secs(self.connection_check_secs),
            first_failure_shortening: secs(FIRST_FAILURE_SHORTENING_SECS),
            backoff_step: Duration::hours(2),
            max_backoff_steps: 8,
            timestamp_interval: secs(self.timestamp_check_secs),
            rate_interval: secs(self.rate_check_secs),
            timestamp_path: self.timestamp_path.clone(),
            small_file: self.small_file.clone(),
            medium_file: self.medium_file.clone(),
            large_file: self.large_file.clone(),
        }
    }

    pub fn mirror_sync_interval(&self) -> Duration {
        secs(self.mirror_sync_secs)
    }

    pub fn weights(&self) -> RankWeights {
        RankWeights {
            freshness: self.freshness_weight,
            speed: self.speed_weight,
        }
    }
}

fn secs(value: u64) -> Duration {
    Duration::seconds(value.min(MAX_INTERVAL_SECS) as i64)
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_failure_delay_schedule() {
        let policy = CheckPolicy::default();
        let base = Duration::hours(6);

        assert_eq!(policy.failure_delay(1), base - Duration::minutes(30));
        assert_eq!(policy.failure_delay(2), base + Duration::hours(2));
        assert_eq!(policy.failure_delay(5), base + Duration::hours(8));
        assert_eq!(policy.failure_delay(9), base + Duration::hours(16));
        // capped at 8 steps
        assert_eq!(policy.failure_delay(40), base + Duration::hours(16));
    }

    #[test]
    fn test_partial_config_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "mirror_list = \"https://example.org/mirrors.json\"\nprobe_concurrency = 2\nrate_size = \"large\"\n",
        )?;

        let settings = Settings::load(Some(&path))?;
        assert_eq!(
            settings.mirror_list.as_deref(),
            Some("https://example.org/mirrors.json")
        );
        assert_eq!(settings.probe_concurrency, 2);
        assert_eq!(settings.rate_size, Some(SizeClass::Large));
        // untouched fields keep their defaults
        assert_eq!(settings.timestamp_path, "lastsync");
        assert_eq!(settings.connection_check_secs, CONNECTION_CHECK_SECS);
        Ok(())
    }

    #[test]
    fn test_missing_explicit_config_is_error() {
        let err = Settings::load(Some(Path::new("/nonexistent/repomirror.toml"))).unwrap_err();
        assert!(matches!(err, MirrorError::Config(_)));
    }

    #[test]
    fn test_zero_concurrency_rejected() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.toml");
        fs::write(&path, "probe_concurrency = 0\n")?;

        let err = Settings::load(Some(&path)).unwrap_err();
        assert!(matches!(err, MirrorError::Config(_)));
        Ok(())
    }

    fn load_str(content: &str) -> Result<Settings> {
        let dir = tempdir()?;
        let path = dir.path().join("config.toml");
        fs::write(&path, content)?;
        Settings::load(Some(&path))
    }

    #[test]
    fn test_short_connection_interval_rejected() {
        // 首次失败的下次检查时间会落在过去
        let err = load_str("connection_check_secs = 600\n").unwrap_err();
        assert!(matches!(err, MirrorError::Config(_)));

        let err = load_str("connection_check_secs = 1800\n").unwrap_err();
        assert!(matches!(err, MirrorError::Config(_)));

        let settings = load_str("connection_check_secs = 1801\n").unwrap();
        let policy = settings.check_policy();
        assert!(policy.failure_delay(1) > Duration::zero());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        for key in ["timestamp_check_secs", "rate_check_secs", "mirror_sync_secs"] {
            let err = load_str(&format!("{} = 0\n", key)).unwrap_err();
            assert!(matches!(err, MirrorError::Config(_)), "{}", key);
        }
    }

    #[test]
    fn test_huge_intervals_rejected() {
        for key in [
            "connection_check_secs",
            "timestamp_check_secs",
            "rate_check_secs",
            "mirror_sync_secs",
        ] {
            let err = load_str(&format!("{} = {}\n", key, MAX_INTERVAL_SECS + 1)).unwrap_err();
            assert!(matches!(err, MirrorError::Config(_)), "{}", key);
        }

        let settings = load_str(&format!("timestamp_check_secs = {}\n", MAX_INTERVAL_SECS)).unwrap();
        assert_eq!(settings.check_policy().timestamp_interval, Duration::days(365));
    }
}
