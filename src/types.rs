use crate::error::MirrorError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 镜像状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Unknown,
    Online,
    Unreachable,
    NoServers,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Unknown => "unknown",
            Status::Online => "online",
            Status::Unreachable => "unreachable",
            Status::NoServers => "no servers",
        };
        f.write_str(s)
    }
}

/// Speed test file size. Each class maps to a configured path in the mirror tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

impl FromStr for SizeClass {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "small" => Ok(SizeClass::Small),
            "medium" => Ok(SizeClass::Medium),
            "large" => Ok(SizeClass::Large),
            _ => Err(MirrorError::Config(format!(
                "Unknown speed test size '{}'. Available: small, medium, large",
                s
            ))),
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SizeClass::Small => "small",
            SizeClass::Medium => "medium",
            SizeClass::Large => "large",
        };
        f.write_str(s)
    }
}

/// Endpoint family of a mirror.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Ftp,
    Http,
    #[default]
    Rsync,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Ftp => "ftp",
            Protocol::Http => "http",
            Protocol::Rsync => "rsync",
        };
        f.write_str(s)
    }
}

/// One record returned by mirror discovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MirrorInfo {
    pub name: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub speed_hint: Option<String>,
    #[serde(default)]
    pub ftp_servers: Vec<String>,
    #[serde(default)]
    pub http_servers: Vec<String>,
    #[serde(default)]
    pub rsync_servers: Vec<String>,
}

/// Weights of the composite ranking score.
///
/// The score is `freshness * timestamp_secs + speed * mbit_per_sec`. With the
/// default 1.0/1.0 the epoch seconds dominate and speed only breaks near-ties.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankWeights {
    pub freshness: f64,
    pub speed: f64,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            freshness: 1.0,
            speed: 1.0,
        }
    }
}

/// Terminal result of one sync cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// `current_sync` advanced to the mirror's timestamp.
    Success {
        mirror: String,
        timestamp: DateTime<Utc>,
    },
    /// Reachable mirrors exist but none is newer than the local copy.
    AlreadyUpToDate,
    /// No reachable mirror with a known timestamp.
    NoCandidates,
    /// Every candidate transfer failed.
    AllFailed { attempted: usize },
}

impl CycleOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, CycleOutcome::NoCandidates | CycleOutcome::AllFailed { .. })
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOutcome::Success { mirror, timestamp } => {
                write!(f, "synced from {} (mirror timestamp {})", mirror, timestamp)
            }
            CycleOutcome::AlreadyUpToDate => f.write_str("already up to date"),
            CycleOutcome::NoCandidates => f.write_str("no usable mirrors"),
            CycleOutcome::AllFailed { attempted } => {
                write!(f, "all {} candidate transfers failed", attempted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_class_parse() {
        assert_eq!("Medium".parse::<SizeClass>().unwrap(), SizeClass::Medium);
        let err = "huge".parse::<SizeClass>().unwrap_err();
        assert!(matches!(err, MirrorError::Config(_)));
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&Status::NoServers).unwrap();
        assert_eq!(json, "\"no_servers\"");
        let back: Status = serde_json::from_str("\"unreachable\"").unwrap();
        assert_eq!(back, Status::Unreachable);
    }
}
