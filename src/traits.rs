use crate::error::Result;
use crate::types::{MirrorInfo, Protocol};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration;

/// A probe result together with the base URL that actually answered.
///
/// `base` differs from the requested base when the endpoint redirected.
#[derive(Debug, Clone, PartialEq)]
pub struct Probed<T> {
    pub value: T,
    pub base: String,
}

/// A completed download used for speed measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Download {
    pub bytes: u64,
    pub elapsed: Duration,
}

/// EndpointProbe: network access to a single mirror endpoint
#[async_trait]
pub trait EndpointProbe: Sync + Send {
    /// Remote modification time of `path` below `base`.
    async fn remote_mtime(&self, base: &str, path: &str) -> Result<Probed<DateTime<Utc>>>;

    /// Download `path` below `base` completely, timing the transfer.
    async fn download(&self, base: &str, path: &str) -> Result<Probed<Download>>;
}

/// MirrorDiscovery: source of the mirror list
#[async_trait]
pub trait MirrorDiscovery: Sync + Send {
    async fn discover(&self) -> Result<Vec<MirrorInfo>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferOptions {
    /// Delete local files that no longer exist on the mirror.
    pub prune_missing: bool,
}

/// Transfer: copies a mirror tree into the local target directory
#[async_trait]
pub trait Transfer: Sync + Send {
    /// Endpoint family this transfer can pull from.
    fn protocol(&self) -> Protocol;

    async fn transfer(&self, source: &str, target: &Path, options: &TransferOptions) -> Result<()>;
}
