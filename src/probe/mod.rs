pub mod ftp;
pub mod http;

use crate::config::Settings;
use crate::error::{MirrorError, Result};
use crate::traits::{Download, EndpointProbe, Probed};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// 所有网络操作都必须有超时, 防止慢源阻塞整个流程
#[derive(Debug, Clone, Copy)]
pub struct ProbeTimeouts {
    pub connect: Duration,
    /// Whole-request limit for timestamp probes.
    pub read: Duration,
    /// Whole-request limit for speed test downloads.
    pub download: Duration,
}

impl ProbeTimeouts {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            connect: Duration::from_millis(settings.connect_timeout_ms),
            read: Duration::from_millis(settings.read_timeout_ms),
            download: Duration::from_millis(settings.download_timeout_ms),
        }
    }
}

/// Dispatches each endpoint to the HTTP or FTP probe by URL scheme.
pub struct NetProbe {
    http: http::HttpProbe,
    ftp: ftp::FtpProbe,
}

impl NetProbe {
    pub fn new(timeouts: ProbeTimeouts) -> Result<Self> {
        Ok(Self {
            http: http::HttpProbe::new(timeouts)?,
            ftp: ftp::FtpProbe::new(timeouts),
        })
    }

    fn pick(&self, base: &str) -> Result<&dyn EndpointProbe> {
        let scheme = base
            .split_once("://")
            .map(|(s, _)| s.to_ascii_lowercase())
            .unwrap_or_default();

        match scheme.as_str() {
            "http" | "https" => Ok(&self.http),
            "ftp" => Ok(&self.ftp),
            _ => Err(MirrorError::Transport(format!(
                "Unsupported endpoint scheme: {}",
                base
            ))),
        }
    }
}

#[async_trait]
impl EndpointProbe for NetProbe {
    async fn remote_mtime(&self, base: &str, path: &str) -> Result<Probed<DateTime<Utc>>> {
        self.pick(base)?.remote_mtime(base, path).await
    }

    async fn download(&self, base: &str, path: &str) -> Result<Probed<Download>> {
        self.pick(base)?.download(base, path).await
    }
}

#[cfg(test)]
pub mod fake {
    //! In-memory probe for mirror and sync tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeProbe {
        mtimes: HashMap<String, DateTime<Utc>>,
        downloads: HashMap<String, Download>,
        redirects: HashMap<String, String>,
        requested: Mutex<Vec<String>>,
    }

    impl FakeProbe {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_mtime(mut self, base: &str, ts: DateTime<Utc>) -> Self {
            self.mtimes.insert(base.to_string(), ts);
            self
        }

        pub fn with_download(mut self, base: &str, bytes: u64, elapsed: Duration) -> Self {
            self.downloads
                .insert(base.to_string(), Download { bytes, elapsed });
            self
        }

        pub fn with_redirect(mut self, from: &str, to: &str) -> Self {
            self.redirects.insert(from.to_string(), to.to_string());
            self
        }

        /// Bases contacted so far, in order.
        pub fn requested(&self) -> Vec<String> {
            self.requested.lock().unwrap().clone()
        }

        pub fn calls(&self) -> usize {
            self.requested.lock().unwrap().len()
        }

        fn record(&self, base: &str) -> String {
            self.requested.lock().unwrap().push(base.to_string());
            self.redirects
                .get(base)
                .cloned()
                .unwrap_or_else(|| base.to_string())
        }
    }

    #[async_trait]
    impl EndpointProbe for FakeProbe {
        async fn remote_mtime(&self, base: &str, _path: &str) -> Result<Probed<DateTime<Utc>>> {
            let target = self.record(base);
            match self.mtimes.get(&target) {
                Some(ts) => Ok(Probed {
                    value: *ts,
                    base: target,
                }),
                None => Err(MirrorError::Transport(format!("{} timed out", base))),
            }
        }

        async fn download(&self, base: &str, _path: &str) -> Result<Probed<Download>> {
            let target = self.record(base);
            match self.downloads.get(&target) {
                Some(d) => Ok(Probed {
                    value: *d,
                    base: target,
                }),
                None => Err(MirrorError::Transport(format!("{} timed out", base))),
            }
        }
    }
}
