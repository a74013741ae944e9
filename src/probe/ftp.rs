use super::ProbeTimeouts;
use crate::error::{MirrorError, Result};
use crate::traits::{Download, EndpointProbe, Probed};
use crate::utils::join_url;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Url;
use std::net::ToSocketAddrs;
use std::time::{Duration, Instant};
use suppaftp::types::FileType;
use suppaftp::FtpStream;

/// FTP endpoint probe.
///
/// suppaftp's client is blocking, so every session runs on the blocking pool
/// and the whole session is bounded by a tokio timeout.
pub struct FtpProbe {
    timeouts: ProbeTimeouts,
}

/// Where to log in and which directory the mirror tree lives in.
struct FtpTarget {
    host: String,
    port: u16,
    user: String,
    password: String,
    root: String,
}

impl FtpTarget {
    fn parse(base: &str) -> Result<Self> {
        let url = Url::parse(base)
            .map_err(|e| MirrorError::Transport(format!("{}: invalid URL: {}", base, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| MirrorError::Transport(format!("{}: missing host", base)))?
            .to_string();

        let user = if url.username().is_empty() {
            "anonymous".to_string()
        } else {
            url.username().to_string()
        };

        Ok(Self {
            host,
            port: url.port_or_known_default().unwrap_or(21),
            user,
            password: url.password().unwrap_or("anonymous@").to_string(),
            root: url.path().to_string(),
        })
    }

    fn connect(&self, timeouts: ProbeTimeouts) -> Result<FtpStream> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| MirrorError::Transport(format!("{}: {}", self.host, e)))?
            .next()
            .ok_or_else(|| MirrorError::Transport(format!("{}: no address", self.host)))?;

        let mut ftp = FtpStream::connect_timeout(addr, timeouts.connect).map_err(ftp_err)?;
        ftp.get_ref().set_read_timeout(Some(timeouts.read))?;
        ftp.login(&self.user, &self.password).map_err(ftp_err)?;
        Ok(ftp)
    }
}

fn ftp_err(e: suppaftp::FtpError) -> MirrorError {
    MirrorError::Transport(format!("ftp: {}", e))
}

impl FtpProbe {
    pub fn new(timeouts: ProbeTimeouts) -> Self {
        Self { timeouts }
    }

    async fn run_blocking<T, F>(&self, limit: Duration, base: &str, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let handle = tokio::task::spawn_blocking(job);
        match tokio::time::timeout(limit, handle).await {
            Ok(Ok(res)) => res,
            Ok(Err(join)) => Err(MirrorError::Transport(format!("{}: {}", base, join))),
            Err(_) => Err(MirrorError::Transport(format!("{}: timed out", base))),
        }
    }
}

#[async_trait]
impl EndpointProbe for FtpProbe {
    async fn remote_mtime(&self, base: &str, path: &str) -> Result<Probed<DateTime<Utc>>> {
        let target = FtpTarget::parse(base)?;
        let timeouts = self.timeouts;
        let remote = join_url(&target.root, path);
        let limit = timeouts.connect + timeouts.read;

        let naive = self
            .run_blocking(limit, base, move || {
                let mut ftp = target.connect(timeouts)?;
                let modified = ftp.mdtm(&remote).map_err(ftp_err);
                let _ = ftp.quit();
                modified
            })
            .await?;

        Ok(Probed {
            value: Utc.from_utc_datetime(&naive),
            base: base.to_string(),
        })
    }

    async fn download(&self, base: &str, path: &str) -> Result<Probed<Download>> {
        let target = FtpTarget::parse(base)?;
        let timeouts = self.timeouts;
        let remote = join_url(&target.root, path);

        let download = self
            .run_blocking(timeouts.download, base, move || {
                let start = Instant::now();
                let mut ftp = target.connect(timeouts)?;
                ftp.transfer_type(FileType::Binary).map_err(ftp_err)?;
                let data = ftp.retr_as_buffer(&remote).map_err(ftp_err);
                let _ = ftp.quit();
                let bytes = data?.into_inner().len() as u64;
                Ok(Download {
                    bytes,
                    elapsed: start.elapsed(),
                })
            })
            .await?;

        Ok(Probed {
            value: download,
            base: base.to_string(),
        })
    }
}
