//! Per-mirror health state.
//!
//! A [`Mirror`] tracks three independent checks, each behind its own gate:
//! connectivity (with failure backoff), content timestamp, and download speed.
//! A check only touches the network when `now` has reached its gate, and every
//! check that does touch the network moves its gate forward.

use crate::config::CheckPolicy;
use crate::error::{MirrorError, Result};
use crate::traits::EndpointProbe;
use crate::types::{MirrorInfo, Protocol, SizeClass, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mirror {
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

    /// Written by the connectivity check only. Older state files call it `status`.
    #[serde(default, alias = "status")]
    pub connectivity: Status,
    /// Written by the speed test only.
    #[serde(default)]
    pub throughput: Status,
    #[serde(default)]
    pub failed_checks: u32,
    #[serde(default, with = "chrono::serde::ts_seconds")]
    pub next_check: DateTime<Utc>,

    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds")]
    pub next_timestamp_check: DateTime<Utc>,

    /// Bits per second.
    #[serde(default)]
    pub last_rate_speed: Option<u64>,
    #[serde(default)]
    pub last_rate_speed_source: Option<SizeClass>,
    /// Size of the last speed test, successful or not. Keys the rate gate.
    #[serde(default)]
    pub last_rate_attempt: Option<SizeClass>,
    #[serde(default, with = "chrono::serde::ts_seconds")]
    pub next_rate_check: DateTime<Utc>,

    /// Original endpoint URL -> base URL it redirected to.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resolved: BTreeMap<String, String>,
}

impl Mirror {
    #[cfg(test)]
    pub fn new(name: &str, country: &str) -> Self {
        Self::from_info(MirrorInfo {
            name: name.to_string(),
            country: country.to_string(),
            ..MirrorInfo::default()
        })
    }

    /// Fresh mirror from discovery data. All gates start open.
    pub fn from_info(info: MirrorInfo) -> Self {
        Self {
            name: info.name,
            country: info.country,
            speed_hint: info.speed_hint,
            ftp_servers: info.ftp_servers,
            http_servers: info.http_servers,
            rsync_servers: info.rsync_servers,
            connectivity: Status::Unknown,
            throughput: Status::Unknown,
            failed_checks: 0,
            next_check: DateTime::<Utc>::default(),
            timestamp: None,
            next_timestamp_check: DateTime::<Utc>::default(),
            last_rate_speed: None,
            last_rate_speed_source: None,
            last_rate_attempt: None,
            next_rate_check: DateTime::<Utc>::default(),
            resolved: BTreeMap::new(),
        }
    }

    pub fn servers(&self, protocol: Protocol) -> &[String] {
        match protocol {
            Protocol::Ftp => &self.ftp_servers,
            Protocol::Http => &self.http_servers,
            Protocol::Rsync => &self.rsync_servers,
        }
    }

    /// Endpoints that can answer probes: FTP first, then HTTP/HTTPS, as listed.
    pub fn probe_endpoints(&self) -> impl Iterator<Item = &String> {
        self.ftp_servers.iter().chain(self.http_servers.iter())
    }

    fn has_probe_endpoints(&self) -> bool {
        !self.ftp_servers.is_empty() || !self.http_servers.is_empty()
    }

    pub fn is_online(&self) -> bool {
        self.connectivity == Status::Online
    }

    /// Connectivity check.
    ///
    /// Returns the stored status untouched while `now < next_check`. Otherwise
    /// probes the endpoints for the timestamp file and applies the backoff
    /// schedule on failure. Endpoint failures never escape this method.
    pub async fn check_connection<P>(&mut self, probe: &P, policy: &CheckPolicy, now: DateTime<Utc>) -> Status
    where
        P: EndpointProbe + ?Sized,
    {
        if now < self.next_check {
            return self.connectivity;
        }

        // 只有 rsync 地址的镜像同样无法探测
        if !self.has_probe_endpoints() {
            self.connectivity = Status::NoServers;
            return self.connectivity;
        }

        match self.first_mtime(probe, &policy.timestamp_path).await {
            Some(ts) => {
                self.connectivity = Status::Online;
                self.failed_checks = 0;
                self.timestamp = Some(ts);
                self.next_timestamp_check = now + policy.timestamp_interval;
                self.next_check = now + policy.connection_interval;
            }
            None => {
                self.connectivity = Status::Unreachable;
                self.failed_checks = self.failed_checks.saturating_add(1);
                self.next_check = now + policy.failure_delay(self.failed_checks);
                tracing::info!(
                    "Mirror {} ({}) unreachable, {} consecutive failures, next check at {}",
                    self.name,
                    self.country,
                    self.failed_checks,
                    self.next_check
                );
            }
        }

        self.connectivity
    }

    /// `true` iff the (cached or freshly probed) connectivity is online.
    pub async fn available<P>(&mut self, probe: &P, policy: &CheckPolicy, now: DateTime<Utc>) -> bool
    where
        P: EndpointProbe + ?Sized,
    {
        self.check_connection(probe, policy, now).await == Status::Online
    }

    /// Content timestamp of the mirror, re-probed once its gate has elapsed.
    ///
    /// A failed re-probe keeps the previous value.
    pub async fn timestamp<P>(&mut self, probe: &P, policy: &CheckPolicy, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>>
    where
        P: EndpointProbe + ?Sized,
    {
        if !self.has_probe_endpoints() {
            return Err(MirrorError::Config(format!(
                "Mirror '{}' has no FTP or HTTP servers",
                self.name
            )));
        }

        if self.timestamp.is_some() && now < self.next_timestamp_check {
            return Ok(self.timestamp);
        }

        if let Some(ts) = self.first_mtime(probe, &policy.timestamp_path).await {
            self.timestamp = Some(ts);
        }
        self.next_timestamp_check = now + policy.timestamp_interval;

        Ok(self.timestamp)
    }

    /// Download speed in bits per second for the given size class.
    ///
    /// Every endpoint is measured and the fastest one wins. When all of them
    /// fail the throughput status becomes unreachable and the old estimate stays.
    pub async fn test_speed<P>(
        &mut self,
        probe: &P,
        size: SizeClass,
        policy: &CheckPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>>
    where
        P: EndpointProbe + ?Sized,
    {
        if !self.has_probe_endpoints() {
            return Err(MirrorError::Config(format!(
                "Mirror '{}' has no FTP or HTTP servers to test",
                self.name
            )));
        }

        // 旧的状态文件没有 last_rate_attempt, 退回到成功测速的尺寸
        let attempted = self.last_rate_attempt.or(self.last_rate_speed_source);
        if attempted == Some(size) && now < self.next_rate_check {
            return Ok(self.last_rate_speed);
        }

        let path = policy.size_path(size);
        let endpoints: Vec<String> = self.probe_endpoints().cloned().collect();
        let mut best: Option<f64> = None;

        for endpoint in endpoints {
            let base = self.resolve(&endpoint).to_string();
            match probe.download(&base, path).await {
                Ok(probed) => {
                    self.remember_base(&endpoint, probed.base);
                    let secs = probed.value.elapsed.as_secs_f64();
                    if secs <= 0.0 {
                        continue;
                    }
                    let bytes_per_sec = probed.value.bytes as f64 / secs;
                    tracing::debug!(
                        "{} via {}: {} bytes in {:.3}s",
                        self.name,
                        endpoint,
                        probed.value.bytes,
                        secs
                    );
                    if best.map_or(true, |b| bytes_per_sec > b) {
                        best = Some(bytes_per_sec);
                    }
                }
                Err(e) => {
                    tracing::debug!("Speed test of {} via {} failed: {}", self.name, endpoint, e);
                }
            }
        }

        match best {
            Some(bytes_per_sec) => {
                self.throughput = Status::Online;
                self.last_rate_speed = Some((bytes_per_sec * 8.0).round() as u64);
                self.last_rate_speed_source = Some(size);
            }
            None => {
                self.throughput = Status::Unreachable;
            }
        }
        self.last_rate_attempt = Some(size);
        self.next_rate_check = now + policy.rate_interval;

        Ok(self.last_rate_speed)
    }

    /// Scan probe endpoints in order and return the first timestamp obtained.
    async fn first_mtime<P>(&mut self, probe: &P, path: &str) -> Option<DateTime<Utc>>
    where
        P: EndpointProbe + ?Sized,
    {
        let endpoints: Vec<String> = self.probe_endpoints().cloned().collect();

        for endpoint in endpoints {
            let base = self.resolve(&endpoint).to_string();
            match probe.remote_mtime(&base, path).await {
                Ok(probed) => {
                    self.remember_base(&endpoint, probed.base);
                    return Some(probed.value);
                }
                Err(e) if e.is_transport() => {
                    tracing::debug!("{} via {}: {}", self.name, endpoint, e);
                }
                Err(e) => {
                    tracing::warn!("{} via {}: {}", self.name, endpoint, e);
                }
            }
        }

        None
    }

    /// Base URL to contact for a configured endpoint.
    pub fn resolve<'a>(&'a self, endpoint: &'a str) -> &'a str {
        self.resolved
            .get(endpoint)
            .map(String::as_str)
            .unwrap_or(endpoint)
    }

    fn remember_base(&mut self, endpoint: &str, base: String) {
        if base.trim_end_matches('/') == endpoint.trim_end_matches('/') {
            self.resolved.remove(endpoint);
        } else {
            self.resolved.insert(endpoint.to_string(), base);
        }
    }

    /// Take over probe state from the previous record of the same mirror.
    ///
    /// Endpoints stay as discovered; redirect entries for endpoints that
    /// disappeared are dropped.
    pub fn inherit(&mut self, previous: Mirror) {
        self.connectivity = previous.connectivity;
        self.throughput = previous.throughput;
        self.failed_checks = previous.failed_checks;
        self.next_check = previous.next_check;
        self.timestamp = previous.timestamp;
        self.next_timestamp_check = previous.next_timestamp_check;
        self.last_rate_speed = previous.last_rate_speed;
        self.last_rate_speed_source = previous.last_rate_speed_source;
        self.last_rate_attempt = previous.last_rate_attempt;
        self.next_rate_check = previous.next_rate_check;

        let known: Vec<String> = self.probe_endpoints().cloned().collect();
        self.resolved = previous
            .resolved
            .into_iter()
            .filter(|(original, _)| known.contains(original))
            .collect();
    }
}
