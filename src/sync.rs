//! One sync cycle: refresh the mirror list when due, probe every mirror, rank
//! the candidates and pull from them in order until one transfer succeeds.

use crate::config::{CheckPolicy, Settings};
use crate::error::{MirrorError, Result};
use crate::mirror::Mirror;
use crate::selector;
use crate::state::{StateStore, SyncState};
use crate::traits::{EndpointProbe, MirrorDiscovery, Transfer, TransferOptions};
use crate::transfer::{transfer_with_retry, RetryPolicy};
use crate::types::{CycleOutcome, RankWeights, SizeClass};
use crate::utils::progress_bar;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct CycleOptions {
    pub target: PathBuf,
    pub transfer: TransferOptions,
    pub policy: CheckPolicy,
    pub mirror_sync_interval: Duration,
    pub weights: RankWeights,
    pub probe_concurrency: usize,
    pub rate_size: Option<SizeClass>,
    pub retry: RetryPolicy,
    pub show_progress: bool,
}

impl CycleOptions {
    pub fn from_settings(settings: &Settings, target: PathBuf) -> Self {
        Self {
            target,
            transfer: TransferOptions {
                prune_missing: settings.erase_extraneous,
            },
            policy: settings.check_policy(),
            mirror_sync_interval: settings.mirror_sync_interval(),
            weights: settings.weights(),
            probe_concurrency: settings.probe_concurrency.max(1),
            rate_size: settings.rate_size,
            retry: RetryPolicy::from_settings(settings),
            show_progress: false,
        }
    }
}

/// Owned snapshot of a ranked mirror, taken before transfers start.
struct Candidate {
    name: String,
    timestamp: Option<DateTime<Utc>>,
    source: Option<String>,
}

pub struct Syncer<'a> {
    discovery: &'a dyn MirrorDiscovery,
    probe: &'a dyn EndpointProbe,
    transfer: &'a dyn Transfer,
    options: CycleOptions,
}

impl<'a> Syncer<'a> {
    pub fn new(
        discovery: &'a dyn MirrorDiscovery,
        probe: &'a dyn EndpointProbe,
        transfer: &'a dyn Transfer,
        options: CycleOptions,
    ) -> Self {
        Self {
            discovery,
            probe,
            transfer,
            options,
        }
    }

    /// Refresh the mirror list if its gate has elapsed. Discovery failures
    /// are logged and leave the previous list in place.
    pub async fn refresh_if_due(&self, state: &mut SyncState, now: DateTime<Utc>) -> bool {
        if now < state.next_mirror_sync {
            return false;
        }
        match self.refresh_mirrors(state, now).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Keeping the previous mirror list: {}", e);
                false
            }
        }
    }

    /// Replace the mirror set with a freshly discovered one.
    ///
    /// Mirrors that reappear under the same (name, country) keep their probe
    /// state. On error the previous set and the list gate are left untouched.
    pub async fn refresh_mirrors(&self, state: &mut SyncState, now: DateTime<Utc>) -> Result<usize> {
        let discovered = self.discovery.discover().await?;
        if discovered.is_empty() && !state.mirrors.is_empty() {
            return Err(MirrorError::Discovery(
                "mirror list is empty, keeping the previous one".to_string(),
            ));
        }

        let mut previous: HashMap<(String, String), Mirror> = state
            .mirrors
            .drain(..)
            .map(|m| ((m.name.clone(), m.country.clone()), m))
            .collect();

        let mut carried = 0;
        state.mirrors = discovered
            .into_iter()
            .map(|info| {
                let mut mirror = Mirror::from_info(info);
                let key = (mirror.name.clone(), mirror.country.clone());
                if let Some(old) = previous.remove(&key) {
                    mirror.inherit(old);
                    carried += 1;
                }
                mirror
            })
            .collect();

        state.last_mirror_sync = now;
        state.next_mirror_sync = now + self.options.mirror_sync_interval;

        tracing::info!(
            "Mirror list refreshed: {} mirrors ({} kept their history), next refresh at {}",
            state.mirrors.len(),
            carried,
            state.next_mirror_sync
        );
        Ok(state.mirrors.len())
    }

    /// Run the checks of every mirror, a bounded number of mirrors at a time.
    ///
    /// Speed tests run for online mirrors when `rate_size` is set; with
    /// `newer_only` they are limited to mirrors newer than the local copy.
    pub async fn probe_mirrors(
        &self,
        state: &mut SyncState,
        now: DateTime<Utc>,
        rate_size: Option<SizeClass>,
        newer_only: bool,
    ) {
        let probe = self.probe;
        let policy = &self.options.policy;
        let current_sync = state.current_sync;
        let pb = progress_bar(state.mirrors.len(), "Checking mirrors...", self.options.show_progress);

        stream::iter(state.mirrors.iter_mut())
            .for_each_concurrent(self.options.probe_concurrency, |mirror| {
                let pb = pb.clone();
                async move {
                    if mirror.available(probe, policy, now).await {
                        if let Err(e) = mirror.timestamp(probe, policy, now).await {
                            tracing::debug!("Timestamp of {}: {}", mirror.name, e);
                        }

                        let wanted = !newer_only || mirror.timestamp.is_some_and(|ts| ts > current_sync);
                        if let (Some(size), true) = (rate_size, wanted) {
                            if let Err(e) = mirror.test_speed(probe, size, policy, now).await {
                                tracing::debug!("Speed test of {}: {}", mirror.name, e);
                            }
                        }
                    }
                    pb.inc(1);
                }
            })
            .await;

        pb.finish_and_clear();

        let online = state.mirrors.iter().filter(|m| m.is_online()).count();
        tracing::info!("{} of {} mirrors online", online, state.mirrors.len());
    }

    /// One full cycle against `state`. Only one transfer runs at a time and
    /// the first successful one ends the cycle.
    pub async fn cycle(&self, state: &mut SyncState, now: DateTime<Utc>) -> Result<CycleOutcome> {
        self.refresh_if_due(state, now).await;
        self.probe_mirrors(state, now, self.options.rate_size, true).await;

        let protocol = self.transfer.protocol();
        let candidates: Vec<Candidate> =
            selector::select(&state.mirrors, state.current_sync, protocol, &self.options.weights)
                .into_iter()
                .map(|m| Candidate {
                    name: m.name.clone(),
                    timestamp: m.timestamp,
                    source: m.servers(protocol).first().cloned(),
                })
                .collect();

        if candidates.is_empty() {
            let any_known = state
                .mirrors
                .iter()
                .any(|m| m.is_online() && m.timestamp.is_some() && !m.servers(protocol).is_empty());
            return Ok(if any_known {
                CycleOutcome::AlreadyUpToDate
            } else {
                CycleOutcome::NoCandidates
            });
        }

        tracing::info!("{} candidate mirrors newer than {}", candidates.len(), state.current_sync);

        let mut attempted = 0;
        let mut up_to_date = false;

        for candidate in candidates {
            let Some(timestamp) = candidate.timestamp else {
                continue;
            };
            // 继续往下找: 后面可能还有更新的镜像
            if timestamp <= state.current_sync {
                up_to_date = true;
                continue;
            }
            let Some(source) = candidate.source else {
                continue;
            };

            attempted += 1;
            tracing::info!("Syncing from {} ({})", candidate.name, source);

            match transfer_with_retry(
                self.transfer,
                &source,
                &self.options.target,
                &self.options.transfer,
                &self.options.retry,
            )
            .await
            {
                Ok(()) => {
                    state.current_sync = timestamp;
                    return Ok(CycleOutcome::Success {
                        mirror: candidate.name,
                        timestamp,
                    });
                }
                Err(e) => {
                    tracing::warn!("Sync from {} failed: {}", candidate.name, e);
                }
            }
        }

        Ok(match (attempted, up_to_date) {
            (0, true) => CycleOutcome::AlreadyUpToDate,
            (0, false) => CycleOutcome::NoCandidates,
            (n, _) => CycleOutcome::AllFailed { attempted: n },
        })
    }
}

/// Load state, run one cycle, and save the state whatever the cycle did.
pub async fn run_cycle(store: &StateStore, syncer: &Syncer<'_>) -> Result<CycleOutcome> {
    let mut state = store.load()?;

    let result = syncer.cycle(&mut state, Utc::now()).await;
    let saved = store.save(&state);

    match (result, saved) {
        (Ok(outcome), Ok(())) => Ok(outcome),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), saved) => {
            if let Err(save_err) = saved {
                tracing::error!("Could not save state after failed cycle: {}", save_err);
            }
            Err(e)
        }
    }
}
