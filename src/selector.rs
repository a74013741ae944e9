use crate::mirror::Mirror;
use crate::types::{Protocol, RankWeights};
use chrono::{DateTime, Utc};

/// Composite ranking score of a mirror with a known timestamp.
///
/// Speed enters in Mbit/s; a mirror that was never speed-tested scores 0 there.
pub fn score(mirror: &Mirror, timestamp: DateTime<Utc>, weights: &RankWeights) -> f64 {
    let mbit = mirror.last_rate_speed.unwrap_or(0) as f64 / 1_000_000.0;
    weights.freshness * timestamp.timestamp() as f64 + weights.speed * mbit
}

/// Whether a mirror may be synced from at all.
fn is_candidate(mirror: &Mirror, current_sync: DateTime<Utc>, protocol: Protocol) -> Option<DateTime<Utc>> {
    if !mirror.is_online() || mirror.servers(protocol).is_empty() {
        return None;
    }
    mirror.timestamp.filter(|ts| *ts > current_sync)
}

/// Filter and rank mirrors into sync order.
///
/// Keeps online mirrors that have an endpoint for `protocol` and a timestamp
/// strictly newer than `current_sync`, best score first. Equal scores keep
/// their input order.
pub fn select<'a>(
    mirrors: &'a [Mirror],
    current_sync: DateTime<Utc>,
    protocol: Protocol,
    weights: &RankWeights,
) -> Vec<&'a Mirror> {
    let mut scored: Vec<(f64, &Mirror)> = mirrors
        .iter()
        .filter_map(|m| is_candidate(m, current_sync, protocol).map(|ts| (score(m, ts, weights), m)))
        .collect();

    // sort_by 是稳定排序
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));

    scored.into_iter().map(|(_, m)| m).collect()
}
