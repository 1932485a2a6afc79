use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rand::Rng;

use crate::config::LbPolicy;
use crate::state::UpstreamEntry;

/// Pick an upstream index for one request.
///
/// `lb_key` is the stickiness input for the hash policy (the `X-LB-HASH`
/// header, falling back to the client IP). The other policies ignore it.
pub fn pick(policy: LbPolicy, upstreams: &[Arc<UpstreamEntry>], lb_key: &str) -> usize {
    debug_assert!(!upstreams.is_empty());
    if upstreams.len() == 1 {
        return 0;
    }
    match policy {
        LbPolicy::Random => {
            let total = total_weight(upstreams);
            let roll = rand::thread_rng().gen_range(0..total);
            weighted_index(upstreams, roll)
        }
        LbPolicy::Hash => pick_hash(upstreams, lb_key),
        LbPolicy::LeastConn => pick_least_conn(upstreams),
        LbPolicy::Latency => {
            let weights = latency_weights(upstreams);
            let total: f64 = weights.iter().sum();
            let roll = rand::thread_rng().gen::<f64>() * total;
            weighted_index_f64(&weights, roll)
        }
    }
}

/// Deterministic pick: identical keys always land on the same upstream for
/// the process lifetime.
pub fn pick_hash(upstreams: &[Arc<UpstreamEntry>], lb_key: &str) -> usize {
    let total = total_weight(upstreams);
    let roll = stable_hash(lb_key) % total;
    weighted_index(upstreams, roll)
}

/// Smallest live inflight count; ties go to the smaller upstream id.
pub fn pick_least_conn(upstreams: &[Arc<UpstreamEntry>]) -> usize {
    upstreams
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            a.inflight()
                .cmp(&b.inflight())
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|(index, _)| index)
        .unwrap_or(0)
}

fn total_weight(upstreams: &[Arc<UpstreamEntry>]) -> u64 {
    upstreams.iter().map(|u| u.weight as u64).sum::<u64>().max(1)
}

/// Locate `roll` in the cumulative weight buckets.
fn weighted_index(upstreams: &[Arc<UpstreamEntry>], roll: u64) -> usize {
    let mut cumulative = 0u64;
    for (index, upstream) in upstreams.iter().enumerate() {
        cumulative += upstream.weight as u64;
        if roll < cumulative {
            return index;
        }
    }
    upstreams.len() - 1
}

/// Pick probability proportional to 1/EWMA. Upstreams with no samples yet get
/// the maximum weight so they are probed early.
fn latency_weights(upstreams: &[Arc<UpstreamEntry>]) -> Vec<f64> {
    upstreams
        .iter()
        .map(|u| 1.0 / u.ewma_ms().max(1.0))
        .collect()
}

fn weighted_index_f64(weights: &[f64], roll: f64) -> usize {
    let mut cumulative = 0.0;
    for (index, weight) in weights.iter().enumerate() {
        cumulative += weight;
        if roll < cumulative {
            return index;
        }
    }
    weights.len() - 1
}

fn stable_hash(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}
