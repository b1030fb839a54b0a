//! Structured lifecycle events for builds, chains and fits.
//!
//! Every event carries an `event` field (`cache.hit`, `build.finished`,
//! `chain.failed`, ...) so log pipelines can filter on it.

use tracing::{info, warn};

use crate::store::Digest;

pub fn emit_cache_hit(model: &str, key: &Digest) {
    info!(event = "cache.hit", model = %model, key = %key.short());
}

pub fn emit_cache_miss(model: &str, key: &Digest) {
    info!(event = "cache.miss", model = %model, key = %key.short());
}

pub fn emit_build_started(model: &str, key: &Digest) {
    info!(event = "build.started", model = %model, key = %key.short());
}

pub fn emit_build_finished(model: &str, key: &Digest, duration_ms: u64, success: bool) {
    info!(
        event = "build.finished",
        model = %model,
        key = %key.short(),
        duration_ms = duration_ms,
        success = success,
    );
}

pub fn emit_chain_started(chain_id: usize, seed: u64, iterations: usize) {
    info!(event = "chain.started", chain_id = chain_id, seed = seed, iterations = iterations);
}

pub fn emit_chain_finished(chain_id: usize, draws: usize, divergences: usize, duration_ms: u64) {
    info!(
        event = "chain.finished",
        chain_id = chain_id,
        draws = draws,
        divergences = divergences,
        duration_ms = duration_ms,
    );
}

/// Chain failures are warnings; the fit continues with the other chains.
pub fn emit_chain_failed(chain_id: usize, reason: &dyn std::fmt::Display) {
    warn!(event = "chain.failed", chain_id = chain_id, reason = %reason);
}

pub fn emit_merge_completed(chains: usize, draws_per_chain: usize, failed: usize) {
    info!(
        event = "merge.completed",
        chains = chains,
        draws_per_chain = draws_per_chain,
        failed = failed,
    );
}
