//! Process-wide counters for builds, cache hits and chain outcomes.
//!
//! Counters are bumped at the call site; [`Metrics::flush`] emits the
//! current values as one `tracing::info!` event, e.g. after a fit.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    builds: AtomicU64,
    cache_hits: AtomicU64,
    chains_succeeded: AtomicU64,
    chains_failed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            builds: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            chains_succeeded: AtomicU64::new(0),
            chains_failed: AtomicU64::new(0),
        }
    }

    pub fn inc_builds(&self) {
        self.builds.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "builds", "counter incremented");
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_hits", "counter incremented");
    }

    pub fn inc_chains_succeeded(&self) {
        self.chains_succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "chains_succeeded", "counter incremented");
    }

    pub fn inc_chains_failed(&self) {
        self.chains_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "chains_failed", "counter incremented");
    }

    /// Emit all counters as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            builds = self.builds(),
            cache_hits = self.cache_hits(),
            chains_succeeded = self.chains_succeeded(),
            chains_failed = self.chains_failed(),
        );
    }

    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn chains_succeeded(&self) -> u64 {
        self.chains_succeeded.load(Ordering::Relaxed)
    }

    pub fn chains_failed(&self) -> u64 {
        self.chains_failed.load(Ordering::Relaxed)
    }

    /// Zero every counter (tests).
    pub fn reset(&self) {
        self.builds.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.chains_succeeded.store(0, Ordering::Relaxed);
        self.chains_failed.store(0, Ordering::Relaxed);
    }
}
