//! Content-addressed artifact cache.
//!
//! Lifecycle: populated lazily by [`ArtifactCache::get_or_build`]; an entry is
//! invalidated implicitly when the model source, engine version or target
//! changes (the key changes), or explicitly through
//! [`ArtifactCache::invalidate`]. The cache is an ordinary object injected
//! into the fit pipeline; there is no process-global instance.
//!
//! Concurrent requests for one key share a single in-flight build.
//!
//! The key covers source, engine version and target only. An entry whose
//! recorded data or parameter schema differs from the requesting spec is
//! stale: it is evicted and rebuilt so bindings are always validated against
//! the schema the caller declared.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{instrument, warn};

use crate::builder::{ModelBuilder, ModelToolchain};
use crate::domain::{BuildError, ModelSpec, SamplerArtifact};
use crate::metrics::METRICS;
use crate::obs;
use crate::store::{ArtifactStore, Digest, StoreError};

type BuildSlot = Arc<OnceCell<Result<Arc<SamplerArtifact>, BuildError>>>;

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub builds: u64,
    pub corrupt: u64,
    pub stale: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
    corrupt: AtomicU64,
    stale: AtomicU64,
}

/// Maps model identity to a verified, loadable sampler artifact.
pub struct ArtifactCache {
    store: Arc<dyn ArtifactStore>,
    builder: ModelBuilder,
    memo: Mutex<HashMap<Digest, Arc<SamplerArtifact>>>,
    inflight: Mutex<HashMap<Digest, BuildSlot>>,
    counters: Counters,
}

impl ArtifactCache {
    pub fn new(store: Arc<dyn ArtifactStore>, toolchain: Arc<dyn ModelToolchain>) -> Self {
        let builder = ModelBuilder::new(toolchain, Arc::clone(&store));
        Self::with_builder(store, builder)
    }

    /// Use a preconfigured builder, e.g. one with a compile timeout. The
    /// builder must write to the same store.
    pub fn with_builder(store: Arc<dyn ArtifactStore>, builder: ModelBuilder) -> Self {
        Self {
            store,
            builder,
            memo: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Cache key of `spec` for this cache's toolchain.
    pub fn key_for(&self, spec: &ModelSpec) -> Digest {
        let toolchain = self.builder.toolchain();
        spec.artifact_key(toolchain.engine_version(), toolchain.target_triple())
    }

    /// Return the artifact for `spec`, building it at most once per key.
    #[instrument(skip_all, fields(model = %spec.name()))]
    pub async fn get_or_build(&self, spec: &ModelSpec) -> Result<Arc<SamplerArtifact>, BuildError> {
        let key = self.key_for(spec);
        if let Some(artifact) = self.memo_get(&key).filter(|a| schema_matches(a, spec)) {
            self.record_hit(spec, &key);
            return Ok(artifact);
        }

        loop {
            let slot = self.slot_for(&key);
            let result = slot
                .get_or_init(|| self.load_or_build(spec, key))
                .await
                .clone();
            self.release_slot(&key, &slot);
            match result {
                // Joined a build started for a spec with another schema.
                Ok(artifact) if !schema_matches(&artifact, spec) => continue,
                other => return other,
            }
        }
    }

    /// Drop `key` from memory and from the backing store.
    pub fn invalidate(&self, key: &Digest) -> Result<(), StoreError> {
        self.memo_lock().remove(key);
        self.store.remove(key)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            builds: self.counters.builds.load(Ordering::Relaxed),
            corrupt: self.counters.corrupt.load(Ordering::Relaxed),
            stale: self.counters.stale.load(Ordering::Relaxed),
        }
    }

    async fn load_or_build(
        &self,
        spec: &ModelSpec,
        key: Digest,
    ) -> Result<Arc<SamplerArtifact>, BuildError> {
        // A sibling may have finished between our memo check and slot creation.
        if let Some(artifact) = self.memo_get(&key).filter(|a| schema_matches(a, spec)) {
            self.record_hit(spec, &key);
            return Ok(artifact);
        }

        match self.store.get(&key) {
            Ok(artifact) if schema_matches(&artifact, spec) => {
                let artifact = Arc::new(artifact);
                self.memo_lock().insert(key, Arc::clone(&artifact));
                self.record_hit(spec, &key);
                return Ok(artifact);
            }
            Ok(_) => {
                self.counters.stale.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event = "cache.stale",
                    key = %key.short(),
                    model = %spec.name(),
                    "cached artifact records a different schema, rebuilding"
                );
                self.memo_lock().remove(&key);
                if let Err(remove_err) = self.store.remove(&key) {
                    warn!(key = %key.short(), error = %remove_err, "failed to evict stale artifact");
                }
            }
            Err(StoreError::NotFound(_)) => {}
            Err(err) => {
                self.counters.corrupt.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event = "cache.corrupt",
                    key = %key.short(),
                    error = %err,
                    "cached artifact unusable, rebuilding"
                );
                if let Err(remove_err) = self.store.remove(&key) {
                    warn!(key = %key.short(), error = %remove_err, "failed to evict corrupt artifact");
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        obs::emit_cache_miss(spec.name(), &key);

        let artifact = Arc::new(self.builder.build(spec).await?);
        self.counters.builds.fetch_add(1, Ordering::Relaxed);
        self.memo_lock().insert(key, Arc::clone(&artifact));
        Ok(artifact)
    }

    fn record_hit(&self, spec: &ModelSpec, key: &Digest) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        METRICS.inc_cache_hits();
        obs::emit_cache_hit(spec.name(), key);
    }

    fn memo_get(&self, key: &Digest) -> Option<Arc<SamplerArtifact>> {
        self.memo_lock().get(key).cloned()
    }

    fn memo_lock(&self) -> std::sync::MutexGuard<'_, HashMap<Digest, Arc<SamplerArtifact>>> {
        self.memo.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn inflight_lock(&self) -> std::sync::MutexGuard<'_, HashMap<Digest, BuildSlot>> {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot_for(&self, key: &Digest) -> BuildSlot {
        Arc::clone(self.inflight_lock().entry(*key).or_default())
    }

    /// Forget a settled slot so a later call starts fresh (a failed build is
    /// attempted again only by a new, non-concurrent request).
    fn release_slot(&self, key: &Digest, slot: &BuildSlot) {
        let mut inflight = self.inflight_lock();
        if inflight
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            inflight.remove(key);
        }
    }
}

fn schema_matches(artifact: &SamplerArtifact, spec: &ModelSpec) -> bool {
    artifact.data_schema() == spec.data_schema() && artifact.param_schema() == spec.param_schema()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ParamDecl, VarDecl};
    use crate::fakes::ScriptedToolchain;
    use crate::store::memory::MemoryArtifactStore;

    fn model() -> ModelSpec {
        ModelSpec::new("normal", "model { mu ~ normal(0, 1); }").with_param(ParamDecl::scalar("mu"))
    }

    #[tokio::test]
    async fn second_call_is_a_hit() {
        let toolchain = Arc::new(ScriptedToolchain::new());
        let cache = ArtifactCache::new(Arc::new(MemoryArtifactStore::new()), toolchain.clone());

        let a = cache.get_or_build(&model()).await.unwrap();
        let b = cache.get_or_build(&model()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(toolchain.builds(), 1);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn persisted_entry_is_reused_by_fresh_cache() {
        let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
        let toolchain = Arc::new(ScriptedToolchain::new());

        ArtifactCache::new(Arc::clone(&store), toolchain.clone())
            .get_or_build(&model())
            .await
            .unwrap();
        let cache = ArtifactCache::new(store, toolchain.clone());
        cache.get_or_build(&model()).await.unwrap();

        assert_eq!(toolchain.builds(), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn corrupt_entry_is_rebuilt_not_surfaced() {
        let store = Arc::new(MemoryArtifactStore::new());
        let toolchain = Arc::new(ScriptedToolchain::new());

        let first = ArtifactCache::new(store.clone(), toolchain.clone())
            .get_or_build(&model())
            .await
            .unwrap();
        store.tamper(first.key(), b"bit rot".to_vec());

        let cache = ArtifactCache::new(store.clone(), toolchain.clone());
        let rebuilt = cache.get_or_build(&model()).await.unwrap();
        assert_eq!(rebuilt.payload(), first.payload());
        assert_eq!(toolchain.builds(), 2);
        assert_eq!(cache.stats().corrupt, 1);
        store.get(first.key()).unwrap();
    }

    #[tokio::test]
    async fn engine_version_change_misses() {
        let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
        let old = Arc::new(ScriptedToolchain::new().with_engine_version("2.32.0"));
        let new = Arc::new(ScriptedToolchain::new().with_engine_version("2.33.1"));

        ArtifactCache::new(Arc::clone(&store), old.clone())
            .get_or_build(&model())
            .await
            .unwrap();
        ArtifactCache::new(store, new.clone())
            .get_or_build(&model())
            .await
            .unwrap();
        assert_eq!(old.builds(), 1);
        assert_eq!(new.builds(), 1);
    }

    #[tokio::test]
    async fn build_error_is_not_cached() {
        let toolchain = Arc::new(ScriptedToolchain::new());
        let cache = ArtifactCache::new(Arc::new(MemoryArtifactStore::new()), toolchain.clone());
        let bad = ModelSpec::new("bad", "model { syntax error }");

        assert!(cache.get_or_build(&bad).await.is_err());
        assert!(cache.get_or_build(&bad).await.is_err());
        assert_eq!(toolchain.builds(), 2);
        assert_eq!(cache.stats().builds, 0);
    }

    #[tokio::test]
    async fn changed_schema_for_same_source_rebuilds() {
        let store = Arc::new(MemoryArtifactStore::new());
        let toolchain = Arc::new(ScriptedToolchain::new());
        let cache = ArtifactCache::new(store.clone(), toolchain.clone());
        let extended = model().with_data(VarDecl::real("sigma"));
        assert_eq!(cache.key_for(&model()), cache.key_for(&extended));

        cache.get_or_build(&model()).await.unwrap();
        let rebuilt = cache.get_or_build(&extended).await.unwrap();
        assert_eq!(rebuilt.data_schema(), extended.data_schema());
        assert_eq!(toolchain.builds(), 2);
        assert_eq!(cache.stats().stale, 1);

        let reloaded = ArtifactCache::new(store, toolchain.clone())
            .get_or_build(&extended)
            .await
            .unwrap();
        assert_eq!(reloaded.data_schema(), extended.data_schema());
        assert_eq!(toolchain.builds(), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_rebuild() {
        let toolchain = Arc::new(ScriptedToolchain::new());
        let cache = ArtifactCache::new(Arc::new(MemoryArtifactStore::new()), toolchain.clone());
        let artifact = cache.get_or_build(&model()).await.unwrap();

        cache.invalidate(artifact.key()).unwrap();
        cache.get_or_build(&model()).await.unwrap();
        assert_eq!(toolchain.builds(), 2);
    }
}
