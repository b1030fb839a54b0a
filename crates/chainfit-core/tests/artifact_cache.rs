use std::sync::Arc;
use std::time::Duration;

use chainfit_core::fakes::ScriptedToolchain;
use chainfit_core::{ArtifactCache, FsArtifactStore, ModelSpec, ParamDecl};

fn model() -> ModelSpec {
    ModelSpec::new(
        "normal",
        "parameters { real mu; }\nmodel { mu ~ normal(0, 1); }",
    )
    .with_param(ParamDecl::scalar("mu"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_build() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = Arc::new(ScriptedToolchain::new().with_delay(Duration::from_millis(100)));
    let cache = Arc::new(ArtifactCache::new(
        Arc::new(FsArtifactStore::new(dir.path()).unwrap()),
        toolchain.clone(),
    ));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_or_build(&model()).await })
        })
        .collect();

    let mut artifacts = Vec::new();
    for handle in handles {
        artifacts.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(toolchain.builds(), 1);
    assert_eq!(cache.stats().builds, 1);
    assert!(artifacts.iter().all(|a| Arc::ptr_eq(a, &artifacts[0])));
}

#[tokio::test]
async fn artifact_survives_a_new_cache_instance() {
    let dir = tempfile::tempdir().unwrap();

    let first_toolchain = Arc::new(ScriptedToolchain::new());
    let first = ArtifactCache::new(
        Arc::new(FsArtifactStore::new(dir.path()).unwrap()),
        first_toolchain.clone(),
    );
    let built = first.get_or_build(&model()).await.unwrap();

    let second_toolchain = Arc::new(ScriptedToolchain::new());
    let second = ArtifactCache::new(
        Arc::new(FsArtifactStore::new(dir.path()).unwrap()),
        second_toolchain.clone(),
    );
    let loaded = second.get_or_build(&model()).await.unwrap();

    assert_eq!(first_toolchain.builds(), 1);
    assert_eq!(second_toolchain.builds(), 0);
    assert_eq!(loaded.key(), built.key());
    assert_eq!(loaded.payload(), built.payload());
    assert_eq!(second.stats().hits, 1);
}

#[tokio::test]
async fn corrupted_payload_on_disk_is_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsArtifactStore::new(dir.path()).unwrap();

    let seed_cache = ArtifactCache::new(
        Arc::new(FsArtifactStore::new(dir.path()).unwrap()),
        Arc::new(ScriptedToolchain::new()),
    );
    let built = seed_cache.get_or_build(&model()).await.unwrap();

    let payload = store.entry_dir(built.key()).join("payload.bin");
    std::fs::write(&payload, b"truncated").unwrap();

    let toolchain = Arc::new(ScriptedToolchain::new());
    let cache = ArtifactCache::new(Arc::new(store), toolchain.clone());
    let rebuilt = cache.get_or_build(&model()).await.unwrap();

    assert_eq!(cache.stats().corrupt, 1);
    assert_eq!(toolchain.builds(), 1);
    assert_eq!(rebuilt.payload(), built.payload());
    assert_eq!(std::fs::read(&payload).unwrap(), built.payload());
}

#[tokio::test]
async fn different_sources_get_different_keys() {
    let cache = ArtifactCache::new(
        Arc::new(chainfit_core::MemoryArtifactStore::new()),
        Arc::new(ScriptedToolchain::new()),
    );
    let a = model();
    let b = ModelSpec::new(
        "normal",
        "parameters { real mu; }\nmodel { mu ~ normal(0, 2); }",
    )
    .with_param(ParamDecl::scalar("mu"));
    assert_ne!(cache.key_for(&a), cache.key_for(&b));

    let aa = cache.get_or_build(&a).await.unwrap();
    let bb = cache.get_or_build(&b).await.unwrap();
    assert_ne!(aa.key(), bb.key());
    assert_eq!(cache.stats().builds, 2);
}
