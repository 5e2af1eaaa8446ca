//! Garbage collection.
//!
//! The collector enforces the local-tier byte budget and repairs the
//! store after corruption, without taking any process-wide lock. One
//! pass works in strictly this order:
//!
//! 1. walk the chunk directory, optionally re-hashing every chunk
//!    (corrupt chunks join the dead set);
//! 2. build an LRU list by file mtime and mark the oldest chunks dead
//!    until the live total fits the budget;
//! 3. walk every index of every namespace. Indices whose chunks
//!    intersect the dead set, whose chunk list is empty, or which no
//!    longer decode into a well-formed artifact are marked dead.
//!    Indices younger than the grace period are skipped, and their
//!    chunks are pulled back out of the dead set, to avoid racing
//!    with in-flight ingests;
//! 4. remove dead indices first, then dead chunks, never the reverse.
//!
//! The ordering is what upholds the store invariant: a persisted index
//! only ever references resolvable chunks. Concurrent ingests are safe
//! because new indices fall under the grace period and chunk writes
//! refresh mtimes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use tokio::time;
use tracing::instrument;

use granary::hash::ContentHash;
use granary::namespace::Namespace;

use crate::assembler::{assemble_bytes, assemble_reader};
use crate::index::ChunkIndex;
use crate::metrics::Metrics;
use crate::nar::validate_nar;
use crate::narinfo::NarInfo;
use crate::store::{ChunkStore, IndexStore, LocalStore};
use crate::State;

/// Bytes reserved for directory overhead of the sharding scheme.
///
/// Up to 0xffff leaf directories at one filesystem block each.
pub const DIRECTORY_RESERVE: u64 = 0xffff * 4096;

/// Grace period protecting fresh indices from collection.
pub const GC_GRACE: Duration = Duration::from_secs(600);

/// Tuning knobs of one collection pass.
#[derive(Debug, Clone)]
pub struct GcOptions {
    /// Byte budget for live chunks, after the directory reserve.
    ///
    /// `None` disables LRU eviction.
    pub budget: Option<u64>,

    /// Whether to re-hash every stored chunk.
    pub verify: bool,

    /// Minimum index age before it may be collected.
    pub grace: Duration,
}

/// What one pass did.
#[derive(Debug, Default)]
pub struct GcSummary {
    pub live_bytes: u64,
    pub chunks_removed: u64,
    pub indices_removed: u64,
    pub corrupt_chunks: u64,
}

/// Runs garbage collection periodically.
pub async fn run_garbage_collection(state: State) {
    let interval = state.config.garbage_collection.interval;

    if interval == Duration::ZERO {
        // disabled
        return;
    }

    loop {
        // We don't stop even if it errors
        if let Err(e) = run_garbage_collection_once(&state).await {
            tracing::warn!("Garbage collection failed: {}", e);
        }

        time::sleep(interval).await;
    }
}

/// Runs garbage collection once, with options from the configuration.
#[instrument(skip_all)]
pub async fn run_garbage_collection_once(state: &State) -> Result<GcSummary> {
    tracing::info!("Running garbage collection...");

    let options = GcOptions {
        budget: state
            .config
            .max_cache_bytes()
            .map(|b| b.saturating_sub(DIRECTORY_RESERVE)),
        verify: state.config.garbage_collection.verify,
        grace: GC_GRACE,
    };

    let namespaces: Vec<Namespace> = state.config.namespaces.keys().cloned().collect();

    collect(state.local.clone(), &namespaces, &options, &state.metrics).await
}

/// Runs a verify pass without eviction.
///
/// Corrupt chunks and the indices referencing them are removed; the
/// byte budget is left alone.
#[instrument(skip_all)]
pub async fn run_verify_once(state: &State) -> Result<GcSummary> {
    tracing::info!("Verifying chunk store integrity...");

    let options = GcOptions {
        budget: None,
        verify: true,
        grace: GC_GRACE,
    };

    let namespaces: Vec<Namespace> = state.config.namespaces.keys().cloned().collect();

    collect(state.local.clone(), &namespaces, &options, &state.metrics).await
}

/// Runs one verify-and-collect pass.
pub async fn collect(
    local: Arc<LocalStore>,
    namespaces: &[Namespace],
    options: &GcOptions,
    metrics: &Metrics,
) -> Result<GcSummary> {
    let now = SystemTime::now();
    let mut summary = GcSummary::default();

    let chunks = local.walk_chunks().await?;

    let sizes: HashMap<ContentHash, u64> =
        chunks.iter().map(|c| (c.digest, c.file_size)).collect();

    let mut dead: HashSet<ContentHash> = HashSet::new();

    // 1. verify
    if options.verify {
        for info in &chunks {
            let intact = match ChunkStore::get(local.as_ref(), &info.digest).await {
                Ok(Some(data)) => ContentHash::digest(&data) == info.digest,
                // raced with a concurrent removal
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Could not read chunk {}: {}", info.digest.to_hex(), e);
                    false
                }
            };

            if !intact {
                tracing::warn!("Chunk {} is corrupt", info.digest.to_hex());
                metrics.corrupt_chunks.fetch_add(1, Ordering::Relaxed);
                summary.corrupt_chunks += 1;
                dead.insert(info.digest);
            }
        }
    }

    // 2. LRU eviction
    let mut live_bytes: u64 = chunks
        .iter()
        .filter(|c| !dead.contains(&c.digest))
        .map(|c| c.file_size)
        .sum();

    if let Some(budget) = options.budget {
        let mut by_age: Vec<_> = chunks
            .iter()
            .filter(|c| !dead.contains(&c.digest))
            .collect();
        by_age.sort_by_key(|c| c.modified);

        let mut oldest_first = by_age.into_iter();
        while live_bytes > budget {
            match oldest_first.next() {
                Some(info) => {
                    dead.insert(info.digest);
                    live_bytes -= info.file_size;
                }
                None => break,
            }
        }
    }

    // 3. find dead indices
    let mut dead_indices: Vec<(Namespace, String)> = Vec::new();

    for namespace in namespaces {
        for info in local.walk_indices(namespace).await? {
            let past_grace = now
                .duration_since(info.modified)
                .map(|age| age >= options.grace)
                .unwrap_or(false);

            let index = match local.get_index(namespace, &info.name).await {
                Ok(Some(index)) => index,
                // raced with a concurrent removal
                Ok(None) => continue,
                Err(e) => {
                    if past_grace {
                        tracing::warn!("Index {} does not decode: {}", info.name, e);
                        dead_indices.push((namespace.clone(), info.name));
                    }
                    continue;
                }
            };

            if !past_grace {
                // an in-flight ingest may still be referencing these
                for digest in index.digests() {
                    if dead.remove(digest) {
                        live_bytes += sizes.get(digest).copied().unwrap_or(0);
                    }
                }
                continue;
            }

            if !index_is_live(&local, namespace, &info.name, index, &dead).await {
                dead_indices.push((namespace.clone(), info.name));
            }
        }
    }

    // 4. remove indices first, then chunks
    for (namespace, name) in &dead_indices {
        match local.remove_index(namespace, name).await {
            Ok(()) => {
                metrics.gc_indices_removed.fetch_add(1, Ordering::Relaxed);
                summary.indices_removed += 1;
            }
            Err(e) => tracing::warn!("Could not remove index {}: {}", name, e),
        }
    }

    for digest in &dead {
        match ChunkStore::remove(local.as_ref(), digest).await {
            Ok(()) => {
                metrics.gc_chunks_removed.fetch_add(1, Ordering::Relaxed);
                summary.chunks_removed += 1;
            }
            Err(e) => tracing::warn!("Could not remove chunk {}: {}", digest.to_hex(), e),
        }
    }

    if let Some(cutoff) = now.checked_sub(options.grace) {
        local.reap_tmp(cutoff).await?;
    }

    summary.live_bytes = live_bytes;

    tracing::info!(
        "Garbage collection done: {} bytes live, {} chunks and {} indices removed, {} corrupt",
        summary.live_bytes,
        summary.chunks_removed,
        summary.indices_removed,
        summary.corrupt_chunks,
    );

    Ok(summary)
}

/// Decides whether an index may stay.
async fn index_is_live(
    local: &Arc<LocalStore>,
    namespace: &Namespace,
    name: &str,
    index: ChunkIndex,
    dead: &HashSet<ContentHash>,
) -> bool {
    if index.entries.is_empty() {
        tracing::warn!("Index {} has an empty chunk list", name);
        return false;
    }

    if index.digests().any(|digest| dead.contains(digest)) {
        return false;
    }

    for digest in index.digests() {
        match ChunkStore::has(local.as_ref(), digest).await {
            Ok(true) => {}
            _ => {
                tracing::warn!(
                    "Index {} references missing chunk {}",
                    name,
                    digest.to_hex()
                );
                return false;
            }
        }
    }

    let store: Arc<dyn ChunkStore> = local.clone();

    // replay the artifact and require it to be well-formed
    let intact = if name.ends_with(".narinfo") {
        match assemble_bytes(store, index).await {
            Ok(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => NarInfo::from_str(text).is_ok(),
                Err(_) => false,
            },
            Err(_) => false,
        }
    } else if name.starts_with("nar/") {
        let mut reader = assemble_reader(store, index);
        validate_nar(&mut reader).await.is_ok()
    } else {
        // not an artifact this proxy writes
        false
    };

    if !intact {
        tracing::warn!("Index {} fails its integrity check ({})", name, namespace);
    }

    intact
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::FileTimes;
    use std::io::Cursor;

    use granary::chunking::ChunkerParams;

    use crate::config::ChunkCompression;
    use crate::ingest::ingest_reader;
    use crate::nar::tests::file_nar;

    const KIB: usize = 1024;

    fn params() -> ChunkerParams {
        ChunkerParams::new(16 * KIB, 32 * KIB, 64 * KIB).unwrap()
    }

    fn testing_ns() -> Namespace {
        "testing".parse().unwrap()
    }

    fn no_eviction(grace: Duration) -> GcOptions {
        GcOptions {
            budget: None,
            verify: true,
            grace,
        }
    }

    /// Deterministic, non-repeating per-artifact payload.
    fn data_for(seed: usize, len: usize) -> Vec<u8> {
        let mut state = 0x9e3779b9u32.wrapping_mul(seed as u32 + 1);
        let mut data = vec![0u8; len];

        for (i, byte) in data.iter_mut().enumerate() {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            *byte = ((state >> (i % 24)) & 0xff) as u8;
        }

        data
    }

    async fn fresh_store() -> (tempfile::TempDir, Arc<LocalStore>) {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalStore::new(dir.path().to_owned(), ChunkCompression::None)
            .await
            .unwrap();
        (dir, Arc::new(local))
    }

    /// Rewrites the mtimes of every chunk of an index.
    async fn age_index_chunks(local: &Arc<LocalStore>, name: &str, mtime: SystemTime) {
        let index = local
            .get_index(&testing_ns(), name)
            .await
            .unwrap()
            .unwrap();

        for digest in index.digests() {
            let path = local.existing_chunk_path(digest).await.unwrap().unwrap();
            let file = std::fs::File::options().write(true).open(path).unwrap();
            file.set_times(FileTimes::new().set_modified(mtime)).unwrap();
        }
    }

    async fn ingest_nar(local: &Arc<LocalStore>, name: &str, contents: &[u8]) {
        let metrics = Metrics::new();
        ingest_reader(
            local.clone(),
            local.clone(),
            &testing_ns(),
            name,
            Cursor::new(file_nar(contents)),
            params(),
            &metrics,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_lru_eviction_keeps_newest() {
        let (_dir, local) = fresh_store().await;
        let namespaces = vec![testing_ns()];
        let metrics = Metrics::new();

        // ten ~200 KiB artifacts, oldest first
        let base = SystemTime::now() - Duration::from_secs(10_000);
        for i in 0..10 {
            let name = format!("nar/artifact-{}.nar", i);
            ingest_nar(&local, &name, &data_for(i, 200 * KIB)).await;
            age_index_chunks(&local, &name, base + Duration::from_secs(i as u64 * 60)).await;
        }

        let options = GcOptions {
            budget: Some(1024 * 1024),
            verify: false,
            grace: Duration::ZERO,
        };

        let summary = collect(local.clone(), &namespaces, &options, &metrics)
            .await
            .unwrap();

        assert!(summary.chunks_removed > 0);
        assert!(summary.live_bytes <= 1024 * 1024);

        // the five oldest artifacts are gone, the five newest remain intact
        for i in 0..5 {
            let name = format!("nar/artifact-{}.nar", i);
            assert!(
                local.get_index(&testing_ns(), &name).await.unwrap().is_none(),
                "expected {} to be evicted",
                name
            );
        }

        for i in 5..10 {
            let name = format!("nar/artifact-{}.nar", i);
            let index = local
                .get_index(&testing_ns(), &name)
                .await
                .unwrap()
                .unwrap_or_else(|| panic!("expected {} to survive", name));

            // every chunk of a surviving index must resolve
            for digest in index.digests() {
                assert!(ChunkStore::has(local.as_ref(), digest).await.unwrap());
            }

            let assembled = assemble_bytes(local.clone(), index).await.unwrap();
            assert_eq!(file_nar(&data_for(i, 200 * KIB)), assembled);
        }
    }

    #[tokio::test]
    async fn test_verify_removes_tampered_chunk_and_its_index() {
        let (_dir, local) = fresh_store().await;
        let namespaces = vec![testing_ns()];
        let metrics = Metrics::new();

        ingest_nar(&local, "nar/victim.nar", &data_for(1, 100 * KIB)).await;
        ingest_nar(&local, "nar/innocent.nar", &data_for(2, 100 * KIB)).await;

        // flip bytes inside one chunk of the victim
        let index = local
            .get_index(&testing_ns(), "nar/victim.nar")
            .await
            .unwrap()
            .unwrap();
        let victim_digest = index.entries[0].digest;
        let path = local
            .existing_chunk_path(&victim_digest)
            .await
            .unwrap()
            .unwrap();
        let size = std::fs::metadata(&path).unwrap().len() as usize;
        std::fs::write(&path, vec![0xaa; size]).unwrap();

        let summary = collect(
            local.clone(),
            &namespaces,
            &no_eviction(Duration::ZERO),
            &metrics,
        )
        .await
        .unwrap();

        assert_eq!(1, summary.corrupt_chunks);
        assert!(summary.chunks_removed >= 1);

        // the tampered chunk and every index referencing it are gone
        assert!(!ChunkStore::has(local.as_ref(), &victim_digest).await.unwrap());
        assert!(local
            .get_index(&testing_ns(), "nar/victim.nar")
            .await
            .unwrap()
            .is_none());

        // the innocent artifact is untouched
        assert!(local
            .get_index(&testing_ns(), "nar/innocent.nar")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_recent_indices_are_protected() {
        let (_dir, local) = fresh_store().await;
        let namespaces = vec![testing_ns()];
        let metrics = Metrics::new();

        ingest_nar(&local, "nar/fresh.nar", &data_for(3, 100 * KIB)).await;

        // a zero budget wants everything gone, but the index is fresh
        let options = GcOptions {
            budget: Some(0),
            verify: false,
            grace: GC_GRACE,
        };

        let summary = collect(local.clone(), &namespaces, &options, &metrics)
            .await
            .unwrap();

        assert_eq!(0, summary.chunks_removed);
        assert_eq!(0, summary.indices_removed);

        let index = local
            .get_index(&testing_ns(), "nar/fresh.nar")
            .await
            .unwrap()
            .unwrap();
        assemble_bytes(local.clone(), index).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_artifacts_are_collected() {
        let (_dir, local) = fresh_store().await;
        let namespaces = vec![testing_ns()];
        let metrics = Metrics::new();

        // not a NAR
        ingest_nar(&local, "nar/valid.nar", &data_for(4, 50 * KIB)).await;
        ingest_reader(
            local.clone(),
            local.clone(),
            &testing_ns(),
            "nar/junk.nar",
            Cursor::new(data_for(5, 50 * KIB)),
            params(),
            &Metrics::new(),
        )
        .await
        .unwrap();

        // not a manifest
        ingest_reader(
            local.clone(),
            local.clone(),
            &testing_ns(),
            "junk.narinfo",
            Cursor::new(b"definitely not a manifest".to_vec()),
            params(),
            &Metrics::new(),
        )
        .await
        .unwrap();

        // an index with an empty chunk list
        let empty = ChunkIndex::new(params(), Vec::new()).unwrap();
        local
            .put_index(&testing_ns(), "nar/empty.nar", &empty)
            .await
            .unwrap();

        let summary = collect(
            local.clone(),
            &namespaces,
            &no_eviction(Duration::ZERO),
            &metrics,
        )
        .await
        .unwrap();

        assert_eq!(3, summary.indices_removed);

        assert!(local
            .get_index(&testing_ns(), "nar/valid.nar")
            .await
            .unwrap()
            .is_some());

        for name in ["nar/junk.nar", "junk.narinfo", "nar/empty.nar"] {
            assert!(
                local.get_index(&testing_ns(), name).await.unwrap().is_none(),
                "expected {} to be collected",
                name
            );
        }
    }

    #[tokio::test]
    async fn test_canonical_narinfo_survives() {
        let (_dir, local) = fresh_store().await;
        let namespaces = vec![testing_ns()];
        let metrics = Metrics::new();

        let manifest = "StorePath: /nix/store/xcp9cav49dmsjbwdjlmkjxj10gkpx553-hello-2.10\n\
                        URL: nar/0nqgf15qfiacfxrgm2wkw0gwwncjqqzzalj8rs14w9srkydkjsk9.nar\n\
                        Compression: none\n\
                        NarHash: sha256:16mvl7v0ylzcg2n3xzjn41qhzbmgcn5iyarx16nn5l2r36n2kqci\n\
                        NarSize: 206104\n\
                        References: \n";

        ingest_reader(
            local.clone(),
            local.clone(),
            &testing_ns(),
            "xcp9cav49dmsjbwdjlmkjxj10gkpx553.narinfo",
            Cursor::new(manifest.as_bytes().to_vec()),
            params(),
            &Metrics::new(),
        )
        .await
        .unwrap();

        let summary = collect(
            local.clone(),
            &namespaces,
            &no_eviction(Duration::ZERO),
            &metrics,
        )
        .await
        .unwrap();

        assert_eq!(0, summary.indices_removed);
    }
}
