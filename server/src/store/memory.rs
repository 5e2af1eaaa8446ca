//! In-memory store fake.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use granary::hash::ContentHash;
use granary::namespace::Namespace;

use super::{ChunkStore, IndexStore};
use crate::error::ServerResult;
use crate::index::ChunkIndex;

/// A store backed by process memory.
///
/// This exists to keep store-agnostic tests fast and hermetic. It
/// implements both store traits with the same durability-free
/// semantics the real backends have.
#[derive(Debug, Default)]
pub struct MemoryStore {
    chunks: Mutex<HashMap<ContentHash, Bytes>>,
    indices: Mutex<HashMap<(Namespace, String), ChunkIndex>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn get(&self, digest: &ContentHash) -> ServerResult<Option<Bytes>> {
        Ok(self.chunks.lock().unwrap().get(digest).cloned())
    }

    async fn has(&self, digest: &ContentHash) -> ServerResult<bool> {
        Ok(self.chunks.lock().unwrap().contains_key(digest))
    }

    async fn put(&self, digest: &ContentHash, data: Bytes) -> ServerResult<()> {
        self.chunks.lock().unwrap().insert(*digest, data);
        Ok(())
    }

    async fn remove(&self, digest: &ContentHash) -> ServerResult<()> {
        self.chunks.lock().unwrap().remove(digest);
        Ok(())
    }
}

#[async_trait]
impl IndexStore for MemoryStore {
    async fn get_index(
        &self,
        namespace: &Namespace,
        name: &str,
    ) -> ServerResult<Option<ChunkIndex>> {
        Ok(self
            .indices
            .lock()
            .unwrap()
            .get(&(namespace.clone(), name.to_string()))
            .cloned())
    }

    async fn put_index(
        &self,
        namespace: &Namespace,
        name: &str,
        index: &ChunkIndex,
    ) -> ServerResult<()> {
        self.indices
            .lock()
            .unwrap()
            .insert((namespace.clone(), name.to_string()), index.clone());
        Ok(())
    }

    async fn remove_index(&self, namespace: &Namespace, name: &str) -> ServerResult<()> {
        self.indices
            .lock()
            .unwrap()
            .remove(&(namespace.clone(), name.to_string()));
        Ok(())
    }
}
