//! Two-tier read-through chunk store.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use granary::hash::ContentHash;

use super::ChunkStore;
use crate::error::ServerResult;

/// A read-through view over `{fast, slow}` chunk tiers.
///
/// Reads prefer the fast tier; a miss is filled from the slow tier and
/// written back to the fast tier before returning, so the hot working
/// set migrates local. The fill only ever flows from slow to fast,
/// which bounds write amplification to one copy per miss.
pub struct CompositeChunkStore {
    fast: Arc<dyn ChunkStore>,
    slow: Arc<dyn ChunkStore>,
}

impl CompositeChunkStore {
    pub fn new(fast: Arc<dyn ChunkStore>, slow: Arc<dyn ChunkStore>) -> Self {
        Self { fast, slow }
    }
}

#[async_trait]
impl ChunkStore for CompositeChunkStore {
    async fn get(&self, digest: &ContentHash) -> ServerResult<Option<Bytes>> {
        if let Some(data) = self.fast.get(digest).await? {
            return Ok(Some(data));
        }

        match self.slow.get(digest).await? {
            Some(data) => {
                if let Err(e) = self.fast.put(digest, data.clone()).await {
                    // the miss-fill is opportunistic
                    tracing::warn!("Failed to warm fast tier: {}", e);
                }

                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    async fn has(&self, digest: &ContentHash) -> ServerResult<bool> {
        if self.fast.has(digest).await? {
            return Ok(true);
        }

        self.slow.has(digest).await
    }

    async fn put(&self, digest: &ContentHash, data: Bytes) -> ServerResult<()> {
        self.fast.put(digest, data.clone()).await?;
        self.slow.put(digest, data).await
    }

    async fn remove(&self, digest: &ContentHash) -> ServerResult<()> {
        self.fast.remove(digest).await?;
        self.slow.remove(digest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_read_through_warms_fast_tier() {
        let fast = Arc::new(MemoryStore::new());
        let slow = Arc::new(MemoryStore::new());

        let data = Bytes::from_static(b"some chunk");
        let digest = ContentHash::digest(&data);

        slow.put(&digest, data.clone()).await.unwrap();

        let composite = CompositeChunkStore::new(fast.clone(), slow.clone());

        assert!(composite.has(&digest).await.unwrap());
        assert!(!fast.has(&digest).await.unwrap());

        // first read fills the fast tier
        assert_eq!(data, composite.get(&digest).await.unwrap().unwrap());
        assert!(fast.has(&digest).await.unwrap());

        // a second read is served even if the slow tier disappears
        slow.remove(&digest).await.unwrap();
        assert_eq!(data, composite.get(&digest).await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_put_writes_both_tiers() {
        let fast = Arc::new(MemoryStore::new());
        let slow = Arc::new(MemoryStore::new());
        let composite = CompositeChunkStore::new(fast.clone(), slow.clone());

        let data = Bytes::from_static(b"both tiers");
        let digest = ContentHash::digest(&data);

        composite.put(&digest, data).await.unwrap();

        assert!(fast.has(&digest).await.unwrap());
        assert!(slow.has(&digest).await.unwrap());
    }
}
