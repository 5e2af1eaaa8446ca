//! Chunk and index storage.
//!
//! Two keyspaces back everything the proxy serves:
//!
//! - the **chunk store** maps a content digest to raw bytes. It is
//!   shared by all namespaces; a digest fully determines its contents.
//! - the **index store** maps `(namespace, artifact name)` to a
//!   [`ChunkIndex`](crate::index::ChunkIndex) describing how to
//!   reassemble the artifact from chunks.
//!
//! Both come in a local-filesystem and an S3-compatible flavor, plus a
//! read-through composite over two chunk tiers and an in-memory fake
//! for tests. Writes are idempotent on the chunk keyspace and
//! last-writer-wins on the index keyspace.

mod composite;
mod local;
mod memory;
mod s3;

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;

use granary::hash::ContentHash;
use granary::namespace::Namespace;

use crate::config::ChunkCompression;
use crate::error::ServerResult;
use crate::index::ChunkIndex;

pub use composite::CompositeChunkStore;
pub use local::{ChunkFileInfo, IndexFileInfo, LocalStore};
pub use memory::MemoryStore;
pub use s3::S3Store;

/// A chunk store.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Retrieves a chunk.
    ///
    /// Returns `None` if the chunk does not exist.
    async fn get(&self, digest: &ContentHash) -> ServerResult<Option<Bytes>>;

    /// Returns whether a chunk exists.
    async fn has(&self, digest: &ContentHash) -> ServerResult<bool>;

    /// Persists a chunk.
    ///
    /// Storing an existing digest is a no-op on contents but refreshes
    /// its last-access time. The chunk is durable when this returns.
    async fn put(&self, digest: &ContentHash, data: Bytes) -> ServerResult<()>;

    /// Removes a chunk. Only the garbage collector calls this.
    async fn remove(&self, digest: &ContentHash) -> ServerResult<()>;
}

/// Applies the configured at-rest compression to a chunk.
pub(crate) async fn compress_chunk(
    compression: ChunkCompression,
    data: Bytes,
) -> io::Result<Bytes> {
    match compression {
        ChunkCompression::None => Ok(data),
        ChunkCompression::Zstd => {
            let mut encoder = async_compression::tokio::bufread::ZstdEncoder::new(&data[..]);
            let mut out = Vec::new();
            encoder.read_to_end(&mut out).await?;
            Ok(Bytes::from(out))
        }
    }
}

/// Reverses [`compress_chunk`].
pub(crate) async fn decompress_chunk(
    compression: ChunkCompression,
    data: Bytes,
) -> io::Result<Bytes> {
    match compression {
        ChunkCompression::None => Ok(data),
        ChunkCompression::Zstd => {
            let mut decoder = async_compression::tokio::bufread::ZstdDecoder::new(&data[..]);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).await?;
            Ok(Bytes::from(out))
        }
    }
}

/// An index store.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Retrieves an index.
    ///
    /// Returns `None` if no index exists under the name. A present but
    /// undecodable index is an integrity error.
    async fn get_index(&self, namespace: &Namespace, name: &str)
        -> ServerResult<Option<ChunkIndex>>;

    /// Atomically replaces the index under a name.
    async fn put_index(
        &self,
        namespace: &Namespace,
        name: &str,
        index: &ChunkIndex,
    ) -> ServerResult<()>;

    /// Removes an index. Missing names are not an error.
    async fn remove_index(&self, namespace: &Namespace, name: &str) -> ServerResult<()>;
}
