//! Local file storage.
//!
//! On-disk layout under the configured data directory:
//!
//! ```text
//! store/<nibble-pair>/<nibble-pair>/<digest>.chunk[.zst]
//! index/<namespace>/<name>
//! tmp/
//! ```
//!
//! Chunks are sharded by the first two bytes of their digest, spreading
//! them across up to 65,536 leaf directories. All writes go through a
//! `.tmp.`-prefixed file in the target directory followed by a rename,
//! so readers and the directory walks only ever observe complete files.
//! `.tmp.` files left behind by crashed writers are skipped by walks
//! and reaped by the garbage collector.

use std::fs::FileTimes;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use granary::hash::ContentHash;
use granary::namespace::Namespace;

use super::{ChunkStore, IndexStore};
use crate::config::ChunkCompression;
use crate::error::{ServerError, ServerResult};
use crate::index::ChunkIndex;

/// Prefix marking in-flight files.
pub const TMP_PREFIX: &str = ".tmp.";

/// Extension of uncompressed chunk files.
const CHUNK_EXT: &str = "chunk";

/// Extension of zstd-compressed chunk files.
const CHUNK_ZST_EXT: &str = "chunk.zst";

/// The local store tier.
#[derive(Debug)]
pub struct LocalStore {
    root: PathBuf,
    compression: ChunkCompression,
}

/// A chunk file seen by [`LocalStore::walk_chunks`].
#[derive(Debug, Clone)]
pub struct ChunkFileInfo {
    pub digest: ContentHash,

    /// On-disk (possibly compressed) size.
    pub file_size: u64,

    /// Last modification time, refreshed on deduplicated writes.
    pub modified: SystemTime,
}

/// An index file seen by [`LocalStore::walk_indices`].
#[derive(Debug, Clone)]
pub struct IndexFileInfo {
    /// Logical artifact name, e.g. `nar/{hash}.nar`.
    pub name: String,

    pub modified: SystemTime,
}

impl LocalStore {
    /// Opens (and if necessary initializes) a local store.
    pub async fn new(root: PathBuf, compression: ChunkCompression) -> ServerResult<Self> {
        for dir in ["store", "index", "tmp"] {
            fs::create_dir_all(root.join(dir))
                .await
                .map_err(ServerError::storage_error)?;
        }

        Ok(Self { root, compression })
    }

    /// Returns the scratch directory for uploads.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn chunk_path(&self, digest: &ContentHash, ext: &str) -> PathBuf {
        let hex = digest.to_hex();
        self.root
            .join("store")
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(format!("{}.{}", hex, ext))
    }

    fn index_root(&self, namespace: &Namespace) -> PathBuf {
        self.root.join("index").join(namespace.as_str())
    }

    fn index_path(&self, namespace: &Namespace, name: &str) -> PathBuf {
        self.index_root(namespace).join(name)
    }

    /// Finds the on-disk path of a chunk, in either compression flavor.
    pub(crate) async fn existing_chunk_path(
        &self,
        digest: &ContentHash,
    ) -> ServerResult<Option<PathBuf>> {
        for ext in [CHUNK_EXT, CHUNK_ZST_EXT] {
            let path = self.chunk_path(digest, ext);
            match fs::metadata(&path).await {
                Ok(_) => return Ok(Some(path)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(ServerError::storage_error(e)),
            }
        }

        Ok(None)
    }

    /// Writes a file atomically via a temporary name in the target directory.
    async fn write_atomically(&self, path: &Path, data: &[u8]) -> ServerResult<()> {
        let parent = path.parent().unwrap();
        fs::create_dir_all(parent)
            .await
            .map_err(ServerError::storage_error)?;

        let tmp = parent.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));

        let result = async {
            let mut file = File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);

            fs::rename(&tmp, path).await
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }

        result.map_err(ServerError::storage_error)
    }

    /// Walks the chunk directory tree.
    ///
    /// In-flight `.tmp.` files are skipped.
    pub async fn walk_chunks(&self) -> ServerResult<Vec<ChunkFileInfo>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.join("store")];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(ServerError::storage_error(e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(ServerError::storage_error)?
            {
                let file_type = entry.file_type().await.map_err(ServerError::storage_error)?;

                if file_type.is_dir() {
                    stack.push(entry.path());
                    continue;
                }

                let name = entry.file_name();
                let name = match name.to_str() {
                    Some(name) => name,
                    None => continue,
                };

                if name.starts_with(TMP_PREFIX) {
                    continue;
                }

                let stem = name
                    .strip_suffix(&format!(".{}", CHUNK_ZST_EXT))
                    .or_else(|| name.strip_suffix(&format!(".{}", CHUNK_EXT)));

                let digest = match stem.and_then(|s| ContentHash::parse_digest(s).ok()) {
                    Some(digest) => digest,
                    None => continue,
                };

                let metadata = entry.metadata().await.map_err(ServerError::storage_error)?;

                out.push(ChunkFileInfo {
                    digest,
                    file_size: metadata.len(),
                    modified: metadata.modified().map_err(ServerError::storage_error)?,
                });
            }
        }

        Ok(out)
    }

    /// Walks the index tree of one namespace.
    pub async fn walk_indices(&self, namespace: &Namespace) -> ServerResult<Vec<IndexFileInfo>> {
        let root = self.index_root(namespace);
        let mut out = Vec::new();
        let mut stack = vec![root.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(ServerError::storage_error(e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(ServerError::storage_error)?
            {
                let file_type = entry.file_type().await.map_err(ServerError::storage_error)?;

                if file_type.is_dir() {
                    stack.push(entry.path());
                    continue;
                }

                let path = entry.path();
                let name = match path.strip_prefix(&root).ok().and_then(|p| p.to_str()) {
                    Some(name) => name.to_string(),
                    None => continue,
                };

                if name.rsplit('/').next().unwrap().starts_with(TMP_PREFIX) {
                    continue;
                }

                let metadata = entry.metadata().await.map_err(ServerError::storage_error)?;

                out.push(IndexFileInfo {
                    name,
                    modified: metadata.modified().map_err(ServerError::storage_error)?,
                });
            }
        }

        Ok(out)
    }

    /// Removes stale scratch files older than the given age.
    pub async fn reap_tmp(&self, older_than: SystemTime) -> ServerResult<u64> {
        let mut reaped = 0;

        let mut entries = match fs::read_dir(self.tmp_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(ServerError::storage_error(e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(ServerError::storage_error)?
        {
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };

            if metadata.modified().map(|m| m < older_than).unwrap_or(false)
                && fs::remove_file(entry.path()).await.is_ok()
            {
                reaped += 1;
            }
        }

        Ok(reaped)
    }
}

#[async_trait]
impl ChunkStore for LocalStore {
    async fn get(&self, digest: &ContentHash) -> ServerResult<Option<Bytes>> {
        let path = match self.existing_chunk_path(digest).await? {
            Some(path) => path,
            None => return Ok(None),
        };

        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            // lost a race with GC
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ServerError::storage_error(e)),
        };

        let compression = if path.extension().map(|e| e == "zst").unwrap_or(false) {
            ChunkCompression::Zstd
        } else {
            ChunkCompression::None
        };

        let data = super::decompress_chunk(compression, Bytes::from(raw))
            .await
            .map_err(ServerError::storage_error)?;

        Ok(Some(data))
    }

    async fn has(&self, digest: &ContentHash) -> ServerResult<bool> {
        Ok(self.existing_chunk_path(digest).await?.is_some())
    }

    async fn put(&self, digest: &ContentHash, data: Bytes) -> ServerResult<()> {
        if let Some(path) = self.existing_chunk_path(digest).await? {
            // refresh the LRU position of the existing chunk
            return touch(&path).map_err(ServerError::storage_error);
        }

        let ext = match self.compression {
            ChunkCompression::None => CHUNK_EXT,
            ChunkCompression::Zstd => CHUNK_ZST_EXT,
        };

        let path = self.chunk_path(digest, ext);
        let payload = super::compress_chunk(self.compression, data)
            .await
            .map_err(ServerError::storage_error)?;

        self.write_atomically(&path, &payload).await
    }

    async fn remove(&self, digest: &ContentHash) -> ServerResult<()> {
        for ext in [CHUNK_EXT, CHUNK_ZST_EXT] {
            match fs::remove_file(self.chunk_path(digest, ext)).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(ServerError::storage_error(e)),
            }
        }

        Ok(())
    }
}

#[async_trait]
impl IndexStore for LocalStore {
    async fn get_index(
        &self,
        namespace: &Namespace,
        name: &str,
    ) -> ServerResult<Option<ChunkIndex>> {
        let bytes = match fs::read(self.index_path(namespace, name)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ServerError::storage_error(e)),
        };

        let index = ChunkIndex::from_bytes(&bytes).map_err(ServerError::integrity_error)?;

        Ok(Some(index))
    }

    async fn put_index(
        &self,
        namespace: &Namespace,
        name: &str,
        index: &ChunkIndex,
    ) -> ServerResult<()> {
        self.write_atomically(&self.index_path(namespace, name), &index.to_bytes())
            .await
    }

    async fn remove_index(&self, namespace: &Namespace, name: &str) -> ServerResult<()> {
        match fs::remove_file(self.index_path(namespace, name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerError::storage_error(e)),
        }
    }
}

/// Refreshes the modification time of a file.
fn touch(path: &Path) -> io::Result<()> {
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(FileTimes::new().set_modified(SystemTime::now()))
}
