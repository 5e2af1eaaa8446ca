//! S3-compatible object storage.
//!
//! Chunks are stored under `{prefix}store/{digest}` and indices under
//! `{prefix}index/{namespace}/{name}`. Chunk sizes are bounded by the
//! chunker's maximum, so plain `PutObject` uploads suffice; an upload
//! acknowledged by the object store is considered durable.

use async_trait::async_trait;
use aws_sdk_s3::{
    config::Builder as S3ConfigBuilder,
    error::SdkError,
    primitives::ByteStream,
    config::{Credentials, Region},
    Client,
};
use bytes::Bytes;

use granary::hash::ContentHash;
use granary::namespace::Namespace;

use super::{ChunkStore, IndexStore};
use crate::config::{load_s3_credentials, ChunkCompression, S3StorageConfig};
use crate::error::{ServerError, ServerResult};
use crate::index::ChunkIndex;

/// The S3-backed store tier.
#[derive(Debug)]
pub struct S3Store {
    client: Client,
    bucket: String,
    prefix: String,
    compression: ChunkCompression,
}

impl S3Store {
    pub async fn new(config: S3StorageConfig) -> ServerResult<Self> {
        let shared_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        let mut builder = S3ConfigBuilder::from(&shared_config);

        match load_s3_credentials(&config) {
            Ok(Some(credentials)) => {
                builder = builder.credentials_provider(Credentials::new(
                    &credentials.access_key_id,
                    &credentials.secret_access_key,
                    None,
                    None,
                    "s3",
                ));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    "Could not load S3 credentials, falling back to the environment: {}",
                    e
                );
            }
        }

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        let s3_config = builder.region(Region::new(config.region.clone())).build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket,
            prefix: config.prefix,
            compression: config.chunk_compression,
        })
    }

    fn chunk_key(&self, digest: &ContentHash, compression: ChunkCompression) -> String {
        let suffix = match compression {
            ChunkCompression::None => "",
            ChunkCompression::Zstd => ".zst",
        };

        format!("{}store/{}{}", self.prefix, digest.to_hex(), suffix)
    }

    /// The key flavors a chunk may exist under, configured one first.
    fn chunk_key_flavors(&self) -> [ChunkCompression; 2] {
        match self.compression {
            ChunkCompression::None => [ChunkCompression::None, ChunkCompression::Zstd],
            ChunkCompression::Zstd => [ChunkCompression::Zstd, ChunkCompression::None],
        }
    }

    fn index_key(&self, namespace: &Namespace, name: &str) -> String {
        format!("{}index/{}/{}", self.prefix, namespace, name)
    }

    async fn get_object(&self, key: String) -> ServerResult<Option<Bytes>> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(SdkError::ServiceError(e)) if e.err().is_no_such_key() => return Ok(None),
            Err(e) => return Err(ServerError::storage_error(e)),
        };

        let data = output
            .body
            .collect()
            .await
            .map_err(ServerError::storage_error)?;

        Ok(Some(data.into_bytes()))
    }

    async fn head_object(&self, key: String) -> ServerResult<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(e)) if e.err().is_not_found() => Ok(false),
            Err(e) => Err(ServerError::storage_error(e)),
        }
    }

    async fn put_object(&self, key: String, data: Bytes) -> ServerResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(ServerError::storage_error)?;

        Ok(())
    }

    async fn delete_object(&self, key: String) -> ServerResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(ServerError::storage_error)?;

        Ok(())
    }
}

#[async_trait]
impl ChunkStore for S3Store {
    async fn get(&self, digest: &ContentHash) -> ServerResult<Option<Bytes>> {
        for compression in self.chunk_key_flavors() {
            if let Some(data) = self.get_object(self.chunk_key(digest, compression)).await? {
                let data = super::decompress_chunk(compression, data)
                    .await
                    .map_err(ServerError::storage_error)?;

                return Ok(Some(data));
            }
        }

        Ok(None)
    }

    async fn has(&self, digest: &ContentHash) -> ServerResult<bool> {
        for compression in self.chunk_key_flavors() {
            if self.head_object(self.chunk_key(digest, compression)).await? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn put(&self, digest: &ContentHash, data: Bytes) -> ServerResult<()> {
        // the object store tracks last access itself
        let payload = super::compress_chunk(self.compression, data)
            .await
            .map_err(ServerError::storage_error)?;

        self.put_object(self.chunk_key(digest, self.compression), payload)
            .await
    }

    async fn remove(&self, digest: &ContentHash) -> ServerResult<()> {
        for compression in self.chunk_key_flavors() {
            self.delete_object(self.chunk_key(digest, compression))
                .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl IndexStore for S3Store {
    async fn get_index(
        &self,
        namespace: &Namespace,
        name: &str,
    ) -> ServerResult<Option<ChunkIndex>> {
        let bytes = match self.get_object(self.index_key(namespace, name)).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
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
        self.put_object(
            self.index_key(namespace, name),
            Bytes::from(index.to_bytes()),
        )
        .await
    }

    async fn remove_index(&self, namespace: &Namespace, name: &str) -> ServerResult<()> {
        self.delete_object(self.index_key(namespace, name)).await
    }
}
