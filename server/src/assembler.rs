//! Artifact reassembly.
//!
//! An assembler turns `(chunk store, index)` back into the original
//! byte stream by fetching chunks in index order. It holds at most one
//! chunk in memory at a time and cross-checks everything it touches:
//! each chunk's digest and size against the index entry, and the final
//! byte count against the index length. Any mismatch terminates the
//! stream with an error; a partially-streamed response cannot be
//! retracted, but the client will see the connection fail rather than
//! silently receive corrupt bytes.

use std::io;
use std::sync::Arc;

use async_stream::try_stream;
use bytes::Bytes;
use futures::stream::Stream;
use tokio_util::io::StreamReader;

use granary::hash::ContentHash;

use crate::index::ChunkIndex;
use crate::store::ChunkStore;

/// Streams the bytes of an artifact.
pub fn assemble_stream(
    store: Arc<dyn ChunkStore>,
    index: ChunkIndex,
) -> impl Stream<Item = io::Result<Bytes>> {
    try_stream! {
        let mut written = 0u64;

        for entry in &index.entries {
            let data = store
                .get(&entry.digest)
                .await
                .map_err(io::Error::from)?
                .ok_or_else(|| {
                    corruption(format!(
                        "chunk {} disappeared from the store",
                        entry.digest.to_hex()
                    ))
                })?;

            if data.len() as u64 != entry.size {
                Err(corruption(format!(
                    "chunk {} is {} bytes, index says {}",
                    entry.digest.to_hex(),
                    data.len(),
                    entry.size
                )))?;
            }

            if ContentHash::digest(&data) != entry.digest {
                Err(corruption(format!(
                    "chunk {} does not match its digest",
                    entry.digest.to_hex()
                )))?;
            }

            written += entry.size;
            yield data;
        }

        if written != index.length {
            Err(corruption(format!(
                "assembled {} bytes, index says {}",
                written, index.length
            )))?;
        }
    }
}

/// Like [`assemble_stream`], but as an `AsyncRead`.
pub fn assemble_reader(
    store: Arc<dyn ChunkStore>,
    index: ChunkIndex,
) -> impl tokio::io::AsyncRead + Send + Unpin {
    StreamReader::new(Box::pin(assemble_stream(store, index)))
}

/// Assembles an entire artifact into memory.
///
/// Only suitable for small artifacts like manifests.
pub async fn assemble_bytes(
    store: Arc<dyn ChunkStore>,
    index: ChunkIndex,
) -> io::Result<Bytes> {
    use futures::StreamExt;

    let mut out = Vec::with_capacity(index.length as usize);
    let mut stream = Box::pin(assemble_stream(store, index));

    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }

    Ok(Bytes::from(out))
}

fn corruption(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
