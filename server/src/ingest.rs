//! Artifact ingestion.
//!
//! Ingestion chunks an uncompressed byte stream, persists every chunk,
//! and finally writes the index. The index is only written after all
//! of its chunks are durable, so a reader can never observe an index
//! whose chunks are missing (crashes leave at most orphan chunks,
//! which are harmless and eventually collected).
//!
//! For upstream fetches the same bytes feed the client response and up
//! to two ingest sinks (local and object tier). The tee reads the
//! source once and publishes each slice to every sink through a
//! bounded queue of capacity 1, then hands the slice to the client.
//! Backpressure is structural: the slowest consumer throttles the
//! source. A sink that stalls longer than the configured interval is
//! dropped so it cannot wedge the client response; a dropped or failed
//! sink never fails the request.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_stream::stream;
use bytes::{Bytes, BytesMut};
use futures::stream::Stream;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;

use granary::chunking::{chunk_stream, ChunkerParams};
use granary::hash::ContentHash;
use granary::namespace::Namespace;
use granary::stream::{read_chunk_async, StreamHasher};

use crate::error::{ServerError, ServerResult};
use crate::index::{ChunkIndex, IndexEntry};
use crate::metrics::Metrics;
use crate::store::{ChunkStore, IndexStore};

/// Read size of the tee combiner.
const IO_CHUNK_SIZE: usize = 64 * 1024;

/// A slice of the source stream, or its clean end.
///
/// Distinguishing the end from a dropped sender is what keeps a client
/// disconnect from being ingested as a complete artifact.
pub enum Frame {
    Data(Bytes),
    End,
}

/// Result of one ingest.
#[derive(Debug)]
pub struct IngestOutcome {
    /// The index written for the artifact.
    pub index: ChunkIndex,

    /// Digest of the whole uncompressed artifact, computed over the
    /// source stream independently of the chunker.
    pub artifact_hash: ContentHash,

    /// Chunks that did not exist in the store before.
    pub new_chunks: u64,

    /// Total uncompressed bytes ingested.
    pub total_bytes: u64,
}

/// Chunks a reader into a store and writes the index.
///
/// The source stream is digested as a whole while it is being chunked;
/// a disagreement between the two byte counts means the chunker lost
/// or duplicated data and fails the ingest. Refuses empty inputs: an
/// artifact with no bytes has no index.
pub async fn ingest_reader<R>(
    chunks: Arc<dyn ChunkStore>,
    indices: Arc<dyn IndexStore>,
    namespace: &Namespace,
    name: &str,
    reader: R,
    params: ChunkerParams,
    metrics: &Metrics,
) -> ServerResult<IngestOutcome>
where
    R: AsyncRead + Unpin + Send,
{
    let (reader, stream_digest) = StreamHasher::new(reader);
    let mut cuts = std::pin::pin!(chunk_stream(reader, params));

    let mut entries = Vec::new();
    let mut new_chunks = 0u64;
    let mut total_bytes = 0u64;

    while let Some(cut) = cuts.next().await {
        let cut = cut.map_err(ServerError::request_error)?;
        let digest = ContentHash::digest(&cut.data);
        let size = cut.data.len() as u64;

        if chunks.has(&digest).await? {
            metrics.deduplicated_chunks.fetch_add(1, Ordering::Relaxed);
        } else {
            new_chunks += 1;
            metrics.ingested_chunks.fetch_add(1, Ordering::Relaxed);
            metrics.ingested_bytes.fetch_add(size, Ordering::Relaxed);
        }

        // deduplicated puts still refresh the chunk's last-access time
        chunks.put(&digest, cut.data).await?;

        entries.push(IndexEntry {
            offset: cut.offset,
            size,
            digest,
        });

        total_bytes += size;
    }

    if entries.is_empty() {
        return Err(ServerError::RequestError(anyhow!(
            "refusing to ingest an empty artifact"
        )));
    }

    // chunking drained the source, so the stream digest is final
    let (artifact_hash, hashed_bytes) = match stream_digest.get() {
        Some(finalized) => *finalized,
        None => {
            return Err(ServerError::IntegrityError(anyhow!(
                "chunker finished before the source stream ended"
            )));
        }
    };

    if hashed_bytes != total_bytes {
        return Err(ServerError::IntegrityError(anyhow!(
            "chunked {} bytes of a {}-byte stream",
            total_bytes,
            hashed_bytes
        )));
    }

    let index =
        ChunkIndex::new(params, entries).map_err(ServerError::integrity_error)?;

    indices.put_index(namespace, name, &index).await?;

    Ok(IngestOutcome {
        index,
        artifact_hash,
        new_chunks,
        total_bytes,
    })
}

/// Tees a source into any number of sinks while streaming it onward.
///
/// Every slice read from `source` is sent to each sink before it is
/// yielded. On clean EOF each sink receives [`Frame::End`]; if the
/// returned stream is dropped early the senders are dropped without it,
/// and the sinks know the copy is truncated.
pub fn tee_stream<R>(
    source: R,
    sinks: Vec<mpsc::Sender<Frame>>,
    stall: Duration,
) -> impl Stream<Item = io::Result<Bytes>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream! {
        let mut source = source;
        let mut sinks: Vec<Option<mpsc::Sender<Frame>>> =
            sinks.into_iter().map(Some).collect();

        loop {
            let data = match read_chunk_async(&mut source, BytesMut::with_capacity(IO_CHUNK_SIZE)).await {
                Ok(data) => data,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            if data.is_empty() {
                break;
            }

            for slot in sinks.iter_mut() {
                if let Some(sink) = slot {
                    if let Err(e) = sink.send_timeout(Frame::Data(data.clone()), stall).await {
                        tracing::warn!("Dropping stalled ingest sink: {}", e);
                        *slot = None;
                    }
                }
            }

            yield Ok(data);
        }

        for slot in sinks.iter_mut() {
            if let Some(sink) = slot.take() {
                let _ = sink.send_timeout(Frame::End, stall).await;
            }
        }
    }
}

/// The reading end of an ingest sink.
///
/// Yields the teed bytes until [`Frame::End`]. A channel that closes
/// without the end marker aborts the sink with an error, so a client
/// disconnect mid-stream never produces a truncated index.
pub fn sink_reader(mut rx: mpsc::Receiver<Frame>) -> impl AsyncRead + Send + Unpin {
    let frames = stream! {
        loop {
            match rx.recv().await {
                Some(Frame::Data(data)) => yield Ok(data),
                Some(Frame::End) => return,
                None => {
                    yield Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "source stream ended before completion",
                    ));
                    return;
                }
            }
        }
    };

    StreamReader::new(Box::pin(frames))
}

/// Spawns an ingest job consuming one tee sink.
///
/// Failures are logged and counted; they never propagate to the
/// response that fed the sink.
#[allow(clippy::too_many_arguments)]
pub fn spawn_sink_ingest(
    chunks: Arc<dyn ChunkStore>,
    indices: Arc<dyn IndexStore>,
    namespace: Namespace,
    name: String,
    rx: mpsc::Receiver<Frame>,
    params: ChunkerParams,
    metrics: Arc<Metrics>,
    tier: &'static str,
) -> JoinHandle<()> {
    tokio::task::spawn(async move {
        let reader = sink_reader(rx);

        match ingest_reader(chunks, indices, &namespace, &name, reader, params, &metrics).await {
            Ok(outcome) => {
                tracing::debug!(
                    "Ingested {} ({}) into {} tier: {} chunks ({} new)",
                    name,
                    outcome.artifact_hash.to_typed_base32(),
                    tier,
                    outcome.index.entries.len(),
                    outcome.new_chunks,
                );
            }
            Err(e) => {
                metrics.ingest_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Ingest of {} into {} tier failed: {}", name, tier, e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    use granary::testing::fake_data;

    use crate::assembler::assemble_bytes;
    use crate::store::MemoryStore;

    fn params() -> ChunkerParams {
        ChunkerParams::new(1024, 4096, 16384).unwrap()
    }

    fn testing_ns() -> Namespace {
        "testing".parse().unwrap()
    }

    #[tokio::test]
    async fn test_ingest_and_reassemble() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Metrics::new();
        let data = fake_data(100 * 1024);

        let outcome = ingest_reader(
            store.clone(),
            store.clone(),
            &testing_ns(),
            "nar/test.nar",
            Cursor::new(data.clone()),
            params(),
            &metrics,
        )
        .await
        .unwrap();

        assert_eq!(data.len() as u64, outcome.total_bytes);
        assert_eq!(data.len() as u64, outcome.index.length);
        assert_eq!(ContentHash::digest(&data), outcome.artifact_hash);
        assert!(outcome.new_chunks > 0);

        let index = store
            .get_index(&testing_ns(), "nar/test.nar")
            .await
            .unwrap()
            .unwrap();
        let assembled = assemble_bytes(store, index).await.unwrap();
        assert_eq!(data, assembled);
    }

    #[tokio::test]
    async fn test_second_ingest_is_fully_deduplicated() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Metrics::new();
        let data = fake_data(64 * 1024);

        ingest_reader(
            store.clone(),
            store.clone(),
            &testing_ns(),
            "nar/a.nar",
            Cursor::new(data.clone()),
            params(),
            &metrics,
        )
        .await
        .unwrap();

        let before = store.chunk_count();

        let outcome = ingest_reader(
            store.clone(),
            store.clone(),
            &testing_ns(),
            "nar/b.nar",
            Cursor::new(data),
            params(),
            &metrics,
        )
        .await
        .unwrap();

        assert_eq!(0, outcome.new_chunks);
        assert_eq!(before, store.chunk_count());
    }

    #[tokio::test]
    async fn test_empty_input_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Metrics::new();

        let result = ingest_reader(
            store.clone(),
            store,
            &testing_ns(),
            "nar/empty.nar",
            Cursor::new(Vec::new()),
            params(),
            &metrics,
        )
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_tee_feeds_client_and_sinks() {
        let data = fake_data(300 * 1024);

        let (tx_a, rx_a) = mpsc::channel(1);
        let (tx_b, rx_b) = mpsc::channel(1);

        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new());

        let job_a = spawn_sink_ingest(
            store.clone(),
            store.clone(),
            testing_ns(),
            "nar/a.nar".to_string(),
            rx_a,
            params(),
            metrics.clone(),
            "local",
        );
        let job_b = spawn_sink_ingest(
            store.clone(),
            store.clone(),
            testing_ns(),
            "nar/b.nar".to_string(),
            rx_b,
            params(),
            metrics.clone(),
            "object",
        );

        let tee = tee_stream(
            Cursor::new(data.clone()),
            vec![tx_a, tx_b],
            Duration::from_secs(5),
        );

        // the "client"
        let mut seen = Vec::new();
        let mut tee = Box::pin(tee);
        while let Some(piece) = tee.next().await {
            seen.extend_from_slice(&piece.unwrap());
        }
        drop(tee);

        job_a.await.unwrap();
        job_b.await.unwrap();

        assert_eq!(data, seen);

        // both sinks saw the identical byte stream
        for name in ["nar/a.nar", "nar/b.nar"] {
            let index = store
                .get_index(&testing_ns(), name)
                .await
                .unwrap()
                .unwrap();
            let assembled = assemble_bytes(store.clone(), index).await.unwrap();
            assert_eq!(data, assembled);
        }
    }

    #[tokio::test]
    async fn test_aborted_tee_does_not_write_an_index() {
        let data = fake_data(300 * 1024);

        let (tx, rx) = mpsc::channel(1);
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new());

        let job = spawn_sink_ingest(
            store.clone(),
            store.clone(),
            testing_ns(),
            "nar/partial.nar".to_string(),
            rx,
            params(),
            metrics.clone(),
            "local",
        );

        let mut tee = Box::pin(tee_stream(
            Cursor::new(data),
            vec![tx],
            Duration::from_secs(5),
        ));

        // the client goes away after the first slice
        let _ = tee.next().await;
        drop(tee);

        job.await.unwrap();

        assert!(store
            .get_index(&testing_ns(), "nar/partial.nar")
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            1,
            metrics.ingest_failures.load(Ordering::Relaxed)
        );
    }

    #[tokio::test]
    async fn test_stalled_sink_is_dropped() {
        let data = fake_data(512 * 1024);

        // a sink that never reads
        let (tx, _rx) = mpsc::channel(1);
        let rx_guard = _rx; // keep the receiver alive without draining it

        let mut tee = Box::pin(tee_stream(
            Cursor::new(data.clone()),
            vec![tx],
            Duration::from_millis(50),
        ));

        let mut seen = Vec::new();
        while let Some(piece) = tee.next().await {
            seen.extend_from_slice(&piece.unwrap());
        }

        assert_eq!(data, seen);
        drop(rx_guard);
    }
}
