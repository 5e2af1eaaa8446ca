//! Content-defined chunking.
//!
//! We split uncompressed artifacts with the FastCDC algorithm. The
//! boundaries depend only on the input bytes and the configured size
//! bounds, so re-ingesting the same artifact always reproduces the
//! same chunks.

use std::io;

use async_stream::try_stream;
use bytes::{BufMut, Bytes, BytesMut};
use fastcdc::ronomon::FastCDC;
use futures::stream::Stream;
use tokio::io::AsyncRead;

use crate::error::{GranaryError, GranaryResult};
use crate::stream::read_chunk_async;

/// The smallest permissible minimum chunk size.
pub const HARD_MIN_CHUNK_SIZE: usize = 48;

/// Size bounds for the content-defined splitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerParams {
    pub min_size: usize,
    pub avg_size: usize,
    pub max_size: usize,
}

/// A chunk cut from a byte stream.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Offset of the first byte of this chunk within the source stream.
    pub offset: u64,

    /// The chunk payload.
    pub data: Bytes,
}

impl ChunkerParams {
    /// Validates and creates a set of chunker parameters.
    pub fn new(min_size: usize, avg_size: usize, max_size: usize) -> GranaryResult<Self> {
        if min_size < HARD_MIN_CHUNK_SIZE {
            return Err(GranaryError::InvalidChunkerParams {
                reason: "Minimum chunk size is too small",
            });
        }

        if !(min_size < avg_size && avg_size < max_size) {
            return Err(GranaryError::InvalidChunkerParams {
                reason: "Chunk sizes must satisfy min < avg < max",
            });
        }

        Ok(Self {
            min_size,
            avg_size,
            max_size,
        })
    }
}

/// Splits a stream into content-defined chunks.
///
/// This is a wrapper over fastcdc-rs that takes an `AsyncRead` and
/// returns a `Stream` of [`Chunk`]s carrying their absolute offsets.
/// The stream ends after the final residual chunk; inputs shorter than
/// `min_size` produce a single chunk.
pub fn chunk_stream<R>(
    mut stream: R,
    params: ChunkerParams,
) -> impl Stream<Item = io::Result<Chunk>>
where
    R: AsyncRead + Unpin + Send,
{
    let ChunkerParams {
        min_size,
        avg_size,
        max_size,
    } = params;

    let s = try_stream! {
        let mut buf = BytesMut::with_capacity(max_size);
        let mut offset = 0u64;

        loop {
            let read = read_chunk_async(&mut stream, buf).await?;

            let mut eof = false;
            if read.is_empty() {
                // Already EOF
                break;
            } else if read.len() < max_size {
                // Last read
                eof = true;
            }

            let chunks = FastCDC::with_eof(&read, min_size, avg_size, max_size, eof);
            let mut consumed = 0;

            for chunk in chunks {
                consumed += chunk.length;

                let data = read.slice(chunk.offset..chunk.offset + chunk.length);
                let cut = Chunk { offset, data };
                offset += chunk.length as u64;

                yield cut;
            }

            if eof {
                break;
            }

            buf = BytesMut::with_capacity(max_size);

            if consumed < read.len() {
                // remaining bytes for the next read
                buf.put_slice(&read[consumed..]);
            }
        }
    };

    Box::pin(s)
}
