//! Stream utilities.

use std::marker::Unpin;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::OnceCell;

use crate::hash::ContentHash;

/// Stream filter that digests every byte passing through it.
///
/// The digest and byte count are published to the shared cell once the
/// stream reaches EOF; until then the cell is empty. The ingest
/// pipeline runs artifacts through this to cross-check the chunker
/// against the source stream.
pub struct StreamHasher<R> {
    inner: R,
    hasher: Option<Sha256>,
    bytes_read: u64,
    finalized: Arc<OnceCell<(ContentHash, u64)>>,
}

impl<R: AsyncRead + Unpin> StreamHasher<R> {
    pub fn new(inner: R) -> (Self, Arc<OnceCell<(ContentHash, u64)>>) {
        let finalized = Arc::new(OnceCell::new());

        (
            Self {
                inner,
                hasher: Some(Sha256::new()),
                bytes_read: 0,
                finalized: finalized.clone(),
            },
            finalized,
        )
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for StreamHasher<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<tokio::io::Result<()>> {
        let old_filled = buf.filled().len();
        let r = Pin::new(&mut self.inner).poll_read(cx, buf);
        let read_len = buf.filled().len() - old_filled;

        match r {
            Poll::Ready(Ok(())) => {
                if read_len == 0 {
                    // EOF, the digest is final
                    if let Some(hasher) = self.hasher.take() {
                        let digest = ContentHash::from(<[u8; 32]>::from(hasher.finalize()));
                        let bytes_read = self.bytes_read;

                        self.finalized
                            .set((digest, bytes_read))
                            .expect("digest has already been finalized");
                    }
                } else {
                    let hasher = self.hasher.as_mut().expect("stream has data after EOF");

                    let filled = buf.filled();
                    hasher.update(&filled[filled.len() - read_len..]);
                    self.bytes_read += read_len as u64;
                }
            }
            Poll::Ready(Err(_)) => {
                assert!(read_len == 0);
            }
            Poll::Pending => {}
        }

        r
    }
}

/// Greedily reads from a stream to fill a buffer.
pub async fn read_chunk_async<S: AsyncRead + Unpin + Send>(
    stream: &mut S,
    mut chunk: BytesMut,
) -> std::io::Result<Bytes> {
    while chunk.len() < chunk.capacity() {
        let read = stream.read_buf(&mut chunk).await?;

        if read == 0 {
            break;
        }
    }

    Ok(chunk.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncReadExt;
    use tokio_test::block_on;

    #[test]
    fn test_stream_hasher() {
        let expected = b"hello world";

        let (mut read, finalized) = StreamHasher::new(expected.as_slice());
        assert!(finalized.get().is_none());

        // force multiple reads
        let mut buf = vec![0u8; 100];
        let mut bytes_read = 0;
        bytes_read += block_on(read.read(&mut buf[bytes_read..bytes_read + 5])).unwrap();
        bytes_read += block_on(read.read(&mut buf[bytes_read..bytes_read + 5])).unwrap();
        bytes_read += block_on(read.read(&mut buf[bytes_read..bytes_read + 5])).unwrap();
        bytes_read += block_on(read.read(&mut buf[bytes_read..bytes_read + 5])).unwrap();

        assert_eq!(expected.len(), bytes_read);
        assert_eq!(expected, &buf[..bytes_read]);

        let (digest, count) = finalized.get().expect("digest wasn't finalized");

        assert_eq!(ContentHash::digest(expected), *digest);
        assert_eq!(expected.len() as u64, *count);
    }

    #[test]
    fn test_read_chunk_async() {
        block_on(async {
            let data = crate::testing::fake_data(100);
            let mut cursor = std::io::Cursor::new(&data);

            let filled = read_chunk_async(&mut cursor, BytesMut::with_capacity(64))
                .await
                .unwrap();
            assert_eq!(&data[..64], &filled[..]);

            let rest = read_chunk_async(&mut cursor, BytesMut::with_capacity(64))
                .await
                .unwrap();
            assert_eq!(&data[64..], &rest[..]);

            let eof = read_chunk_async(&mut cursor, BytesMut::with_capacity(64))
                .await
                .unwrap();
            assert!(eof.is_empty());
        });
    }
}
