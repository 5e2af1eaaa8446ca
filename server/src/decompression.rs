//! Streaming decompression across multiple algorithms.
//!
//! Upstream caches serve NARs in whatever compression they prefer; the
//! proxy always chunks and stores the uncompressed form. The format is
//! chosen from the file extension of the URL that won the fan-out (or
//! of a PUT request path). lzip is recognized but deliberately not
//! supported.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use async_compression::tokio::bufread::{
    BrotliDecoder, BzDecoder, Lz4Decoder, XzDecoder, ZstdDecoder,
};
use pin_project::pin_project;
use tokio::io::{AsyncBufRead, AsyncRead, BufReader, ReadBuf};

use crate::error::{ServerError, ServerResult};

/// Compression formats understood on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    None,
    Xz,
    Bzip2,
    Zstd,
    Brotli,
    Lz4,
}

impl CompressionFormat {
    /// Chooses a format from the extension trailing `.nar`.
    ///
    /// An empty extension means no compression.
    pub fn from_extension(ext: &str) -> ServerResult<Self> {
        match ext {
            "" => Ok(Self::None),
            "xz" => Ok(Self::Xz),
            "bz2" | "bzip2" => Ok(Self::Bzip2),
            "zst" | "zstd" => Ok(Self::Zstd),
            "br" => Ok(Self::Brotli),
            "lz4" => Ok(Self::Lz4),
            "lz" | "lzip" => Err(ServerError::UnsupportedCompressionType {
                name: ext.to_string(),
            }),
            _ => Err(ServerError::InvalidCompressionType {
                name: ext.to_string(),
            }),
        }
    }

    /// Chooses a format from the path of a NAR URL.
    pub fn from_nar_path(path: &str) -> ServerResult<Self> {
        match path.rsplit_once(".nar") {
            Some((_, "")) => Ok(Self::None),
            Some((_, ext)) => Self::from_extension(ext.strip_prefix('.').unwrap_or(ext)),
            None => Err(ServerError::InvalidCompressionType {
                name: path.to_string(),
            }),
        }
    }

    /// The extension suffix appended to `.nar`, e.g. `".xz"`.
    pub fn nar_suffix(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Xz => ".xz",
            Self::Bzip2 => ".bz2",
            Self::Zstd => ".zst",
            Self::Brotli => ".br",
            Self::Lz4 => ".lz4",
        }
    }
}

/// A streaming multi-codec decompressor.
#[pin_project(project = DecompressorProj)]
pub enum Decompressor<S: AsyncBufRead> {
    /// No decompression
    None(#[pin] S),
    /// XZ decompression
    Xz(#[pin] XzDecoder<S>),
    /// bzip2 decompression
    Bzip2(#[pin] BzDecoder<S>),
    /// Zstd decompression
    Zstd(#[pin] ZstdDecoder<S>),
    /// Brotli decompression
    Brotli(#[pin] BrotliDecoder<S>),
    /// LZ4 decompression
    Lz4(#[pin] Lz4Decoder<S>),
}

impl<S: AsyncBufRead> Decompressor<S> {
    /// Creates a new streaming decompressor from a buffered stream.
    pub fn new(inner: S, format: CompressionFormat) -> Self {
        match format {
            CompressionFormat::None => Self::None(inner),
            CompressionFormat::Xz => Self::Xz(XzDecoder::new(inner)),
            CompressionFormat::Bzip2 => Self::Bzip2(BzDecoder::new(inner)),
            CompressionFormat::Zstd => Self::Zstd(ZstdDecoder::new(inner)),
            CompressionFormat::Brotli => Self::Brotli(BrotliDecoder::new(inner)),
            CompressionFormat::Lz4 => Self::Lz4(Lz4Decoder::new(inner)),
        }
    }
}

impl<U: AsyncRead> Decompressor<BufReader<U>> {
    /// Creates a new streaming decompressor from an unbuffered stream.
    pub fn new_unbuffered(inner: U, format: CompressionFormat) -> Self {
        Self::new(BufReader::new(inner), format)
    }
}

impl<S: AsyncBufRead> AsyncRead for Decompressor<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            DecompressorProj::None(i) => i.poll_read(cx, buf),
            DecompressorProj::Xz(i) => i.poll_read(cx, buf),
            DecompressorProj::Bzip2(i) => i.poll_read(cx, buf),
            DecompressorProj::Zstd(i) => i.poll_read(cx, buf),
            DecompressorProj::Brotli(i) => i.poll_read(cx, buf),
            DecompressorProj::Lz4(i) => i.poll_read(cx, buf),
        }
    }
}
