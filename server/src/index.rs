//! Chunk index files.
//!
//! An index maps one logical artifact (`{hash}.narinfo`, `nar/{hash}.nar`)
//! to the ordered chunks reconstructing it. The on-disk format is a
//! little-endian header followed by fixed-size entries:
//!
//! ```text
//! magic     u64    "grnryidx"
//! flags     u64    feature flags, currently 0
//! min       u64    chunker minimum size
//! avg       u64    chunker average size
//! max       u64    chunker maximum size
//! length    u64    total uncompressed length
//! count     u64    number of entries
//! entries   count × { offset u64, size u64, digest [u8; 32] }
//! ```
//!
//! Entries are contiguous: the first offset is 0, each offset is the
//! sum of everything before it, and the sizes add up to `length`.
//! Indices are never mutated; they are replaced atomically by the
//! index store.

use std::error::Error as StdError;

use displaydoc::Display;

use granary::chunking::ChunkerParams;
use granary::hash::ContentHash;

/// The index file magic.
pub const INDEX_MAGIC: u64 = u64::from_le_bytes(*b"grnryidx");

/// Size of the fixed header, in bytes.
const HEADER_SIZE: usize = 7 * 8;

/// Size of one entry, in bytes.
const ENTRY_SIZE: usize = 8 + 8 + 32;

/// An index of the chunks making up one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkIndex {
    /// Feature flags. Currently always 0.
    pub flags: u64,

    /// The chunker bounds the artifact was split with.
    pub min_size: u64,
    pub avg_size: u64,
    pub max_size: u64,

    /// Total uncompressed length of the artifact.
    pub length: u64,

    /// The chunk list, in artifact order.
    pub entries: Vec<IndexEntry>,
}

/// One chunk of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Offset of the first byte within the artifact.
    pub offset: u64,

    /// Size of the chunk in bytes.
    pub size: u64,

    /// Digest of the raw chunk bytes.
    pub digest: ContentHash,
}

/// An index format error.
#[derive(Debug, Display)]
pub enum Error {
    /// Index is truncated.
    Truncated,

    /// Bad index magic.
    BadMagic,

    /// Trailing bytes after the last entry.
    TrailingBytes,

    /// Inconsistent index: {0}
    Inconsistent(&'static str),
}

impl StdError for Error {}

impl ChunkIndex {
    /// Creates an index from an ordered chunk list.
    ///
    /// The entries must already be contiguous; this is validated.
    pub fn new(params: ChunkerParams, entries: Vec<IndexEntry>) -> Result<Self, Error> {
        let length = entries.iter().map(|e| e.size).sum();

        let index = Self {
            flags: 0,
            min_size: params.min_size as u64,
            avg_size: params.avg_size as u64,
            max_size: params.max_size as u64,
            length,
            entries,
        };

        index.validate()?;

        Ok(index)
    }

    /// Checks the structural invariants.
    pub fn validate(&self) -> Result<(), Error> {
        let mut expected_offset = 0u64;

        for entry in &self.entries {
            if entry.offset != expected_offset {
                return Err(Error::Inconsistent("entry offsets are not contiguous"));
            }

            expected_offset = expected_offset
                .checked_add(entry.size)
                .ok_or(Error::Inconsistent("entry sizes overflow"))?;
        }

        if expected_offset != self.length {
            return Err(Error::Inconsistent("entry sizes do not add up to length"));
        }

        Ok(())
    }

    /// Iterates over the digests referenced by this index.
    pub fn digests(&self) -> impl Iterator<Item = &ContentHash> {
        self.entries.iter().map(|e| &e.digest)
    }

    /// Serializes the index.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.entries.len() * ENTRY_SIZE);

        out.extend_from_slice(&INDEX_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.min_size.to_le_bytes());
        out.extend_from_slice(&self.avg_size.to_le_bytes());
        out.extend_from_slice(&self.max_size.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u64).to_le_bytes());

        for entry in &self.entries {
            out.extend_from_slice(&entry.offset.to_le_bytes());
            out.extend_from_slice(&entry.size.to_le_bytes());
            out.extend_from_slice(entry.digest.as_bytes());
        }

        out
    }

    /// Deserializes and validates an index.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut cursor = Cursor { bytes, pos: 0 };

        if cursor.u64()? != INDEX_MAGIC {
            return Err(Error::BadMagic);
        }

        let flags = cursor.u64()?;
        let min_size = cursor.u64()?;
        let avg_size = cursor.u64()?;
        let max_size = cursor.u64()?;
        let length = cursor.u64()?;
        let count = cursor.u64()?;

        if count as usize > bytes.len() / ENTRY_SIZE + 1 {
            // blatantly wrong count, don't even try to allocate
            return Err(Error::Truncated);
        }

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let offset = cursor.u64()?;
            let size = cursor.u64()?;
            let digest = ContentHash::from(cursor.digest()?);

            entries.push(IndexEntry {
                offset,
                size,
                digest,
            });
        }

        if cursor.pos != bytes.len() {
            return Err(Error::TrailingBytes);
        }

        let index = Self {
            flags,
            min_size,
            avg_size,
            max_size,
            length,
            entries,
        };

        index.validate()?;

        Ok(index)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn u64(&mut self) -> Result<u64, Error> {
        let end = self.pos.checked_add(8).ok_or(Error::Truncated)?;
        let slice = self.bytes.get(self.pos..end).ok_or(Error::Truncated)?;
        self.pos = end;
        Ok(u64::from_le_bytes(slice.try_into().unwrap()))
    }

    fn digest(&mut self) -> Result<[u8; 32], Error> {
        let end = self.pos.checked_add(32).ok_or(Error::Truncated)?;
        let slice = self.bytes.get(self.pos..end).ok_or(Error::Truncated)?;
        self.pos = end;
        Ok(slice.try_into().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ChunkerParams {
        ChunkerParams::new(64, 128, 256).unwrap()
    }

    fn sample() -> ChunkIndex {
        let entries = vec![
            IndexEntry {
                offset: 0,
                size: 100,
                digest: ContentHash::digest(b"first"),
            },
            IndexEntry {
                offset: 100,
                size: 50,
                digest: ContentHash::digest(b"second"),
            },
            IndexEntry {
                offset: 150,
                size: 1,
                digest: ContentHash::digest(b"third"),
            },
        ];

        ChunkIndex::new(params(), entries).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let index = sample();
        assert_eq!(151, index.length);

        let bytes = index.to_bytes();
        let back = ChunkIndex::from_bytes(&bytes).unwrap();

        assert_eq!(index, back);
    }

    #[test]
    fn test_empty_round_trip() {
        let index = ChunkIndex::new(params(), Vec::new()).unwrap();
        assert_eq!(0, index.length);

        let back = ChunkIndex::from_bytes(&index.to_bytes()).unwrap();
        assert_eq!(index, back);
        assert!(back.entries.is_empty());
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample().to_bytes();
        bytes[0] ^= 0xff;

        assert!(matches!(
            ChunkIndex::from_bytes(&bytes),
            Err(Error::BadMagic)
        ));
    }

    #[test]
    fn test_truncated() {
        let bytes = sample().to_bytes();

        assert!(matches!(
            ChunkIndex::from_bytes(&bytes[..bytes.len() - 1]),
            Err(Error::Truncated)
        ));

        assert!(matches!(
            ChunkIndex::from_bytes(&bytes[..10]),
            Err(Error::Truncated)
        ));
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = sample().to_bytes();
        bytes.push(0);

        assert!(matches!(
            ChunkIndex::from_bytes(&bytes),
            Err(Error::TrailingBytes)
        ));
    }

    #[test]
    fn test_inconsistent_entries() {
        let mut index = sample();
        index.entries[1].offset += 1;

        assert!(index.validate().is_err());

        // the serialized form is rejected too
        let bytes = index.to_bytes();
        assert!(matches!(
            ChunkIndex::from_bytes(&bytes),
            Err(Error::Inconsistent(_))
        ));
    }

    #[test]
    fn test_new_rejects_gaps() {
        let entries = vec![
            IndexEntry {
                offset: 0,
                size: 10,
                digest: ContentHash::digest(b"a"),
            },
            IndexEntry {
                offset: 20,
                size: 10,
                digest: ContentHash::digest(b"b"),
            },
        ];

        assert!(ChunkIndex::new(params(), entries).is_err());
    }
}
