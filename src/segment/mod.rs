//! Immutable, time-bucketed segment files.
//!
//! A segment holds a sorted run of `(InternalKey, value)` entries that all
//! fall into one bucket of one level. Segments are written once by
//! [`SegmentWriter`] and never modified; they disappear only when a level
//! retires their bucket.
//!
//! # On-disk layout
//!
//! ```text
//! [HEAD (44 B)]
//! [ENTRY][ENTRY]...                       entry = code u32 | time u64 | value_len u32 | value
//! [INDEX_LEN_LE][INDEX_BYTES][INDEX_CRC32_LE]   index = Vec<u64> of entry offsets
//! [BLOOM_LEN_LE][BLOOM_BYTES][BLOOM_CRC32_LE]
//! [FOOTER (36 B)]
//! ```
//!
//! - **Head**: magic `TSG0`, version, smallest and largest key, entry
//!   count and a CRC32 computed with the CRC field zeroed. It has a fixed
//!   size so recovery can rebuild a [`FileMeta`] by reading it alone.
//! - **Index**: offsets of every entry, in key order, for binary search.
//! - **Bloom**: filter over [`InternalKey::to_bytes`] for point lookups.
//! - **Footer**: handles of the index and bloom blocks plus a CRC32.
//!
//! # File names
//!
//! `<bucket>-<fileNumber>.<level>-dat`, see [`segment_file_name`] and
//! [`SegmentName::parse`].

pub mod builder;
pub mod cursor;
pub mod storage;


pub use builder::SegmentWriter;
pub use cursor::SegmentCursor;
pub use storage::{FileStorage, MmapStorage, Storage};

use std::cmp::Ordering;
use std::io;
use std::path::{Path, PathBuf};

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use thiserror::Error;

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::key::{Entry, INTERNAL_KEY_SIZE, InternalKey, KeyComparator};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

pub(crate) const SEG_HEAD_MAGIC: [u8; 4] = *b"TSG0";
pub(crate) const SEG_VERSION: u32 = 1;

/// Size of the fixed segment head.
pub const HEAD_SIZE: usize = 44;

pub(crate) const FOOTER_SIZE: usize = 36;
pub(crate) const BLOCK_LEN_SIZE: usize = 4;
pub(crate) const BLOCK_CHECKSUM_SIZE: usize = 4;
pub(crate) const ENTRY_HEADER_SIZE: usize = INTERNAL_KEY_SIZE + 4;
pub(crate) const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Suffix shared by every segment file name.
pub const SEGMENT_SUFFIX: &str = "-dat";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by segment reads and writes.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A head, footer or block failed its CRC check.
    #[error("Checksum mismatch in {0}")]
    ChecksumMismatch(&'static str),

    /// Structurally invalid file.
    #[error("Corrupt segment: {0}")]
    Corrupt(String),

    /// Writer input was empty or not sorted.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Head
// ------------------------------------------------------------------------------------------------

/// Fixed-size segment prefix carrying the key bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    magic: [u8; 4],
    version: u32,
    /// Smallest key in the segment (inclusive).
    pub smallest: InternalKey,
    /// Largest key in the segment (inclusive).
    pub largest: InternalKey,
    /// Number of entries in the segment.
    pub entry_count: u64,
    head_crc: u32,
}

impl Head {
    /// Builds a head for the given bounds.
    pub fn new(smallest: InternalKey, largest: InternalKey, entry_count: u64) -> Self {
        Self {
            magic: SEG_HEAD_MAGIC,
            version: SEG_VERSION,
            smallest,
            largest,
            entry_count,
            head_crc: 0,
        }
    }

    /// Returns the head with its CRC filled in, as it is stored on disk.
    pub fn sealed(&self) -> Result<Self, SegmentError> {
        let zeroed = Self {
            head_crc: 0,
            ..self.clone()
        };
        let bytes = encoding::encode_to_vec(&zeroed)?;
        Ok(Self {
            head_crc: crc32(&bytes),
            ..zeroed
        })
    }

    /// Encodes the head with its CRC filled in.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SegmentError> {
        Ok(encoding::encode_to_vec(&self.sealed()?)?)
    }

    /// Decodes and verifies a head from the first [`HEAD_SIZE`] bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, SegmentError> {
        let (head, _) = Head::decode_from(buf)?;
        if head.magic != SEG_HEAD_MAGIC {
            return Err(SegmentError::Corrupt(format!(
                "bad magic {:?}",
                head.magic
            )));
        }
        if head.version != SEG_VERSION {
            return Err(SegmentError::Corrupt(format!(
                "unsupported version {}",
                head.version
            )));
        }
        let zeroed = Self {
            head_crc: 0,
            ..head.clone()
        };
        if crc32(&encoding::encode_to_vec(&zeroed)?) != head.head_crc {
            return Err(SegmentError::ChecksumMismatch("head"));
        }
        Ok(head)
    }

    /// Reads the head of a segment without touching the rest of it.
    pub fn read_from(storage: &dyn Storage) -> Result<Self, SegmentError> {
        if storage.len() < HEAD_SIZE as u64 {
            return Err(SegmentError::Corrupt(format!(
                "file of {} bytes is shorter than the head",
                storage.len()
            )));
        }
        let mut buf = [0u8; HEAD_SIZE];
        storage.read_at(0, &mut buf)?;
        Self::from_bytes(&buf)
    }
}

impl Encode for Head {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.smallest.encode_to(buf)?;
        self.largest.encode_to(buf)?;
        self.entry_count.encode_to(buf)?;
        self.head_crc.encode_to(buf)
    }
}

impl Decode for Head {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&buf[off..])?;
        off += n;
        let (version, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (smallest, n) = InternalKey::decode_from(&buf[off..])?;
        off += n;
        let (largest, n) = InternalKey::decode_from(&buf[off..])?;
        off += n;
        let (entry_count, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (head_crc, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                magic,
                version,
                smallest,
                largest,
                entry_count,
                head_crc,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Block handles and footer
// ------------------------------------------------------------------------------------------------

/// Location of a checksummed block: offset of its length prefix and its total size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockHandle {
    pub(crate) offset: u64,
    pub(crate) size: u64,
}

impl Encode for BlockHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.size.encode_to(buf)
    }
}

impl Decode for BlockHandle {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (offset, n) = u64::decode_from(buf)?;
        let (size, m) = u64::decode_from(&buf[n..])?;
        Ok((Self { offset, size }, n + m))
    }
}

/// Trailer locating the index and bloom blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Footer {
    pub(crate) index: BlockHandle,
    pub(crate) bloom: BlockHandle,
    pub(crate) footer_crc: u32,
}

impl Footer {
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>, SegmentError> {
        let zeroed = Self {
            footer_crc: 0,
            ..self.clone()
        };
        let crc = crc32(&encoding::encode_to_vec(&zeroed)?);
        Ok(encoding::encode_to_vec(&Self {
            footer_crc: crc,
            ..zeroed
        })?)
    }

    fn from_bytes(buf: &[u8]) -> Result<Self, SegmentError> {
        let (footer, _) = Footer::decode_from(buf)?;
        let zeroed = Self {
            footer_crc: 0,
            ..footer.clone()
        };
        if crc32(&encoding::encode_to_vec(&zeroed)?) != footer.footer_crc {
            return Err(SegmentError::ChecksumMismatch("footer"));
        }
        Ok(footer)
    }
}

impl Encode for Footer {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.index.encode_to(buf)?;
        self.bloom.encode_to(buf)?;
        self.footer_crc.encode_to(buf)
    }
}

impl Decode for Footer {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (index, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        let (bloom, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        let (footer_crc, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                index,
                bloom,
                footer_crc,
            },
            off,
        ))
    }
}

pub(crate) fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    hasher.finalize()
}

/// Reads `[len][data][crc]` at `handle` and returns `data` after verifying it.
fn read_block(
    storage: &dyn Storage,
    handle: BlockHandle,
    what: &'static str,
) -> Result<Vec<u8>, SegmentError> {
    let overhead = (BLOCK_LEN_SIZE + BLOCK_CHECKSUM_SIZE) as u64;
    let end = handle.offset.checked_add(handle.size);
    if handle.size < overhead || end.is_none_or(|end| end > storage.len()) {
        return Err(SegmentError::Corrupt(format!(
            "{what} block {handle:?} out of bounds"
        )));
    }

    let mut raw = vec![0u8; handle.size as usize];
    storage.read_at(handle.offset, &mut raw)?;

    let (len, _) = u32::decode_from(&raw)?;
    if u64::from(len) + overhead != handle.size {
        return Err(SegmentError::Corrupt(format!(
            "{what} block length {len} disagrees with handle {handle:?}"
        )));
    }
    let data_end = BLOCK_LEN_SIZE + len as usize;
    let (stored, _) = u32::decode_from(&raw[data_end..])?;
    if crc32(&raw[BLOCK_LEN_SIZE..data_end]) != stored {
        return Err(SegmentError::ChecksumMismatch(what));
    }
    raw.truncate(data_end);
    raw.drain(..BLOCK_LEN_SIZE);
    Ok(raw)
}

// ------------------------------------------------------------------------------------------------
// FileMeta
// ------------------------------------------------------------------------------------------------

/// Catalog descriptor of one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    /// Process-unique, monotonic, never reused.
    pub file_number: u64,
    /// Location of the segment file.
    pub path: PathBuf,
    /// Smallest key in the segment (inclusive).
    pub smallest: InternalKey,
    /// Largest key in the segment (inclusive).
    pub largest: InternalKey,
}

impl FileMeta {
    /// Rebuilds a descriptor from a recovered head.
    pub fn from_head(file_number: u64, path: impl Into<PathBuf>, head: &Head) -> Self {
        Self {
            file_number,
            path: path.into(),
            smallest: head.smallest,
            largest: head.largest,
        }
    }

    /// Whether `key` lies within `[smallest, largest]`.
    pub fn contains(&self, key: &InternalKey, cmp: &dyn KeyComparator) -> bool {
        cmp.compare(key, &self.smallest) != Ordering::Less
            && cmp.compare(key, &self.largest) != Ordering::Greater
    }
}

// ------------------------------------------------------------------------------------------------
// File names
// ------------------------------------------------------------------------------------------------

/// Builds `<time>-<fileNumber>.<level>-dat`.
pub fn segment_file_name(time: u64, file_number: u64, level: usize) -> String {
    format!("{time}-{file_number}.{level}{SEGMENT_SUFFIX}")
}

/// Fields encoded in a segment file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentName {
    /// Bucket start (or creation time) the file was written for.
    pub time: u64,
    /// File number assigned at write time.
    pub file_number: u64,
    /// Level the file belongs to.
    pub level: usize,
}

impl SegmentName {
    /// Parses a file name of the form `<time>-<fileNumber>.<level>-dat`.
    ///
    /// Returns `None` for anything else, including names that merely end in
    /// `-dat` but carry non-numeric fields.
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(SEGMENT_SUFFIX)?;
        let (time, rest) = stem.split_once('-')?;
        let (file_number, level) = rest.split_once('.')?;
        Some(Self {
            time: time.parse().ok()?,
            file_number: file_number.parse().ok()?,
            level: level.parse().ok()?,
        })
    }

    /// Whether `path` looks like a segment of any level.
    pub fn is_segment_path(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(SEGMENT_SUFFIX))
    }
}

// ------------------------------------------------------------------------------------------------
// Segment reader
// ------------------------------------------------------------------------------------------------

/// An opened, verified segment.
///
/// The head, index and bloom filter are loaded eagerly; entries are read
/// from `storage` on demand.
pub struct Segment<S: Storage> {
    storage: S,
    head: Head,
    index: Vec<u64>,
    bloom: Vec<u8>,
    data_end: u64,
}

impl<S: Storage> Segment<S> {
    /// Verifies head and footer and loads the index and bloom blocks.
    pub fn open(storage: S) -> Result<Self, SegmentError> {
        let head = Head::read_from(&storage)?;

        let file_len = storage.len();
        if file_len < (HEAD_SIZE + FOOTER_SIZE) as u64 {
            return Err(SegmentError::Corrupt(format!(
                "file of {file_len} bytes is too short"
            )));
        }
        let mut footer_buf = [0u8; FOOTER_SIZE];
        storage.read_at(file_len - FOOTER_SIZE as u64, &mut footer_buf)?;
        let footer = Footer::from_bytes(&footer_buf)?;

        let index_bytes = read_block(&storage, footer.index, "index")?;
        let (index, _) = encoding::decode_vec::<u64>(&index_bytes)?;
        if index.len() as u64 != head.entry_count {
            return Err(SegmentError::Corrupt(format!(
                "index holds {} offsets, head says {}",
                index.len(),
                head.entry_count
            )));
        }
        let bloom = read_block(&storage, footer.bloom, "bloom")?;

        Ok(Self {
            storage,
            head,
            index,
            bloom,
            data_end: footer.index.offset,
        })
    }

    /// Head of this segment.
    pub fn head(&self) -> &Head {
        &self.head
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the segment holds no entries.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// `false` only when the bloom filter rules `key` out.
    pub fn may_contain(&self, key: &InternalKey) -> bool {
        if self.bloom.is_empty() {
            return true;
        }
        match Bloom::<[u8; INTERNAL_KEY_SIZE]>::from_slice(&self.bloom) {
            Ok(bloom) => bloom.check(&key.to_bytes()),
            Err(_) => true,
        }
    }

    fn offset_of(&self, idx: usize) -> Result<u64, SegmentError> {
        let offset = *self
            .index
            .get(idx)
            .ok_or_else(|| SegmentError::Internal(format!("entry {idx} out of range")))?;
        if offset < HEAD_SIZE as u64 || offset + ENTRY_HEADER_SIZE as u64 > self.data_end {
            return Err(SegmentError::Corrupt(format!(
                "entry offset {offset} outside data region"
            )));
        }
        Ok(offset)
    }

    /// Key of entry `idx`.
    pub fn key_at(&self, idx: usize) -> Result<InternalKey, SegmentError> {
        let offset = self.offset_of(idx)?;
        let mut buf = [0u8; INTERNAL_KEY_SIZE];
        self.storage.read_at(offset, &mut buf)?;
        Ok(InternalKey::decode_from(&buf)?.0)
    }

    /// Key and value of entry `idx`.
    pub fn entry_at(&self, idx: usize) -> Result<Entry, SegmentError> {
        let offset = self.offset_of(idx)?;
        let mut hdr = [0u8; ENTRY_HEADER_SIZE];
        self.storage.read_at(offset, &mut hdr)?;
        let (key, n) = InternalKey::decode_from(&hdr)?;
        let (value_len, _) = u32::decode_from(&hdr[n..])?;

        let value_start = offset + ENTRY_HEADER_SIZE as u64;
        if value_start + u64::from(value_len) > self.data_end {
            return Err(SegmentError::Corrupt(format!(
                "value of entry {idx} runs past data region"
            )));
        }
        let mut value = vec![0u8; value_len as usize];
        self.storage.read_at(value_start, &mut value)?;
        Ok((key, value))
    }

    /// Index of the first entry `>= key`, or `len()` when every entry is smaller.
    pub fn lower_bound(
        &self,
        key: &InternalKey,
        cmp: &dyn KeyComparator,
    ) -> Result<usize, SegmentError> {
        let (mut lo, mut hi) = (0usize, self.index.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if cmp.compare(&self.key_at(mid)?, key) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Point lookup: bloom check, then binary search for an exact match.
    pub fn get(
        &self,
        key: &InternalKey,
        cmp: &dyn KeyComparator,
    ) -> Result<Option<Vec<u8>>, SegmentError> {
        if !self.may_contain(key) {
            return Ok(None);
        }
        let idx = self.lower_bound(key, cmp)?;
        if idx >= self.len() {
            return Ok(None);
        }
        let (found, value) = self.entry_at(idx)?;
        if cmp.compare(&found, key) == Ordering::Equal {
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }
}
