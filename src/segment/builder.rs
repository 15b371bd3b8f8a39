//! Segment writer.
//!
//! Builds a complete segment from a sorted run of entries:
//!
//! 1. Write everything to `<path>.tmp`.
//! 2. `fsync` the temporary file.
//! 3. Rename it over `<path>`.
//!
//! A crash before the rename leaves only a `.tmp` file, which recovery
//! ignores because it does not carry the segment suffix.

use std::fs::{OpenOptions, rename};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bloomfilter::Bloom;
use tracing::debug;

use super::{
    BLOCK_CHECKSUM_SIZE, BLOCK_LEN_SIZE, BLOOM_FALSE_POSITIVE_RATE, BlockHandle, Footer, Head,
    SegmentError, crc32,
};
use crate::encoding::{self, Encode};
use crate::key::{Entry, INTERNAL_KEY_SIZE, KeyComparator};

/// Appends bytes while tracking the absolute file offset.
struct OffsetWriter<W: Write> {
    inner: W,
    offset: u64,
}

impl<W: Write> OffsetWriter<W> {
    fn write_all(&mut self, data: &[u8]) -> Result<(), SegmentError> {
        self.inner.write_all(data)?;
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Writes `[len_le][data][crc32_le]` and returns its handle.
    fn write_checksummed_block(&mut self, data: &[u8]) -> Result<BlockHandle, SegmentError> {
        let offset = self.offset;
        let len = encoding::len_to_u32(data.len())?;
        self.write_all(&len.to_le_bytes())?;
        self.write_all(data)?;
        self.write_all(&crc32(data).to_le_bytes())?;
        Ok(BlockHandle {
            offset,
            size: (BLOCK_LEN_SIZE + data.len() + BLOCK_CHECKSUM_SIZE) as u64,
        })
    }
}

/// Builds one segment file on disk.
///
/// ```rust,ignore
/// let head = SegmentWriter::new(&path).build(&entries, &CodeThenTime)?;
/// ```
pub struct SegmentWriter {
    path: PathBuf,
}

impl SegmentWriter {
    /// Create a writer targeting `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Writes `entries` and returns the head that was stored.
    ///
    /// # Errors
    ///
    /// - [`SegmentError::InvalidInput`] if `entries` is empty, or not
    ///   strictly ascending under `cmp`.
    /// - I/O errors from writing, syncing or renaming.
    pub fn build(self, entries: &[Entry], cmp: &dyn KeyComparator) -> Result<Head, SegmentError> {
        let (Some((smallest, _)), Some((largest, _))) = (entries.first(), entries.last()) else {
            return Err(SegmentError::InvalidInput(
                "cannot build a segment from no entries".into(),
            ));
        };
        if let Some(pair) = entries
            .windows(2)
            .find(|w| cmp.compare(&w[0].0, &w[1].0).is_ge())
        {
            return Err(SegmentError::InvalidInput(format!(
                "entries not strictly ascending: {} then {}",
                pair[0].0, pair[1].0
            )));
        }

        let head = Head::new(*smallest, *largest, entries.len() as u64).sealed()?;
        let tmp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        {
            let mut writer = OffsetWriter {
                inner: BufWriter::new(&mut file),
                offset: 0,
            };
            writer.write_all(&head.to_bytes()?)?;

            let mut bloom = Bloom::<[u8; INTERNAL_KEY_SIZE]>::new_for_fp_rate(
                entries.len(),
                BLOOM_FALSE_POSITIVE_RATE,
            )
            .map_err(|e| SegmentError::Internal(e.to_string()))?;

            let mut offsets = Vec::with_capacity(entries.len());
            let mut record = Vec::new();
            for (key, value) in entries {
                offsets.push(writer.offset);
                bloom.set(&key.to_bytes());

                record.clear();
                key.encode_to(&mut record)?;
                value.encode_to(&mut record)?;
                writer.write_all(&record)?;
            }

            let mut index_bytes = Vec::with_capacity(4 + offsets.len() * 8);
            encoding::encode_vec(&offsets, &mut index_bytes)?;
            let index = writer.write_checksummed_block(&index_bytes)?;
            let bloom = writer.write_checksummed_block(bloom.as_slice())?;

            let footer = Footer {
                index,
                bloom,
                footer_crc: 0,
            };
            writer.write_all(&footer.to_bytes()?)?;
            writer.inner.flush()?;
        }
        file.sync_all()?;
        drop(file);

        rename(&tmp_path, &self.path)?;
        debug!(path = %self.path.display(), entries = entries.len(), "segment written");
        Ok(head)
    }
}
