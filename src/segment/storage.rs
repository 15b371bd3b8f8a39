//! Read access to segment bytes.
//!
//! Two backends are provided. [`MmapStorage`] maps the whole file and is
//! what scans use; a mapping stays valid after the file is unlinked, so a
//! segment retired mid-scan remains readable through an open cursor.
//! [`FileStorage`] issues positional reads against an open descriptor and
//! is what point lookups use, avoiding a mapping per lookup.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use memmap2::Mmap;

/// Random-access, read-only view of a segment file.
pub trait Storage: Send + Sync {
    /// Fills `buf` with the bytes starting at `offset`.
    ///
    /// Fails with [`io::ErrorKind::UnexpectedEof`] if the range runs past the end.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Total length in bytes.
    fn len(&self) -> u64;

    /// Whether the storage holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ------------------------------------------------------------------------------------------------
// MmapStorage
// ------------------------------------------------------------------------------------------------

/// Memory-mapped segment file.
pub struct MmapStorage {
    mmap: Mmap,
}

impl MmapStorage {
    /// Maps the file at `path` read-only.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        // SAFETY: segment files are immutable once renamed into place and
        // the mapping is read-only.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { mmap })
    }
}

impl Storage for MmapStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflows usize"))?;
        let src = start
            .checked_add(buf.len())
            .and_then(|end| self.mmap.get(start..end))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("read of {} bytes at {offset} past end", buf.len()),
                )
            })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.mmap.len() as u64
    }
}

// ------------------------------------------------------------------------------------------------
// FileStorage
// ------------------------------------------------------------------------------------------------

/// Segment file read with positional reads.
pub struct FileStorage {
    file: File,
    len: u64,
}

impl FileStorage {
    /// Opens the file at `path` for reading.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl Storage for FileStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn len(&self) -> u64 {
        self.len
    }
}
