//! Process-wide coordination shared by every level and iterator.
//!
//! A [`FileManager`] is constructed once per store and handed out as
//! `Arc<FileManager>`. It owns:
//!
//! - the file-number allocator (monotonic, never reused);
//! - the [`KeyComparator`], the single source of key order;
//! - the three ordering policies for segments, per-level iterators and
//!   per-file iterators;
//! - the name dictionary that maps `table`/`column` pairs to key codes;
//! - the store directory and the retention window.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use tracing::debug;

use crate::iterator::{LevelIterator, SeekIterator};
use crate::key::{InternalKey, KeyComparator};
use crate::names::{self, NameDictionary, NameError, NameStore};
use crate::segment::FileMeta;

/// Segment order backing [`FileManager::segment_order`]; also the order of
/// every bucket set in a level's catalog.
pub(crate) fn newest_first(a: &FileMeta, b: &FileMeta) -> Ordering {
    b.file_number.cmp(&a.file_number)
}

/// Shared store context.
pub struct FileManager {
    dir: PathBuf,
    next_file_number: AtomicU64,
    comparator: Arc<dyn KeyComparator>,
    names: NameDictionary,
    max_period: u64,
}

impl std::fmt::Debug for FileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileManager")
            .field("dir", &self.dir)
            .field("comparator", &self.comparator.name())
            .field("max_period", &self.max_period)
            .finish_non_exhaustive()
    }
}

impl FileManager {
    /// Builds a manager rooted at `dir`. The name dictionary starts empty;
    /// call [`recover_names`](Self::recover_names) before serving traffic.
    pub fn new(
        dir: impl AsRef<Path>,
        comparator: Arc<dyn KeyComparator>,
        names: Box<dyn NameStore>,
        max_period: u64,
    ) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            next_file_number: AtomicU64::new(1),
            comparator,
            names: NameDictionary::new(names),
            max_period,
        }
    }

    /// Directory holding every segment and the name log.
    pub fn store_dir(&self) -> &Path {
        &self.dir
    }

    /// Retention window: data older than `now - max_period` may be retired.
    pub fn max_period(&self) -> u64 {
        self.max_period
    }

    /// The installed comparator.
    pub fn comparator(&self) -> &dyn KeyComparator {
        self.comparator.as_ref()
    }

    /// Shared handle to the installed comparator.
    pub fn comparator_arc(&self) -> Arc<dyn KeyComparator> {
        Arc::clone(&self.comparator)
    }

    // --------------------------------------------------------------------------------------------
    // File numbers
    // --------------------------------------------------------------------------------------------

    /// Next file number. Strictly increasing across all threads.
    pub fn allocate_file_number(&self) -> u64 {
        self.next_file_number.fetch_add(1, AtomicOrdering::SeqCst)
    }

    /// Makes sure future allocations stay above `file_number`.
    pub fn observe_file_number(&self, file_number: u64) {
        self.next_file_number
            .fetch_max(file_number.saturating_add(1), AtomicOrdering::SeqCst);
    }

    /// The number the next allocation will return.
    pub fn peek_file_number(&self) -> u64 {
        self.next_file_number.load(AtomicOrdering::SeqCst)
    }

    // --------------------------------------------------------------------------------------------
    // Ordering policies
    // --------------------------------------------------------------------------------------------

    /// Key order, delegated to the comparator.
    #[inline]
    pub fn compare(&self, a: &InternalKey, b: &InternalKey) -> Ordering {
        self.comparator.compare(a, b)
    }

    /// Segment order inside a bucket: newest (highest file number) first.
    pub fn segment_order(&self, a: &FileMeta, b: &FileMeta) -> Ordering {
        newest_first(a, b)
    }

    /// Order of per-level iterators in a cross-level merge: level 0 first.
    ///
    /// Combined with a stable sort, iterators of equal level keep the order
    /// they were added in.
    pub fn level_iterator_order<I: LevelIterator + ?Sized>(&self, a: &I, b: &I) -> Ordering {
        a.level_num().cmp(&b.level_num())
    }

    /// Order of per-file iterators inside one level: higher priority first.
    pub fn file_iterator_order<I: SeekIterator + ?Sized>(&self, a: &I, b: &I) -> Ordering {
        b.priority().cmp(&a.priority())
    }

    // --------------------------------------------------------------------------------------------
    // Names
    // --------------------------------------------------------------------------------------------

    /// Loads the name dictionary from its store.
    pub fn recover_names(&self) -> Result<usize, NameError> {
        self.names.recover()
    }

    /// Code for `name`, allocated and persisted on first use.
    pub fn name_to_code(&self, name: &str) -> Result<u32, NameError> {
        self.names.code_of(name)
    }

    /// Code for `name` without allocating.
    pub fn lookup_code(&self, name: &str) -> Option<u32> {
        self.names.lookup(name)
    }

    /// Name behind `code`.
    pub fn code_to_name(&self, code: u32) -> Option<String> {
        self.names.name_of(code)
    }

    /// Code for a `table`/`column` pair, allocated on first use.
    pub fn code_for(&self, table: &str, column: &str) -> Result<u32, NameError> {
        self.name_to_code(&names::scope_name(table, column)?)
    }

    /// Code for a `table`/`column` pair without allocating.
    pub fn lookup_scope(&self, table: &str, column: &str) -> Option<u32> {
        names::scope_name(table, column)
            .ok()
            .and_then(|name| self.lookup_code(&name))
    }

    /// `(table, column)` behind `code`.
    pub fn scope_of(&self, code: u32) -> Option<(String, String)> {
        let name = self.code_to_name(code)?;
        let (table, column) = names::split_scope(&name)?;
        Some((table.to_string(), column.to_string()))
    }

    /// Number of known names.
    pub fn name_count(&self) -> usize {
        self.names.len()
    }

    // --------------------------------------------------------------------------------------------
    // Files
    // --------------------------------------------------------------------------------------------

    /// Removes a segment file. A file that is already gone counts as removed.
    pub fn delete(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "segment file deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
