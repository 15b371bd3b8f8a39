//! Cross-level merged view.

use std::sync::Arc;

use tracing::trace;

use super::merge::{Direction, MergingIterator};
use super::{IteratorError, LevelIterator, LevelSeekIterator, SeekIterator};
use crate::key::{Entry, InternalKey};
use crate::manager::FileManager;

/// Merges one cursor per level into the logical, deduplicated view of the
/// whole store.
///
/// Children are ordered by [`FileManager::level_iterator_order`], so when
/// the same key exists in several levels the lowest level wins and the
/// key is produced once.
///
/// Unlike the per-level cursors, a seek lands **on** the first entry
/// `>= target` (see [`seek`](Self::seek)); `next`/`prev` then move from it.
pub struct SeekIteratorAdapter<I: LevelIterator = LevelSeekIterator> {
    fm: Arc<FileManager>,
    merger: MergingIterator<I>,
    last_seek_time: Option<u64>,
    /// Set by a seek on a scope that was never written.
    empty: bool,
}

impl<I: LevelIterator> SeekIteratorAdapter<I> {
    /// Builds the merged view over `iterators`.
    pub fn new(fm: Arc<FileManager>, iterators: Vec<I>) -> Self {
        let mut iterators = iterators;
        iterators.sort_by(|a, b| fm.level_iterator_order(a, b));
        let merger = MergingIterator::new(iterators, fm.comparator_arc());
        Self {
            fm,
            merger,
            last_seek_time: None,
            empty: false,
        }
    }

    /// Adds another level; the position is reset and a new seek is needed.
    pub fn add_iterator(&mut self, iterator: I) {
        let fm = Arc::clone(&self.fm);
        let children = self.merger.children_mut();
        children.push(iterator);
        children.sort_by(|a, b| fm.level_iterator_order(a, b));
        self.last_seek_time = None;
        self.empty = false;
    }

    /// Per-level children, in merge order.
    pub fn iterators(&self) -> &[I] {
        self.merger.children()
    }

    /// Positions on the first entry at or after `(table, column, time)`.
    ///
    /// Returns `Ok(false)` when no such entry exists. A `table`/`column`
    /// pair that was never written yields an empty view.
    pub fn seek(&mut self, table: &str, column: &str, time: u64) -> Result<bool, IteratorError> {
        match self.fm.lookup_scope(table, column) {
            Some(code) => self.seek_key(&InternalKey::new(code, time)),
            None => {
                trace!(table, column, "adapter seek on unknown scope");
                self.empty = true;
                self.last_seek_time = None;
                Ok(false)
            }
        }
    }

    /// Positions on the first entry `>= key`.
    pub fn seek_key(&mut self, key: &InternalKey) -> Result<bool, IteratorError> {
        self.empty = false;
        self.merger.seek(key)?;
        let landed = self.merger.next()?;
        self.last_seek_time = landed.as_ref().map(|(k, _)| k.time);
        trace!(key = %key, found = landed.is_some(), "adapter seek");
        Ok(landed.is_some())
    }

    /// Advances to the next key in merged order and returns it.
    pub fn next(&mut self) -> Result<Option<Entry>, IteratorError> {
        if self.empty {
            return Ok(None);
        }
        let entry = self.merger.next()?;
        if let Some((k, _)) = &entry {
            self.last_seek_time = Some(k.time);
        }
        Ok(entry)
    }

    /// Moves to the previous key in merged order and returns it.
    pub fn prev(&mut self) -> Result<Option<Entry>, IteratorError> {
        if self.empty {
            return Ok(None);
        }
        let entry = self.merger.prev()?;
        if let Some((k, _)) = &entry {
            self.last_seek_time = Some(k.time);
        }
        Ok(entry)
    }

    /// Whether [`next`](Self::next) would produce an entry.
    pub fn has_next(&mut self) -> Result<bool, IteratorError> {
        Ok(!self.empty && self.merger.has_next()?)
    }

    /// Whether [`prev`](Self::prev) would produce an entry.
    pub fn has_prev(&mut self) -> Result<bool, IteratorError> {
        Ok(!self.empty && self.merger.has_prev()?)
    }

    /// Whether the adapter is on an entry.
    pub fn valid(&self) -> bool {
        !self.empty && self.merger.valid()
    }

    /// Direction of the last movement.
    pub fn direction(&self) -> Direction {
        self.merger.direction()
    }

    /// Time of the last key produced by a seek or a step.
    pub fn last_seek_time(&self) -> Option<u64> {
        self.last_seek_time
    }

    /// Level that supplied the current entry.
    pub fn current_level(&self) -> Option<usize> {
        if self.empty {
            return None;
        }
        self.merger
            .current_index()
            .map(|i| self.merger.children()[i].level_num())
    }

    /// Key of the current entry.
    pub fn key(&self) -> Option<InternalKey> {
        if self.empty {
            return None;
        }
        self.merger.key()
    }

    /// Value of the current entry.
    pub fn value(&self) -> Option<&[u8]> {
        if self.empty {
            return None;
        }
        self.merger.value()
    }

    /// Table of the current entry.
    pub fn table(&self) -> Option<String> {
        self.fm.scope_of(self.key()?.code).map(|(t, _)| t)
    }

    /// Column of the current entry.
    pub fn column(&self) -> Option<String> {
        self.fm.scope_of(self.key()?.code).map(|(_, c)| c)
    }

    /// Timestamp of the current entry.
    pub fn time(&self) -> Option<u64> {
        self.key().map(|k| k.time)
    }

    /// Always fails: the merged view is read-only.
    pub fn remove(&mut self) -> Result<(), IteratorError> {
        Err(IteratorError::Unsupported("remove on a merged view"))
    }

    /// Closes every child, even if some fail; failures come back together
    /// as [`IteratorError::Close`].
    pub fn close(&mut self) -> Result<(), IteratorError> {
        self.merger.close()
    }
}
