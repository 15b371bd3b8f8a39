//! Cursor over every segment of one level.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use tracing::{debug, trace};

use super::merge::MergingIterator;
use super::{IteratorError, LevelIterator, SeekIterator};
use crate::key::{Entry, InternalKey};
use crate::level::Level;
use crate::manager::FileManager;
use crate::segment::{SegmentCursor, SegmentError};

/// Merges the segments of one level into a single ordered cursor.
///
/// Every seek snapshots the level's catalog, so segments added since the
/// previous seek become visible and retired ones drop out. Cursors over
/// segments that survive between seeks are reused rather than re-mapped.
/// Within the level, the newest segment wins duplicate keys.
pub struct LevelSeekIterator {
    level: Level,
    merger: MergingIterator<SegmentCursor>,
    loaded: bool,
}

impl LevelSeekIterator {
    pub(crate) fn new(level: Level) -> Self {
        let comparator = level.file_manager().comparator_arc();
        Self {
            level,
            merger: MergingIterator::new(Vec::new(), comparator),
            loaded: false,
        }
    }

    fn fm(&self) -> &Arc<FileManager> {
        self.level.file_manager()
    }

    /// Number of segments in the current snapshot.
    pub fn segment_count(&self) -> usize {
        self.merger.children().len()
    }

    /// Rebuilds the child list from a fresh catalog snapshot.
    fn refresh(&mut self) -> Result<(), IteratorError> {
        let fm = Arc::clone(self.fm());
        let mut reusable: HashMap<u64, SegmentCursor> = self
            .merger
            .take_children()
            .into_iter()
            .map(|c| (c.meta().file_number, c))
            .collect();

        let mut children = Vec::new();
        for meta in self.level.all_files() {
            if let Some(cursor) = reusable.remove(&meta.file_number) {
                children.push(cursor);
                continue;
            }
            match SegmentCursor::open(Arc::clone(&meta), fm.comparator_arc()) {
                Ok(cursor) => children.push(cursor),
                Err(e) if is_not_found(&e) => {
                    debug!(path = %meta.path.display(), "segment retired before open");
                }
                Err(e) => return Err(e),
            }
        }
        for (_, mut dropped) in reusable {
            dropped.close()?;
        }

        children.sort_by(|a, b| fm.file_iterator_order(a, b));
        *self.merger.children_mut() = children;
        self.loaded = true;
        Ok(())
    }

    fn ensure_loaded(&mut self) -> Result<(), IteratorError> {
        if !self.loaded {
            self.refresh()?;
        }
        Ok(())
    }

    /// Seeks to `(table, column, time)`. An unknown `table`/`column` leaves
    /// the cursor empty.
    pub fn seek_scope(
        &mut self,
        table: &str,
        column: &str,
        time: u64,
    ) -> Result<(), IteratorError> {
        match self.fm().lookup_scope(table, column) {
            Some(code) => self.seek(&InternalKey::new(code, time)),
            None => {
                trace!(level = self.level.level_num(), table, column, "seek on unknown scope");
                for mut child in self.merger.take_children() {
                    child.close()?;
                }
                self.loaded = true;
                Ok(())
            }
        }
    }

    /// Table of the current entry.
    pub fn table(&self) -> Option<String> {
        self.fm().scope_of(self.key()?.code).map(|(t, _)| t)
    }

    /// Column of the current entry.
    pub fn column(&self) -> Option<String> {
        self.fm().scope_of(self.key()?.code).map(|(_, c)| c)
    }

    /// Timestamp of the current entry.
    pub fn time(&self) -> Option<u64> {
        self.key().map(|k| k.time)
    }
}

fn is_not_found(e: &IteratorError) -> bool {
    match e {
        IteratorError::Io(e) | IteratorError::Segment(SegmentError::Io(e)) => {
            e.kind() == io::ErrorKind::NotFound
        }
        _ => false,
    }
}

impl SeekIterator for LevelSeekIterator {
    fn seek(&mut self, key: &InternalKey) -> Result<(), IteratorError> {
        if self.merger.is_closed() {
            return Err(IteratorError::Closed);
        }
        self.refresh()?;
        self.merger.seek(key)
    }

    fn next(&mut self) -> Result<Option<Entry>, IteratorError> {
        self.ensure_loaded()?;
        self.merger.next()
    }

    fn prev(&mut self) -> Result<Option<Entry>, IteratorError> {
        self.ensure_loaded()?;
        self.merger.prev()
    }

    fn has_next(&mut self) -> Result<bool, IteratorError> {
        self.ensure_loaded()?;
        self.merger.has_next()
    }

    fn has_prev(&mut self) -> Result<bool, IteratorError> {
        self.ensure_loaded()?;
        self.merger.has_prev()
    }

    fn valid(&self) -> bool {
        self.merger.valid()
    }

    fn key(&self) -> Option<InternalKey> {
        self.merger.key()
    }

    fn value(&self) -> Option<&[u8]> {
        self.merger.value()
    }

    fn close(&mut self) -> Result<(), IteratorError> {
        self.merger.close()
    }
}

impl LevelIterator for LevelSeekIterator {
    fn level_num(&self) -> usize {
        self.level.level_num()
    }
}
