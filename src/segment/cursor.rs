//! Cursor over a single segment.

use std::sync::Arc;

use super::{FileMeta, MmapStorage, Segment};
use crate::iterator::{IteratorError, SeekIterator};
use crate::key::{Entry, InternalKey, KeyComparator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    /// Before entry `i` (`i == len` means past the last entry).
    Gap(usize),
    /// On entry `i`.
    At(usize),
}

/// Bidirectional cursor over one memory-mapped segment.
///
/// Its [`priority`](SeekIterator::priority) is the segment's file number,
/// so inside a level the newest segment wins duplicate keys.
pub struct SegmentCursor {
    meta: Arc<FileMeta>,
    segment: Option<Arc<Segment<MmapStorage>>>,
    comparator: Arc<dyn KeyComparator>,
    pos: Position,
    current: Option<Entry>,
}

impl SegmentCursor {
    /// Maps and verifies the segment described by `meta`.
    pub fn open(
        meta: Arc<FileMeta>,
        comparator: Arc<dyn KeyComparator>,
    ) -> Result<Self, IteratorError> {
        let storage = MmapStorage::open(&meta.path)?;
        let segment = Segment::open(storage)?;
        Ok(Self {
            meta,
            segment: Some(Arc::new(segment)),
            comparator,
            pos: Position::Gap(0),
            current: None,
        })
    }

    /// Descriptor of the underlying segment.
    pub fn meta(&self) -> &Arc<FileMeta> {
        &self.meta
    }

    fn segment(&self) -> Result<&Arc<Segment<MmapStorage>>, IteratorError> {
        self.segment.as_ref().ok_or(IteratorError::Closed)
    }

    fn land(&mut self, idx: usize) -> Result<Option<Entry>, IteratorError> {
        let entry = self.segment()?.entry_at(idx)?;
        self.pos = Position::At(idx);
        self.current = Some(entry.clone());
        Ok(Some(entry))
    }

    fn park(&mut self, gap: usize) -> Result<Option<Entry>, IteratorError> {
        self.pos = Position::Gap(gap);
        self.current = None;
        Ok(None)
    }

    /// Index of the entry `next()` would land on.
    fn next_index(&self) -> usize {
        match self.pos {
            Position::Gap(g) => g,
            Position::At(i) => i + 1,
        }
    }

    /// Index one past the entry `prev()` would land on.
    fn prev_bound(&self) -> usize {
        match self.pos {
            Position::Gap(g) | Position::At(g) => g,
        }
    }
}

impl SeekIterator for SegmentCursor {
    fn seek(&mut self, key: &InternalKey) -> Result<(), IteratorError> {
        let gap = self
            .segment()?
            .lower_bound(key, self.comparator.as_ref())?;
        self.pos = Position::Gap(gap);
        self.current = None;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Entry>, IteratorError> {
        let len = self.segment()?.len();
        let idx = self.next_index();
        if idx < len {
            self.land(idx)
        } else {
            self.park(len)
        }
    }

    fn prev(&mut self) -> Result<Option<Entry>, IteratorError> {
        match self.prev_bound() {
            0 => {
                self.segment()?;
                self.park(0)
            }
            bound => self.land(bound - 1),
        }
    }

    fn has_next(&mut self) -> Result<bool, IteratorError> {
        Ok(self.next_index() < self.segment()?.len())
    }

    fn has_prev(&mut self) -> Result<bool, IteratorError> {
        self.segment()?;
        Ok(self.prev_bound() > 0)
    }

    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> Option<InternalKey> {
        self.current.as_ref().map(|(k, _)| *k)
    }

    fn value(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(_, v)| v.as_slice())
    }

    fn priority(&self) -> u64 {
        self.meta.file_number
    }

    fn close(&mut self) -> Result<(), IteratorError> {
        self.segment = None;
        self.current = None;
        Ok(())
    }
}
