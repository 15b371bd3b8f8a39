use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::iterator::{IteratorError, LevelIterator, SeekIterator};
use crate::key::{Entry, InternalKey};

/// In-memory cursor over a sorted vector, with the same gap semantics as
/// the on-disk cursors.
pub struct VecIterator {
    entries: Vec<Entry>,
    /// Index of the entry `next()` lands on.
    gap: usize,
    on: Option<usize>,
    level: usize,
    priority: u64,
    fail_close: bool,
    /// While set, `seek` fails without moving.
    seek_fault: Option<Arc<AtomicBool>>,
    closed: bool,
}

impl VecIterator {
    /// `entries` must be sorted by `(code, time)` without duplicates.
    pub fn new(entries: Vec<Entry>) -> Self {
        Self {
            entries,
            gap: 0,
            on: None,
            level: 0,
            priority: 0,
            fail_close: false,
            seek_fault: None,
            closed: false,
        }
    }

    pub fn at_level(mut self, level: usize) -> Self {
        self.level = level;
        self
    }

    pub fn with_priority(mut self, priority: u64) -> Self {
        self.priority = priority;
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Makes `seek` fail whenever `fault` is set.
    pub fn failing_seek_when(mut self, fault: Arc<AtomicBool>) -> Self {
        self.seek_fault = Some(fault);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn check(&self) -> Result<(), IteratorError> {
        if self.closed {
            Err(IteratorError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Builds a `VecIterator` from `(code, time, value)` triples.
pub fn vec_iter(items: &[(u32, u64, &str)]) -> VecIterator {
    VecIterator::new(
        items
            .iter()
            .map(|(c, t, v)| (InternalKey::new(*c, *t), v.as_bytes().to_vec()))
            .collect(),
    )
}

impl SeekIterator for VecIterator {
    fn seek(&mut self, key: &InternalKey) -> Result<(), IteratorError> {
        self.check()?;
        if self
            .seek_fault
            .as_ref()
            .is_some_and(|f| f.load(Ordering::SeqCst))
        {
            return Err(IteratorError::Io(io::Error::other("injected seek fault")));
        }
        self.gap = self
            .entries
            .partition_point(|(k, _)| (k.code, k.time) < (key.code, key.time));
        self.on = None;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Entry>, IteratorError> {
        self.check()?;
        let idx = match self.on {
            Some(i) => i + 1,
            None => self.gap,
        };
        if idx < self.entries.len() {
            self.on = Some(idx);
            Ok(Some(self.entries[idx].clone()))
        } else {
            self.on = None;
            self.gap = self.entries.len();
            Ok(None)
        }
    }

    fn prev(&mut self) -> Result<Option<Entry>, IteratorError> {
        self.check()?;
        let bound = self.on.unwrap_or(self.gap);
        if bound > 0 {
            self.on = Some(bound - 1);
            Ok(Some(self.entries[bound - 1].clone()))
        } else {
            self.on = None;
            self.gap = 0;
            Ok(None)
        }
    }

    fn has_next(&mut self) -> Result<bool, IteratorError> {
        self.check()?;
        let idx = self.on.map_or(self.gap, |i| i + 1);
        Ok(idx < self.entries.len())
    }

    fn has_prev(&mut self) -> Result<bool, IteratorError> {
        self.check()?;
        Ok(self.on.unwrap_or(self.gap) > 0)
    }

    fn valid(&self) -> bool {
        self.on.is_some()
    }

    fn key(&self) -> Option<InternalKey> {
        self.on.map(|i| self.entries[i].0)
    }

    fn value(&self) -> Option<&[u8]> {
        self.on.map(|i| self.entries[i].1.as_slice())
    }

    fn priority(&self) -> u64 {
        self.priority
    }

    fn close(&mut self) -> Result<(), IteratorError> {
        self.closed = true;
        self.on = None;
        if self.fail_close {
            Err(IteratorError::Unsupported("close"))
        } else {
            Ok(())
        }
    }
}

impl LevelIterator for VecIterator {
    fn level_num(&self) -> usize {
        self.level
    }
}
