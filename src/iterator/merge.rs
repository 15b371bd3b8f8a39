//! Bidirectional k-way merge with duplicate suppression.
//!
//! Children are kept in a fixed priority order; when several children hold
//! the same key, the earliest one supplies the entry and the others are
//! stepped past it, so every key surfaces exactly once.
//!
//! Moving forward, every non-frontier child rests on its smallest entry
//! greater than the current key. Moving backward, every non-frontier child
//! rests on its largest entry smaller than the current key. Changing
//! direction re-seeks the non-frontier children around the current key to
//! restore the invariant for the new direction.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::warn;

use super::{IteratorError, SeekIterator};
use crate::key::{Entry, InternalKey, KeyComparator};

/// Direction of the last movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending key order.
    Forward,
    /// Descending key order.
    Reverse,
}

/// Merges children that are already sorted by priority.
pub struct MergingIterator<I: SeekIterator> {
    children: Vec<I>,
    comparator: Arc<dyn KeyComparator>,
    /// Child supplying the current entry; `None` while in a gap.
    current: Option<usize>,
    direction: Direction,
    closed: bool,
}

impl<I: SeekIterator> MergingIterator<I> {
    /// Merges `children`, which must already be in priority order.
    pub fn new(children: Vec<I>, comparator: Arc<dyn KeyComparator>) -> Self {
        Self {
            children,
            comparator,
            current: None,
            direction: Direction::Forward,
            closed: false,
        }
    }

    /// Children in priority order.
    pub fn children(&self) -> &[I] {
        &self.children
    }

    /// Mutable access to the children. Reordering them invalidates the position.
    pub fn children_mut(&mut self) -> &mut Vec<I> {
        self.current = None;
        &mut self.children
    }

    /// Takes the children out, leaving the merge empty.
    pub fn take_children(&mut self) -> Vec<I> {
        self.current = None;
        std::mem::take(&mut self.children)
    }

    /// Index of the child supplying the current entry.
    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    /// Direction of the last movement.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether [`close`](SeekIterator::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn check_open(&self) -> Result<(), IteratorError> {
        if self.closed {
            Err(IteratorError::Closed)
        } else {
            Ok(())
        }
    }

    fn current_entry(&self) -> Option<Entry> {
        let child = &self.children[self.current?];
        Some((child.key()?, child.value()?.to_vec()))
    }

    fn compare(&self, a: &InternalKey, b: &InternalKey) -> Ordering {
        self.comparator.compare(a, b)
    }

    /// Picks the child holding the key that wins under `wanted` and steps
    /// every other child holding that same key past it.
    fn select(&mut self, wanted: Ordering) -> Result<(), IteratorError> {
        let mut best: Option<(usize, InternalKey)> = None;
        for (i, child) in self.children.iter().enumerate() {
            let Some(key) = child.key() else { continue };
            match best {
                Some((_, b)) if self.compare(&key, &b) != wanted => {}
                _ => best = Some((i, key)),
            }
        }

        self.current = best.map(|(i, _)| i);
        let Some((winner, key)) = best else {
            return Ok(());
        };
        for i in 0..self.children.len() {
            if i == winner {
                continue;
            }
            while self.children[i]
                .key()
                .is_some_and(|k| self.comparator.compare(&k, &key) == Ordering::Equal)
            {
                match wanted {
                    Ordering::Less => self.children[i].next()?,
                    _ => self.children[i].prev()?,
                };
            }
        }
        Ok(())
    }

    fn find_smallest(&mut self) -> Result<(), IteratorError> {
        self.select(Ordering::Less)
    }

    fn find_largest(&mut self) -> Result<(), IteratorError> {
        self.select(Ordering::Greater)
    }

    /// Re-seeks non-frontier children onto their first entry above the
    /// current key.
    fn switch_to_forward(&mut self) -> Result<(), IteratorError> {
        let (Some(cur), Some(key)) = (self.current, self.key()) else {
            return Ok(());
        };
        for i in 0..self.children.len() {
            if i == cur {
                continue;
            }
            let child = &mut self.children[i];
            child.seek(&key)?;
            child.next()?;
            while child
                .key()
                .is_some_and(|k| self.comparator.compare(&k, &key) == Ordering::Equal)
            {
                child.next()?;
            }
        }
        self.direction = Direction::Forward;
        Ok(())
    }

    /// Re-seeks non-frontier children onto their last entry below the
    /// current key.
    fn switch_to_reverse(&mut self) -> Result<(), IteratorError> {
        let (Some(cur), Some(key)) = (self.current, self.key()) else {
            return Ok(());
        };
        for (i, child) in self.children.iter_mut().enumerate() {
            if i == cur {
                continue;
            }
            child.seek(&key)?;
            child.prev()?;
        }
        self.direction = Direction::Reverse;
        Ok(())
    }
}

impl<I: SeekIterator> SeekIterator for MergingIterator<I> {
    fn seek(&mut self, key: &InternalKey) -> Result<(), IteratorError> {
        self.check_open()?;
        for child in &mut self.children {
            child.seek(key)?;
        }
        self.current = None;
        self.direction = Direction::Forward;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Entry>, IteratorError> {
        self.check_open()?;
        match self.current {
            None => {
                for child in &mut self.children {
                    child.next()?;
                }
            }
            Some(cur) => {
                if self.direction == Direction::Reverse {
                    self.switch_to_forward()?;
                }
                self.children[cur].next()?;
            }
        }
        self.direction = Direction::Forward;
        self.find_smallest()?;
        Ok(self.current_entry())
    }

    fn prev(&mut self) -> Result<Option<Entry>, IteratorError> {
        self.check_open()?;
        match self.current {
            None => {
                for child in &mut self.children {
                    child.prev()?;
                }
            }
            Some(cur) => {
                if self.direction == Direction::Forward {
                    self.switch_to_reverse()?;
                }
                self.children[cur].prev()?;
            }
        }
        self.direction = Direction::Reverse;
        self.find_largest()?;
        Ok(self.current_entry())
    }

    fn has_next(&mut self) -> Result<bool, IteratorError> {
        self.check_open()?;
        let Some(cur) = self.current else {
            for child in &mut self.children {
                if child.has_next()? {
                    return Ok(true);
                }
            }
            return Ok(false);
        };
        if self.direction == Direction::Reverse {
            self.switch_to_forward()?;
        }
        if self
            .children
            .iter()
            .enumerate()
            .any(|(i, c)| i != cur && c.valid())
        {
            return Ok(true);
        }
        self.children[cur].has_next()
    }

    fn has_prev(&mut self) -> Result<bool, IteratorError> {
        self.check_open()?;
        let Some(cur) = self.current else {
            for child in &mut self.children {
                if child.has_prev()? {
                    return Ok(true);
                }
            }
            return Ok(false);
        };
        if self.direction == Direction::Forward {
            self.switch_to_reverse()?;
        }
        if self
            .children
            .iter()
            .enumerate()
            .any(|(i, c)| i != cur && c.valid())
        {
            return Ok(true);
        }
        self.children[cur].has_prev()
    }

    fn valid(&self) -> bool {
        self.current.is_some_and(|i| self.children[i].valid())
    }

    fn key(&self) -> Option<InternalKey> {
        self.children[self.current?].key()
    }

    fn value(&self) -> Option<&[u8]> {
        self.children[self.current?].value()
    }

    fn close(&mut self) -> Result<(), IteratorError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.current = None;
        let failures: Vec<IteratorError> = self
            .children
            .iter_mut()
            .filter_map(|child| child.close().err())
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            warn!(failed = failures.len(), "children failed to close");
            Err(IteratorError::Close(failures))
        }
    }
}
