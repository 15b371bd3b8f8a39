//! Ordered, bidirectional, seekable cursors.
//!
//! Three cursor kinds share the [`SeekIterator`] contract:
//!
//! - [`SegmentCursor`](crate::segment::SegmentCursor) walks one segment;
//! - [`LevelSeekIterator`] merges every segment of one level;
//! - [`SeekIteratorAdapter`] merges one iterator per level into the
//!   logical view of the whole store.
//!
//! Both merging cursors are built on [`MergingIterator`].
//!
//! # Positions
//!
//! A cursor is either **between** two entries (a gap) or **on** an entry.
//! [`seek`](SeekIterator::seek) moves to the gap just before the first
//! entry `>= target`. [`next`](SeekIterator::next) and
//! [`prev`](SeekIterator::prev) step onto the following or preceding entry
//! and return it; when there is none they return `Ok(None)` and leave the
//! cursor in the gap past that end, from which the opposite direction
//! resumes normally.
//!
//! ```text
//!          seek(k)
//!             v
//!   [a]  [b]  |  [k]  [m]
//!        prev ^  next ^
//! ```

pub mod adapter;
pub mod level;
pub mod merge;

#[cfg(test)]
pub(crate) mod tests;

pub use adapter::SeekIteratorAdapter;
pub use level::LevelSeekIterator;
pub use merge::{Direction, MergingIterator};

use std::io;

use thiserror::Error;

use crate::key::{Entry, InternalKey};
use crate::names::NameError;
use crate::segment::SegmentError;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors raised while positioning or advancing a cursor.
#[derive(Debug, Error)]
pub enum IteratorError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A segment could not be opened or read.
    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),

    /// A name could not be resolved.
    #[error("name error: {0}")]
    Name(#[from] NameError),

    /// The operation is not supported by this cursor.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The cursor was used after [`close`](SeekIterator::close).
    #[error("iterator is closed")]
    Closed,

    /// One or more children failed to close.
    #[error("{} iterator(s) failed to close", .0.len())]
    Close(Vec<IteratorError>),
}

// ------------------------------------------------------------------------------------------------
// Traits
// ------------------------------------------------------------------------------------------------

/// Ordered, bidirectional, seekable cursor over [`Entry`]s.
pub trait SeekIterator: Send {
    /// Moves to the gap before the first entry `>= key`.
    fn seek(&mut self, key: &InternalKey) -> Result<(), IteratorError>;

    /// Steps onto the next entry and returns it.
    fn next(&mut self) -> Result<Option<Entry>, IteratorError>;

    /// Steps onto the previous entry and returns it.
    fn prev(&mut self) -> Result<Option<Entry>, IteratorError>;

    /// Whether [`next`](Self::next) would return an entry.
    fn has_next(&mut self) -> Result<bool, IteratorError>;

    /// Whether [`prev`](Self::prev) would return an entry.
    fn has_prev(&mut self) -> Result<bool, IteratorError>;

    /// Whether the cursor is on an entry.
    fn valid(&self) -> bool;

    /// Key of the current entry.
    fn key(&self) -> Option<InternalKey>;

    /// Value of the current entry.
    fn value(&self) -> Option<&[u8]>;

    /// Tie-break rank among sibling cursors; higher wins.
    fn priority(&self) -> u64 {
        0
    }

    /// Releases resources. Further positioning fails with
    /// [`IteratorError::Closed`]; closing twice is harmless.
    fn close(&mut self) -> Result<(), IteratorError> {
        Ok(())
    }
}

/// A cursor covering one whole level.
pub trait LevelIterator: SeekIterator {
    /// Level served by this cursor; lower levels win duplicate keys.
    fn level_num(&self) -> usize;
}

impl<I: SeekIterator + ?Sized> SeekIterator for Box<I> {
    fn seek(&mut self, key: &InternalKey) -> Result<(), IteratorError> {
        (**self).seek(key)
    }

    fn next(&mut self) -> Result<Option<Entry>, IteratorError> {
        (**self).next()
    }

    fn prev(&mut self) -> Result<Option<Entry>, IteratorError> {
        (**self).prev()
    }

    fn has_next(&mut self) -> Result<bool, IteratorError> {
        (**self).has_next()
    }

    fn has_prev(&mut self) -> Result<bool, IteratorError> {
        (**self).has_prev()
    }

    fn valid(&self) -> bool {
        (**self).valid()
    }

    fn key(&self) -> Option<InternalKey> {
        (**self).key()
    }

    fn value(&self) -> Option<&[u8]> {
        (**self).value()
    }

    fn priority(&self) -> u64 {
        (**self).priority()
    }

    fn close(&mut self) -> Result<(), IteratorError> {
        (**self).close()
    }
}

impl<I: LevelIterator + ?Sized> LevelIterator for Box<I> {
    fn level_num(&self) -> usize {
        (**self).level_num()
    }
}
