//! Internal keys and the comparator that orders them.
//!
//! Every stored datum is addressed by an [`InternalKey`]: the compact code
//! of a `table`/`column` pair plus a timestamp. Keys carry no intrinsic
//! order; the only order is the one produced by the [`KeyComparator`]
//! installed in the [`FileManager`](crate::manager::FileManager), so a
//! single comparator governs segment layout, point lookups and merges.


use std::cmp::Ordering;
use std::fmt;

use crate::encoding::{Decode, Encode, EncodingError};

/// Encoded size of an [`InternalKey`]: `code u32` + `time u64`.
pub const INTERNAL_KEY_SIZE: usize = 12;

/// A key together with its stored value, as yielded by cursors.
pub type Entry = (InternalKey, Vec<u8>);

// ------------------------------------------------------------------------------------------------
// InternalKey
// ------------------------------------------------------------------------------------------------

/// Identifier of one datum: name code and timestamp.
///
/// Deliberately not `Ord`; compare through
/// [`FileManager::compare`](crate::manager::FileManager::compare).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InternalKey {
    /// Compact code of a `table`/`column` pair.
    pub code: u32,
    /// Timestamp, in the unit chosen by the caller (milliseconds by convention).
    pub time: u64,
}

impl InternalKey {
    /// Creates a key.
    pub const fn new(code: u32, time: u64) -> Self {
        Self { code, time }
    }

    /// Fixed-width byte form, used as the bloom filter item.
    pub fn to_bytes(&self) -> [u8; INTERNAL_KEY_SIZE] {
        let mut out = [0u8; INTERNAL_KEY_SIZE];
        out[..4].copy_from_slice(&self.code.to_le_bytes());
        out[4..].copy_from_slice(&self.time.to_le_bytes());
        out
    }
}

impl fmt::Display for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.code, self.time)
    }
}

impl Encode for InternalKey {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.code.encode_to(buf)?;
        self.time.encode_to(buf)
    }
}

impl Decode for InternalKey {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (code, n) = u32::decode_from(buf)?;
        let (time, m) = u64::decode_from(&buf[n..])?;
        Ok((Self { code, time }, n + m))
    }
}

// ------------------------------------------------------------------------------------------------
// Comparators
// ------------------------------------------------------------------------------------------------

/// Total order over [`InternalKey`]s.
///
/// Implementations must be consistent and stable across restarts: segment
/// files are written in this order and read back with whatever comparator
/// the store is opened with.
pub trait KeyComparator: Send + Sync {
    /// Orders `a` relative to `b`.
    fn compare(&self, a: &InternalKey, b: &InternalKey) -> Ordering;

    /// Short identifier, used in log output.
    fn name(&self) -> &'static str {
        "unnamed"
    }
}

/// Orders by `code`, then by `time`, both ascending.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeThenTime;

impl KeyComparator for CodeThenTime {
    #[inline]
    fn compare(&self, a: &InternalKey, b: &InternalKey) -> Ordering {
        a.code.cmp(&b.code).then(a.time.cmp(&b.time))
    }

    fn name(&self) -> &'static str {
        "code-then-time"
    }
}

impl<F> KeyComparator for F
where
    F: Fn(&InternalKey, &InternalKey) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &InternalKey, b: &InternalKey) -> Ordering {
        self(a, b)
    }
}
