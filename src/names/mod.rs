//! Name dictionary: `table`/`column` names to compact `u32` codes.
//!
//! Keys store a 4-byte code instead of the names they belong to. The
//! mapping is append-only and durable: a code is persisted through the
//! [`NameStore`] before it is published, so a code observed by any reader
//! survives a restart.
//!
//! # Name log format
//!
//! [`FileNameStore`] appends one record per allocation:
//!
//! ```text
//! [PAYLOAD_LEN_LE u32][CRC32_LE u32][CODE_LE u32][NAME_LEN_LE u32][NAME utf-8]
//! ```
//!
//! `PAYLOAD_LEN` covers `CODE` and the length-prefixed `NAME`; the CRC is
//! computed over the same bytes. A short or mismatching record at the end
//! of the log is a torn append and is dropped on load; anywhere else it is
//! corruption. Appends always start at the end of the last intact record,
//! so a torn tail is overwritten rather than buried.

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crossbeam_skiplist::SkipMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::encoding::{Decode, Encode};
use crate::segment::crc32;

/// Separator between the table and column parts of a dictionary name.
pub const SCOPE_SEPARATOR: char = '\u{1f}';

/// First code handed out by an empty dictionary.
pub const FIRST_CODE: u32 = 1;

const RECORD_HEADER_SIZE: usize = 8;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors raised by the name dictionary and its stores.
#[derive(Debug, Error)]
pub enum NameError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The store could not persist a new mapping; no code was assigned.
    #[error("name store unavailable: {0}")]
    StoreUnavailable(String),

    /// The persisted log is damaged.
    #[error("corrupt name log: {0}")]
    Corrupt(String),

    /// Empty name, or a name containing the scope separator.
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// Every `u32` code is in use.
    #[error("name codes exhausted")]
    Exhausted,

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Scope names
// ------------------------------------------------------------------------------------------------

/// Joins `table` and `column` into a single dictionary name.
pub fn scope_name(table: &str, column: &str) -> Result<String, NameError> {
    for part in [table, column] {
        if part.is_empty() || part.contains(SCOPE_SEPARATOR) {
            return Err(NameError::InvalidName(part.to_string()));
        }
    }
    Ok(format!("{table}{SCOPE_SEPARATOR}{column}"))
}

/// Splits a dictionary name back into `(table, column)`.
pub fn split_scope(name: &str) -> Option<(&str, &str)> {
    name.split_once(SCOPE_SEPARATOR)
}

// ------------------------------------------------------------------------------------------------
// Stores
// ------------------------------------------------------------------------------------------------

/// Durable backing for the dictionary.
pub trait NameStore: Send + Sync {
    /// Returns every persisted `(name, code)` pair.
    fn load(&self) -> Result<Vec<(String, u32)>, NameError>;

    /// Durably records one new pair.
    fn persist(&self, name: &str, code: u32) -> Result<(), NameError>;
}

/// Append-only, checksummed name log on disk.
pub struct FileNameStore {
    path: PathBuf,
    writer: Mutex<Option<LogWriter>>,
}

/// Open log handle and the end of its last intact record.
struct LogWriter {
    file: File,
    end: u64,
}

impl FileNameStore {
    /// Uses the log at `path`; it is created on first append.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(None),
        }
    }

    /// Location of the log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode_record(name: &str, code: u32) -> Result<Vec<u8>, NameError> {
        let mut payload = Vec::with_capacity(8 + name.len());
        code.encode_to(&mut payload)
            .map_err(|e| NameError::Internal(e.to_string()))?;
        name.encode_to(&mut payload)
            .map_err(|_| NameError::InvalidName(name.to_string()))?;

        let len = u32::try_from(payload.len())
            .map_err(|_| NameError::InvalidName(name.to_string()))?;
        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(&crc32(&payload).to_le_bytes());
        record.extend_from_slice(&payload);
        Ok(record)
    }

    /// Parses `bytes` into records and the length of the intact prefix.
    fn scan(&self, bytes: &[u8]) -> Result<(Vec<(String, u32)>, u64), NameError> {
        let mut out = Vec::new();
        let mut off = 0usize;
        while off < bytes.len() {
            let rest = &bytes[off..];
            let torn = |reason: &str| {
                warn!(
                    path = %self.path.display(),
                    offset = off,
                    reason,
                    "dropping torn name record"
                );
            };
            if rest.len() < RECORD_HEADER_SIZE {
                torn("short header");
                break;
            }
            let (len, _) = u32::decode_from(rest).map_err(|e| NameError::Corrupt(e.to_string()))?;
            let (crc, _) =
                u32::decode_from(&rest[4..]).map_err(|e| NameError::Corrupt(e.to_string()))?;
            let end = RECORD_HEADER_SIZE + len as usize;
            if rest.len() < end {
                torn("short payload");
                break;
            }
            let payload = &rest[RECORD_HEADER_SIZE..end];
            if crc32(payload) != crc {
                if end == rest.len() {
                    torn("checksum mismatch");
                    break;
                }
                return Err(NameError::Corrupt(format!(
                    "checksum mismatch at offset {off}"
                )));
            }
            let (code, n) = u32::decode_from(payload)
                .map_err(|e| NameError::Corrupt(format!("record at offset {off}: {e}")))?;
            let (name, _) = String::decode_from(&payload[n..])
                .map_err(|e| NameError::Corrupt(format!("record at offset {off}: {e}")))?;
            out.push((name, code));
            off += end;
        }
        Ok((out, off as u64))
    }

    fn read_log(&self) -> Result<Option<Vec<u8>>, NameError> {
        let mut bytes = Vec::new();
        match File::open(&self.path) {
            Ok(mut f) => {
                f.read_to_end(&mut bytes)?;
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Opens the log for appending, cut back to its last intact record.
    fn open_writer(&self) -> Result<LogWriter, NameError> {
        let end = match self.read_log()? {
            Some(bytes) => self.scan(&bytes)?.1,
            None => 0,
        };
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;
        Ok(LogWriter { file, end })
    }

    fn append(writer: &mut LogWriter, record: &[u8]) -> io::Result<()> {
        if writer.file.metadata()?.len() != writer.end {
            writer.file.set_len(writer.end)?;
        }
        writer.file.seek(SeekFrom::Start(writer.end))?;
        writer.file.write_all(record)?;
        writer.file.sync_data()?;
        writer.end += record.len() as u64;
        Ok(())
    }
}

impl NameStore for FileNameStore {
    fn load(&self) -> Result<Vec<(String, u32)>, NameError> {
        match self.read_log()? {
            Some(bytes) => Ok(self.scan(&bytes)?.0),
            None => Ok(Vec::new()),
        }
    }

    fn persist(&self, name: &str, code: u32) -> Result<(), NameError> {
        let record = Self::encode_record(name, code)?;
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| NameError::Internal("Mutex poisoned".into()))?;
        if guard.is_none() {
            *guard = Some(self.open_writer()?);
        }
        let writer = guard
            .as_mut()
            .ok_or_else(|| NameError::Internal("name log not open".into()))?;

        if let Err(e) = Self::append(writer, &record) {
            let end = writer.end;
            if let Err(trim) = writer.file.set_len(end) {
                warn!(
                    path = %self.path.display(),
                    end,
                    error = %trim,
                    "failed to roll back name record"
                );
            }
            *guard = None;
            return Err(NameError::StoreUnavailable(e.to_string()));
        }
        Ok(())
    }
}

/// Volatile store for tests and throwaway stores.
#[derive(Default)]
pub struct MemoryNameStore {
    records: Mutex<Vec<(String, u32)>>,
}

impl NameStore for MemoryNameStore {
    fn load(&self) -> Result<Vec<(String, u32)>, NameError> {
        self.records
            .lock()
            .map(|r| r.clone())
            .map_err(|_| NameError::Internal("Mutex poisoned".into()))
    }

    fn persist(&self, name: &str, code: u32) -> Result<(), NameError> {
        self.records
            .lock()
            .map_err(|_| NameError::Internal("Mutex poisoned".into()))?
            .push((name.to_string(), code));
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Dictionary
// ------------------------------------------------------------------------------------------------

/// Bidirectional, concurrently readable name/code map.
///
/// Lookups never lock. Allocation is serialized by `next_code` and
/// publishes a code only after the store accepted it.
pub struct NameDictionary {
    store: Box<dyn NameStore>,
    by_name: SkipMap<String, u32>,
    by_code: SkipMap<u32, String>,
    next_code: Mutex<u32>,
}

impl NameDictionary {
    /// Empty dictionary over `store`; call [`recover`](Self::recover) before use.
    pub fn new(store: Box<dyn NameStore>) -> Self {
        Self {
            store,
            by_name: SkipMap::new(),
            by_code: SkipMap::new(),
            next_code: Mutex::new(FIRST_CODE),
        }
    }

    /// Loads every persisted mapping. Returns how many were loaded.
    pub fn recover(&self) -> Result<usize, NameError> {
        let records = self.store.load()?;
        let mut next = self
            .next_code
            .lock()
            .map_err(|_| NameError::Internal("Mutex poisoned".into()))?;

        for (name, code) in &records {
            if let Some(other) = self.by_name.get(name).map(|e| *e.value()).filter(|c| c != code) {
                return Err(NameError::Corrupt(format!(
                    "{name:?} mapped to both {other} and {code}"
                )));
            }
            if let Some(other) = self
                .by_code
                .get(code)
                .map(|e| e.value().clone())
                .filter(|n| n != name)
            {
                return Err(NameError::Corrupt(format!(
                    "code {code} mapped to both {other:?} and {name:?}"
                )));
            }
            self.by_name.insert(name.clone(), *code);
            self.by_code.insert(*code, name.clone());
            *next = (*next).max(code.saturating_add(1));
        }
        debug!(names = records.len(), next_code = *next, "name dictionary recovered");
        Ok(records.len())
    }

    /// Code for `name`, allocating and persisting one on first use.
    pub fn code_of(&self, name: &str) -> Result<u32, NameError> {
        if let Some(code) = self.lookup(name) {
            return Ok(code);
        }
        if name.is_empty() {
            return Err(NameError::InvalidName(name.to_string()));
        }

        let mut next = self
            .next_code
            .lock()
            .map_err(|_| NameError::Internal("Mutex poisoned".into()))?;
        if let Some(code) = self.lookup(name) {
            return Ok(code);
        }
        let code = *next;
        if code == u32::MAX {
            return Err(NameError::Exhausted);
        }
        self.store
            .persist(name, code)
            .map_err(|e| NameError::StoreUnavailable(e.to_string()))?;
        self.by_code.insert(code, name.to_string());
        self.by_name.insert(name.to_string(), code);
        *next = code + 1;
        debug!(name, code, "name code allocated");
        Ok(code)
    }

    /// Code for `name` if one was ever assigned.
    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).map(|e| *e.value())
    }

    /// Name behind `code`.
    pub fn name_of(&self, code: u32) -> Option<String> {
        self.by_code.get(&code).map(|e| e.value().clone())
    }

    /// Number of known names.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether no name is known.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
