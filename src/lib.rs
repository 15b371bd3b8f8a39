//! # tempodb
//!
//! Storage core of a time-series database. Data lives in immutable
//! **segments**, grouped by time **bucket** into **levels** of increasing
//! bucket width. Reads see one logical, ordered view across every level.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tempodb::{Store, StoreConfig};
//!
//! let store = Store::open("/tmp/my_series", StoreConfig::default()).unwrap();
//!
//! // Flush a batch of rows into level 0
//! store
//!     .write_segment(0, vec![
//!         ("cpu".into(), "load".into(), 1_000, b"0.42".to_vec()),
//!         ("cpu".into(), "load".into(), 2_000, b"0.57".to_vec()),
//!     ])
//!     .unwrap();
//!
//! // Point lookup
//! assert_eq!(store.get("cpu", "load", 1_000).unwrap(), Some(b"0.42".to_vec()));
//!
//! // Ordered scan across all levels
//! let mut it = store.seek("cpu", "load", 0).unwrap();
//! while it.valid() {
//!     println!("{:?} {:?}", it.time(), it.value());
//!     it.next().unwrap();
//! }
//!
//! store.close().unwrap();
//! ```
//!
//! ## Layout
//!
//! - [`manager`]: file numbers, key order, segment/iterator ordering and
//!   the name dictionary, shared as `Arc<FileManager>`.
//! - [`level`]: one tier's bucket catalog, recovery, retention and
//!   maintenance worker pool.
//! - [`iterator`]: per-level and cross-level bidirectional merge cursors.
//! - [`segment`]: the immutable segment file format.
//! - [`names`]: the durable `table`/`column` to code dictionary.

pub mod encoding;
pub mod iterator;
pub mod key;
pub mod level;
pub mod manager;
pub mod names;
pub mod segment;

pub use iterator::{IteratorError, LevelSeekIterator, SeekIterator, SeekIteratorAdapter};
pub use key::{CodeThenTime, Entry, InternalKey, KeyComparator};
pub use level::{
    Level, LevelConfig, LevelError, LevelStats, MaintenancePolicy, NoopPolicy, RecoveryPolicy,
    RetentionPolicy, TaskError,
};
pub use manager::FileManager;
pub use names::NameError;
pub use segment::{FileMeta, Head, SegmentError};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{info, warn};

use names::FileNameStore;

/// File name of the name dictionary log inside the store directory.
pub const NAMES_FILE: &str = "names.log";

/// One row handed to [`Store::write_segment`]: `(table, column, time, value)`.
pub type Row = (String, String, u64, Vec<u8>);

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Store`].
///
/// All fields have defaults via [`StoreConfig::default()`]; the
/// configuration is validated by [`Store::open`].
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use tempodb::{LevelConfig, StoreConfig};
///
/// // Three levels: minute, hour and day buckets over millisecond timestamps
/// let config = StoreConfig::default();
///
/// // Or a single level of 10-second buckets
/// let config = StoreConfig {
///     levels: vec![LevelConfig {
///         interval: 10_000,
///         tasks: 1,
///         task_period: Duration::from_secs(1),
///     }],
///     ..StoreConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Levels from finest (level 0) to coarsest.
    ///
    /// Default: 1 minute, 1 hour and 1 day buckets, 2 workers each,
    /// 500 ms between cycles. Must not be empty.
    pub levels: Vec<LevelConfig>,

    /// Retention window in key time units; see [`Store::retire_expired`].
    ///
    /// Default: 30 days in milliseconds. Must be ≥ 1.
    pub max_period: u64,

    /// What recovery does with unusable segment files.
    ///
    /// Default: [`RecoveryPolicy::Abort`].
    pub recovery_policy: RecoveryPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            levels: vec![
                LevelConfig::with_interval(60_000),
                LevelConfig::with_interval(3_600_000),
                LevelConfig::with_interval(86_400_000),
            ],
            max_period: 30 * 86_400_000,
            recovery_policy: RecoveryPolicy::Abort,
        }
    }
}

impl StoreConfig {
    /// Validates all configuration parameters.
    fn validate(&self) -> Result<(), StoreError> {
        if self.levels.is_empty() {
            return Err(StoreError::InvalidConfig(
                "at least one level is required".into(),
            ));
        }
        for (n, level) in self.levels.iter().enumerate() {
            if level.interval < 1 {
                return Err(StoreError::InvalidConfig(format!(
                    "level {n}: interval must be >= 1"
                )));
            }
            if level.tasks < 1 {
                return Err(StoreError::InvalidConfig(format!(
                    "level {n}: tasks must be >= 1"
                )));
            }
            if level.task_period.is_zero() {
                return Err(StoreError::InvalidConfig(format!(
                    "level {n}: task_period must be non-zero"
                )));
            }
        }
        if self.max_period < 1 {
            return Err(StoreError::InvalidConfig("max_period must be >= 1".into()));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Store`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Argument out of range (unknown level, bad name).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A level operation failed.
    #[error("{0}")]
    Level(#[from] LevelError),

    /// A cursor operation failed.
    #[error("{0}")]
    Iterator(#[from] IteratorError),

    /// The name dictionary failed.
    #[error("{0}")]
    Name(#[from] NameError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ------------------------------------------------------------------------------------------------
// Store handle
// ------------------------------------------------------------------------------------------------

/// The main store handle.
///
/// Opening a store recovers the name dictionary and every level from the
/// directory, then starts each level's maintenance pool.
///
/// # Thread safety
///
/// `Store` is `Send + Sync`; share it via `Arc<Store>`.
///
/// # Shutdown
///
/// [`Store::close`] stops every pool. Dropping the handle does the same.
pub struct Store {
    path: PathBuf,
    fm: Arc<FileManager>,
    levels: Vec<Level>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("levels", &self.levels.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (or creates) a store whose levels run no maintenance.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        let policies = config
            .levels
            .iter()
            .map(|_| Arc::new(NoopPolicy) as Arc<dyn MaintenancePolicy>)
            .collect();
        Self::open_with_policies(path, config, policies)
    }

    /// Opens (or creates) a store with one maintenance policy per level.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidConfig`] for a bad configuration or a policy
    ///   count that does not match the level count.
    /// - [`StoreError::Name`] / [`StoreError::Level`] if recovery fails.
    pub fn open_with_policies(
        path: impl AsRef<Path>,
        config: StoreConfig,
        policies: Vec<Arc<dyn MaintenancePolicy>>,
    ) -> Result<Self, StoreError> {
        config.validate()?;
        if policies.len() != config.levels.len() {
            return Err(StoreError::InvalidConfig(format!(
                "{} policies for {} levels",
                policies.len(),
                config.levels.len()
            )));
        }

        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let fm = Arc::new(FileManager::new(
            &path,
            Arc::new(CodeThenTime),
            Box::new(FileNameStore::new(path.join(NAMES_FILE))),
            config.max_period,
        ));
        let names = fm.recover_names()?;

        let mut levels = Vec::with_capacity(config.levels.len());
        for (n, (level_config, policy)) in config.levels.into_iter().zip(policies).enumerate() {
            let level = Level::new(
                n,
                level_config,
                config.recovery_policy,
                Arc::clone(&fm),
                policy,
            );
            level.recover()?;
            levels.push(level);
        }
        for level in &levels {
            level.start()?;
        }

        info!(
            path = %path.display(),
            levels = levels.len(),
            names,
            next_file_number = fm.peek_file_number(),
            "store opened"
        );
        Ok(Self {
            path,
            fm,
            levels,
            closed: AtomicBool::new(false),
        })
    }

    /// Stops every level's maintenance pool.
    ///
    /// Subsequent operations return [`StoreError::Closed`]. Calling
    /// `close` more than once is harmless.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for level in &self.levels {
            level.stop()?;
        }
        info!(path = %self.path.display(), "store closed");
        Ok(())
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Shared store context.
    pub fn file_manager(&self) -> &Arc<FileManager> {
        &self.fm
    }

    /// Level `n`.
    pub fn level(&self, n: usize) -> Result<&Level, StoreError> {
        self.levels
            .get(n)
            .ok_or_else(|| StoreError::InvalidArgument(format!("no level {n}")))
    }

    /// All levels, finest first.
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Writes `rows` into level `level`, one new segment per bucket.
    ///
    /// Names are added to the dictionary on first use. Returns the
    /// descriptors of the segments written.
    pub fn write_segment(
        &self,
        level: usize,
        rows: Vec<Row>,
    ) -> Result<Vec<Arc<FileMeta>>, StoreError> {
        self.check_open()?;
        let target = self.level(level)?;
        let mut entries = Vec::with_capacity(rows.len());
        for (table, column, time, value) in rows {
            let code = self.fm.code_for(&table, &column)?;
            entries.push((InternalKey::new(code, time), value));
        }
        Ok(target.write_segment(entries)?)
    }

    /// Retires, on every level, the buckets older than `now - max_period`.
    ///
    /// Every level is attempted; the first failure is returned after all
    /// levels ran. Returns the number of segments retired.
    pub fn retire_expired(&self, now: u64) -> Result<usize, StoreError> {
        self.check_open()?;
        let cutoff = now.saturating_sub(self.fm.max_period());
        let mut retired = 0;
        let mut first_error = None;
        for level in &self.levels {
            match level.retire(cutoff) {
                Ok(n) => retired += n,
                Err(e) => {
                    warn!(level = level.level_num(), error = %e, "retire failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            None => Ok(retired),
            Some(e) => Err(e.into()),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Point lookup; the lowest level holding the key wins.
    pub fn get(&self, table: &str, column: &str, time: u64) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_open()?;
        let Some(code) = self.fm.lookup_scope(table, column) else {
            return Ok(None);
        };
        let key = InternalKey::new(code, time);
        for level in &self.levels {
            if let Some(value) = level.get_value(&key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// An adapter over every level, positioned on the first entry at or
    /// after `(table, column, time)`.
    pub fn seek(
        &self,
        table: &str,
        column: &str,
        time: u64,
    ) -> Result<SeekIteratorAdapter, StoreError> {
        let mut it = self.iter()?;
        it.seek(table, column, time)?;
        Ok(it)
    }

    /// An unpositioned adapter over every level.
    pub fn iter(&self) -> Result<SeekIteratorAdapter, StoreError> {
        self.check_open()?;
        let iterators = self.levels.iter().map(Level::iterator).collect();
        Ok(SeekIteratorAdapter::new(Arc::clone(&self.fm), iterators))
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            for level in &self.levels {
                let _ = level.stop();
            }
        }
    }
}
