//! One storage tier: a time-bucketed catalog of segments plus the worker
//! pool that maintains it.
//!
//! # Catalog
//!
//! ```text
//! bucket start ──► { FileMeta (newest) , FileMeta , … , FileMeta (oldest) }
//! ```
//!
//! `bucket(time) = time / interval * interval`. A bucket is present only
//! while it holds at least one segment. Sets are ordered newest first so a
//! point lookup returns the most recently written value.
//!
//! Both the bucket map and the per-bucket sets are lock-free skip lists:
//! readers never block, and they see a live, weakly consistent view in
//! which segments added or retired during a scan may or may not appear.
//! Creating a bucket is serialized by `change_lock` (double-checked), and
//! dropping an emptied bucket excludes concurrent `add`s via `bucket_gate`
//! so a segment is never inserted into a bucket that is being unlinked.
//!
//! # Lifecycle
//!
//! ```text
//! Stopped ──start()──► Running ──stop()──► Stopped
//! ```
//!
//! While running, `tasks` worker threads repeatedly invoke the level's
//! [`MaintenancePolicy`]. `stop()` disconnects the workers' stop channel
//! and returns immediately; an in-flight cycle runs to completion on its
//! own and its thread then exits.

pub mod task;

#[cfg(test)]
pub(crate) mod tests;

pub use task::{MaintenancePolicy, NoopPolicy, RetentionPolicy, TaskError};

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use crossbeam_skiplist::{SkipMap, SkipSet};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::iterator::LevelSeekIterator;
use crate::key::{Entry, InternalKey};
use crate::manager::{self, FileManager};
use crate::segment::{
    FileMeta, FileStorage, Head, Segment, SegmentError, SegmentName, SegmentWriter,
    segment_file_name,
};

/// Suffix appended to segment files set aside by [`RecoveryPolicy::Quarantine`].
pub const QUARANTINE_SUFFIX: &str = ".quarantine";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Level`] operations.
#[derive(Debug, Error)]
pub enum LevelError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A segment could not be written or read.
    #[error("Segment error: {0}")]
    Segment(#[from] SegmentError),

    /// A segment found during recovery is unusable.
    #[error("cannot recover {}: {reason}", path.display())]
    Recovery {
        /// The offending file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// Some segments could not be deleted; they remain in the catalog.
    #[error("failed to retire {failed} segment(s): {source}")]
    Retire {
        /// Number of segments that could not be deleted.
        failed: usize,
        /// The first deletion error.
        #[source]
        source: io::Error,
    },

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Shape of one level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelConfig {
    /// Bucket width, in the same unit as key timestamps.
    pub interval: u64,
    /// Number of maintenance worker threads.
    pub tasks: usize,
    /// Pause between two maintenance cycles of one worker.
    pub task_period: Duration,
}

impl LevelConfig {
    /// A level with `interval`-wide buckets and the default pool.
    pub fn with_interval(interval: u64) -> Self {
        Self {
            interval,
            tasks: 2,
            task_period: Duration::from_millis(500),
        }
    }
}

/// What recovery does with a segment whose name or head is unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicy {
    /// Fail recovery with [`LevelError::Recovery`].
    #[default]
    Abort,
    /// Rename the file with [`QUARANTINE_SUFFIX`], log it, and carry on.
    Quarantine,
}

/// Point-in-time counters of one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelStats {
    /// Level number.
    pub level: usize,
    /// Whether the worker pool is running.
    pub running: bool,
    /// Buckets in the catalog.
    pub buckets: usize,
    /// Segments in the catalog.
    pub segments: usize,
    /// Maintenance cycles started.
    pub processed: u64,
    /// Maintenance cycles that failed or panicked.
    pub errors: u64,
}

// ------------------------------------------------------------------------------------------------
// Catalog entries
// ------------------------------------------------------------------------------------------------

/// Catalog element ordered by [`FileManager::segment_order`].
#[derive(Debug, Clone)]
struct SegmentRef(Arc<FileMeta>);

impl PartialEq for SegmentRef {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SegmentRef {}

impl PartialOrd for SegmentRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SegmentRef {
    fn cmp(&self, other: &Self) -> Ordering {
        manager::newest_first(&self.0, &other.0)
    }
}

type Bucket = Arc<SkipSet<SegmentRef>>;

enum PoolState {
    Stopped,
    Running { _stop: Sender<()> },
}

// ------------------------------------------------------------------------------------------------
// Level
// ------------------------------------------------------------------------------------------------

struct LevelInner {
    level_num: usize,
    config: LevelConfig,
    recovery_policy: RecoveryPolicy,
    fm: Arc<FileManager>,
    policy: Arc<dyn MaintenancePolicy>,
    catalog: SkipMap<u64, Bucket>,
    change_lock: Mutex<()>,
    bucket_gate: RwLock<()>,
    pool: Mutex<PoolState>,
    processed: AtomicU64,
    errors: AtomicU64,
}

/// Handle to one level. Cloning is cheap and shares the same catalog.
#[derive(Clone)]
pub struct Level {
    inner: Arc<LevelInner>,
}

impl std::fmt::Debug for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Level")
            .field("level", &self.inner.level_num)
            .field("interval", &self.inner.config.interval)
            .field("buckets", &self.inner.catalog.len())
            .finish_non_exhaustive()
    }
}

impl Level {
    /// Creates an empty, stopped level.
    pub fn new(
        level_num: usize,
        config: LevelConfig,
        recovery_policy: RecoveryPolicy,
        fm: Arc<FileManager>,
        policy: Arc<dyn MaintenancePolicy>,
    ) -> Self {
        Self {
            inner: Arc::new(LevelInner {
                level_num,
                config,
                recovery_policy,
                fm,
                policy,
                catalog: SkipMap::new(),
                change_lock: Mutex::new(()),
                bucket_gate: RwLock::new(()),
                pool: Mutex::new(PoolState::Stopped),
                processed: AtomicU64::new(0),
                errors: AtomicU64::new(0),
            }),
        }
    }

    /// Level number; 0 holds the most recent, finest-grained data.
    pub fn level_num(&self) -> usize {
        self.inner.level_num
    }

    /// Bucket width.
    pub fn interval(&self) -> u64 {
        self.inner.config.interval
    }

    /// Shared store context.
    pub fn file_manager(&self) -> &Arc<FileManager> {
        &self.inner.fm
    }

    /// Start of the bucket containing `time`.
    pub fn bucket(&self, time: u64) -> u64 {
        let interval = self.inner.config.interval.max(1);
        time / interval * interval
    }

    fn lock_pool(&self) -> Result<MutexGuard<'_, PoolState>, LevelError> {
        self.inner
            .pool
            .lock()
            .map_err(|_| LevelError::Internal("Mutex poisoned".into()))
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Starts the worker pool. Does nothing if already running.
    pub fn start(&self) -> Result<(), LevelError> {
        let mut pool = self.lock_pool()?;
        if matches!(*pool, PoolState::Running { .. }) {
            return Ok(());
        }

        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        for worker in 0..self.inner.config.tasks {
            let rx = stop_rx.clone();
            let weak = Arc::downgrade(&self.inner);
            let period = self.inner.config.task_period;
            thread::Builder::new()
                .name(format!("tempodb-L{}-task-{worker}", self.inner.level_num))
                .spawn(move || run_worker(weak, worker, period, rx))?;
        }
        *pool = PoolState::Running { _stop: stop_tx };

        info!(
            level = self.inner.level_num,
            tasks = self.inner.config.tasks,
            "level started"
        );
        Ok(())
    }

    /// Cancels the worker pool without waiting for in-flight cycles.
    /// Does nothing if already stopped.
    pub fn stop(&self) -> Result<(), LevelError> {
        let mut pool = self.lock_pool()?;
        if matches!(*pool, PoolState::Stopped) {
            return Ok(());
        }
        *pool = PoolState::Stopped;
        info!(level = self.inner.level_num, "level stopped");
        Ok(())
    }

    /// Whether the worker pool is running.
    pub fn is_running(&self) -> bool {
        self.inner
            .pool
            .lock()
            .map(|p| matches!(*p, PoolState::Running { .. }))
            .unwrap_or(false)
    }

    /// Maintenance cycles started so far.
    pub fn processed_count(&self) -> u64 {
        self.inner.processed.load(AtomicOrdering::Relaxed)
    }

    /// Maintenance cycles that failed so far.
    pub fn error_count(&self) -> u64 {
        self.inner.errors.load(AtomicOrdering::Relaxed)
    }

    /// Snapshot of the level's counters.
    pub fn stats(&self) -> LevelStats {
        LevelStats {
            level: self.inner.level_num,
            running: self.is_running(),
            buckets: self.inner.catalog.len(),
            segments: self
                .inner
                .catalog
                .iter()
                .map(|e| e.value().len())
                .sum(),
            processed: self.processed_count(),
            errors: self.error_count(),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Catalog
    // --------------------------------------------------------------------------------------------

    /// Registers `meta` in the bucket containing `time`.
    pub fn add(&self, time: u64, meta: Arc<FileMeta>) -> Result<(), LevelError> {
        let _gate = self
            .inner
            .bucket_gate
            .read()
            .map_err(|_| LevelError::Internal("RwLock poisoned".into()))?;
        let start = self.bucket(time);

        let bucket = match self.inner.catalog.get(&start) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                let _change = self
                    .inner
                    .change_lock
                    .lock()
                    .map_err(|_| LevelError::Internal("Mutex poisoned".into()))?;
                match self.inner.catalog.get(&start) {
                    Some(entry) => Arc::clone(entry.value()),
                    None => {
                        let created: Bucket = Arc::new(SkipSet::new());
                        self.inner.catalog.insert(start, Arc::clone(&created));
                        created
                    }
                }
            }
        };

        trace!(
            level = self.inner.level_num,
            bucket = start,
            file_number = meta.file_number,
            "segment added"
        );
        bucket.insert(SegmentRef(meta));
        Ok(())
    }

    /// Segments in the bucket containing `time`, newest first.
    pub fn files_at(&self, time: u64) -> Vec<Arc<FileMeta>> {
        self.inner
            .catalog
            .get(&self.bucket(time))
            .map(|e| e.value().iter().map(|s| Arc::clone(&s.value().0)).collect())
            .unwrap_or_default()
    }

    /// Every segment, bucket by bucket in ascending order, newest first within a bucket.
    pub fn all_files(&self) -> Vec<Arc<FileMeta>> {
        self.inner
            .catalog
            .iter()
            .flat_map(|e| {
                e.value()
                    .iter()
                    .map(|s| Arc::clone(&s.value().0))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Bucket starts currently present, ascending.
    pub fn buckets(&self) -> Vec<u64> {
        self.inner.catalog.iter().map(|e| *e.key()).collect()
    }

    /// Number of buckets currently present.
    pub fn bucket_count(&self) -> usize {
        self.inner.catalog.len()
    }

    /// Deletes every segment in buckets starting before `after_time`.
    ///
    /// Every eligible segment is attempted. Deleted segments leave the
    /// catalog; a bucket is dropped only once it is empty. Segments whose
    /// file could not be removed stay registered, and the call fails with
    /// [`LevelError::Retire`] carrying the first error, so it can be retried.
    ///
    /// Returns the number of segments retired.
    pub fn retire(&self, after_time: u64) -> Result<usize, LevelError> {
        let eligible: Vec<(u64, Bucket)> = self
            .inner
            .catalog
            .range(..after_time)
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();

        let mut retired = 0usize;
        let mut failed = 0usize;
        let mut first_error: Option<io::Error> = None;

        for (start, bucket) in eligible {
            for seg in bucket.iter() {
                let meta = &seg.value().0;
                match self.inner.fm.delete(&meta.path) {
                    Ok(()) => {
                        seg.remove();
                        retired += 1;
                    }
                    Err(e) => {
                        warn!(
                            level = self.inner.level_num,
                            path = %meta.path.display(),
                            error = %e,
                            "failed to retire segment"
                        );
                        failed += 1;
                        first_error.get_or_insert(e);
                    }
                }
            }
            self.drop_bucket_if_empty(start, &bucket)?;
        }

        debug!(
            level = self.inner.level_num,
            after_time, retired, failed, "retire finished"
        );
        match first_error {
            None => Ok(retired),
            Some(source) => Err(LevelError::Retire { failed, source }),
        }
    }

    fn drop_bucket_if_empty(&self, start: u64, bucket: &Bucket) -> Result<(), LevelError> {
        let _gate = self
            .inner
            .bucket_gate
            .write()
            .map_err(|_| LevelError::Internal("RwLock poisoned".into()))?;
        if !bucket.is_empty() {
            return Ok(());
        }
        if let Some(entry) = self.inner.catalog.get(&start) {
            if Arc::ptr_eq(entry.value(), bucket) {
                entry.remove();
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Point lookup; the newest segment holding `key` wins.
    pub fn get_value(&self, key: &InternalKey) -> Result<Option<Vec<u8>>, LevelError> {
        let cmp = self.inner.fm.comparator();
        for meta in self.files_at(key.time) {
            if !meta.contains(key, cmp) {
                continue;
            }
            let storage = match FileStorage::open(&meta.path) {
                Ok(s) => s,
                // Retired since the snapshot was taken.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let segment = Segment::open(storage)?;
            if let Some(value) = segment.get(key, cmp)? {
                trace!(
                    level = self.inner.level_num,
                    key = %key,
                    file_number = meta.file_number,
                    "point lookup hit"
                );
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// A cursor over the whole level.
    pub fn iterator(&self) -> LevelSeekIterator {
        LevelSeekIterator::new(self.clone())
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Writes `entries` as one new segment per bucket and registers them.
    ///
    /// Entries may arrive in any order; within the batch the last value
    /// written for a key wins.
    pub fn write_segment(&self, entries: Vec<Entry>) -> Result<Vec<Arc<FileMeta>>, LevelError> {
        let fm = &self.inner.fm;
        let mut groups: BTreeMap<u64, Vec<Entry>> = BTreeMap::new();
        for entry in entries {
            groups.entry(self.bucket(entry.0.time)).or_default().push(entry);
        }

        let mut written = Vec::with_capacity(groups.len());
        for (start, mut group) in groups {
            group.sort_by(|a, b| fm.compare(&a.0, &b.0));
            let mut run: Vec<Entry> = Vec::with_capacity(group.len());
            for entry in group {
                match run.last_mut() {
                    Some(last) if fm.compare(&last.0, &entry.0) == Ordering::Equal => *last = entry,
                    _ => run.push(entry),
                }
            }

            let file_number = fm.allocate_file_number();
            let path = fm
                .store_dir()
                .join(segment_file_name(start, file_number, self.inner.level_num));
            let head = SegmentWriter::new(&path).build(&run, fm.comparator())?;
            let meta = Arc::new(FileMeta::from_head(file_number, path, &head));
            self.add(start, Arc::clone(&meta))?;
            written.push(meta);
        }
        Ok(written)
    }

    // --------------------------------------------------------------------------------------------
    // Recovery
    // --------------------------------------------------------------------------------------------

    /// Rebuilds the catalog from the segment files of this level.
    ///
    /// Returns the number of segments registered.
    pub fn recover(&self) -> Result<usize, LevelError> {
        let fm = &self.inner.fm;
        let mut recovered = 0usize;

        let mut paths = Vec::new();
        for entry in fs::read_dir(fm.store_dir())? {
            let path = entry?.path();
            if SegmentName::is_segment_path(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let Some(name) = SegmentName::parse(&file_name) else {
                self.reject(&path, format!("unparsable segment name {file_name:?}"))?;
                continue;
            };
            if name.level != self.inner.level_num {
                continue;
            }
            let head = match read_head(&path) {
                Ok(head) => head,
                Err(e) => {
                    self.reject(&path, e.to_string())?;
                    continue;
                }
            };
            if fm.compare(&head.smallest, &head.largest) == Ordering::Greater {
                self.reject(
                    &path,
                    format!("bounds inverted: {} > {}", head.smallest, head.largest),
                )?;
                continue;
            }

            let meta = Arc::new(FileMeta::from_head(name.file_number, &path, &head));
            self.add(name.time, meta)?;
            fm.observe_file_number(name.file_number);
            recovered += 1;
            debug!(
                level = self.inner.level_num,
                path = %path.display(),
                file_number = name.file_number,
                "segment recovered"
            );
        }

        info!(
            level = self.inner.level_num,
            segments = recovered,
            buckets = self.inner.catalog.len(),
            "level recovered"
        );
        Ok(recovered)
    }

    /// Applies the recovery policy to an unusable file.
    fn reject(&self, path: &Path, reason: String) -> Result<(), LevelError> {
        match self.inner.recovery_policy {
            RecoveryPolicy::Abort => Err(LevelError::Recovery {
                path: path.to_path_buf(),
                reason,
            }),
            RecoveryPolicy::Quarantine => {
                let mut target = path.as_os_str().to_os_string();
                target.push(QUARANTINE_SUFFIX);
                fs::rename(path, &target)?;
                warn!(
                    level = self.inner.level_num,
                    path = %path.display(),
                    reason = %reason,
                    "segment quarantined"
                );
                Ok(())
            }
        }
    }
}

fn read_head(path: &Path) -> Result<Head, SegmentError> {
    let storage = FileStorage::open(path)?;
    Head::read_from(&storage)
}

// ------------------------------------------------------------------------------------------------
// Workers
// ------------------------------------------------------------------------------------------------

fn run_worker(
    inner: Weak<LevelInner>,
    worker: usize,
    period: Duration,
    stop: channel::Receiver<()>,
) {
    loop {
        if matches!(stop.try_recv(), Err(channel::TryRecvError::Disconnected)) {
            break;
        }
        let Some(inner) = inner.upgrade() else { break };
        let level = Level { inner };
        level.inner.processed.fetch_add(1, AtomicOrdering::Relaxed);

        let policy = Arc::clone(&level.inner.policy);
        if let Err(e) = task::run_guarded(policy.as_ref(), &level, worker) {
            level.inner.errors.fetch_add(1, AtomicOrdering::Relaxed);
            warn!(
                level = level.inner.level_num,
                worker,
                policy = policy.name(),
                error = %e,
                "maintenance cycle failed"
            );
        }
        drop(level);

        match stop.recv_timeout(period) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }
    }
    trace!(worker, "maintenance worker exited");
}
