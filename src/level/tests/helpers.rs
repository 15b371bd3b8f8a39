use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::key::{CodeThenTime, Entry, InternalKey};
use crate::level::{Level, LevelConfig, MaintenancePolicy, NoopPolicy, RecoveryPolicy};
use crate::manager::FileManager;
use crate::names::MemoryNameStore;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Manager over `dir` with the default comparator, an in-memory name
/// store and a retention window of 10 000.
pub fn file_manager(dir: &Path) -> Arc<FileManager> {
    init_tracing();
    Arc::new(FileManager::new(
        dir,
        Arc::new(CodeThenTime),
        Box::new(MemoryNameStore::default()),
        10_000,
    ))
}

/// Stopped level with `interval`-wide buckets and no maintenance work.
pub fn level(fm: &Arc<FileManager>, level_num: usize, interval: u64) -> Level {
    level_with(fm, level_num, interval, RecoveryPolicy::Abort, Arc::new(NoopPolicy))
}

/// Level with a fast worker pool (2 tasks, 5 ms period).
pub fn level_with(
    fm: &Arc<FileManager>,
    level_num: usize,
    interval: u64,
    recovery_policy: RecoveryPolicy,
    policy: Arc<dyn MaintenancePolicy>,
) -> Level {
    let config = LevelConfig {
        interval,
        tasks: 2,
        task_period: Duration::from_millis(5),
    };
    Level::new(level_num, config, recovery_policy, Arc::clone(fm), policy)
}

pub fn entry(code: u32, time: u64, value: &str) -> Entry {
    (InternalKey::new(code, time), value.as_bytes().to_vec())
}

/// Drains `next()` from the current position into `(code, time, value)` triples.
pub fn drain<I: crate::iterator::SeekIterator + ?Sized>(it: &mut I) -> Vec<(u32, u64, String)> {
    let mut out = Vec::new();
    while let Some((k, v)) = it.next().unwrap() {
        out.push((k.code, k.time, String::from_utf8(v).unwrap()));
    }
    out
}
