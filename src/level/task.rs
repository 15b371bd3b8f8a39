//! Pluggable maintenance work run by a level's worker pool.
//!
//! The level only schedules: each worker calls
//! [`MaintenancePolicy::process`] once per cycle. What a cycle does
//! (downsampling into the next level, retention, merging small segments)
//! belongs to the policy. A failing or panicking cycle is counted and
//! logged by the worker and never stops the pool.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::debug;

use super::{Level, LevelError};

/// Errors reported by a maintenance cycle.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The policy gave up on this cycle.
    #[error("task failed: {0}")]
    Failed(String),

    /// The policy panicked; the payload is rendered as text.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// A level operation issued by the policy failed.
    #[error(transparent)]
    Level(#[from] LevelError),
}

/// Work performed by a level's workers.
///
/// Cycles may be abandoned at any point by `Level::stop` and must be safe
/// to run again from the start.
pub trait MaintenancePolicy: Send + Sync {
    /// Runs one cycle for `worker` of `level`.
    fn process(&self, level: &Level, worker: usize) -> Result<(), TaskError>;

    /// Short identifier, used in log output.
    fn name(&self) -> &str {
        "policy"
    }
}

impl<F> MaintenancePolicy for F
where
    F: Fn(&Level, usize) -> Result<(), TaskError> + Send + Sync,
{
    fn process(&self, level: &Level, worker: usize) -> Result<(), TaskError> {
        self(level, worker)
    }
}

/// Does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPolicy;

impl MaintenancePolicy for NoopPolicy {
    fn process(&self, _level: &Level, _worker: usize) -> Result<(), TaskError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "noop"
    }
}

/// Retires buckets older than the store's retention window.
///
/// Only worker 0 acts, so a level with several workers does not race
/// itself over the same buckets.
pub struct RetentionPolicy {
    clock: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl RetentionPolicy {
    /// Retention against wall-clock milliseconds since the Unix epoch.
    pub fn wall_clock() -> Self {
        Self::with_clock(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0)
        })
    }

    /// Retention against a caller-supplied clock, in key time units.
    pub fn with_clock(clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Self {
            clock: Box::new(clock),
        }
    }
}

impl MaintenancePolicy for RetentionPolicy {
    fn process(&self, level: &Level, worker: usize) -> Result<(), TaskError> {
        if worker != 0 {
            return Ok(());
        }
        let now = (self.clock)();
        let cutoff = now.saturating_sub(level.file_manager().max_period());
        let retired = level.retire(cutoff)?;
        if retired > 0 {
            debug!(level = level.level_num(), cutoff, retired, "retention pass");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "retention"
    }
}

/// Runs one cycle, turning a panic into [`TaskError::Panicked`].
pub(crate) fn run_guarded(
    policy: &dyn MaintenancePolicy,
    level: &Level,
    worker: usize,
) -> Result<(), TaskError> {
    match catch_unwind(AssertUnwindSafe(|| policy.process(level, worker))) {
        Ok(result) => result,
        Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}
