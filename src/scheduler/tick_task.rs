//! Scheduler-owned bookkeeping record for a registered task, plus the
//! request struct used to register one and the stable handle returned to
//! the caller.

use crate::record::Record;
use crate::task::TaskClosure;
use std::sync::Arc;
use std::time::Duration;

use super::TickScheduler;

/// Parameters for [`TickScheduler::schedule`]. A struct-with-`Default`
/// instead of an eight-positional-argument function — mirrors the
/// teacher's own settings-struct idiom (`RetryPolicy`).
#[derive(Clone)]
pub struct ScheduleRequest {
    /// Target tick, or an offset from the current tick if `relative`.
    pub target_tick: u64,
    /// If true, `target_tick` is added to the scheduler's current tick at
    /// registration time.
    pub relative: bool,
    /// Number of retry attempts remaining after the first.
    pub retry_count: u32,
    /// Ticks to wait between a failed attempt and its retry.
    pub retry_interval: u64,
    /// If set, the new task's target tick is taken from the referenced
    /// task (still pending), and it is inserted immediately after it.
    pub after_task: Option<u64>,
    /// A further offset added to the computed target tick.
    pub delay: u64,
    /// Wall-clock budget for a single dispatch attempt, starting when it
    /// enters `Running`.
    pub timeout: Option<Duration>,
    /// Lower value dispatches first among tasks ready on the same tick.
    pub priority: Option<i64>,
    pub name: Option<String>,
    pub input: Record,
}

impl Default for ScheduleRequest {
    fn default() -> Self {
        Self {
            target_tick: 0,
            relative: false,
            retry_count: 0,
            retry_interval: 1,
            after_task: None,
            delay: 0,
            timeout: None,
            priority: None,
            name: None,
            input: Record::new(),
        }
    }
}

/// The scheduler's bookkeeping record for one registered task. Exists only
/// while pending; dispatch removes it from the pending list and hands its
/// contents to a fresh [`crate::task::Task`].
#[derive(Clone)]
pub(crate) struct PendingEntry {
    pub(crate) id: u64,
    pub(crate) target_tick: u64,
    pub(crate) priority: Option<i64>,
    pub(crate) closure: TaskClosure,
    pub(crate) dependencies: Vec<u64>,
    pub(crate) completion: Option<super::CompletionCallback>,
    pub(crate) retry_count: u32,
    pub(crate) retry_interval: u64,
    pub(crate) timeout: Option<Duration>,
    pub(crate) name: Option<String>,
    pub(crate) input: Record,
}

/// A stable handle bearing the identifier a [`TickScheduler::schedule`]
/// call assigned.
#[derive(Clone)]
pub struct TickTaskHandle {
    id: u64,
    scheduler: TickScheduler,
}

impl TickTaskHandle {
    pub(crate) fn new(id: u64, scheduler: TickScheduler) -> Self {
        Self { id, scheduler }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Removes the task from the pending list. Returns `false` if it's no
    /// longer pending (already dispatched, completed, or never existed).
    pub fn cancel(&self) -> bool {
        self.scheduler.cancel(self.id)
    }

    /// A snapshot of the task's pending-list bookkeeping, if it's still
    /// pending.
    pub fn get(&self) -> Option<TickTaskInfo> {
        self.scheduler.get_by_id(self.id)
    }
}

/// A read-only snapshot of a pending task's bookkeeping fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickTaskInfo {
    pub id: u64,
    pub target_tick: u64,
    pub priority: Option<i64>,
    pub retry_count: u32,
    pub dependencies: Vec<u64>,
    pub name: Option<String>,
}

impl From<&PendingEntry> for TickTaskInfo {
    fn from(e: &PendingEntry) -> Self {
        Self {
            id: e.id,
            target_tick: e.target_tick,
            priority: e.priority,
            retry_count: e.retry_count,
            dependencies: e.dependencies.clone(),
            name: e.name.clone(),
        }
    }
}

pub(crate) fn closure_arc(
    f: impl Fn(&Record) -> Result<Record, crate::error::CoreError> + Send + Sync + 'static,
) -> TaskClosure {
    Arc::new(f)
}
