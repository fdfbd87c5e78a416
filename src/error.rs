//! Crate-wide error taxonomy.
//!
//! One enum covers every fallible path through the pool, scheduler, and
//! task state machine. Only [`CoreError::InvalidConfiguration`] is fatal to
//! construction; every other variant is routed to a future, a termination
//! hook, a completion callback, or a log record — never a panic.

use thiserror::Error;

/// The crate-wide error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Raised from inside a user closure.
    #[error("task closure failed: {0}")]
    UserError(String),

    /// Raised by `Task::cancel`.
    #[error("task was canceled")]
    TaskCanceled,

    /// Raised by the scheduler when a Running task exceeds its timeout.
    #[error("task timed out")]
    TimedOut,

    /// Raised when the scheduler is asked to dispatch a task whose
    /// dependency reached `Failed`.
    #[error("a dependency of this task failed")]
    DependencyFailed,

    /// Raised by `submit` after `stop_accepting`.
    #[error("pool is shutting down and no longer accepts work")]
    PoolShuttingDown,

    /// Raised by scheduler APIs keyed on an identifier that isn't present.
    #[error("no task with id {0}")]
    UnknownTask(u64),

    /// Raised at construction time for invalid settings.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}
