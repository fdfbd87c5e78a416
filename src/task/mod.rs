//! A single unit of work and the state machine governing its lifecycle.

mod state_machine;

pub use state_machine::Status;
use state_machine::{Event, StateMachine};

use crate::error::CoreError;
use crate::panic_message;
use crate::record::Record;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The user function wrapped by a task. Reusable (`Fn`, not `FnOnce`) so a
/// retried attempt can share the same closure via reference counting
/// instead of recapturing it (see the design notes on capture semantics).
pub type TaskClosure = Arc<dyn Fn(&Record) -> Result<Record, CoreError> + Send + Sync>;

/// A hook fired from within a status's entry procedure.
pub type HookFn = Box<dyn Fn(&Task) + Send + Sync>;

/// The optional hook fired with the originating error when a task fails.
pub type TerminationHook = Box<dyn Fn(&CoreError) + Send + Sync>;

/// Invokes `closure` with `input`, catching a panic and turning it into a
/// `UserError` rather than letting it unwind into the caller (a worker
/// thread, typically). Kept free-standing so it can run without any `Task`
/// borrowed or locked.
pub(crate) fn invoke_closure(closure: &TaskClosure, input: &Record) -> Result<Record, CoreError> {
    match panic::catch_unwind(AssertUnwindSafe(|| closure(input))) {
        Ok(result) => result,
        Err(payload) => {
            let msg = panic_message(&*payload);
            tracing::error!(error = %msg, "task closure panicked");
            Err(CoreError::UserError(msg))
        }
    }
}

/// A task wraps a user closure, its input record, an optional result, and
/// the formal state machine `{Pending -> Running -> {Completed | Failed}}`.
///
/// Ownership is exclusive: a `Task` is assumed to be touched from one
/// thread at a time — the scheduler before dispatch, a worker during
/// execution — per the concurrency model. Hooks must not re-enter the task
/// from another thread.
pub struct Task {
    id: String,
    name: Option<String>,
    input: Record,
    result: Option<Record>,
    last_error: Option<CoreError>,
    state: StateMachine,
    progress: f64,
    timeout: Option<Duration>,
    termination_hook: Option<TerminationHook>,
    hooks: HashMap<Status, Vec<HookFn>>,
    closure: TaskClosure,
    created_at: Instant,
    run_start: Option<Instant>,
}

impl Task {
    /// Builds a new task in the `Pending` state. `id` is expected to be a
    /// process-unique identifier (a `uuid` v4 string, typically).
    pub fn new(id: String, name: Option<String>, input: Record, closure: TaskClosure) -> Self {
        Self {
            id,
            name,
            input,
            result: None,
            last_error: None,
            state: StateMachine::new(),
            progress: 0.0,
            timeout: None,
            termination_hook: None,
            hooks: HashMap::new(),
            closure,
            created_at: Instant::now(),
            run_start: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn params(&self) -> &Record {
        &self.input
    }

    pub fn result(&self) -> Option<&Record> {
        self.result.as_ref()
    }

    pub fn last_error(&self) -> Option<&CoreError> {
        self.last_error.as_ref()
    }

    pub fn status(&self) -> Status {
        self.state.current()
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Registers a hook invoked from within `status`'s entry procedure, in
    /// registration order, every time the task enters that status.
    pub fn register_hook(&mut self, status: Status, hook: HookFn) {
        self.hooks.entry(status).or_default().push(hook);
    }

    /// Installs the hook invoked with the originating error when the task
    /// reaches `Failed`.
    pub fn set_termination_hook(&mut self, hook: TerminationHook) {
        self.termination_hook = Some(hook);
    }

    pub fn set_timeout(&mut self, duration: Duration) {
        self.timeout = Some(duration);
    }

    /// True once `now - run_start >= timeout` while `Running`.
    pub fn is_timed_out(&self) -> bool {
        match (self.timeout, self.run_start, self.state.current()) {
            (Some(timeout), Some(start), Status::Running) => start.elapsed() >= timeout,
            _ => false,
        }
    }

    /// Updates progress (clamped to `[0.0, 1.0]`) and fires the
    /// `Running`-status hooks.
    pub fn set_progress(&mut self, p: f64) {
        self.progress = p.clamp(0.0, 1.0);
        self.fire_hooks(Status::Running);
    }

    /// Raises `Event::Start`. Valid only in `Pending`; otherwise a no-op.
    /// On success, synchronously runs the user closure (the transition's
    /// side effect) and drives the task all the way to a terminal state.
    ///
    /// This is the convenient all-in-one path for callers that aren't
    /// sharing the task across threads while it runs. A caller that wraps
    /// the task in a lock visible to another thread (a timeout watcher,
    /// say) should use [`Task::begin`] and [`Task::finish`] instead, so the
    /// lock isn't held for the duration of the closure itself.
    pub fn start(&mut self) {
        if let Some((closure, input)) = self.begin() {
            let outcome = invoke_closure(&closure, &input);
            self.finish(outcome);
        }
    }

    /// Raises `Event::Start`. On success, returns the closure and input the
    /// caller should invoke *without* holding any lock the task is behind —
    /// pass the outcome to [`Task::finish`] once it returns. Returns `None`
    /// if the task isn't `Pending`.
    pub fn begin(&mut self) -> Option<(TaskClosure, Record)> {
        if self.transition(Event::Start) {
            self.run_start = Some(Instant::now());
            Some((Arc::clone(&self.closure), self.input.clone()))
        } else {
            None
        }
    }

    /// Synchronously invokes the user closure with the input record and
    /// feeds the outcome to [`Task::finish`]. Equivalent to calling
    /// [`Task::begin`] immediately followed by [`Task::finish`], kept
    /// separate for callers already holding a closure/input pair from
    /// `begin`.
    pub fn run(&mut self) {
        let outcome = invoke_closure(&self.closure, &self.input);
        self.finish(outcome);
    }

    /// Applies the outcome of a closure invocation: `Ok` completes unless
    /// the timeout already elapsed while it ran, in which case it fails
    /// with `TimedOut` instead; `Err` fails with the propagated error.
    pub fn finish(&mut self, outcome: Result<Record, CoreError>) {
        match outcome {
            Ok(record) => {
                if self.is_timed_out() {
                    self.fail(CoreError::TimedOut);
                } else {
                    self.complete(record);
                }
            }
            Err(err) => {
                self.fail(err);
            }
        }
    }

    /// Sets the result, sets status to `Completed`, raises `Event::Complete`.
    /// A no-op unless currently `Running` (including when already
    /// `Completed` — idempotent).
    pub fn complete(&mut self, result: Record) -> bool {
        if self.state.current() != Status::Running {
            return false;
        }
        self.result = Some(result);
        self.transition(Event::Complete)
    }

    /// Sets status to `Failed`, invokes the termination hook with `err`,
    /// raises `Event::Fail`. A no-op once already terminal.
    pub fn fail(&mut self, err: CoreError) -> bool {
        let transitioned = self.transition(Event::Fail);
        if transitioned {
            if let Some(hook) = &self.termination_hook {
                let result = panic::catch_unwind(AssertUnwindSafe(|| hook(&err)));
                if result.is_err() {
                    tracing::error!(task_id = %self.id, "termination hook panicked");
                }
            }
            self.last_error = Some(err);
        }
        transitioned
    }

    /// Valid only in `Running`: clears the result, transitions to `Failed`,
    /// and returns the `TaskCanceled` error to the canceller. A no-op
    /// outside `Running` (logged as a misuse signal).
    pub fn cancel(&mut self) -> Result<(), CoreError> {
        if self.state.current() != Status::Running {
            tracing::error!(task_id = %self.id, status = ?self.state.current(), "cancel() called on a non-Running task");
            return Ok(());
        }
        self.result = None;
        self.fail(CoreError::TaskCanceled);
        Err(CoreError::TaskCanceled)
    }

    fn transition(&mut self, event: Event) -> bool {
        match self.state.apply(event) {
            Some(new_status) => {
                self.fire_hooks(new_status);
                true
            }
            None => false,
        }
    }

    fn fire_hooks(&self, status: Status) {
        if let Some(hooks) = self.hooks.get(&status) {
            for hook in hooks {
                let result = panic::catch_unwind(AssertUnwindSafe(|| hook(self)));
                if result.is_err() {
                    tracing::error!(task_id = %self.id, status = ?status, "status hook panicked");
                }
            }
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.state.current())
            .field("progress", &self.progress)
            .finish()
    }
}
