//! The tick-driven scheduler: a monotonic logical clock that dispatches
//! ready, dependency-satisfied work into a [`crate::pool::WorkStealingPool`].

mod tick_task;

pub use tick_task::{ScheduleRequest, TickTaskHandle, TickTaskInfo};
use tick_task::{closure_arc, PendingEntry};

use crate::config::{Config, Mode};
use crate::error::CoreError;
use crate::pool::WorkStealingPool;
use crate::record::Record;
use crate::task::{Status, Task};

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

/// Fired after a dispatched task's closure returns, regardless of
/// success or failure, once the state transition has landed.
pub type CompletionCallback = Arc<dyn Fn(&Task) + Send + Sync>;

struct WatchEntry {
    id: u64,
    task: Arc<Mutex<Task>>,
    completion: Option<CompletionCallback>,
    /// Arbitrates which of {timeout watcher, the dispatch closure's own
    /// natural finish} performs the one-time terminal bookkeeping.
    flagged: Arc<AtomicBool>,
}

struct Inner {
    pool: WorkStealingPool,
    pending: RwLock<Vec<PendingEntry>>,
    next_id: AtomicU64,
    current_tick: AtomicU64,
    paused: AtomicBool,
    mode: RwLock<Mode>,
    tick_length_ms: AtomicU64,
    max_concurrent: AtomicUsize,
    outstanding: AtomicUsize,
    completed_ids: RwLock<HashSet<u64>>,
    failed_ids: RwLock<HashSet<u64>>,
    timeout_watch: Mutex<Vec<WatchEntry>>,
    auto_thread: Mutex<Option<thread::JoinHandle<()>>>,
    stop_auto: Arc<AtomicBool>,
}

/// A monotonically advancing logical clock driving dispatch of registered
/// tasks. Cheaply cloneable; clones share the same scheduler state.
///
/// Takes a non-owning reference to a pool at construction rather than
/// owning or globally singleton-ing it, so multiple independent
/// schedulers (and pools) can coexist in one process — primarily valuable
/// for hermetic tests.
#[derive(Clone)]
pub struct TickScheduler(Arc<Inner>);

impl TickScheduler {
    pub fn new(pool: WorkStealingPool, config: &Config) -> Result<Self, CoreError> {
        config.validate()?;
        let inner = Arc::new(Inner {
            pool,
            pending: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            current_tick: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            mode: RwLock::new(config.mode),
            tick_length_ms: AtomicU64::new(config.tick_length_ms),
            max_concurrent: AtomicUsize::new(config.max_concurrent),
            outstanding: AtomicUsize::new(0),
            completed_ids: RwLock::new(HashSet::new()),
            failed_ids: RwLock::new(HashSet::new()),
            timeout_watch: Mutex::new(Vec::new()),
            auto_thread: Mutex::new(None),
            stop_auto: Arc::new(AtomicBool::new(false)),
        });
        let scheduler = Self(inner);
        if config.mode == Mode::Auto {
            scheduler.spawn_auto_thread();
        }
        Ok(scheduler)
    }

    fn spawn_auto_thread(&self) {
        self.0.stop_auto.store(false, Ordering::SeqCst);
        let scheduler = self.clone();
        let stop = Arc::clone(&self.0.stop_auto);
        let handle = thread::Builder::new()
            .name("tickforge-scheduler".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    if scheduler.0.paused.load(Ordering::Acquire) {
                        thread::sleep(Duration::from_millis(10));
                        continue;
                    }
                    scheduler.sweep();
                    let tick_len = scheduler.0.tick_length_ms.load(Ordering::Relaxed);
                    thread::sleep(Duration::from_millis(tick_len));
                    scheduler.0.current_tick.fetch_add(1, Ordering::SeqCst);
                }
            })
            .expect("failed to spawn scheduler thread");
        *self.0.auto_thread.lock().unwrap() = Some(handle);
    }

    fn stop_auto_thread(&self) {
        self.0.stop_auto.store(true, Ordering::SeqCst);
        if let Some(handle) = self.0.auto_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    // ---- introspection ----

    pub fn current_tick(&self) -> u64 {
        self.0.current_tick.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.0.paused.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.0.pending.read().unwrap().len()
    }

    pub fn pending_ids(&self) -> Vec<u64> {
        self.0.pending.read().unwrap().iter().map(|e| e.id).collect()
    }

    pub fn get_by_id(&self, id: u64) -> Option<TickTaskInfo> {
        self.0
            .pending
            .read()
            .unwrap()
            .iter()
            .find(|e| e.id == id)
            .map(TickTaskInfo::from)
    }

    // ---- mode / pacing control ----

    pub fn pause(&self) {
        self.0.paused.store(true, Ordering::Release);
        tracing::info!("scheduler paused");
    }

    pub fn resume(&self) {
        self.0.paused.store(false, Ordering::Release);
        tracing::info!("scheduler resumed");
    }

    pub fn set_max_concurrent(&self, n: usize) {
        self.0.max_concurrent.store(n, Ordering::Relaxed);
    }

    pub fn set_tick_length(&self, ms: u64) {
        self.0.tick_length_ms.store(ms, Ordering::Relaxed);
    }

    pub fn switch_manual(&self) {
        if *self.0.mode.read().unwrap() == Mode::Manual {
            return;
        }
        self.stop_auto_thread();
        *self.0.mode.write().unwrap() = Mode::Manual;
        tracing::info!("scheduler switched to manual mode");
    }

    pub fn switch_auto(&self) {
        if *self.0.mode.read().unwrap() == Mode::Auto {
            return;
        }
        *self.0.mode.write().unwrap() = Mode::Auto;
        self.spawn_auto_thread();
        tracing::info!("scheduler switched to automatic mode");
    }

    /// Valid only in manual mode: performs one tick's worth of dispatch
    /// and increments the clock by one. Rejected (logged, no state
    /// change) in automatic mode. Returns whether it actually fired.
    pub fn trigger(&self) -> bool {
        if *self.0.mode.read().unwrap() != Mode::Manual {
            tracing::error!("trigger() called while scheduler is in automatic mode");
            return false;
        }
        self.sweep();
        self.0.current_tick.fetch_add(1, Ordering::SeqCst);
        true
    }

    // ---- registration ----

    pub fn schedule<F>(&self, request: ScheduleRequest, closure: F) -> TickTaskHandle
    where
        F: Fn(&Record) -> Result<Record, CoreError> + Send + Sync + 'static,
    {
        let id = self.0.next_id.fetch_add(1, Ordering::SeqCst);
        let mut base_target = if request.relative {
            self.current_tick() + request.target_tick
        } else {
            request.target_tick
        };

        let mut pending = self.0.pending.write().unwrap();
        let insert_at = if let Some(after_id) = request.after_task {
            match pending.iter().position(|e| e.id == after_id) {
                Some(pos) => {
                    base_target = pending[pos].target_tick;
                    pos + 1
                }
                None => pending.len(),
            }
        } else {
            pending.len()
        };
        let target_tick = base_target + request.delay;

        let entry = PendingEntry {
            id,
            target_tick,
            priority: request.priority,
            closure: closure_arc(closure),
            dependencies: Vec::new(),
            completion: None,
            retry_count: request.retry_count,
            retry_interval: request.retry_interval,
            timeout: request.timeout,
            name: request.name,
            input: request.input,
        };
        pending.insert(insert_at.min(pending.len()), entry);
        drop(pending);

        TickTaskHandle::new(id, self.clone())
    }

    /// Removes a pending task by id. Returns `false` if it's not pending.
    pub fn cancel(&self, id: u64) -> bool {
        let mut pending = self.0.pending.write().unwrap();
        if let Some(pos) = pending.iter().position(|e| e.id == id) {
            pending.remove(pos);
            true
        } else {
            false
        }
    }

    /// Increases the target tick of the named task, or of every pending
    /// task if `id` is absent.
    pub fn delay(&self, id: Option<u64>, ticks: u64) -> Result<(), CoreError> {
        let mut pending = self.0.pending.write().unwrap();
        match id {
            Some(id) => match pending.iter_mut().find(|e| e.id == id) {
                Some(e) => {
                    e.target_tick += ticks;
                    Ok(())
                }
                None => Err(CoreError::UnknownTask(id)),
            },
            None => {
                for e in pending.iter_mut() {
                    e.target_tick += ticks;
                }
                Ok(())
            }
        }
    }

    /// Appends `dependency` to `task`'s dependency list. Must be called
    /// before `task` becomes ready.
    pub fn add_dependency(&self, task: &TickTaskHandle, dependency: &TickTaskHandle) -> Result<(), CoreError> {
        let mut pending = self.0.pending.write().unwrap();
        match pending.iter_mut().find(|e| e.id == task.id()) {
            Some(e) => {
                e.dependencies.push(dependency.id());
                Ok(())
            }
            None => Err(CoreError::UnknownTask(task.id())),
        }
    }

    /// Records a callback fired after the task's closure returns,
    /// regardless of success or failure.
    pub fn set_completion<F>(&self, task: &TickTaskHandle, callback: F) -> Result<(), CoreError>
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        let mut pending = self.0.pending.write().unwrap();
        match pending.iter_mut().find(|e| e.id == task.id()) {
            Some(e) => {
                e.completion = Some(Arc::new(callback));
                Ok(())
            }
            None => Err(CoreError::UnknownTask(task.id())),
        }
    }

    // ---- dispatch ----

    fn has_capacity(&self) -> bool {
        let cap = self.0.max_concurrent.load(Ordering::Relaxed);
        cap == 0 || self.0.outstanding.load(Ordering::SeqCst) < cap
    }

    fn any_dependency_failed(&self, deps: &[u64]) -> bool {
        if deps.is_empty() {
            return false;
        }
        let failed = self.0.failed_ids.read().unwrap();
        deps.iter().any(|d| failed.contains(d))
    }

    fn all_dependencies_completed(&self, deps: &[u64]) -> bool {
        if deps.is_empty() {
            return true;
        }
        let completed = self.0.completed_ids.read().unwrap();
        deps.iter().all(|d| completed.contains(d))
    }

    fn mark_completed(&self, id: u64) {
        self.0.completed_ids.write().unwrap().insert(id);
    }

    fn mark_failed(&self, id: u64) {
        self.0.completed_ids.write().unwrap().insert(id);
        self.0.failed_ids.write().unwrap().insert(id);
    }

    /// One pass over the pending list: checks outstanding dispatches for
    /// timeout expiry, then walks pending tasks for readiness, sorts the
    /// ready set by (target_tick, priority, registration) ascending, and
    /// dispatches as capacity allows.
    fn sweep(&self) {
        self.check_timeouts();

        let current = self.current_tick();
        let mut pending = self.0.pending.write().unwrap();

        let mut ready_idx = Vec::new();
        let mut dep_failed_idx = Vec::new();
        for (i, entry) in pending.iter().enumerate() {
            if entry.target_tick > current {
                continue;
            }
            if self.any_dependency_failed(&entry.dependencies) {
                dep_failed_idx.push(i);
            } else if self.all_dependencies_completed(&entry.dependencies) {
                ready_idx.push(i);
            }
        }

        let mut to_remove: Vec<usize> = ready_idx.iter().chain(dep_failed_idx.iter()).copied().collect();
        to_remove.sort_unstable();
        to_remove.dedup();

        let mut ready_entries = Vec::new();
        let mut dep_failed_entries = Vec::new();
        for &i in to_remove.iter().rev() {
            let entry = pending.remove(i);
            if dep_failed_idx.contains(&i) {
                dep_failed_entries.push(entry);
            } else {
                ready_entries.push(entry);
            }
        }
        drop(pending);

        tracing::debug!(
            ready = ready_entries.len(),
            dependency_failed = dep_failed_entries.len(),
            still_pending = self.pending_count(),
            "sweep"
        );

        for entry in dep_failed_entries {
            self.fail_dependency(entry);
        }

        ready_entries.sort_by_key(|e| (e.target_tick, e.priority.unwrap_or(i64::MAX), e.id));

        for entry in ready_entries {
            if !self.has_capacity() {
                self.0.pending.write().unwrap().push(entry);
                continue;
            }
            self.dispatch(entry);
        }
    }

    fn fail_dependency(&self, entry: PendingEntry) {
        let mut task = Task::new(
            uuid::Uuid::new_v4().to_string(),
            entry.name.clone(),
            entry.input.clone(),
            Arc::clone(&entry.closure),
        );
        // Short-circuits Pending -> Failed; the user closure never runs.
        let _ = task.fail(CoreError::DependencyFailed);
        self.mark_failed(entry.id);
        if let Some(cb) = &entry.completion {
            let _ = panic::catch_unwind(AssertUnwindSafe(|| cb(&task)));
        }
        tracing::error!(task_id = entry.id, "task failed: dependency did not complete successfully");
    }

    fn reinsert_retry(&self, mut entry: PendingEntry) {
        entry.retry_count = entry.retry_count.saturating_sub(1);
        entry.target_tick = self.current_tick() + entry.retry_interval;
        tracing::warn!(task_id = entry.id, retries_left = entry.retry_count, target_tick = entry.target_tick, "scheduling retry");
        self.0.pending.write().unwrap().push(entry);
    }

    fn dispatch(&self, entry: PendingEntry) {
        let task = Arc::new(Mutex::new(Task::new(
            uuid::Uuid::new_v4().to_string(),
            entry.name.clone(),
            entry.input.clone(),
            Arc::clone(&entry.closure),
        )));
        if let Some(timeout) = entry.timeout {
            task.lock().unwrap().set_timeout(timeout);
        }

        let flagged = Arc::new(AtomicBool::new(false));
        self.0.outstanding.fetch_add(1, Ordering::SeqCst);
        self.0.timeout_watch.lock().unwrap().push(WatchEntry {
            id: entry.id,
            task: Arc::clone(&task),
            completion: entry.completion.clone(),
            flagged: Arc::clone(&flagged),
        });

        let scheduler = self.clone();
        let retry_template = entry.clone();
        let completion = entry.completion.clone();
        let id = entry.id;
        let task_for_closure = Arc::clone(&task);

        let submitted = self.0.pool.submit(move || {
            // `begin` and `finish` bracket the actual closure call so the
            // task's lock is released while it runs — otherwise
            // `check_timeouts` would block on this same lock for the
            // closure's full duration instead of catching it early.
            let begun = task_for_closure.lock().unwrap().begin();
            if let Some((closure, input)) = begun {
                let outcome = crate::task::invoke_closure(&closure, &input);
                task_for_closure.lock().unwrap().finish(outcome);
            }

            if flagged.swap(true, Ordering::AcqRel) {
                // The timeout watcher already performed terminal
                // bookkeeping for this dispatch; this outcome is discarded.
                return;
            }
            scheduler.remove_from_watch(id);

            let (status, last_error) = {
                let guard = task_for_closure.lock().unwrap();
                (guard.status(), guard.last_error().cloned())
            };

            match status {
                Status::Completed => {
                    scheduler.mark_completed(id);
                    if let Some(cb) = &completion {
                        let guard = task_for_closure.lock().unwrap();
                        let _ = panic::catch_unwind(AssertUnwindSafe(|| cb(&guard)));
                    }
                    tracing::info!(task_id = id, "task dispatch completed");
                    scheduler.0.outstanding.fetch_sub(1, Ordering::SeqCst);
                }
                Status::Failed => {
                    let retryable = retry_template.retry_count > 0
                        && !matches!(
                            last_error,
                            Some(CoreError::DependencyFailed) | Some(CoreError::TimedOut)
                        );
                    if retryable {
                        scheduler.0.outstanding.fetch_sub(1, Ordering::SeqCst);
                        scheduler.reinsert_retry(retry_template.clone());
                    } else {
                        scheduler.mark_failed(id);
                        if let Some(cb) = &completion {
                            let guard = task_for_closure.lock().unwrap();
                            let _ = panic::catch_unwind(AssertUnwindSafe(|| cb(&guard)));
                        }
                        tracing::error!(task_id = id, error = ?last_error, "task dispatch failed");
                        scheduler.0.outstanding.fetch_sub(1, Ordering::SeqCst);
                    }
                }
                _ => unreachable!("Task::start drives the task to a terminal state synchronously"),
            }
        });

        if let Err(CoreError::PoolShuttingDown) = submitted {
            self.0.outstanding.fetch_sub(1, Ordering::SeqCst);
            self.remove_from_watch(id);
            tracing::warn!(task_id = id, "dispatch observed PoolShuttingDown, re-queueing");
            self.0.pending.write().unwrap().insert(0, entry);
        }
    }

    fn remove_from_watch(&self, id: u64) {
        self.0.timeout_watch.lock().unwrap().retain(|w| w.id != id);
    }

    /// Doubles as the scheduler's timeout watcher: scans outstanding
    /// dispatches for `now - run_start >= timeout` and fails anything over
    /// budget, independent of whether the real closure has returned.
    fn check_timeouts(&self) {
        let mut watch = self.0.timeout_watch.lock().unwrap();
        let mut to_complete = Vec::new();
        watch.retain(|w| {
            let timed_out = {
                let guard = w.task.lock().unwrap();
                guard.status() == Status::Running && guard.is_timed_out()
            };
            if !timed_out {
                return true;
            }
            if !w.flagged.swap(true, Ordering::AcqRel) {
                to_complete.push((w.id, Arc::clone(&w.task), w.completion.clone()));
            }
            false
        });
        drop(watch);

        for (id, task, completion) in to_complete {
            {
                let mut guard = task.lock().unwrap();
                let _ = guard.fail(CoreError::TimedOut);
            }
            self.mark_failed(id);
            if let Some(cb) = &completion {
                let guard = task.lock().unwrap();
                let _ = panic::catch_unwind(AssertUnwindSafe(|| cb(&guard)));
            }
            tracing::error!(task_id = id, "task timed out");
            self.0.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop_auto.store(true, Ordering::SeqCst);
        if let Some(handle) = self.auto_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
