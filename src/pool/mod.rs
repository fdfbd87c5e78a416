//! A fixed-size bank of worker threads, each owning a private
//! double-ended queue, stealing from peers when idle.

mod handle;
mod queue;

pub use handle::JoinHandle;
pub(crate) use queue::Job;
use queue::WorkerQueue;

use crate::config::Config;
use crate::error::CoreError;
use crate::panic_message;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::Duration;

thread_local! {
    /// `(pool id, worker index)` of the pool this thread is a worker of,
    /// if any. Lets `submit` route work to the calling worker's own queue
    /// when called from inside a worker (as opposed to an outside caller,
    /// who always lands on queue 0).
    static CURRENT_WORKER: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

/// How long a worker blocks on the wake condition before re-checking
/// shutdown on its own; a safety net against a missed notification, not
/// the primary wakeup path.
const IDLE_RECHECK: Duration = Duration::from_millis(50);

struct Inner {
    id: u64,
    queues: RwLock<Vec<Arc<WorkerQueue>>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    /// Set only by `shutdown()`, never by `resize()`. `resize` drains each
    /// queue to empty before a worker exits; `shutdown` exits a worker as
    /// soon as its currently in-hand job finishes, discarding whatever is
    /// still queued.
    discard: Arc<AtomicBool>,
    accepting: AtomicBool,
    wake: Arc<(Mutex<bool>, Condvar)>,
}

/// A fixed-size, cheaply cloneable handle to the worker bank. Cloning
/// shares the same underlying pool (all clones observe the same queues,
/// the same shutdown state).
#[derive(Clone)]
pub struct WorkStealingPool(Arc<Inner>);

impl WorkStealingPool {
    /// Builds a pool per `config`, validating it first.
    pub fn new(config: &Config) -> Result<Self, CoreError> {
        config.validate()?;
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let queues: Vec<Arc<WorkerQueue>> = (0..config.worker_count)
            .map(|_| Arc::new(WorkerQueue::new()))
            .collect();
        let inner = Arc::new(Inner {
            id,
            queues: RwLock::new(queues),
            handles: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            discard: Arc::new(AtomicBool::new(false)),
            accepting: AtomicBool::new(true),
            wake: Arc::new((Mutex::new(false), Condvar::new())),
        });
        let pool = Self(inner);
        pool.spawn_workers(config.worker_count);
        tracing::info!(worker_count = config.worker_count, "pool constructed");
        Ok(pool)
    }

    fn spawn_workers(&self, n: usize) {
        let queues: Vec<Arc<WorkerQueue>> = self.0.queues.read().unwrap().clone();
        let mut handles = self.0.handles.lock().unwrap();
        for idx in 0..n {
            let queues = queues.clone();
            let shutdown = Arc::clone(&self.0.shutdown);
            let discard = Arc::clone(&self.0.discard);
            let wake = Arc::clone(&self.0.wake);
            let pool_id = self.0.id;
            let handle = thread::Builder::new()
                .name(format!("tickforge-worker-{idx}"))
                .spawn(move || worker_loop(idx, queues, shutdown, discard, wake, pool_id))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
    }

    /// Accepts a nullary closure, returning a handle that resolves to its
    /// return value (or any error it propagates, including a captured
    /// panic). Fails with `PoolShuttingDown` if the pool is no longer
    /// accepting work.
    pub fn submit<F, R>(&self, f: F) -> Result<JoinHandle<R>, CoreError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if !self.0.accepting.load(Ordering::Acquire) {
            return Err(CoreError::PoolShuttingDown);
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f));
            let result = match outcome {
                Ok(v) => Ok(v),
                Err(payload) => {
                    let msg = panic_message(&*payload);
                    tracing::error!(error = %msg, "submitted closure panicked");
                    Err(CoreError::UserError(msg))
                }
            };
            let _ = tx.send(result);
        });

        let queues = self.0.queues.read().unwrap();
        if queues.is_empty() {
            return Err(CoreError::PoolShuttingDown);
        }
        let target = CURRENT_WORKER.with(|c| match c.get() {
            Some((pool_id, idx)) if pool_id == self.0.id => idx % queues.len(),
            _ => 0,
        });
        queues[target].push_near(job);
        drop(queues);
        self.notify_one();
        Ok(JoinHandle { receiver: rx })
    }

    fn notify_one(&self) {
        let (lock, cvar) = &*self.0.wake;
        let _guard = lock.lock().unwrap();
        cvar.notify_one();
    }

    fn notify_all(&self) {
        let (lock, cvar) = &*self.0.wake;
        let _guard = lock.lock().unwrap();
        cvar.notify_all();
    }

    /// Marks the pool closed to new submissions; in-flight work continues.
    pub fn stop_accepting(&self) {
        self.0.accepting.store(false, Ordering::Release);
        tracing::info!("pool stopped accepting new submissions");
    }

    /// Stops accepting new work, drains existing work, then restarts with
    /// `n` workers. Blocks until every worker has joined.
    pub fn resize(&self, n: usize) -> Result<(), CoreError> {
        if n == 0 {
            return Err(CoreError::InvalidConfiguration(
                "worker_count must be greater than zero".to_string(),
            ));
        }
        tracing::info!(new_worker_count = n, "pool resize begun");
        self.0.accepting.store(false, Ordering::Release);
        self.0.shutdown.store(true, Ordering::SeqCst);
        self.notify_all();

        let mut handles = self.0.handles.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
        drop(handles);

        {
            let mut queues = self.0.queues.write().unwrap();
            *queues = (0..n).map(|_| Arc::new(WorkerQueue::new())).collect();
        }
        self.0.shutdown.store(false, Ordering::SeqCst);
        self.0.discard.store(false, Ordering::SeqCst);
        self.0.accepting.store(true, Ordering::Release);
        self.spawn_workers(n);
        tracing::info!(new_worker_count = n, "pool resize completed");
        Ok(())
    }

    /// Stops accepting work and joins every worker thread, letting each
    /// finish any task already in hand. Undispatched queue entries are
    /// discarded.
    pub fn shutdown(&self) {
        tracing::info!("pool shutdown begun");
        self.0.accepting.store(false, Ordering::Release);
        self.0.discard.store(true, Ordering::SeqCst);
        self.0.shutdown.store(true, Ordering::SeqCst);
        self.notify_all();
        let mut handles = self.0.handles.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
        tracing::info!("pool shutdown completed");
    }

    pub fn worker_count(&self) -> usize {
        self.0.queues.read().unwrap().len()
    }
}

fn worker_loop(
    idx: usize,
    queues: Vec<Arc<WorkerQueue>>,
    shutdown: Arc<AtomicBool>,
    discard: Arc<AtomicBool>,
    wake: Arc<(Mutex<bool>, Condvar)>,
    pool_id: u64,
) {
    CURRENT_WORKER.with(|c| c.set(Some((pool_id, idx))));
    let peer_count = queues.len();
    loop {
        // `discard` is only ever set by `shutdown()`. Checked before
        // looking for more work so a worker that just finished its
        // in-hand job exits immediately instead of draining (or stealing
        // into) the rest of the queue.
        if discard.load(Ordering::Acquire) {
            break;
        }

        if let Some(job) = queues[idx].pop_near() {
            job();
            continue;
        }

        let mut stolen = None;
        for offset in 1..peer_count {
            let peer = (idx + offset) % peer_count;
            if let Some(job) = queues[peer].steal_far() {
                tracing::debug!(worker = idx, from = peer, "stole work");
                stolen = Some(job);
                break;
            }
        }
        if let Some(job) = stolen {
            job();
            continue;
        }

        if shutdown.load(Ordering::Acquire) {
            break;
        }

        let (lock, cvar) = &*wake;
        let guard = lock.lock().unwrap();
        let _ = cvar.wait_timeout(guard, IDLE_RECHECK).unwrap();
    }
}
