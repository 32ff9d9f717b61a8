//! Worker pool draining the task queue.
//!
//! Each worker is an OS thread. A worker opens its data index connection,
//! then loops: check the abort flag and its own stop flag, wait briefly for
//! a task, check abort again, run the task.
//!
//! - A fatal task error (or a panic) triggers the process-wide abort.
//!   Every worker exits at its next check; nothing is drained afterwards.
//! - A recoverable task error ends the worker thread after the task has
//!   been cleaned up and requeued. `check` later respawns the worker with
//!   a fresh connection.

use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, info_span, warn};

use crate::abort::AbortToken;
use crate::error::{TaskError, TaskResult};
use crate::task::TaskQueue;

/// Establishes a worker's connection to the data index.
///
/// Called once at the start of every worker thread, including respawns.
pub trait Connector: Send + Sync {
    /// Connects for worker `index`.
    fn connect(&self, index: usize) -> TaskResult;
}

/// A connector for pools that need no per-worker connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopConnector;

impl Connector for NoopConnector {
    fn connect(&self, _index: usize) -> TaskResult {
        Ok(())
    }
}

/// The pool interface consumed by the update loop.
pub trait Pool: Send + Sync {
    /// Adds a worker. Best effort: returns false if the pool could not be changed right now.
    fn add_worker(&self) -> bool;
    /// Stops the highest-indexed worker after its current task. Best effort.
    fn del_worker(&self) -> bool;
    /// Respawns workers that exited after a recoverable error. Returns how many were respawned.
    fn check(&self) -> usize;
    /// Stops all workers and waits for them to exit.
    fn shutdown(&self);
    /// Number of live workers.
    fn len(&self) -> usize;
    /// True if the pool has no workers.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerExit {
    Stopped,
    Aborted,
    Reconnect,
}

struct Worker {
    index: usize,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<WorkerExit>>,
}

struct Workers {
    live: Vec<Worker>,
    retired: Vec<Worker>,
}

/// A resizable pool of worker threads.
pub struct WorkerPool<K> {
    queue: Arc<TaskQueue<K>>,
    abort: AbortToken,
    connector: Arc<dyn Connector>,
    poll_interval: Duration,
    workers: Mutex<Workers>,
}

impl<K> WorkerPool<K>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
{
    /// Creates a pool and starts `num_workers` workers.
    pub fn new(
        num_workers: usize,
        queue: Arc<TaskQueue<K>>,
        abort: AbortToken,
        connector: Arc<dyn Connector>,
        poll_interval: Duration,
    ) -> Self {
        let pool = Self {
            queue,
            abort,
            connector,
            poll_interval,
            workers: Mutex::new(Workers {
                live: Vec::new(),
                retired: Vec::new(),
            }),
        };
        {
            let mut workers = pool.workers.lock();
            for index in 0..num_workers {
                let worker = pool.spawn(index);
                workers.live.push(worker);
            }
        }
        info!("Started worker pool with {} workers", num_workers);
        pool
    }

    fn spawn(&self, index: usize) -> Worker {
        let stop = Arc::new(AtomicBool::new(false));
        let queue = Arc::clone(&self.queue);
        let abort = self.abort.clone();
        let connector = Arc::clone(&self.connector);
        let poll = self.poll_interval;
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("worker-{}", index))
            .spawn(move || worker_loop(index, &queue, &abort, connector.as_ref(), &flag, poll));
        match handle {
            Ok(handle) => Worker {
                index,
                stop,
                handle: Some(handle),
            },
            Err(err) => {
                // Thread creation failure leaves a dead slot; check() retries it.
                warn!("Unable to spawn worker {}: {}", index, err);
                Worker {
                    index,
                    stop,
                    handle: None,
                }
            }
        }
    }

    /// The abort token shared with the workers.
    pub fn abort_token(&self) -> &AbortToken {
        &self.abort
    }
}

impl<K> Pool for WorkerPool<K>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
{
    fn add_worker(&self) -> bool {
        let Some(mut workers) = self.workers.try_lock() else {
            debug!("Worker pool busy; not adding worker");
            return false;
        };
        let index = workers.live.len();
        let worker = self.spawn(index);
        workers.live.push(worker);
        info!("Added worker {}", index);
        true
    }

    fn del_worker(&self) -> bool {
        let Some(mut workers) = self.workers.try_lock() else {
            debug!("Worker pool busy; not removing worker");
            return false;
        };
        let Some(worker) = workers.live.pop() else {
            return false;
        };
        worker.stop.store(true, Ordering::SeqCst);
        info!("Stopping worker {}", worker.index);
        workers.retired.push(worker);
        true
    }

    fn check(&self) -> usize {
        let mut workers = self.workers.lock();
        workers
            .retired
            .retain(|w| w.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false));

        if self.abort.is_aborted() {
            return 0;
        }

        let mut respawned = 0;
        for slot in 0..workers.live.len() {
            let worker = &mut workers.live[slot];
            if worker.stop.load(Ordering::SeqCst) {
                continue;
            }
            let finished = worker
                .handle
                .as_ref()
                .map(|h| h.is_finished())
                .unwrap_or(true);
            if !finished {
                continue;
            }
            let exit = match worker.handle.take() {
                Some(handle) => handle.join().unwrap_or(WorkerExit::Aborted),
                None => WorkerExit::Reconnect,
            };
            if exit != WorkerExit::Reconnect {
                // Dead slot; never respawned.
                worker.stop.store(true, Ordering::SeqCst);
                continue;
            }
            let index = workers.live[slot].index;
            info!("Respawning worker {}", index);
            workers.live[slot] = self.spawn(index);
            respawned += 1;
        }
        respawned
    }

    fn shutdown(&self) {
        let mut workers = self.workers.lock();
        let mut all: Vec<Worker> = workers.live.drain(..).collect();
        all.append(&mut workers.retired);
        for worker in &all {
            worker.stop.store(true, Ordering::SeqCst);
        }
        for mut worker in all {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    warn!("Worker {} panicked during shutdown", worker.index);
                }
            }
        }
        info!("Worker pool shut down");
    }

    fn len(&self) -> usize {
        self.workers.lock().live.len()
    }
}

fn worker_loop<K>(
    index: usize,
    queue: &TaskQueue<K>,
    abort: &AbortToken,
    connector: &dyn Connector,
    stop: &AtomicBool,
    poll: Duration,
) -> WorkerExit
where
    K: Clone + Eq + Hash + Debug,
{
    let span = info_span!("worker", index);
    let _enter = span.enter();

    if let Err(err) = connector.connect(index) {
        return classify(err, abort);
    }
    debug!("Worker {} connected", index);

    loop {
        if abort.is_aborted() {
            return WorkerExit::Aborted;
        }
        if stop.load(Ordering::SeqCst) {
            debug!("Worker {} stopping", index);
            return WorkerExit::Stopped;
        }
        let Some((_key, task)) = queue.get(poll) else {
            continue;
        };
        if abort.is_aborted() {
            return WorkerExit::Aborted;
        }
        let name = task.name().to_string();
        let outcome = catch_unwind(AssertUnwindSafe(|| task.run(queue)))
            .unwrap_or_else(|_| Err(TaskError::fatal(format!("task {} panicked", name))));
        if let Err(err) = outcome {
            return classify(err, abort);
        }
    }
}

fn classify(err: TaskError, abort: &AbortToken) -> WorkerExit {
    match err {
        TaskError::Recoverable { cause } => {
            warn!("Worker exiting to reconnect: {}", cause);
            WorkerExit::Reconnect
        }
        TaskError::Fatal { cause } => {
            error!("Fatal error, aborting: {}", cause);
            abort.trigger(cause);
            WorkerExit::Aborted
        }
    }
}

/// Runs queued tasks in the calling thread until the queue has nothing runnable.
///
/// Stops early, without error, on a recoverable failure (the task has been
/// requeued for the next pass). A fatal failure triggers `abort` and is returned.
pub fn drain_serial<K>(queue: &TaskQueue<K>, abort: &AbortToken) -> TaskResult
where
    K: Clone + Eq + Hash + Debug,
{
    while !abort.is_aborted() {
        let Some((_key, task)) = queue.get(Duration::ZERO) else {
            break;
        };
        let name = task.name().to_string();
        let outcome = catch_unwind(AssertUnwindSafe(|| task.run(queue)))
            .unwrap_or_else(|_| Err(TaskError::fatal(format!("task {} panicked", name))));
        match outcome {
            Ok(()) => {}
            Err(err @ TaskError::Recoverable { .. }) => {
                warn!("Serial drain interrupted: {}", err);
                return Ok(());
            }
            Err(err) => {
                error!("Fatal error, aborting: {}", err);
                abort.trigger(err.to_string());
                return Err(err);
            }
        }
    }
    Ok(())
}

/// A pool with no workers, for fully serial operation.
///
/// Queued tasks are run by the caller via `run_pending`.
pub struct EmptyPool<K> {
    queue: Arc<TaskQueue<K>>,
    abort: AbortToken,
}

impl<K> EmptyPool<K>
where
    K: Clone + Eq + Hash + Debug,
{
    /// Creates the serial pool.
    pub fn new(queue: Arc<TaskQueue<K>>, abort: AbortToken) -> Self {
        Self { queue, abort }
    }

    /// Drains the queue in the calling thread.
    pub fn run_pending(&self) -> TaskResult {
        drain_serial(&self.queue, &self.abort)
    }
}

impl<K> Pool for EmptyPool<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync,
{
    fn add_worker(&self) -> bool {
        info!("Serial mode: not adding worker");
        false
    }

    fn del_worker(&self) -> bool {
        false
    }

    fn check(&self) -> usize {
        0
    }

    fn shutdown(&self) {}

    fn len(&self) -> usize {
        0
    }
}
