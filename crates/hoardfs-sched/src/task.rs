//! Units of work executed by the worker pool.
//!
//! A task body is a re-runnable closure: if it fails with a recoverable
//! error the same task is put back on the queue and run again later, so it
//! must capture what it needs by shared ownership rather than by move.
//!
//! Cleanup callbacks are registered by the body while it runs. They run once
//! the body returns, whether it succeeded, failed normally, or was abandoned
//! because the data index connection dropped.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{TaskError, TaskResult};
use crate::queue::FairMultiFifoQueue;

/// The queue type the pool drains.
pub type TaskQueue<K> = FairMultiFifoQueue<K, Task<K>>;

type TaskFn = Arc<dyn Fn(&mut TaskContext) -> TaskResult + Send + Sync>;

/// A cleanup callback.
pub type Cleanup = Box<dyn FnMut() -> TaskResult + Send>;

const CLEANUP_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Per-execution context handed to a task body.
pub struct TaskContext {
    name: String,
    cleanups: VecDeque<Cleanup>,
}

impl TaskContext {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cleanups: VecDeque::new(),
        }
    }

    /// Name of the running task.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a cleanup. With `first` it runs before all previously
    /// registered cleanups, otherwise after them.
    pub fn on_cleanup<F>(&mut self, cleanup: F, first: bool)
    where
        F: FnMut() -> TaskResult + Send + 'static,
    {
        if first {
            self.cleanups.push_front(Box::new(cleanup));
        } else {
            self.cleanups.push_back(Box::new(cleanup));
        }
    }

    /// Number of cleanups waiting to run.
    pub fn pending_cleanups(&self) -> usize {
        self.cleanups.len()
    }

    /// Runs all registered cleanups in order.
    ///
    /// A cleanup failing with a recoverable error is retried until it
    /// succeeds or fails some other way. A fatal cleanup error stops the
    /// run and is returned.
    fn run_cleanups(&mut self) -> TaskResult {
        while let Some(mut cleanup) = self.cleanups.pop_front() {
            loop {
                match cleanup() {
                    Ok(()) => break,
                    Err(TaskError::Recoverable { cause }) => {
                        warn!("Task {}: retrying cleanup after: {}", self.name, cause);
                        thread::sleep(CLEANUP_RETRY_DELAY);
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }
}

/// A unit of work bound to a queue key.
pub struct Task<K> {
    name: String,
    key: K,
    exclusive: bool,
    func: TaskFn,
}

impl<K: Clone> Clone for Task<K> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            key: self.key.clone(),
            exclusive: self.exclusive,
            func: Arc::clone(&self.func),
        }
    }
}

impl<K: Debug> Debug for Task<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("exclusive", &self.exclusive)
            .finish()
    }
}

impl<K> Task<K>
where
    K: Clone + Eq + Hash + Debug,
{
    /// Creates a non-exclusive task.
    pub fn new<F>(name: impl Into<String>, key: K, func: F) -> Self
    where
        F: Fn(&mut TaskContext) -> TaskResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            key,
            exclusive: false,
            func: Arc::new(func),
        }
    }

    /// Marks the task exclusive: it will not run concurrently with any
    /// other task of the same key.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Human-readable task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// True if the task is exclusive.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Puts the task on the tail of its key's FIFO.
    pub fn submit(self, queue: &TaskQueue<K>) -> crate::SchedResult<()> {
        let key = self.key.clone();
        let exclusive = self.exclusive;
        debug!("Queueing task {} for {:?}", self.name, key);
        queue.put(self, key, exclusive)
    }

    /// Executes the task body, runs its cleanups and acknowledges the queue.
    ///
    /// On a recoverable error the task is requeued after cleanup and the
    /// error is returned so the worker can retire. A fatal error is returned
    /// as-is; the queue is not acknowledged since no further draining happens.
    pub fn run(self, queue: &TaskQueue<K>) -> TaskResult {
        let mut ctx = TaskContext::new(&self.name);
        debug!("Beginning task {}", self.name);
        let outcome = (self.func)(&mut ctx);

        match outcome {
            Ok(()) => {
                ctx.run_cleanups()?;
                queue.task_done(&self.key)?;
                debug!("Finished task {}", self.name);
                Ok(())
            }
            Err(TaskError::Recoverable { cause }) => {
                warn!(
                    "Task {} abandoned after connection loss: {}; requeueing",
                    self.name, cause
                );
                ctx.run_cleanups()?;
                queue.task_done(&self.key)?;
                let name = self.name.clone();
                if let Err(err) = self.submit(queue) {
                    warn!("Unable to requeue task {}: {}", name, err);
                }
                Err(TaskError::Recoverable { cause })
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const NOW: Duration = Duration::ZERO;

    #[test]
    fn test_run_success_acknowledges_queue() {
        let queue: TaskQueue<String> = TaskQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        Task::new("count", "node1".to_string(), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .submit(&queue)
        .unwrap();

        let (key, task) = queue.get(NOW).unwrap();
        assert_eq!(key, "node1");
        task.run(&queue).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(queue.key_idle(&key));
    }

    #[test]
    fn test_cleanups_run_in_order_after_success() {
        let queue: TaskQueue<&'static str> = TaskQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        Task::new("ordered", "n", move |ctx| {
            let (a, b, c) = (Arc::clone(&l), Arc::clone(&l), Arc::clone(&l));
            ctx.on_cleanup(move || { a.lock().unwrap().push("second"); Ok(()) }, false);
            ctx.on_cleanup(move || { b.lock().unwrap().push("third"); Ok(()) }, false);
            ctx.on_cleanup(move || { c.lock().unwrap().push("first"); Ok(()) }, true);
            assert_eq!(ctx.pending_cleanups(), 3);
            Ok(())
        })
        .submit(&queue)
        .unwrap();

        let (_, task) = queue.get(NOW).unwrap();
        task.run(&queue).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_recoverable_requeues_and_cleans_up() {
        let queue: TaskQueue<&'static str> = TaskQueue::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let cleaned = Arc::new(AtomicUsize::new(0));
        let (a, c) = (Arc::clone(&attempts), Arc::clone(&cleaned));
        Task::new("flaky", "n", move |ctx| {
            let c = Arc::clone(&c);
            ctx.on_cleanup(move || { c.fetch_add(1, Ordering::SeqCst); Ok(()) }, false);
            if a.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TaskError::recoverable("lost connection"))
            } else {
                Ok(())
            }
        })
        .submit(&queue)
        .unwrap();

        let (_, task) = queue.get(NOW).unwrap();
        assert!(task.run(&queue).unwrap_err().is_recoverable());
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        assert_eq!(queue.qsize(), 1);
        assert_eq!(queue.inflight_size(), 0);

        let (_, task) = queue.get(NOW).unwrap();
        task.run(&queue).unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(cleaned.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cleanup_retried_on_recoverable() {
        let queue: TaskQueue<&'static str> = TaskQueue::new();
        let tries = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&tries);
        Task::new("retry-cleanup", "n", move |ctx| {
            let t = Arc::clone(&t);
            ctx.on_cleanup(
                move || {
                    if t.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TaskError::recoverable("still down"))
                    } else {
                        Ok(())
                    }
                },
                false,
            );
            Ok(())
        })
        .submit(&queue)
        .unwrap();

        let (_, task) = queue.get(NOW).unwrap();
        task.run(&queue).unwrap();
        assert_eq!(tries.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_fatal_cleanup_error_propagates() {
        let queue: TaskQueue<&'static str> = TaskQueue::new();
        Task::new("bad-cleanup", "n", |ctx| {
            ctx.on_cleanup(|| Err(TaskError::fatal("boom")), false);
            Ok(())
        })
        .submit(&queue)
        .unwrap();

        let (_, task) = queue.get(NOW).unwrap();
        assert_eq!(task.run(&queue), Err(TaskError::fatal("boom")));
    }

    #[test]
    fn test_fatal_body_error_not_requeued() {
        let queue: TaskQueue<&'static str> = TaskQueue::new();
        Task::new("fatal", "n", |_| Err(TaskError::fatal("corrupt")))
            .submit(&queue)
            .unwrap();
        let (_, task) = queue.get(NOW).unwrap();
        assert!(!task.run(&queue).unwrap_err().is_recoverable());
        assert!(queue.empty());
    }

    #[test]
    fn test_exclusive_builder() {
        let task = Task::new("x", 1u32, |_| Ok(())).exclusive();
        assert!(task.is_exclusive());
        assert_eq!(task.name(), "x");
        assert_eq!(*task.key(), 1);
    }
}
