//! Fair multi-FIFO queue.
//!
//! A queue of queues: items are stored in one FIFO per key. Within a key,
//! items come out in insertion order. Across keys, `get` serves keys
//! round-robin, so a key with a deep backlog cannot starve the others.
//!
//! Each key also tracks how many of its items are in flight (handed out by
//! `get` but not yet acknowledged with `task_done`). An item put with the
//! exclusive flag is only handed out when its key has nothing in flight,
//! and while it is in flight no other item of that key is handed out.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{SchedError, SchedResult};

struct Entry<T> {
    item: T,
    exclusive: bool,
}

struct KeyState<T> {
    fifo: VecDeque<Entry<T>>,
    inflight: usize,
    exclusive_inflight: bool,
}

impl<T> KeyState<T> {
    fn new() -> Self {
        Self {
            fifo: VecDeque::new(),
            inflight: 0,
            exclusive_inflight: false,
        }
    }

    fn is_idle(&self) -> bool {
        self.fifo.is_empty() && self.inflight == 0
    }

    fn head_runnable(&self) -> bool {
        if self.exclusive_inflight {
            return false;
        }
        match self.fifo.front() {
            Some(entry) => !entry.exclusive || self.inflight == 0,
            None => false,
        }
    }
}

struct QueueInner<K, T> {
    keys: HashMap<K, KeyState<T>>,
    /// Keys with pending items, in service order.
    order: VecDeque<K>,
    last_key: Option<K>,
    pending: usize,
    inflight: usize,
    closed: bool,
}

impl<K: Clone + Eq + Hash, T> QueueInner<K, T> {
    fn select(&mut self) -> Option<(K, T)> {
        let mut chosen = None;
        let mut fallback = None;
        for (pos, key) in self.order.iter().enumerate() {
            let runnable = self.keys.get(key).map(KeyState::head_runnable).unwrap_or(false);
            if !runnable {
                continue;
            }
            if self.last_key.as_ref() == Some(key) {
                fallback.get_or_insert(pos);
                continue;
            }
            chosen = Some(pos);
            break;
        }

        let key = self.order.remove(chosen.or(fallback)?)?;
        let state = self.keys.get_mut(&key)?;
        let entry = state.fifo.pop_front()?;
        state.inflight += 1;
        if entry.exclusive {
            state.exclusive_inflight = true;
        }
        if !state.fifo.is_empty() {
            self.order.push_back(key.clone());
        }
        self.pending -= 1;
        self.inflight += 1;
        self.last_key = Some(key.clone());
        Some((key, entry.item))
    }
}

/// A queue-of-queues with per-key FIFO order and round-robin fairness across keys.
pub struct FairMultiFifoQueue<K, T> {
    inner: Mutex<QueueInner<K, T>>,
    cond: Condvar,
}

impl<K, T> FairMultiFifoQueue<K, T>
where
    K: Clone + Eq + Hash + Debug,
{
    /// Creates an empty, open queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                keys: HashMap::new(),
                order: VecDeque::new(),
                last_key: None,
                pending: 0,
                inflight: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Appends `item` to the tail of `key`'s FIFO.
    ///
    /// Never blocks. Fails only once the queue has been closed.
    pub fn put(&self, item: T, key: K, exclusive: bool) -> SchedResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SchedError::Shutdown);
        }
        let state = inner.keys.entry(key.clone()).or_insert_with(KeyState::new);
        let was_empty = state.fifo.is_empty();
        state.fifo.push_back(Entry { item, exclusive });
        if was_empty {
            inner.order.push_back(key);
        }
        inner.pending += 1;
        drop(inner);
        self.cond.notify_all();
        Ok(())
    }

    /// Waits up to `timeout` for a runnable item.
    ///
    /// Returns the item with its key, or `None` on timeout or once the queue
    /// is closed. The caller must acknowledge the item with `task_done`.
    pub fn get(&self, timeout: Duration) -> Option<(K, T)> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            if let Some(found) = inner.select() {
                return Some(found);
            }
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                return if inner.closed { None } else { inner.select() };
            }
        }
    }

    /// Acknowledges completion of one in-flight item for `key`.
    ///
    /// Releases the key's exclusivity, if held, and wakes blocked `get` callers.
    pub fn task_done(&self, key: &K) -> SchedResult<()> {
        let mut inner = self.inner.lock();
        let Some(state) = inner.keys.get_mut(key) else {
            return Err(SchedError::NotInFlight {
                key: format!("{:?}", key),
            });
        };
        if state.inflight == 0 {
            return Err(SchedError::NotInFlight {
                key: format!("{:?}", key),
            });
        }
        state.inflight -= 1;
        state.exclusive_inflight = false;
        if state.is_idle() {
            inner.keys.remove(key);
        }
        inner.inflight -= 1;
        drop(inner);
        self.cond.notify_all();
        Ok(())
    }

    /// Closes the queue. Further `put` calls fail and blocked `get` callers return `None`.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if !inner.closed {
            debug!("closing queue with {} pending items", inner.pending);
        }
        inner.closed = true;
        drop(inner);
        self.cond.notify_all();
    }

    /// True once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of pending (queued, not in-flight) items across all keys.
    pub fn qsize(&self) -> usize {
        self.inner.lock().pending
    }

    /// True when no items are pending.
    pub fn empty(&self) -> bool {
        self.qsize() == 0
    }

    /// Number of in-flight items across all keys.
    pub fn inflight_size(&self) -> usize {
        self.inner.lock().inflight
    }

    /// Number of pending items for `key`.
    pub fn pending(&self, key: &K) -> usize {
        self.inner
            .lock()
            .keys
            .get(key)
            .map(|s| s.fifo.len())
            .unwrap_or(0)
    }

    /// Number of in-flight items for `key`.
    pub fn inflight(&self, key: &K) -> usize {
        self.inner
            .lock()
            .keys
            .get(key)
            .map(|s| s.inflight)
            .unwrap_or(0)
    }

    /// True if `key` has neither pending nor in-flight items.
    pub fn key_idle(&self, key: &K) -> bool {
        self.inner
            .lock()
            .keys
            .get(key)
            .map(KeyState::is_idle)
            .unwrap_or(true)
    }

    /// Keys that currently have pending or in-flight items.
    pub fn keys(&self) -> Vec<K> {
        self.inner.lock().keys.keys().cloned().collect()
    }
}

impl<K, T> Default for FairMultiFifoQueue<K, T>
where
    K: Clone + Eq + Hash + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}
