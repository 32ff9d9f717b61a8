//! Process-wide scheduler state, owned explicitly and shared by reference.
//!
//! Bundles the task queue, the abort flag, per-node byte reservations,
//! per-node directory tree locks and the runtime used to supervise
//! transfer subprocesses.

use std::sync::Arc;

use dashmap::DashMap;
use hoardfs_sched::{AbortToken, Task, TaskQueue};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

use crate::config::{DaemonConfig, TransferPolicy};
use crate::error::{ArchiveError, ArchiveResult};

/// Safety multiplier applied to requested sizes when checking free space.
///
/// Reservations are recorded at the requested size; only the comparison
/// against available space is scaled.
pub const DEFAULT_RESERVE_FACTOR: f64 = 2.0;

/// Bytes reserved for in-progress pulls, per node.
///
/// Each node's counter is guarded by its own map entry lock.
#[derive(Debug)]
pub struct ReservationTable {
    reserved: DashMap<String, u64>,
    factor: f64,
}

impl ReservationTable {
    /// Creates an empty table using `factor` as the safety multiplier.
    pub fn new(factor: f64) -> Self {
        Self {
            reserved: DashMap::new(),
            factor,
        }
    }

    /// The safety multiplier.
    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Attempts to reserve `size` bytes on `node`.
    ///
    /// `avail` returns the free bytes on the node, or `None` if unknown, in
    /// which case the reservation is granted. It is called before the
    /// node's entry is locked, so it may read this table. With
    /// `check_only` nothing is recorded.
    pub fn reserve<F>(&self, node: &str, size: u64, check_only: bool, avail: F) -> bool
    where
        F: FnOnce() -> Option<u64>,
    {
        let avail = avail();
        let mut entry = self.reserved.entry(node.to_string()).or_insert(0);
        let needed = (size as f64 * self.factor).ceil() as u64;
        if let Some(avail) = avail {
            let free = avail.saturating_sub(*entry);
            if needed > free {
                debug!(
                    "Reservation of {} bytes on {} refused: {} needed, {} free",
                    size, node, needed, free
                );
                return false;
            }
        }
        if !check_only {
            *entry = entry.saturating_add(size);
        }
        true
    }

    /// Releases `size` bytes previously reserved on `node`.
    pub fn release(&self, node: &str, size: u64) -> ArchiveResult<()> {
        let mut entry = self.reserved.entry(node.to_string()).or_insert(0);
        if size > *entry {
            return Err(ArchiveError::OverRelease {
                node: node.to_string(),
                requested: size,
                reserved: *entry,
            });
        }
        *entry -= size;
        Ok(())
    }

    /// Bytes currently reserved on `node`.
    pub fn reserved(&self, node: &str) -> u64 {
        self.reserved.get(node).map(|r| *r).unwrap_or(0)
    }
}

/// Shared state handed to every controller and task.
pub struct SchedulerState {
    queue: Arc<TaskQueue<String>>,
    abort: AbortToken,
    reservations: ReservationTable,
    tree_locks: DashMap<String, Arc<hoardfs_sched::UpDownLock>>,
    transfer: TransferPolicy,
    pull_search: bool,
    runtime: Runtime,
}

impl SchedulerState {
    /// Builds state from the daemon configuration.
    pub fn new(config: &DaemonConfig) -> ArchiveResult<Arc<Self>> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("hfs-transfer")
            .enable_all()
            .build()?;
        Ok(Arc::new(Self {
            queue: Arc::new(TaskQueue::new()),
            abort: AbortToken::new(),
            reservations: ReservationTable::new(config.reserve_factor),
            tree_locks: DashMap::new(),
            transfer: config.transfer.clone(),
            pull_search: config.pull_search,
            runtime,
        }))
    }

    /// The task queue.
    pub fn queue(&self) -> &Arc<TaskQueue<String>> {
        &self.queue
    }

    /// The process-wide abort flag.
    pub fn abort(&self) -> &AbortToken {
        &self.abort
    }

    /// Per-node byte reservations.
    pub fn reservations(&self) -> &ReservationTable {
        &self.reservations
    }

    /// Transfer timeout policy.
    pub fn transfer_policy(&self) -> &TransferPolicy {
        &self.transfer
    }

    /// Whether groups search their nodes before pulling.
    pub fn pull_search(&self) -> bool {
        self.pull_search
    }

    /// Runtime used to supervise transfer subprocesses.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// The directory tree lock for `node`, created on first use.
    pub fn tree_lock(&self, node: &str) -> Arc<hoardfs_sched::UpDownLock> {
        self.tree_locks
            .entry(node.to_string())
            .or_default()
            .clone()
    }

    /// Queues a task. Fails only once the queue is closed.
    pub fn submit(&self, task: Task<String>) -> ArchiveResult<()> {
        let name = task.name().to_string();
        task.submit(&self.queue).map_err(|e| {
            warn!("Unable to queue {}: {}", name, e);
            ArchiveError::from(e)
        })
    }
}
