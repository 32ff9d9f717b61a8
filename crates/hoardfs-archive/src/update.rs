//! The update loop: one pass turns index state into queued work.
//!
//! Each pass refreshes node and group I/O for active nodes, dispatches
//! pending copy requests into groups and queues per-node maintenance
//! (rechecks, deletions, auto-verify). Work is only queued for nodes whose
//! queue key is idle, so a slow node is never buried under repeats of
//! the same work.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hoardfs_sched::{drain_serial, Pool, TaskError};
use tracing::{debug, info, warn};

use crate::error::{ArchiveError, ArchiveResult, IndexError};
use crate::index::DataIndex;
use crate::io::ops::{self, group_key};
use crate::io::{GroupEnv, GroupIo, IoRegistry, NodeEnv, NodeIo};
use crate::state::SchedulerState;
use crate::types::{HasFile, WantsFile};

const IDLE_POLL: Duration = Duration::from_millis(50);
const ABORT_POLL: Duration = Duration::from_millis(250);

/// Counts of work queued by one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Active, initialised nodes.
    pub nodes: usize,
    /// Usable groups.
    pub groups: usize,
    /// Requests dispatched.
    pub requests: usize,
    /// Copies queued for verification.
    pub checks: usize,
    /// Copies queued for deletion.
    pub deletes: usize,
}

/// Drives the scheduler from the data index.
pub struct UpdateLoop {
    index: Arc<dyn DataIndex>,
    state: Arc<SchedulerState>,
    registry: IoRegistry,
    pool: Arc<dyn Pool>,
    serial: bool,
    nodes: HashMap<String, Arc<dyn NodeIo>>,
}

impl UpdateLoop {
    /// Creates the loop. With `serial`, each pass drains the queue itself.
    pub fn new(
        index: Arc<dyn DataIndex>,
        state: Arc<SchedulerState>,
        registry: IoRegistry,
        pool: Arc<dyn Pool>,
        serial: bool,
    ) -> Self {
        Self {
            index,
            state,
            registry,
            pool,
            serial,
            nodes: HashMap::new(),
        }
    }

    /// Node I/O currently in use, by node name.
    pub fn node_io(&self, name: &str) -> Option<Arc<dyn NodeIo>> {
        self.nodes.get(name).cloned()
    }

    /// Initialises every active node's root. Returns the names that failed.
    pub fn init_nodes(&self) -> ArchiveResult<Vec<String>> {
        let mut failed = Vec::new();
        for node in self.index.nodes()?.into_iter().filter(|n| n.active) {
            let name = node.name.clone();
            let io = self.registry.node_io(NodeEnv {
                node,
                index: Arc::clone(&self.index),
                state: Arc::clone(&self.state),
            });
            let ok = match io {
                Ok(io) => io.init()?,
                Err(err) => {
                    warn!("Unable to initialise {}: {}", name, err);
                    false
                }
            };
            if !ok {
                failed.push(name);
            }
        }
        Ok(failed)
    }

    fn refresh_nodes(&mut self) -> ArchiveResult<()> {
        let mut fresh = HashMap::new();
        for node in self.index.nodes()?.into_iter().filter(|n| n.active) {
            if let Some(io) = self.nodes.get(&node.name) {
                if *io.node() == node {
                    fresh.insert(node.name.clone(), Arc::clone(io));
                    continue;
                }
            }
            let name = node.name.clone();
            let env = NodeEnv {
                node,
                index: Arc::clone(&self.index),
                state: Arc::clone(&self.state),
            };
            match self.registry.node_io(env) {
                Ok(io) if io.check_init() => {
                    info!("Activated node {}", name);
                    fresh.insert(name, io);
                }
                Ok(_) => warn!("Node {} is not initialised; skipping", name),
                Err(err) => warn!("Skipping node {}: {}", name, err),
            }
        }
        for name in self.nodes.keys().filter(|n| !fresh.contains_key(*n)) {
            info!("Deactivated node {}", name);
        }
        self.nodes = fresh;
        Ok(())
    }

    fn build_groups(&self) -> ArchiveResult<Vec<Arc<dyn GroupIo>>> {
        let mut groups = Vec::new();
        for group in self.index.groups()? {
            let mut members: Vec<Arc<dyn NodeIo>> = self
                .nodes
                .values()
                .filter(|io| io.node().group == group.name)
                .cloned()
                .collect();
            if members.is_empty() {
                continue;
            }
            members.sort_by(|a, b| a.node().name.cmp(&b.node().name));
            let name = group.name.clone();
            let env = GroupEnv {
                group,
                index: Arc::clone(&self.index),
                state: Arc::clone(&self.state),
            };
            let io = match self.registry.group_io(env) {
                Ok(io) => io,
                Err(err) => {
                    warn!("Skipping group {}: {}", name, err);
                    continue;
                }
            };
            match io.set_nodes(members) {
                Ok(_) => groups.push(io),
                Err(err) => warn!("Skipping group {}: {}", name, err),
            }
        }
        Ok(groups)
    }

    /// Runs one pass.
    pub fn run_once(&mut self) -> ArchiveResult<PassReport> {
        if let Some(reason) = self.state.abort().reason() {
            return Err(ArchiveError::Aborted(reason));
        }
        self.respawn_workers();

        self.refresh_nodes()?;
        let groups = self.build_groups()?;
        let queue = Arc::clone(self.state.queue());
        let idle: HashMap<String, bool> = self
            .nodes
            .keys()
            .map(|name| (name.clone(), queue.key_idle(name)))
            .collect();
        let is_idle = |name: &str| idle.get(name).copied().unwrap_or(false);

        let mut report = PassReport {
            nodes: self.nodes.len(),
            groups: groups.len(),
            ..Default::default()
        };

        for group in &groups {
            let name = &group.group().name;
            let quiet = queue.key_idle(&group_key(name))
                && group.nodes().iter().all(|n| is_idle(n.node().name.as_str()));
            if !quiet {
                debug!("Group {} busy; deferring its requests", name);
                continue;
            }
            for req in self.index.pending_requests(name)? {
                ops::dispatch_pull(Arc::clone(group), &req)?;
                report.requests += 1;
            }
        }

        for (name, io) in &self.nodes {
            if !is_idle(name.as_str()) {
                debug!("Node {} busy; skipping maintenance", name);
                continue;
            }
            if io.under_min() {
                warn!("Node {} is below its minimum free space", name);
            }
            if io.over_max()? {
                warn!("Node {} exceeds its maximum total size", name);
            }

            let copies = self.index.node_copies(name)?;
            let mut queued = 0;
            for copy in copies.iter().filter(|c| c.has_file == HasFile::Suspect) {
                Arc::clone(io).check(copy)?;
                report.checks += 1;
                queued += 1;
            }

            let released: Vec<_> = copies
                .iter()
                .filter(|c| c.wants_file == WantsFile::Released && c.has_file != HasFile::Missing)
                .cloned()
                .collect();
            if !released.is_empty() {
                report.deletes += released.len();
                queued += released.len();
                Arc::clone(io).delete(released)?;
            }

            let verify = io.node().auto_verify;
            if queued == 0 && verify > 0 {
                let mut healthy: Vec<_> = copies
                    .iter()
                    .filter(|c| c.has_file == HasFile::Healthy)
                    .collect();
                healthy.sort_by_key(|c| c.last_update);
                for copy in healthy.into_iter().take(verify) {
                    Arc::clone(io).check(copy)?;
                    report.checks += 1;
                }
            }
        }

        if self.serial {
            drain_serial(&queue, self.state.abort()).map_err(|err| match err {
                TaskError::Fatal { cause } => ArchiveError::Aborted(cause),
                TaskError::Recoverable { cause } => ArchiveError::Index(IndexError::ConnectionLost(cause)),
            })?;
        }
        Ok(report)
    }

    /// Blocks until the queue is empty with nothing in flight, or the pool aborted.
    ///
    /// Workers that exited to reconnect are respawned while waiting, so
    /// requeued work still gets run.
    pub fn wait_idle(&self) {
        let queue = self.state.queue();
        while !self.state.abort().is_aborted() && !(queue.empty() && queue.inflight_size() == 0) {
            self.respawn_workers();
            thread::sleep(IDLE_POLL);
        }
    }

    fn respawn_workers(&self) {
        let respawned = self.pool.check();
        if respawned > 0 {
            info!("Respawned {} workers", respawned);
        }
    }

    /// Runs passes until aborted. With `once`, runs a single pass and waits for its work.
    ///
    /// A lost index connection skips to the next pass; anything else stops the loop.
    pub fn run(&mut self, interval: Duration, once: bool) -> ArchiveResult<()> {
        loop {
            match self.run_once() {
                Ok(report) => info!(
                    "Update pass: {} nodes, {} groups, {} requests, {} checks, {} deletes",
                    report.nodes, report.groups, report.requests, report.checks, report.deletes
                ),
                Err(ArchiveError::Index(IndexError::ConnectionLost(cause))) => {
                    warn!("Data index connection lost during update: {}", cause);
                }
                Err(err) => return Err(err),
            }
            if once {
                // serial passes have already drained their own work
                if !self.serial {
                    self.wait_idle();
                }
                break;
            }
            let deadline = Instant::now() + interval;
            loop {
                let now = Instant::now();
                if now >= deadline || self.state.abort().is_aborted() {
                    break;
                }
                thread::sleep((deadline - now).min(ABORT_POLL));
            }
            if let Some(reason) = self.state.abort().reason() {
                return Err(ArchiveError::Aborted(reason));
            }
        }
        match self.state.abort().reason() {
            Some(reason) => Err(ArchiveError::Aborted(reason)),
            None => Ok(()),
        }
    }
}
