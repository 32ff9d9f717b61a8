//! Node and group I/O controllers.
//!
//! Each storage node and group is driven through an I/O class chosen by
//! name. A class implements [`NodeIo`] or [`GroupIo`]; higher layers only
//! see the trait objects. Classes are resolved through an
//! [`IoRegistry`], which extensions can add to.
//!
//! Paths handed to node I/O are relative to the node root.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::ArchiveResult;
use crate::index::DataIndex;
use crate::state::SchedulerState;
use crate::types::{ArchiveFileCopy, CopyRequest, StorageGroup, StorageNode};

pub mod default;
pub mod ops;
pub mod registry;
pub mod transport;

pub use default::{DefaultGroupIo, DefaultNodeIo};
pub use registry::{GroupIoFactory, IoRegistry, NodeIoFactory};
pub use transport::TransportGroupIo;

/// Name of the identity marker written into a node root by `init`.
pub const NODE_MARKER: &str = "HOARDFS_NODE";

const GIB: f64 = (1u64 << 30) as f64;

/// Converts a size in GiB to bytes.
pub fn gib_to_bytes(gib: f64) -> u64 {
    (gib.max(0.0) * GIB) as u64
}

/// Everything a node I/O instance needs from its surroundings.
#[derive(Clone)]
pub struct NodeEnv {
    /// The node record, as of activation.
    pub node: StorageNode,
    /// The data index.
    pub index: Arc<dyn DataIndex>,
    /// Shared scheduler state.
    pub state: Arc<SchedulerState>,
}

/// Everything a group I/O instance needs from its surroundings.
#[derive(Clone)]
pub struct GroupEnv {
    /// The group record, as of activation.
    pub group: StorageGroup,
    /// The data index.
    pub index: Arc<dyn DataIndex>,
    /// Shared scheduler state.
    pub state: Arc<SchedulerState>,
}

/// The capability surface of a storage node.
pub trait NodeIo: Send + Sync {
    /// Surroundings this instance was built with.
    fn env(&self) -> &NodeEnv;

    /// The node record.
    fn node(&self) -> &StorageNode {
        &self.env().node
    }

    /// True if `path` exists on the node.
    fn exists(&self, path: &Path) -> bool;

    /// True if `path` is temporarily unusable (e.g. being staged).
    fn locked(&self, _path: &Path) -> bool {
        false
    }

    /// Size of `path` in bytes, or `None` if it cannot be determined.
    fn filesize(&self, path: &Path) -> Option<u64>;

    /// Hex MD5 of `path`, or `None` if it cannot be read.
    fn md5(&self, path: &Path) -> Option<String>;

    /// Opens `path` for reading.
    fn open(&self, path: &Path) -> ArchiveResult<File>;

    /// Free bytes on the node, or `None` if unknown. `fast` permits a cached or approximate answer.
    fn bytes_avail(&self, fast: bool) -> Option<u64>;

    /// Reserves space for an incoming file against the fast free-space
    /// estimate. With `check_only` nothing is recorded.
    fn reserve_bytes(&self, size: u64, check_only: bool) -> bool {
        let env = self.env();
        env.state
            .reservations()
            .reserve(&env.node.name, size, check_only, || self.bytes_avail(true))
    }

    /// Returns a reservation.
    fn release_bytes(&self, size: u64) -> ArchiveResult<()> {
        let env = self.env();
        env.state.reservations().release(&env.node.name, size)
    }

    /// True if a file of `size` bytes fits within the node's capacity limits.
    ///
    /// `max_total_gb` bounds the registered contents plus the new file;
    /// `min_avail_gb` must remain free once it lands.
    fn fits(&self, size: u64) -> ArchiveResult<bool> {
        let node = self.node();
        if let Some(max) = node.max_total_gb {
            let total = self.env().index.total_size(&node.name)?;
            if total.saturating_add(size) > gib_to_bytes(max) {
                return Ok(false);
            }
        }
        let min = gib_to_bytes(node.min_avail_gb);
        if min > 0 {
            if let Some(avail) = self.bytes_avail(true) {
                if avail < size.saturating_add(min) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// True if free space has dropped below `min_avail_gb`.
    fn under_min(&self) -> bool {
        let min = gib_to_bytes(self.node().min_avail_gb);
        min > 0 && self.bytes_avail(true).is_some_and(|avail| avail < min)
    }

    /// True if registered contents exceed `max_total_gb`.
    fn over_max(&self) -> ArchiveResult<bool> {
        let node = self.node();
        match node.max_total_gb {
            Some(max) => Ok(self.env().index.total_size(&node.name)? > gib_to_bytes(max)),
            None => Ok(false),
        }
    }

    /// Prepares the node for use. Returns false if it cannot be initialised.
    fn init(&self) -> ArchiveResult<bool>;

    /// True if the node has been initialised.
    fn check_init(&self) -> bool;

    /// All files under the node root, relative to it.
    fn file_walk(&self) -> ArchiveResult<Vec<PathBuf>>;

    /// Whether a healthy copy is usable as a transfer source.
    fn ready(&self, copy: &ArchiveFileCopy) -> bool;

    /// Schedules verification of a copy.
    fn check(self: Arc<Self>, copy: &ArchiveFileCopy) -> ArchiveResult<()>;

    /// Schedules deletion of copies, subject to the redundancy gate.
    fn delete(self: Arc<Self>, copies: Vec<ArchiveFileCopy>) -> ArchiveResult<()>;

    /// Schedules a pull of a requested file onto this node.
    fn pull(self: Arc<Self>, req: &CopyRequest) -> ArchiveResult<()>;
}

/// The capability surface of a storage group.
pub trait GroupIo: Send + Sync {
    /// Surroundings this instance was built with.
    fn env(&self) -> &GroupEnv;

    /// The group record.
    fn group(&self) -> &StorageGroup {
        &self.env().group
    }

    /// Gives the group its active nodes. Returns the nodes it will use,
    /// or an error if it cannot operate with this set.
    fn set_nodes(&self, nodes: Vec<Arc<dyn NodeIo>>) -> ArchiveResult<Vec<Arc<dyn NodeIo>>>;

    /// The nodes in use.
    fn nodes(&self) -> Vec<Arc<dyn NodeIo>>;

    /// The first node holding `path` on disk.
    fn exists(&self, path: &Path) -> Option<Arc<dyn NodeIo>> {
        self.nodes().into_iter().find(|n| n.exists(path))
    }

    /// Forwards a pull request to a member node.
    fn pull(&self, req: &CopyRequest) -> ArchiveResult<()>;
}
