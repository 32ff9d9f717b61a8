//! The data index: durable record of files, copies, requests and policy.
//!
//! Durability and transactions belong to the index implementation. This
//! crate only sequences reads and writes against it. [`MemoryIndex`] is an
//! in-process implementation used for serial operation, demos and tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use hoardfs_sched::{Connector, TaskResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ArchiveError, ArchiveResult, IndexError, IndexResult};
use crate::types::{
    ArchiveFile, ArchiveFileCopy, CopyRequest, HasFile, StorageGroup, StorageNode, TransferAction,
};

/// Read/write access to the data index.
pub trait DataIndex: Send + Sync {
    /// Verifies the connection is usable.
    fn ping(&self) -> IndexResult<()>;

    /// Looks up a node by name.
    fn node(&self, name: &str) -> IndexResult<StorageNode>;

    /// All nodes.
    fn nodes(&self) -> IndexResult<Vec<StorageNode>>;

    /// Looks up a group by name.
    fn group(&self, name: &str) -> IndexResult<StorageGroup>;

    /// All groups.
    fn groups(&self) -> IndexResult<Vec<StorageGroup>>;

    /// Looks up a file by id.
    fn file(&self, id: u64) -> IndexResult<ArchiveFile>;

    /// The copy of `file_id` on `node`, if one is recorded.
    fn copy(&self, file_id: u64, node: &str) -> IndexResult<Option<ArchiveFileCopy>>;

    /// All recorded copies of a file.
    fn file_copies(&self, file_id: u64) -> IndexResult<Vec<ArchiveFileCopy>>;

    /// All recorded copies on a node.
    fn node_copies(&self, node: &str) -> IndexResult<Vec<ArchiveFileCopy>>;

    /// Inserts or replaces the copy keyed by (file, node).
    fn upsert_copy(&self, copy: &ArchiveFileCopy) -> IndexResult<()>;

    /// Creates a pending copy request.
    fn create_request(&self, file_id: u64, node_from: &str, group_to: &str) -> IndexResult<CopyRequest>;

    /// Looks up a request by id.
    fn request(&self, id: u64) -> IndexResult<CopyRequest>;

    /// Replaces a request record.
    fn update_request(&self, req: &CopyRequest) -> IndexResult<()>;

    /// Pending requests into a group, oldest first.
    fn pending_requests(&self, group: &str) -> IndexResult<Vec<CopyRequest>>;

    /// All transfer actions.
    fn transfer_actions(&self) -> IndexResult<Vec<TransferAction>>;

    /// Nodes belonging to a group.
    fn group_nodes(&self, group: &str) -> IndexResult<Vec<StorageNode>> {
        Ok(self
            .nodes()?
            .into_iter()
            .filter(|n| n.group == group)
            .collect())
    }

    /// Total size of files believed present on a node.
    fn total_size(&self, node: &str) -> IndexResult<u64> {
        Ok(self
            .node_copies(node)?
            .iter()
            .filter(|c| c.has_file != HasFile::Missing)
            .map(|c| c.size_b.unwrap_or(0))
            .sum())
    }
}

/// Adapts a data index into a worker pool connector.
pub struct IndexConnector<I: ?Sized>(pub std::sync::Arc<I>);

impl<I: DataIndex + ?Sized> Connector for IndexConnector<I> {
    fn connect(&self, index: usize) -> TaskResult {
        debug!("Worker {} connecting to data index", index);
        self.0.ping().map_err(Into::into)
    }
}

/// Serializable contents of a [`MemoryIndex`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Groups.
    #[serde(default)]
    pub groups: Vec<StorageGroup>,
    /// Nodes.
    #[serde(default)]
    pub nodes: Vec<StorageNode>,
    /// Files.
    #[serde(default)]
    pub files: Vec<ArchiveFile>,
    /// Copies.
    #[serde(default)]
    pub copies: Vec<ArchiveFileCopy>,
    /// Requests.
    #[serde(default)]
    pub requests: Vec<CopyRequest>,
    /// Transfer actions.
    #[serde(default)]
    pub actions: Vec<TransferAction>,
}

#[derive(Default)]
struct Tables {
    groups: BTreeMap<String, StorageGroup>,
    nodes: BTreeMap<String, StorageNode>,
    files: BTreeMap<u64, ArchiveFile>,
    copies: BTreeMap<(u64, String), ArchiveFileCopy>,
    requests: BTreeMap<u64, CopyRequest>,
    actions: Vec<TransferAction>,
    next_request: u64,
}

/// In-memory data index.
#[derive(Default)]
pub struct MemoryIndex {
    tables: RwLock<Tables>,
    fail_next: AtomicUsize,
}

impl MemoryIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an index seeded from a snapshot.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let index = Self::new();
        {
            let mut t = index.tables.write();
            for g in snapshot.groups {
                t.groups.insert(g.name.clone(), g);
            }
            for n in snapshot.nodes {
                t.nodes.insert(n.name.clone(), n);
            }
            for f in snapshot.files {
                t.files.insert(f.id, f);
            }
            for c in snapshot.copies {
                t.copies.insert((c.file_id, c.node.clone()), c);
            }
            for r in snapshot.requests {
                t.next_request = t.next_request.max(r.id);
                t.requests.insert(r.id, r);
            }
            t.actions = snapshot.actions;
        }
        index
    }

    /// Loads a JSON snapshot file.
    pub fn load(path: &Path) -> ArchiveResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&contents)
            .map_err(|e| ArchiveError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// Dumps the current contents.
    pub fn snapshot(&self) -> Snapshot {
        let t = self.tables.read();
        Snapshot {
            groups: t.groups.values().cloned().collect(),
            nodes: t.nodes.values().cloned().collect(),
            files: t.files.values().cloned().collect(),
            copies: t.copies.values().cloned().collect(),
            requests: t.requests.values().cloned().collect(),
            actions: t.actions.clone(),
        }
    }

    /// Makes the next `n` index calls fail with `ConnectionLost`.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn gate(&self) -> IndexResult<()> {
        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match failed {
            Ok(_) => Err(IndexError::ConnectionLost("injected failure".into())),
            Err(_) => Ok(()),
        }
    }

    /// Adds or replaces a group.
    pub fn insert_group(&self, group: StorageGroup) {
        self.tables.write().groups.insert(group.name.clone(), group);
    }

    /// Adds or replaces a node.
    pub fn insert_node(&self, node: StorageNode) {
        self.tables.write().nodes.insert(node.name.clone(), node);
    }

    /// Adds or replaces a file.
    pub fn insert_file(&self, file: ArchiveFile) {
        self.tables.write().files.insert(file.id, file);
    }

    /// Adds a transfer action.
    pub fn insert_action(&self, action: TransferAction) {
        self.tables.write().actions.push(action);
    }
}

impl DataIndex for MemoryIndex {
    fn ping(&self) -> IndexResult<()> {
        self.gate()
    }

    fn node(&self, name: &str) -> IndexResult<StorageNode> {
        self.gate()?;
        self.tables
            .read()
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| IndexError::not_found("node", name))
    }

    fn nodes(&self) -> IndexResult<Vec<StorageNode>> {
        self.gate()?;
        Ok(self.tables.read().nodes.values().cloned().collect())
    }

    fn group(&self, name: &str) -> IndexResult<StorageGroup> {
        self.gate()?;
        self.tables
            .read()
            .groups
            .get(name)
            .cloned()
            .ok_or_else(|| IndexError::not_found("group", name))
    }

    fn groups(&self) -> IndexResult<Vec<StorageGroup>> {
        self.gate()?;
        Ok(self.tables.read().groups.values().cloned().collect())
    }

    fn file(&self, id: u64) -> IndexResult<ArchiveFile> {
        self.gate()?;
        self.tables
            .read()
            .files
            .get(&id)
            .cloned()
            .ok_or_else(|| IndexError::not_found("file", id))
    }

    fn copy(&self, file_id: u64, node: &str) -> IndexResult<Option<ArchiveFileCopy>> {
        self.gate()?;
        Ok(self
            .tables
            .read()
            .copies
            .get(&(file_id, node.to_string()))
            .cloned())
    }

    fn file_copies(&self, file_id: u64) -> IndexResult<Vec<ArchiveFileCopy>> {
        self.gate()?;
        Ok(self
            .tables
            .read()
            .copies
            .values()
            .filter(|c| c.file_id == file_id)
            .cloned()
            .collect())
    }

    fn node_copies(&self, node: &str) -> IndexResult<Vec<ArchiveFileCopy>> {
        self.gate()?;
        Ok(self
            .tables
            .read()
            .copies
            .values()
            .filter(|c| c.node == node)
            .cloned()
            .collect())
    }

    fn upsert_copy(&self, copy: &ArchiveFileCopy) -> IndexResult<()> {
        self.gate()?;
        let mut t = self.tables.write();
        if !t.files.contains_key(&copy.file_id) {
            return Err(IndexError::Constraint(format!(
                "copy references unknown file {}",
                copy.file_id
            )));
        }
        if !t.nodes.contains_key(&copy.node) {
            return Err(IndexError::Constraint(format!(
                "copy references unknown node {}",
                copy.node
            )));
        }
        t.copies
            .insert((copy.file_id, copy.node.clone()), copy.clone());
        Ok(())
    }

    fn create_request(&self, file_id: u64, node_from: &str, group_to: &str) -> IndexResult<CopyRequest> {
        self.gate()?;
        let mut t = self.tables.write();
        if !t.files.contains_key(&file_id) {
            return Err(IndexError::Constraint(format!(
                "request references unknown file {}",
                file_id
            )));
        }
        t.next_request += 1;
        let req = CopyRequest {
            id: t.next_request,
            file_id,
            node_from: node_from.to_string(),
            group_to: group_to.to_string(),
            cancelled: false,
            completed: false,
            timestamp: Utc::now(),
            transfer_started: None,
            transfer_completed: None,
        };
        t.requests.insert(req.id, req.clone());
        Ok(req)
    }

    fn request(&self, id: u64) -> IndexResult<CopyRequest> {
        self.gate()?;
        self.tables
            .read()
            .requests
            .get(&id)
            .cloned()
            .ok_or_else(|| IndexError::not_found("request", id))
    }

    fn update_request(&self, req: &CopyRequest) -> IndexResult<()> {
        self.gate()?;
        let mut t = self.tables.write();
        match t.requests.get_mut(&req.id) {
            Some(slot) => {
                *slot = req.clone();
                Ok(())
            }
            None => Err(IndexError::not_found("request", req.id)),
        }
    }

    fn pending_requests(&self, group: &str) -> IndexResult<Vec<CopyRequest>> {
        self.gate()?;
        Ok(self
            .tables
            .read()
            .requests
            .values()
            .filter(|r| r.group_to == group && r.is_pending())
            .cloned()
            .collect())
    }

    fn transfer_actions(&self) -> IndexResult<Vec<TransferAction>> {
        self.gate()?;
        Ok(self.tables.read().actions.clone())
    }
}
