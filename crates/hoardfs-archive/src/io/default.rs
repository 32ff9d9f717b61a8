//! The Default I/O class: a node is a plain POSIX directory tree.

use std::ffi::CString;
use std::fs::{self, File};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{ops, GroupEnv, GroupIo, NodeEnv, NodeIo, NODE_MARKER};
use crate::error::{ArchiveError, ArchiveResult};
use crate::transfer::md5_file;
use crate::types::{ArchiveFileCopy, CopyRequest};

/// Rejects any I/O configuration other than an absent or empty object.
pub(crate) fn require_no_options(target: &str, config: Option<&serde_json::Value>) -> ArchiveResult<()> {
    match config {
        None | Some(serde_json::Value::Null) => Ok(()),
        Some(serde_json::Value::Object(map)) if map.is_empty() => Ok(()),
        Some(other) => Err(ArchiveError::InvalidIoConfig {
            target: target.to_string(),
            reason: format!("this I/O class takes no options, got {}", other),
        }),
    }
}

/// Free bytes on the filesystem holding `path`.
pub(crate) fn statvfs_avail(path: &Path) -> Option<u64> {
    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    // SAFETY: statvfs only writes into the zeroed buffer we own.
    let mut buf: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut buf) };
    if rc != 0 {
        debug!("statvfs({}) failed: {}", path.display(), std::io::Error::last_os_error());
        return None;
    }
    Some((buf.f_bavail as u64).saturating_mul(buf.f_frsize as u64))
}

/// Node I/O for a directory tree on a locally mounted filesystem.
pub struct DefaultNodeIo {
    env: NodeEnv,
}

impl DefaultNodeIo {
    /// Creates node I/O, validating the node's I/O config.
    pub fn new(env: NodeEnv) -> ArchiveResult<Self> {
        require_no_options(&env.node.name, env.node.io_config.as_ref())?;
        Ok(Self { env })
    }

    fn abs(&self, path: &Path) -> PathBuf {
        self.env.node.root.join(path)
    }

    fn is_internal(rel: &Path) -> bool {
        rel == Path::new(NODE_MARKER) || ops::is_placeholder(rel)
    }
}

impl NodeIo for DefaultNodeIo {
    fn env(&self) -> &NodeEnv {
        &self.env
    }

    fn exists(&self, path: &Path) -> bool {
        self.abs(path).is_file()
    }

    fn filesize(&self, path: &Path) -> Option<u64> {
        fs::metadata(self.abs(path)).ok().map(|m| m.len())
    }

    fn md5(&self, path: &Path) -> Option<String> {
        match md5_file(&self.abs(path)) {
            Ok(digest) => Some(digest),
            Err(err) => {
                warn!("Unable to hash {} on {}: {}", path.display(), self.env.node.name, err);
                None
            }
        }
    }

    fn open(&self, path: &Path) -> ArchiveResult<File> {
        Ok(File::open(self.abs(path))?)
    }

    fn bytes_avail(&self, _fast: bool) -> Option<u64> {
        statvfs_avail(&self.env.node.root)
    }

    fn init(&self) -> ArchiveResult<bool> {
        let node = &self.env.node;
        if !node.root.is_dir() {
            warn!("Root {} of node {} is not a directory", node.root.display(), node.name);
            return Ok(false);
        }
        if self.check_init() {
            return Ok(true);
        }
        let marker = node.root.join(NODE_MARKER);
        if marker.exists() {
            warn!("{} belongs to a different node", marker.display());
            return Ok(false);
        }
        fs::write(&marker, format!("{}\n", node.name))?;
        info!("Initialised node {} at {}", node.name, node.root.display());
        Ok(true)
    }

    fn check_init(&self) -> bool {
        let node = &self.env.node;
        fs::read_to_string(node.root.join(NODE_MARKER))
            .map(|contents| contents.trim() == node.name)
            .unwrap_or(false)
    }

    fn file_walk(&self) -> ArchiveResult<Vec<PathBuf>> {
        let root = &self.env.node.root;
        let mut files = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let kind = entry.file_type()?;
                let path = entry.path();
                if kind.is_dir() {
                    stack.push(path);
                } else if kind.is_file() {
                    if let Ok(rel) = path.strip_prefix(root) {
                        if !Self::is_internal(rel) {
                            files.push(rel.to_path_buf());
                        }
                    }
                }
            }
        }
        files.sort();
        Ok(files)
    }

    // plain disk: every healthy copy can be read immediately
    fn ready(&self, _copy: &ArchiveFileCopy) -> bool {
        true
    }

    fn check(self: Arc<Self>, copy: &ArchiveFileCopy) -> ArchiveResult<()> {
        ops::check(self, copy)
    }

    fn delete(self: Arc<Self>, copies: Vec<ArchiveFileCopy>) -> ArchiveResult<()> {
        ops::delete(self, copies)
    }

    fn pull(self: Arc<Self>, req: &CopyRequest) -> ArchiveResult<()> {
        ops::pull(self, req)
    }
}

/// Group I/O for a group of exactly one node.
pub struct DefaultGroupIo {
    env: GroupEnv,
    node: RwLock<Option<Arc<dyn NodeIo>>>,
}

impl DefaultGroupIo {
    /// Creates group I/O, validating the group's I/O config.
    pub fn new(env: GroupEnv) -> ArchiveResult<Self> {
        require_no_options(&env.group.name, env.group.io_config.as_ref())?;
        Ok(Self {
            env,
            node: RwLock::new(None),
        })
    }
}

impl GroupIo for DefaultGroupIo {
    fn env(&self) -> &GroupEnv {
        &self.env
    }

    fn set_nodes(&self, nodes: Vec<Arc<dyn NodeIo>>) -> ArchiveResult<Vec<Arc<dyn NodeIo>>> {
        if nodes.len() != 1 {
            return Err(ArchiveError::InvalidGroup {
                group: self.env.group.name.clone(),
                reason: format!("needs exactly one active node, got {}", nodes.len()),
            });
        }
        *self.node.write() = nodes.first().cloned();
        Ok(nodes)
    }

    fn nodes(&self) -> Vec<Arc<dyn NodeIo>> {
        self.node.read().iter().cloned().collect()
    }

    fn pull(&self, req: &CopyRequest) -> ArchiveResult<()> {
        let node = self.node.read().clone();
        match node {
            Some(node) => node.pull(req),
            None => Err(ArchiveError::InvalidGroup {
                group: self.env.group.name.clone(),
                reason: "no active node".into(),
            }),
        }
    }
}
