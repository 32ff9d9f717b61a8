//! Records shared with the data index.
//!
//! The single-letter encodings of [`HasFile`] and [`WantsFile`] are
//! persisted and must not change.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// I/O class used when a node or group does not name one.
pub const DEFAULT_IO_CLASS: &str = "Default";

/// Recorded health of a file copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HasFile {
    /// Present and verified.
    #[serde(rename = "Y")]
    Healthy,
    /// Needs verification.
    #[serde(rename = "M")]
    Suspect,
    /// Present but failed verification.
    #[serde(rename = "X")]
    Corrupt,
    /// Not on disk.
    #[serde(rename = "N")]
    Missing,
}

impl HasFile {
    /// Wire encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            HasFile::Healthy => "Y",
            HasFile::Suspect => "M",
            HasFile::Corrupt => "X",
            HasFile::Missing => "N",
        }
    }

    /// Healthy or Suspect: the copy is believed to exist.
    pub fn is_good(&self) -> bool {
        matches!(self, HasFile::Healthy | HasFile::Suspect)
    }
}

impl FromStr for HasFile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Y" => Ok(HasFile::Healthy),
            "M" => Ok(HasFile::Suspect),
            "X" => Ok(HasFile::Corrupt),
            "N" => Ok(HasFile::Missing),
            other => Err(format!("invalid has_file value: {:?}", other)),
        }
    }
}

impl fmt::Display for HasFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired disposition of a file copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WantsFile {
    /// Keep it.
    #[serde(rename = "Y")]
    Keep,
    /// May be removed if space is needed.
    #[serde(rename = "M")]
    Removable,
    /// Should be deleted.
    #[serde(rename = "N")]
    Released,
}

impl WantsFile {
    /// Wire encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            WantsFile::Keep => "Y",
            WantsFile::Removable => "M",
            WantsFile::Released => "N",
        }
    }
}

impl FromStr for WantsFile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Y" => Ok(WantsFile::Keep),
            "M" => Ok(WantsFile::Removable),
            "N" => Ok(WantsFile::Released),
            other => Err(format!("invalid wants_file value: {:?}", other)),
        }
    }
}

impl fmt::Display for WantsFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a storage node in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Authoritative long-term copy holder.
    Archive,
    /// Acquisition-site storage.
    #[default]
    Field,
    /// Removable media shuttling data between sites.
    Transport,
}

/// A storage group: one or more nodes managed together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageGroup {
    /// Unique group name.
    pub name: String,
    /// I/O class; `None` means "Default".
    #[serde(default)]
    pub io_class: Option<String>,
    /// Opaque I/O class configuration.
    #[serde(default)]
    pub io_config: Option<serde_json::Value>,
}

impl StorageGroup {
    /// Creates a group using the Default I/O class.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            io_class: None,
            io_config: None,
        }
    }

    /// The effective I/O class name.
    pub fn io_class(&self) -> &str {
        self.io_class.as_deref().unwrap_or(DEFAULT_IO_CLASS)
    }
}

/// A storage node: a directory tree on some host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageNode {
    /// Unique node name; also the task queue key.
    pub name: String,
    /// Root directory of the node's file tree.
    pub root: PathBuf,
    /// Owning group name.
    pub group: String,
    /// I/O class; `None` means "Default".
    #[serde(default)]
    pub io_class: Option<String>,
    /// Opaque I/O class configuration.
    #[serde(default)]
    pub io_config: Option<serde_json::Value>,
    /// Inactive nodes are ignored by the update loop.
    #[serde(default)]
    pub active: bool,
    /// Node role.
    #[serde(default)]
    pub role: NodeRole,
    /// Host the node is mounted on.
    #[serde(default)]
    pub host: String,
    /// Login name for remote transfers from this node.
    #[serde(default)]
    pub username: Option<String>,
    /// Network address for remote transfers from this node.
    #[serde(default)]
    pub address: Option<String>,
    /// Upper bound on the total size of files stored, in GiB.
    #[serde(default)]
    pub max_total_gb: Option<f64>,
    /// Free space to keep available, in GiB.
    #[serde(default)]
    pub min_avail_gb: f64,
    /// Register unknown files found on the node.
    #[serde(default)]
    pub auto_import: bool,
    /// Number of healthy copies to re-verify per idle update pass.
    #[serde(default)]
    pub auto_verify: usize,
}

impl StorageNode {
    /// Creates an active field node using the Default I/O class.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            group: group.into(),
            io_class: None,
            io_config: None,
            active: true,
            role: NodeRole::Field,
            host: String::new(),
            username: None,
            address: None,
            max_total_gb: None,
            min_avail_gb: 0.0,
            auto_import: false,
            auto_verify: 0,
        }
    }

    /// Sets the role.
    pub fn with_role(mut self, role: NodeRole) -> Self {
        self.role = role;
        self
    }

    /// Sets the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// The effective I/O class name.
    pub fn io_class(&self) -> &str {
        self.io_class.as_deref().unwrap_or(DEFAULT_IO_CLASS)
    }

    /// True for archive-role nodes.
    pub fn is_archive(&self) -> bool {
        self.role == NodeRole::Archive
    }

    /// True if a transfer between this node and `other` stays on one host.
    pub fn local_to(&self, other: &StorageNode) -> bool {
        self.host == other.host
    }
}

/// A registered archive file. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveFile {
    /// Unique file id.
    pub id: u64,
    /// Acquisition directory the file belongs to.
    pub acq: String,
    /// File name relative to the acquisition.
    pub name: String,
    /// Size in bytes.
    pub size_b: u64,
    /// Hex MD5 digest.
    pub md5sum: String,
    /// Registration time.
    pub registered: DateTime<Utc>,
}

impl ArchiveFile {
    /// Path relative to a node root.
    pub fn path(&self) -> PathBuf {
        Path::new(&self.acq).join(&self.name)
    }
}

/// The state of one file on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveFileCopy {
    /// File id.
    pub file_id: u64,
    /// Node name.
    pub node: String,
    /// Recorded health.
    pub has_file: HasFile,
    /// Desired disposition.
    pub wants_file: WantsFile,
    /// Usability flag for I/O classes that stage files.
    pub ready: bool,
    /// Size on disk in bytes, if known.
    pub size_b: Option<u64>,
    /// Last state change.
    pub last_update: DateTime<Utc>,
}

impl ArchiveFileCopy {
    /// Creates a copy record stamped now.
    pub fn new(file_id: u64, node: impl Into<String>, has_file: HasFile, wants_file: WantsFile) -> Self {
        Self {
            file_id,
            node: node.into(),
            has_file,
            wants_file,
            ready: false,
            size_b: None,
            last_update: Utc::now(),
        }
    }

    /// Healthy and wanted.
    pub fn is_healthy_kept(&self) -> bool {
        self.has_file == HasFile::Healthy && self.wants_file == WantsFile::Keep
    }
}

/// A request to copy a file from a node into a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyRequest {
    /// Unique request id.
    pub id: u64,
    /// File id.
    pub file_id: u64,
    /// Source node name.
    pub node_from: String,
    /// Destination group name.
    pub group_to: String,
    /// Abandoned; terminal.
    #[serde(default)]
    pub cancelled: bool,
    /// Fulfilled; terminal.
    #[serde(default)]
    pub completed: bool,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// When the last transfer attempt started.
    #[serde(default)]
    pub transfer_started: Option<DateTime<Utc>>,
    /// When the transfer finished.
    #[serde(default)]
    pub transfer_completed: Option<DateTime<Utc>>,
}

impl CopyRequest {
    /// Neither completed nor cancelled.
    pub fn is_pending(&self) -> bool {
        !self.completed && !self.cancelled
    }
}

/// A policy edge from a node to a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAction {
    /// Source node name.
    pub node_from: String,
    /// Destination group name.
    pub group_to: String,
    /// Copy new healthy files on `node_from` into `group_to`.
    #[serde(default)]
    pub autosync: bool,
    /// Release files on `node_from` once they are healthy in `group_to`.
    #[serde(default)]
    pub autoclean: bool,
}
