#![warn(missing_docs)]

//! HoardFS archive subsystem: replication, verification and cleanup of archive files across storage nodes
//!
//! Storage nodes are directory trees on some host; groups are sets of
//! nodes managed together. The data index records which node holds which
//! file in what state. Controllers turn that state into queued tasks that
//! pull, check and delete files, and healthy copies propagate through the
//! autosync/autoclean policy graph.

pub mod config;
pub mod copystate;
pub mod error;
pub mod index;
pub mod io;
pub mod state;
pub mod transfer;
pub mod trigger;
pub mod types;
pub mod update;

pub use config::{DaemonConfig, TransferPolicy};
pub use copystate::{deletion_allowed, evaluate_check, CheckOutcome};
pub use error::{ArchiveError, ArchiveResult, IndexError, IndexResult};
pub use index::{DataIndex, IndexConnector, MemoryIndex, Snapshot};
pub use io::{
    DefaultGroupIo, DefaultNodeIo, GroupEnv, GroupIo, IoRegistry, NodeEnv, NodeIo, TransportGroupIo,
};
pub use state::{ReservationTable, SchedulerState, DEFAULT_RESERVE_FACTOR};
pub use trigger::{on_copy_healthy, TriggerReport};
pub use types::{
    ArchiveFile, ArchiveFileCopy, CopyRequest, HasFile, NodeRole, StorageGroup, StorageNode,
    TransferAction, WantsFile,
};
pub use update::{PassReport, UpdateLoop};
