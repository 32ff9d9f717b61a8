//! The Transport group I/O class.
//!
//! A transport group is a pool of removable disks that carry data between
//! sites. A pull into the group goes to one member disk plugged into the
//! same host as the source, preferring the fullest disk that still fits
//! the file so that disks fill up one at a time.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::default::require_no_options;
use super::{GroupEnv, GroupIo, NodeIo};
use crate::error::{ArchiveError, ArchiveResult};
use crate::types::{CopyRequest, NodeRole};

/// Group I/O over a set of transport-role nodes.
pub struct TransportGroupIo {
    env: GroupEnv,
    nodes: RwLock<Vec<Arc<dyn NodeIo>>>,
}

impl TransportGroupIo {
    /// Creates group I/O, validating the group's I/O config.
    pub fn new(env: GroupEnv) -> ArchiveResult<Self> {
        require_no_options(&env.group.name, env.group.io_config.as_ref())?;
        Ok(Self {
            env,
            nodes: RwLock::new(Vec::new()),
        })
    }
}

impl GroupIo for TransportGroupIo {
    fn env(&self) -> &GroupEnv {
        &self.env
    }

    fn set_nodes(&self, nodes: Vec<Arc<dyn NodeIo>>) -> ArchiveResult<Vec<Arc<dyn NodeIo>>> {
        let mut kept = Vec::with_capacity(nodes.len());
        for node in nodes {
            if node.node().role == NodeRole::Transport {
                kept.push(node);
            } else {
                warn!(
                    "Ignoring non-transport node {} in transport group {}",
                    node.node().name,
                    self.env.group.name
                );
            }
        }
        if kept.is_empty() {
            return Err(ArchiveError::InvalidGroup {
                group: self.env.group.name.clone(),
                reason: "no active transport nodes".into(),
            });
        }
        *self.nodes.write() = kept.clone();
        Ok(kept)
    }

    fn nodes(&self) -> Vec<Arc<dyn NodeIo>> {
        self.nodes.read().clone()
    }

    fn pull(&self, req: &CopyRequest) -> ArchiveResult<()> {
        let index = self.env.index.as_ref();
        let src = index.node(&req.node_from)?;
        let file = index.file(req.file_id)?;

        let mut candidates = Vec::new();
        for node in self.nodes() {
            let record = node.node();
            if !record.active || record.name == src.name || !record.local_to(&src) {
                continue;
            }
            if node.fits(file.size_b)? {
                candidates.push((node.bytes_avail(true), node));
            }
        }
        // least free space first; unknown sorts last
        candidates.sort_by_key(|(avail, _)| avail.unwrap_or(u64::MAX));

        for (_, node) in candidates {
            if node.reserve_bytes(file.size_b, true) {
                debug!(
                    "Transport {} takes request {} for {}",
                    node.node().name,
                    req.id,
                    file.path().display()
                );
                return node.pull(req);
            }
        }
        info!(
            "No transport node in {} can take {} from {}",
            self.env.group.name,
            file.path().display(),
            src.name
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::path::{Path, PathBuf};

    use chrono::Utc;
    use parking_lot::Mutex;

    use super::*;
    use crate::config::DaemonConfig;
    use crate::index::{DataIndex, MemoryIndex};
    use crate::io::{DefaultNodeIo, NodeEnv};
    use crate::state::SchedulerState;
    use crate::types::{ArchiveFile, ArchiveFileCopy, StorageGroup, StorageNode};

    /// A disk with fixed free space that records the requests it is handed.
    struct StubDisk {
        env: NodeEnv,
        avail: Option<u64>,
        pulled: Arc<Mutex<Vec<String>>>,
    }

    impl NodeIo for StubDisk {
        fn env(&self) -> &NodeEnv {
            &self.env
        }
        fn exists(&self, _path: &Path) -> bool {
            false
        }
        fn filesize(&self, _path: &Path) -> Option<u64> {
            None
        }
        fn md5(&self, _path: &Path) -> Option<String> {
            None
        }
        fn open(&self, path: &Path) -> ArchiveResult<File> {
            Ok(File::open(self.env.node.root.join(path))?)
        }
        fn bytes_avail(&self, fast: bool) -> Option<u64> {
            // only the estimate is stubbed; an exact query sees a full disk
            if fast {
                self.avail
            } else {
                Some(0)
            }
        }
        fn init(&self) -> ArchiveResult<bool> {
            Ok(true)
        }
        fn check_init(&self) -> bool {
            true
        }
        fn file_walk(&self) -> ArchiveResult<Vec<PathBuf>> {
            Ok(Vec::new())
        }
        fn ready(&self, _copy: &ArchiveFileCopy) -> bool {
            true
        }
        fn check(self: Arc<Self>, _copy: &ArchiveFileCopy) -> ArchiveResult<()> {
            Ok(())
        }
        fn delete(self: Arc<Self>, _copies: Vec<ArchiveFileCopy>) -> ArchiveResult<()> {
            Ok(())
        }
        fn pull(self: Arc<Self>, _req: &CopyRequest) -> ArchiveResult<()> {
            self.pulled.lock().push(self.env.node.name.clone());
            Ok(())
        }
    }

    fn setup() -> (Arc<MemoryIndex>, Arc<SchedulerState>, TransportGroupIo) {
        let index = Arc::new(MemoryIndex::new());
        let state = SchedulerState::new(&DaemonConfig::default()).unwrap();
        let group = TransportGroupIo::new(GroupEnv {
            group: StorageGroup::new("transport"),
            index: index.clone(),
            state: Arc::clone(&state),
        })
        .unwrap();
        (index, state, group)
    }

    fn node_io(
        index: &Arc<MemoryIndex>,
        state: &Arc<SchedulerState>,
        node: StorageNode,
    ) -> Arc<dyn NodeIo> {
        Arc::new(
            DefaultNodeIo::new(NodeEnv {
                node,
                index: index.clone(),
                state: Arc::clone(state),
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_set_nodes_keeps_transport_role_only() {
        let (index, state, group) = setup();
        let disk = node_io(
            &index,
            &state,
            StorageNode::new("disk1", "/mnt/disk1", "transport").with_role(NodeRole::Transport),
        );
        let field = node_io(&index, &state, StorageNode::new("field", "/mnt/f", "transport"));

        let kept = group.set_nodes(vec![disk, field]).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].node().name, "disk1");
    }

    #[test]
    fn test_set_nodes_requires_a_transport_node() {
        let (index, state, group) = setup();
        let field = node_io(&index, &state, StorageNode::new("field", "/mnt/f", "transport"));
        assert!(matches!(
            group.set_nodes(vec![field]),
            Err(ArchiveError::InvalidGroup { .. })
        ));
        assert!(group.nodes().is_empty());
    }

    fn transport_node(name: &str, host: &str) -> StorageNode {
        let mut node = StorageNode::new(name, format!("/mnt/{}", name), "transport")
            .with_role(NodeRole::Transport);
        node.host = host.into();
        node
    }

    fn stub(
        index: &Arc<MemoryIndex>,
        state: &Arc<SchedulerState>,
        pulled: &Arc<Mutex<Vec<String>>>,
        node: StorageNode,
        avail: Option<u64>,
    ) -> Arc<dyn NodeIo> {
        index.insert_node(node.clone());
        Arc::new(StubDisk {
            env: NodeEnv {
                node,
                index: index.clone(),
                state: Arc::clone(state),
            },
            avail,
            pulled: Arc::clone(pulled),
        })
    }

    fn register(index: &MemoryIndex, size_b: u64) {
        index.insert_file(ArchiveFile {
            id: 1,
            acq: "20240101T000000Z_acq".into(),
            name: "00000001.dat".into(),
            size_b,
            md5sum: "0".repeat(32),
            registered: Utc::now(),
        });
    }

    #[test]
    fn test_pull_picks_fullest_local_disk_that_fits() {
        let (index, state, group) = setup();
        let pulled = Arc::new(Mutex::new(Vec::new()));
        register(&index, 20);

        let mut asleep = transport_node("asleep", "site1");
        asleep.active = false;
        let mut reserved_floor = transport_node("floor", "site1");
        reserved_floor.min_avail_gb = 1.0;
        let disks = vec![
            // the source itself, nearly full
            stub(&index, &state, &pulled, transport_node("src", "site1"), Some(100)),
            stub(&index, &state, &pulled, asleep, Some(60)),
            stub(&index, &state, &pulled, transport_node("away", "site2"), Some(60)),
            // fits the file, but not twice over
            stub(&index, &state, &pulled, transport_node("tight", "site1"), Some(30)),
            // would dip below its free-space floor
            stub(&index, &state, &pulled, reserved_floor, Some(50)),
            stub(&index, &state, &pulled, transport_node("roomy", "site1"), Some(5_000)),
            stub(&index, &state, &pulled, transport_node("unknown", "site1"), None),
            stub(&index, &state, &pulled, transport_node("fullest", "site1"), Some(500)),
        ];
        group.set_nodes(disks).unwrap();

        let req = index.create_request(1, "src", "transport").unwrap();
        group.pull(&req).unwrap();
        assert_eq!(*pulled.lock(), vec!["fullest".to_string()]);
        // choosing a candidate records no reservation
        assert_eq!(state.reservations().reserved("fullest"), 0);
    }

    #[test]
    fn test_reserve_uses_fast_estimate() {
        let (index, state, _group) = setup();
        let pulled = Arc::new(Mutex::new(Vec::new()));
        let disk = stub(&index, &state, &pulled, transport_node("d1", "site1"), Some(1000));
        assert!(disk.reserve_bytes(100, false));
        assert_eq!(state.reservations().reserved("d1"), 100);
        disk.release_bytes(100).unwrap();
    }

    #[test]
    fn test_pull_without_candidate_is_skipped() {
        let (index, state, group) = setup();
        let pulled = Arc::new(Mutex::new(Vec::new()));
        register(&index, 20);

        let disks = vec![
            stub(&index, &state, &pulled, transport_node("src", "site1"), Some(5_000)),
            stub(&index, &state, &pulled, transport_node("away", "site2"), Some(5_000)),
            stub(&index, &state, &pulled, transport_node("tight", "site1"), Some(39)),
        ];
        group.set_nodes(disks).unwrap();

        let req = index.create_request(1, "src", "transport").unwrap();
        assert!(group.pull(&req).is_ok());
        assert!(pulled.lock().is_empty());
    }

    #[test]
    fn test_unknown_free_space_is_tried_last() {
        let (index, state, group) = setup();
        let pulled = Arc::new(Mutex::new(Vec::new()));
        register(&index, 20);

        let disks = vec![
            stub(&index, &state, &pulled, transport_node("src", "site1"), None),
            stub(&index, &state, &pulled, transport_node("unknown", "site1"), None),
            stub(&index, &state, &pulled, transport_node("tight", "site1"), Some(30)),
        ];
        group.set_nodes(disks).unwrap();

        let req = index.create_request(1, "src", "transport").unwrap();
        group.pull(&req).unwrap();
        assert_eq!(*pulled.lock(), vec!["unknown".to_string()]);
    }
}
