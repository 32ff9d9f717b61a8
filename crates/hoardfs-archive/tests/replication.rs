//! End-to-end replication scenarios against real directory trees.

use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use chrono::Utc;
use hoardfs_archive::io::ops;
use hoardfs_archive::{
    ArchiveFile, ArchiveFileCopy, DaemonConfig, DataIndex, HasFile, IndexConnector, IoRegistry,
    MemoryIndex, NodeRole, SchedulerState, StorageGroup, StorageNode, TransferAction, UpdateLoop,
    WantsFile,
};
use hoardfs_sched::{drain_serial, EmptyPool, NoopConnector, Pool, WorkerPool};
use md5::{Digest, Md5};
use tempfile::TempDir;

struct Fleet {
    dirs: Vec<(String, TempDir)>,
    index: Arc<MemoryIndex>,
    state: Arc<SchedulerState>,
}

impl Fleet {
    fn new(nodes: &[(&str, NodeRole)]) -> Self {
        let index = Arc::new(MemoryIndex::new());
        let mut dirs = Vec::new();
        for (name, role) in nodes {
            let dir = TempDir::new().unwrap();
            let group = format!("{}_group", name);
            index.insert_group(StorageGroup::new(group.clone()));
            index.insert_node(StorageNode::new(*name, dir.path(), group).with_role(*role));
            dirs.push((name.to_string(), dir));
        }
        let state = SchedulerState::new(&DaemonConfig::default()).unwrap();
        Self { dirs, index, state }
    }

    fn root(&self, node: &str) -> PathBuf {
        self.dirs
            .iter()
            .find(|(name, _)| name == node)
            .map(|(_, dir)| dir.path().to_path_buf())
            .unwrap()
    }

    fn register(&self, id: u64, content: &[u8]) -> ArchiveFile {
        let file = ArchiveFile {
            id,
            acq: "20240101T000000Z_acq".into(),
            name: format!("{:08}.dat", id),
            size_b: content.len() as u64,
            md5sum: hex::encode(Md5::digest(content)),
            registered: Utc::now(),
        };
        self.index.insert_file(file.clone());
        file
    }

    fn place(&self, node: &str, file: &ArchiveFile, content: &[u8], has_file: HasFile) {
        let path = self.root(node).join(file.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        let mut copy = ArchiveFileCopy::new(file.id, node, has_file, WantsFile::Keep);
        copy.size_b = Some(content.len() as u64);
        self.index.upsert_copy(&copy).unwrap();
    }

    fn copy(&self, file: &ArchiveFile, node: &str) -> Option<ArchiveFileCopy> {
        self.index.copy(file.id, node).unwrap()
    }

    fn serial_updater(&self) -> UpdateLoop {
        let pool: Arc<dyn Pool> = Arc::new(EmptyPool::new(
            Arc::clone(self.state.queue()),
            self.state.abort().clone(),
        ));
        let updater = UpdateLoop::new(
            self.index.clone(),
            Arc::clone(&self.state),
            IoRegistry::builtin(),
            pool,
            true,
        );
        assert!(updater.init_nodes().unwrap().is_empty());
        updater
    }
}

const CONTENT: &[u8] = b"hello world";

#[test]
fn test_pull_request_is_fulfilled() {
    let fleet = Fleet::new(&[("cedar", NodeRole::Archive), ("robson", NodeRole::Archive)]);
    let file = fleet.register(1, CONTENT);
    fleet.place("cedar", &file, CONTENT, HasFile::Healthy);
    let req = fleet.index.create_request(1, "cedar", "robson_group").unwrap();

    let mut updater = fleet.serial_updater();
    let report = updater.run_once().unwrap();
    assert_eq!(report.requests, 1);

    let dest = fleet.root("robson").join(file.path());
    assert_eq!(std::fs::read(&dest).unwrap(), CONTENT);
    let copy = fleet.copy(&file, "robson").unwrap();
    assert_eq!(copy.has_file, HasFile::Healthy);
    assert_eq!(copy.wants_file, WantsFile::Keep);

    let req = fleet.index.request(req.id).unwrap();
    assert!(req.completed);
    assert!(req.transfer_started.is_some());

    // reservation and placeholder are gone once the task is done
    assert_eq!(fleet.state.reservations().reserved("robson"), 0);
    assert!(!ops::placeholder_path(&dest).exists());
}

#[test]
fn test_pull_from_bad_source_marks_source_suspect() {
    let fleet = Fleet::new(&[("cedar", NodeRole::Field), ("robson", NodeRole::Archive)]);
    let file = fleet.register(1, CONTENT);
    // same size as the registered file, different bytes
    fleet.place("cedar", &file, b"hello wurld", HasFile::Healthy);
    let req = fleet.index.create_request(1, "cedar", "robson_group").unwrap();

    let report = fleet.serial_updater().run_once().unwrap();
    assert_eq!(report.requests, 1);

    assert!(!fleet.root("robson").join(file.path()).exists());
    assert_ne!(
        fleet.copy(&file, "robson").map(|c| c.has_file),
        Some(HasFile::Healthy)
    );
    assert_eq!(fleet.copy(&file, "cedar").unwrap().has_file, HasFile::Suspect);
    assert!(fleet.root("cedar").join(file.path()).exists());
    assert!(fleet.index.request(req.id).unwrap().is_pending());
    assert_eq!(fleet.state.reservations().reserved("robson"), 0);
}

#[test]
fn test_request_cancelled_when_source_has_no_copy() {
    let fleet = Fleet::new(&[("cedar", NodeRole::Field), ("robson", NodeRole::Archive)]);
    fleet.register(1, CONTENT);
    let req = fleet.index.create_request(1, "cedar", "robson_group").unwrap();

    fleet.serial_updater().run_once().unwrap();
    assert!(fleet.index.request(req.id).unwrap().cancelled);
}

#[test]
fn test_pull_search_registers_unknown_copy() {
    let fleet = Fleet::new(&[("cedar", NodeRole::Archive), ("robson", NodeRole::Archive)]);
    let file = fleet.register(1, CONTENT);
    fleet.place("cedar", &file, CONTENT, HasFile::Healthy);
    // already on robson's disk, but the index does not know
    let stray = fleet.root("robson").join(file.path());
    std::fs::create_dir_all(stray.parent().unwrap()).unwrap();
    std::fs::write(&stray, CONTENT).unwrap();
    let req = fleet.index.create_request(1, "cedar", "robson_group").unwrap();

    let mut updater = fleet.serial_updater();
    updater.run_once().unwrap();
    // the search found and verified it instead of transferring
    assert_eq!(fleet.copy(&file, "robson").unwrap().has_file, HasFile::Healthy);
    assert!(fleet.index.request(req.id).unwrap().is_pending());

    updater.run_once().unwrap();
    assert!(fleet.index.request(req.id).unwrap().completed);
}

#[test]
fn test_check_detects_corruption() {
    let fleet = Fleet::new(&[("cedar", NodeRole::Field)]);
    let file = fleet.register(1, CONTENT);
    fleet.place("cedar", &file, b"hello wurld", HasFile::Suspect);

    let report = fleet.serial_updater().run_once().unwrap();
    assert_eq!(report.checks, 1);
    let copy = fleet.copy(&file, "cedar").unwrap();
    assert_eq!(copy.has_file, HasFile::Corrupt);
    assert!(!copy.ready);
}

#[test]
fn test_check_detects_missing_file() {
    let fleet = Fleet::new(&[("cedar", NodeRole::Field)]);
    let file = fleet.register(1, CONTENT);
    fleet
        .index
        .upsert_copy(&ArchiveFileCopy::new(1, "cedar", HasFile::Suspect, WantsFile::Keep))
        .unwrap();

    fleet.serial_updater().run_once().unwrap();
    assert_eq!(fleet.copy(&file, "cedar").unwrap().has_file, HasFile::Missing);
}

#[test]
fn test_autosync_chain() {
    let fleet = Fleet::new(&[("cedar", NodeRole::Field), ("robson", NodeRole::Archive)]);
    let file = fleet.register(1, CONTENT);
    fleet.place("cedar", &file, CONTENT, HasFile::Suspect);
    fleet.index.insert_action(TransferAction {
        node_from: "cedar".into(),
        group_to: "robson_group".into(),
        autosync: true,
        autoclean: false,
    });

    let mut updater = fleet.serial_updater();
    // pass 1: the check turns the copy healthy and autosync requests a copy
    updater.run_once().unwrap();
    assert_eq!(fleet.copy(&file, "cedar").unwrap().has_file, HasFile::Healthy);
    assert_eq!(fleet.index.pending_requests("robson_group").unwrap().len(), 1);

    // pass 2: the request is pulled
    updater.run_once().unwrap();
    assert_eq!(fleet.copy(&file, "robson").unwrap().has_file, HasFile::Healthy);
    assert!(fleet.index.pending_requests("robson_group").unwrap().is_empty());
}

#[test]
fn test_autoclean_then_delete() {
    let fleet = Fleet::new(&[
        ("field", NodeRole::Field),
        ("arc1", NodeRole::Archive),
        ("arc2", NodeRole::Archive),
    ]);
    let file = fleet.register(1, CONTENT);
    fleet.place("field", &file, CONTENT, HasFile::Healthy);
    fleet.place("arc1", &file, CONTENT, HasFile::Healthy);
    fleet.place("arc2", &file, CONTENT, HasFile::Suspect);
    fleet.index.insert_action(TransferAction {
        node_from: "field".into(),
        group_to: "arc2_group".into(),
        autosync: false,
        autoclean: true,
    });

    let mut updater = fleet.serial_updater();
    // pass 1: arc2 verifies, autoclean releases the field copy
    updater.run_once().unwrap();
    assert_eq!(fleet.copy(&file, "field").unwrap().wants_file, WantsFile::Released);
    assert!(fleet.root("field").join(file.path()).exists());

    // pass 2: two healthy copies elsewhere, one on an archive node: delete
    let report = updater.run_once().unwrap();
    assert_eq!(report.deletes, 1);
    let copy = fleet.copy(&file, "field").unwrap();
    assert_eq!(copy.has_file, HasFile::Missing);
    assert_eq!(copy.wants_file, WantsFile::Released);
    assert!(!fleet.root("field").join(&file.acq).exists());
    assert!(fleet.root("field").exists());
}

#[test]
fn test_delete_refused_without_redundancy() {
    let fleet = Fleet::new(&[("field", NodeRole::Field), ("arc1", NodeRole::Archive)]);
    let file = fleet.register(1, CONTENT);
    fleet.place("field", &file, CONTENT, HasFile::Healthy);
    fleet.place("arc1", &file, CONTENT, HasFile::Healthy);
    let mut copy = fleet.copy(&file, "field").unwrap();
    copy.wants_file = WantsFile::Released;
    fleet.index.upsert_copy(&copy).unwrap();

    fleet.serial_updater().run_once().unwrap();
    assert!(fleet.root("field").join(file.path()).exists());
    assert_eq!(fleet.copy(&file, "field").unwrap().has_file, HasFile::Healthy);
}

#[test]
fn test_lost_index_connection_requeues_task() {
    let fleet = Fleet::new(&[("cedar", NodeRole::Field)]);
    let file = fleet.register(1, CONTENT);
    fleet.place("cedar", &file, CONTENT, HasFile::Suspect);
    let mut updater = fleet.serial_updater();
    let report = updater.run_once().unwrap();
    assert_eq!(fleet.copy(&file, "cedar").unwrap().has_file, HasFile::Healthy);
    assert_eq!(report.checks, 1);

    // mark suspect again and run the check by hand with an injected failure
    let mut copy = fleet.copy(&file, "cedar").unwrap();
    copy.has_file = HasFile::Suspect;
    fleet.index.upsert_copy(&copy).unwrap();
    let io = updater.node_io("cedar").unwrap();
    ops::check(io, &copy).unwrap();

    fleet.index.fail_next(1);
    drain_serial(fleet.state.queue(), fleet.state.abort()).unwrap();
    // the failed task went back on the queue
    assert_eq!(fleet.state.queue().qsize(), 1);
    assert!(!fleet.state.abort().is_aborted());

    drain_serial(fleet.state.queue(), fleet.state.abort()).unwrap();
    assert_eq!(fleet.state.queue().qsize(), 0);
    assert_eq!(fleet.copy(&file, "cedar").unwrap().has_file, HasFile::Healthy);
}

#[test]
fn test_wait_idle_respawns_worker_after_lost_connection() {
    let fleet = Fleet::new(&[("cedar", NodeRole::Field)]);
    let file = fleet.register(1, CONTENT);
    fleet.place("cedar", &file, CONTENT, HasFile::Healthy);

    let pool: Arc<dyn Pool> = Arc::new(WorkerPool::new(
        1,
        Arc::clone(fleet.state.queue()),
        fleet.state.abort().clone(),
        Arc::new(IndexConnector(fleet.index.clone())),
        Duration::from_millis(10),
    ));
    let mut updater = UpdateLoop::new(
        fleet.index.clone(),
        Arc::clone(&fleet.state),
        IoRegistry::builtin(),
        Arc::clone(&pool),
        false,
    );
    assert!(updater.init_nodes().unwrap().is_empty());
    // nothing to queue, but node I/O gets built
    updater.run_once().unwrap();

    let mut copy = fleet.copy(&file, "cedar").unwrap();
    copy.has_file = HasFile::Suspect;
    fleet.index.upsert_copy(&copy).unwrap();
    // the only worker loses its connection and exits, leaving the check queued
    fleet.index.fail_next(1);
    ops::check(updater.node_io("cedar").unwrap(), &copy).unwrap();

    let (tx, rx) = mpsc::channel();
    let waiter = std::thread::spawn(move || {
        updater.wait_idle();
        let _ = tx.send(());
    });
    assert!(rx.recv_timeout(Duration::from_secs(10)).is_ok());
    waiter.join().unwrap();
    pool.shutdown();

    assert_eq!(fleet.state.queue().qsize(), 0);
    assert!(!fleet.state.abort().is_aborted());
    assert_eq!(fleet.copy(&file, "cedar").unwrap().has_file, HasFile::Healthy);
}

#[test]
fn test_worker_pool_runs_checks() {
    let fleet = Fleet::new(&[("cedar", NodeRole::Field), ("robson", NodeRole::Field)]);
    let mut files = Vec::new();
    for id in 1..=6 {
        let file = fleet.register(id, CONTENT);
        let node = if id % 2 == 0 { "cedar" } else { "robson" };
        fleet.place(node, &file, CONTENT, HasFile::Suspect);
        files.push((file, node));
    }

    let pool: Arc<dyn Pool> = Arc::new(WorkerPool::new(
        3,
        Arc::clone(fleet.state.queue()),
        fleet.state.abort().clone(),
        Arc::new(IndexConnector(fleet.index.clone())),
        Duration::from_millis(10),
    ));
    let mut updater = UpdateLoop::new(
        fleet.index.clone(),
        Arc::clone(&fleet.state),
        IoRegistry::builtin(),
        Arc::clone(&pool),
        false,
    );
    assert!(updater.init_nodes().unwrap().is_empty());
    updater.run(Duration::ZERO, true).unwrap();
    pool.shutdown();

    for (file, node) in &files {
        assert_eq!(fleet.copy(file, node).unwrap().has_file, HasFile::Healthy);
    }
}

#[test]
fn test_fatal_error_aborts_pool() {
    let fleet = Fleet::new(&[("cedar", NodeRole::Field)]);
    let pool = WorkerPool::new(
        1,
        Arc::clone(fleet.state.queue()),
        fleet.state.abort().clone(),
        Arc::new(NoopConnector),
        Duration::from_millis(10),
    );
    let mut updater = fleet.serial_updater();
    // node I/O is only built by a pass
    assert!(updater.node_io("cedar").is_none());
    updater.run_once().unwrap();

    // a check of an unregistered file fails with a non-recoverable index error
    let io = updater.node_io("cedar").unwrap();
    ops::check(io, &ArchiveFileCopy::new(99, "cedar", HasFile::Suspect, WantsFile::Keep)).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !fleet.state.abort().is_aborted() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(fleet.state.abort().is_aborted());
    pool.shutdown();
    assert!(updater.run_once().is_err());
}
