//! Task bodies shared by node and group I/O classes.
//!
//! Each public function here does the cheap synchronous part of an
//! operation (lookups, gating) and queues the expensive part as a task
//! keyed by the node name.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use hoardfs_sched::{Task, TaskContext, TaskError, TaskResult, UpDownLock};
use tracing::{debug, error, info, warn};

use super::{GroupIo, NodeIo};
use crate::copystate::{
    apply_check, deleted, deletion_allowed, evaluate_check, pulled_copy, suspect_source, CheckOutcome,
};
use crate::error::{ArchiveResult, IndexResult};
use crate::index::DataIndex;
use crate::transfer::{self, RemoteSource, TransferSpec};
use crate::trigger;
use crate::types::{
    ArchiveFile, ArchiveFileCopy, CopyRequest, HasFile, StorageNode, WantsFile, DEFAULT_IO_CLASS,
};

/// Queue key prefix for group-level tasks.
pub const GROUP_KEY_PREFIX: &str = "group:";

/// The queue key used for tasks run on behalf of a group.
pub fn group_key(group: &str) -> String {
    format!("{}{}", GROUP_KEY_PREFIX, group)
}

/// Placeholder kept beside an incoming file so its directory survives pruning.
pub fn placeholder_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.placeholder", name))
}

/// True for bookkeeping files that are never archive contents.
pub fn is_placeholder(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') && n.ends_with(".placeholder"))
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Removes empty directories from `dir` upward, stopping at `root`.
pub fn prune_dirs(root: &Path, dir: &Path, lock: &UpDownLock) {
    let _down = lock.down();
    let mut current = dir.to_path_buf();
    while current.starts_with(root) && current != root {
        if std::fs::remove_dir(&current).is_err() {
            break;
        }
        debug!("Pruned empty directory {}", current.display());
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
}

fn complete_request(index: &dyn DataIndex, req: &mut CopyRequest) -> IndexResult<()> {
    req.completed = true;
    if req.transfer_completed.is_none() {
        req.transfer_completed = Some(Utc::now());
    }
    index.update_request(req)
}

fn suspect_source_copy(index: &dyn DataIndex, file: &ArchiveFile, src: &StorageNode) -> IndexResult<()> {
    if let Some(mut copy) = index.copy(file.id, &src.name)? {
        suspect_source(&mut copy);
        index.upsert_copy(&copy)?;
        warn!(
            "Marked {} on {} suspect after a failed pull",
            file.path().display(),
            src.name
        );
    }
    Ok(())
}

/// Queues verification of a copy.
pub fn check(io: Arc<dyn NodeIo>, copy: &ArchiveFileCopy) -> ArchiveResult<()> {
    let node = io.node().name.clone();
    let state = Arc::clone(&io.env().state);
    let file_id = copy.file_id;
    let task = Task::new(format!("Check file {} on {}", file_id, node), node, move |_ctx| {
        check_copy(io.as_ref(), file_id)
    });
    state.submit(task)
}

fn check_copy(io: &dyn NodeIo, file_id: u64) -> TaskResult {
    let index = io.env().index.as_ref();
    let node = io.node();
    let file = index.file(file_id)?;
    let path = file.path();

    if io.locked(&path) {
        debug!("Skipping check of locked {} on {}", path.display(), node.name);
        return Ok(());
    }

    let mut copy = index
        .copy(file_id, &node.name)?
        .unwrap_or_else(|| ArchiveFileCopy::new(file_id, node.name.clone(), HasFile::Suspect, WantsFile::Keep));

    let outcome = if !io.exists(&path) {
        CheckOutcome::Missing
    } else {
        match io.filesize(&path) {
            Some(size) => evaluate_check(&file, Some(size), || io.md5(&path)),
            None => CheckOutcome::Unreadable,
        }
    };

    let newly_healthy = apply_check(&mut copy, &outcome);
    index.upsert_copy(&copy)?;
    match outcome {
        CheckOutcome::Healthy { .. } => info!("File {} on {} is healthy", path.display(), node.name),
        CheckOutcome::Missing => warn!("File {} missing from {}", path.display(), node.name),
        CheckOutcome::Corrupt => error!("File {} on {} is corrupt", path.display(), node.name),
        CheckOutcome::Unreadable => warn!("File {} on {} could not be read", path.display(), node.name),
    }

    if newly_healthy {
        trigger::on_copy_healthy(index, &file, node)?;
    }
    Ok(())
}

/// Queues deletion of copies. Each one is gated on redundancy when the task runs.
pub fn delete(io: Arc<dyn NodeIo>, copies: Vec<ArchiveFileCopy>) -> ArchiveResult<()> {
    if copies.is_empty() {
        return Ok(());
    }
    let node = io.node().name.clone();
    let state = Arc::clone(&io.env().state);
    let ids: Vec<u64> = copies.iter().map(|c| c.file_id).collect();
    let task = Task::new(
        format!("Delete {} copies from {}", ids.len(), node),
        node,
        move |_ctx| delete_copies(io.as_ref(), &ids),
    );
    state.submit(task)
}

fn delete_copies(io: &dyn NodeIo, ids: &[u64]) -> TaskResult {
    let env = io.env();
    let index = env.index.as_ref();
    let node = io.node();
    let lock = env.state.tree_lock(&node.name);

    for &file_id in ids {
        let Some(mut copy) = index.copy(file_id, &node.name)? else {
            continue;
        };
        if copy.has_file == HasFile::Missing {
            continue;
        }
        let file = index.file(file_id)?;
        let path = file.path();
        if io.locked(&path) {
            debug!("Not deleting locked {} on {}", path.display(), node.name);
            continue;
        }

        let mut others = Vec::new();
        for other in index.file_copies(file_id)? {
            if other.node != node.name {
                let other_node = index.node(&other.node)?;
                others.push((other, other_node));
            }
        }
        if !deletion_allowed(node, &others) {
            info!(
                "Too few copies of {} elsewhere to delete it from {}",
                path.display(),
                node.name
            );
            continue;
        }

        let abs = node.root.join(&path);
        if let Err(err) = remove_if_present(&abs) {
            warn!("Unable to delete {}: {}", abs.display(), err);
            continue;
        }
        if let Some(parent) = abs.parent() {
            prune_dirs(&node.root, parent, &lock);
        }
        deleted(&mut copy);
        index.upsert_copy(&copy)?;
        info!("Deleted {} from {}", path.display(), node.name);
    }
    Ok(())
}

/// Checks a pull request against the destination and source, then queues the transfer.
pub fn pull(io: Arc<dyn NodeIo>, req: &CopyRequest) -> ArchiveResult<()> {
    let env = io.env();
    let index = env.index.as_ref();
    let node = io.node();
    let file = index.file(req.file_id)?;
    let path = file.path();

    if let Some(copy) = index.copy(file.id, &node.name)? {
        match copy.has_file {
            HasFile::Healthy => {
                info!("{} already on {}; completing request {}", path.display(), node.name, req.id);
                let mut req = req.clone();
                complete_request(index, &mut req)?;
                return Ok(());
            }
            HasFile::Suspect => {
                debug!("{} on {} awaits a check", path.display(), node.name);
                return Ok(());
            }
            HasFile::Corrupt | HasFile::Missing => {}
        }
    }

    let src = index.node(&req.node_from)?;
    if !src.active {
        debug!("Source {} inactive; deferring request {}", src.name, req.id);
        return Ok(());
    }
    match index.copy(file.id, &src.name)? {
        Some(copy) if copy.has_file == HasFile::Healthy => {
            if !copy.ready && src.io_class() != DEFAULT_IO_CLASS {
                debug!("{} on {} not ready", path.display(), src.name);
                return Ok(());
            }
        }
        Some(copy) if copy.has_file != HasFile::Missing => {
            debug!("Source copy on {} is {}; deferring request {}", src.name, copy.has_file, req.id);
            return Ok(());
        }
        _ => {
            warn!("Cancelling request {}: {} has no copy of {}", req.id, src.name, path.display());
            let mut req = req.clone();
            req.cancelled = true;
            index.update_request(&req)?;
            return Ok(());
        }
    }

    if !io.fits(file.size_b)? {
        info!("{} does not fit on {}", path.display(), node.name);
        return Ok(());
    }
    if !io.reserve_bytes(file.size_b, true) {
        info!("Insufficient space on {} for {}", node.name, path.display());
        return Ok(());
    }

    let name = format!("Pull {} from {} to {}", path.display(), src.name, node.name);
    let key = node.name.clone();
    let state = Arc::clone(&env.state);
    let req_id = req.id;
    let task = Task::new(name, key, move |ctx| pull_file(&io, req_id, ctx));
    state.submit(task)
}

fn pull_file(io: &Arc<dyn NodeIo>, req_id: u64, ctx: &mut TaskContext) -> TaskResult {
    let env = io.env();
    let index = env.index.as_ref();
    let node = io.node();

    let mut req = index.request(req_id)?;
    if !req.is_pending() {
        debug!("Request {} no longer pending", req_id);
        return Ok(());
    }
    let file = index.file(req.file_id)?;
    let path = file.path();
    let dest = node.root.join(&path);

    if io.exists(&path) {
        let known = index.copy(file.id, &node.name)?.map(|c| c.has_file);
        match known {
            Some(HasFile::Healthy) => {
                complete_request(index, &mut req)?;
                return Ok(());
            }
            Some(HasFile::Suspect) => return Ok(()),
            Some(HasFile::Corrupt) => {
                info!("Removing corrupt {} from {} before pulling", path.display(), node.name);
                if let Err(err) = remove_if_present(&dest) {
                    error!("Unable to remove {}: {}", dest.display(), err);
                    return Ok(());
                }
            }
            Some(HasFile::Missing) | None => {
                let copy = ArchiveFileCopy::new(file.id, node.name.clone(), HasFile::Suspect, WantsFile::Keep);
                index.upsert_copy(&copy)?;
                info!("Found unregistered {} on {}; checking it", path.display(), node.name);
                check(Arc::clone(io), &copy)?;
                return Ok(());
            }
        }
    }

    let size = file.size_b;
    if !io.reserve_bytes(size, false) {
        info!("Insufficient space on {} for {}", node.name, path.display());
        return Ok(());
    }
    let releaser = Arc::clone(io);
    ctx.on_cleanup(move || releaser.release_bytes(size).map_err(TaskError::from), false);

    let Some(parent) = dest.parent().map(Path::to_path_buf) else {
        return Err(TaskError::fatal(format!("no parent directory for {}", dest.display())));
    };
    let placeholder = placeholder_path(&dest);
    let lock = env.state.tree_lock(&node.name);
    {
        let _up = lock.up();
        let prepared = std::fs::create_dir_all(&parent)
            .and_then(|()| std::fs::File::create(&placeholder).map(drop));
        if let Err(err) = prepared {
            error!("Unable to prepare {}: {}", parent.display(), err);
            return Ok(());
        }
    }
    let root = node.root.clone();
    ctx.on_cleanup(
        move || {
            if let Err(err) = remove_if_present(&placeholder) {
                warn!("Unable to remove {}: {}", placeholder.display(), err);
            }
            prune_dirs(&root, &parent, &lock);
            Ok(())
        },
        false,
    );

    req.transfer_started = Some(Utc::now());
    index.update_request(&req)?;

    let src = index.node(&req.node_from)?;
    let remote = if src.local_to(node) {
        None
    } else {
        Some(RemoteSource {
            user: src.username.clone(),
            address: src.address.clone().unwrap_or_else(|| src.host.clone()),
        })
    };
    let spec = TransferSpec {
        src: src.root.join(&path),
        dest: dest.clone(),
        size_b: size,
        remote,
    };
    info!("Pulling {} from {} to {}", path.display(), src.name, node.name);
    let outcome = transfer::transfer(env.state.runtime(), env.state.transfer_policy(), &spec);

    if !outcome.success {
        error!("Pull of {} from {} failed: {}", path.display(), src.name, outcome.message);
        if let Err(err) = remove_if_present(&dest) {
            warn!("Unable to remove partial {}: {}", dest.display(), err);
        }
        if outcome.check_src {
            suspect_source_copy(index, &file, &src)?;
        }
        return Ok(());
    }

    let digest = outcome.md5.clone().or_else(|| io.md5(&path));
    let verified = digest
        .as_deref()
        .is_some_and(|d| d.eq_ignore_ascii_case(&file.md5sum));
    if !verified {
        error!(
            "MD5 mismatch pulling {} from {}: got {:?}",
            path.display(),
            src.name,
            digest
        );
        if let Err(err) = remove_if_present(&dest) {
            warn!("Unable to remove {}: {}", dest.display(), err);
        }
        if digest.is_some() {
            suspect_source_copy(index, &file, &src)?;
        }
        return Ok(());
    }

    let on_disk = io.filesize(&path).unwrap_or(size);
    index.upsert_copy(&pulled_copy(&file, &node.name, on_disk, false))?;
    complete_request(index, &mut req)?;
    info!(
        "Pulled {} from {} to {} via {:?}",
        path.display(),
        src.name,
        node.name,
        outcome.method
    );
    trigger::on_copy_healthy(index, &file, node)?;
    Ok(())
}

/// Hands a request to a group, searching its nodes for an unregistered copy
/// first when pull search is enabled.
pub fn dispatch_pull(group: Arc<dyn GroupIo>, req: &CopyRequest) -> ArchiveResult<()> {
    let state = Arc::clone(&group.env().state);
    if !state.pull_search() {
        return group.pull(req);
    }
    let name = group.group().name.clone();
    let req_id = req.id;
    let task = Task::new(
        format!("Search {} for request {}", name, req_id),
        group_key(&name),
        move |_ctx| search_then_pull(group.as_ref(), req_id),
    );
    state.submit(task)
}

fn search_then_pull(group: &dyn GroupIo, req_id: u64) -> TaskResult {
    let index = group.env().index.as_ref();
    let mut req = index.request(req_id)?;
    if !req.is_pending() {
        return Ok(());
    }
    let file = index.file(req.file_id)?;
    let path = file.path();

    for node_io in group.nodes() {
        let name = &node_io.node().name;
        match index.copy(file.id, name)?.map(|c| c.has_file) {
            Some(HasFile::Healthy) => {
                info!("{} already in {} on {}", path.display(), group.group().name, name);
                complete_request(index, &mut req)?;
                return Ok(());
            }
            Some(HasFile::Suspect) => {
                debug!("{} on {} awaits a check", path.display(), name);
                return Ok(());
            }
            _ => {}
        }
    }

    if let Some(node_io) = group.exists(&path) {
        let name = node_io.node().name.clone();
        let known = index.copy(file.id, &name)?.map(|c| c.has_file);
        if known != Some(HasFile::Corrupt) {
            let copy = ArchiveFileCopy::new(file.id, name.clone(), HasFile::Suspect, WantsFile::Keep);
            index.upsert_copy(&copy)?;
            info!("Found unregistered {} on {}; checking it", path.display(), name);
            node_io.check(&copy)?;
            return Ok(());
        }
    }

    group.pull(&req)?;
    Ok(())
}
