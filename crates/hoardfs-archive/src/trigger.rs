//! Policy-graph propagation of copy state changes.
//!
//! When a copy becomes healthy on a node, the transfer actions touching
//! that node decide what happens elsewhere:
//!
//! - **autosync** edges leaving the node request a copy into their target
//!   group, unless that group already has a good copy.
//! - **autoclean** edges entering the node's group release the file on
//!   their source node. Physical deletion still goes through the delete
//!   safety gate later.
//!
//! An edge whose source node belongs to its target group is a self-loop
//! and is never acted on.

use tracing::{debug, info};

use crate::error::IndexResult;
use crate::index::DataIndex;
use crate::types::{ArchiveFile, HasFile, StorageNode, TransferAction, WantsFile};

/// What a trigger walk did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerReport {
    /// Groups a new copy request was created for.
    pub requested: Vec<String>,
    /// Nodes on which the file was released.
    pub released: Vec<String>,
}

fn is_self_loop(index: &dyn DataIndex, action: &TransferAction) -> IndexResult<bool> {
    Ok(index.node(&action.node_from)?.group == action.group_to)
}

fn group_has_good_copy(index: &dyn DataIndex, file_id: u64, group: &str) -> IndexResult<bool> {
    let members: Vec<String> = index.group_nodes(group)?.into_iter().map(|n| n.name).collect();
    Ok(index
        .file_copies(file_id)?
        .iter()
        .any(|c| c.has_file.is_good() && members.contains(&c.node)))
}

/// Runs autosync and autoclean for `file` having become healthy on `node`.
pub fn on_copy_healthy(
    index: &dyn DataIndex,
    file: &ArchiveFile,
    node: &StorageNode,
) -> IndexResult<TriggerReport> {
    let mut report = TriggerReport::default();
    let actions = index.transfer_actions()?;

    for action in actions.iter().filter(|a| a.autosync && a.node_from == node.name) {
        if is_self_loop(index, action)? {
            debug!(
                "Ignoring autosync self-loop {} -> {}",
                action.node_from, action.group_to
            );
            continue;
        }
        if group_has_good_copy(index, file.id, &action.group_to)? {
            continue;
        }
        let duplicate = index
            .pending_requests(&action.group_to)?
            .iter()
            .any(|r| r.file_id == file.id && r.node_from == node.name);
        if duplicate {
            continue;
        }
        index.create_request(file.id, &node.name, &action.group_to)?;
        info!(
            "Autosync: requested {} from {} into {}",
            file.path().display(),
            node.name,
            action.group_to
        );
        report.requested.push(action.group_to.clone());
    }

    for action in actions.iter().filter(|a| a.autoclean && a.group_to == node.group) {
        if is_self_loop(index, action)? {
            debug!(
                "Ignoring autoclean self-loop {} -> {}",
                action.node_from, action.group_to
            );
            continue;
        }
        let Some(mut copy) = index.copy(file.id, &action.node_from)? else {
            continue;
        };
        if copy.has_file != HasFile::Healthy || copy.wants_file == WantsFile::Released {
            continue;
        }
        copy.wants_file = WantsFile::Released;
        copy.last_update = chrono::Utc::now();
        index.upsert_copy(&copy)?;
        info!(
            "Autoclean: released {} on {}",
            file.path().display(),
            action.node_from
        );
        report.released.push(action.node_from.clone());
    }

    Ok(report)
}
