//! File copy state transitions.
//!
//! Pure decision logic for the check, pull and delete transitions. The
//! task bodies in [`crate::io::ops`] gather the facts (on-disk size, hash,
//! other copies) and persist what these functions decide.

use chrono::Utc;

use crate::types::{ArchiveFile, ArchiveFileCopy, HasFile, StorageNode, WantsFile};

/// Healthy+kept copies required elsewhere before deleting from a non-archive node.
pub const MIN_OTHER_COPIES: usize = 2;

/// Healthy+kept copies required elsewhere before deleting from an archive node.
pub const MIN_OTHER_COPIES_ARCHIVE: usize = 3;

/// Result of verifying a file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The file is not on disk.
    Missing,
    /// Size or hash disagrees with the registered file.
    Corrupt,
    /// Size and hash agree. Carries the on-disk size.
    Healthy {
        /// Size on disk in bytes.
        size_b: u64,
    },
    /// The file exists but could not be read to completion.
    Unreadable,
}

impl CheckOutcome {
    /// The recorded state this outcome maps to.
    pub fn has_file(&self) -> HasFile {
        match self {
            CheckOutcome::Missing => HasFile::Missing,
            CheckOutcome::Corrupt => HasFile::Corrupt,
            CheckOutcome::Healthy { .. } => HasFile::Healthy,
            CheckOutcome::Unreadable => HasFile::Suspect,
        }
    }
}

/// Decides the check transition.
///
/// A size mismatch is conclusive, so `hash` is only called when the size
/// agrees. `hash` returns `None` if the file could not be read.
pub fn evaluate_check<H>(file: &ArchiveFile, on_disk_size: Option<u64>, hash: H) -> CheckOutcome
where
    H: FnOnce() -> Option<String>,
{
    let Some(size) = on_disk_size else {
        return CheckOutcome::Missing;
    };
    if size != file.size_b {
        return CheckOutcome::Corrupt;
    }
    match hash() {
        None => CheckOutcome::Unreadable,
        Some(digest) if digest.eq_ignore_ascii_case(&file.md5sum) => CheckOutcome::Healthy { size_b: size },
        Some(_) => CheckOutcome::Corrupt,
    }
}

/// Applies a check outcome to a copy. Returns true if the copy newly became healthy.
///
/// A healthy outcome leaves the ready bit alone; anything else clears it.
pub fn apply_check(copy: &mut ArchiveFileCopy, outcome: &CheckOutcome) -> bool {
    let was_healthy = copy.has_file == HasFile::Healthy;
    copy.has_file = outcome.has_file();
    match outcome {
        CheckOutcome::Healthy { size_b } => {
            copy.size_b = Some(*size_b);
        }
        CheckOutcome::Missing => {
            copy.size_b = None;
            copy.ready = false;
        }
        CheckOutcome::Corrupt | CheckOutcome::Unreadable => {
            copy.ready = false;
        }
    }
    copy.last_update = Utc::now();
    !was_healthy && copy.has_file == HasFile::Healthy
}

/// The copy record written after a verified pull.
pub fn pulled_copy(file: &ArchiveFile, node: &str, size_b: u64, ready: bool) -> ArchiveFileCopy {
    let mut copy = ArchiveFileCopy::new(file.id, node, HasFile::Healthy, WantsFile::Keep);
    copy.size_b = Some(size_b);
    copy.ready = ready;
    copy
}

/// Marks a source copy for re-verification after a pull blamed it.
pub fn suspect_source(copy: &mut ArchiveFileCopy) {
    if copy.has_file == HasFile::Healthy {
        copy.has_file = HasFile::Suspect;
        copy.last_update = Utc::now();
    }
}

/// Marks a copy deleted.
pub fn deleted(copy: &mut ArchiveFileCopy) {
    copy.has_file = HasFile::Missing;
    copy.wants_file = WantsFile::Released;
    copy.ready = false;
    copy.size_b = None;
    copy.last_update = Utc::now();
}

/// Copies required elsewhere before a copy on `node` may be deleted.
pub fn required_other_copies(node: &StorageNode) -> usize {
    if node.is_archive() {
        MIN_OTHER_COPIES_ARCHIVE
    } else {
        MIN_OTHER_COPIES
    }
}

/// Safety gate for deleting a copy from `node`.
///
/// `others` are the other copies of the file paired with their node. Only
/// healthy, kept copies on active nodes count, at least one of which must
/// be on an archive node.
pub fn deletion_allowed(node: &StorageNode, others: &[(ArchiveFileCopy, StorageNode)]) -> bool {
    let counted: Vec<&StorageNode> = others
        .iter()
        .filter(|(copy, other)| other.name != node.name && other.active && copy.is_healthy_kept())
        .map(|(_, other)| other)
        .collect();
    let authoritative = counted.iter().any(|n| n.is_archive());
    authoritative && counted.len() >= required_other_copies(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeRole;
    use std::cell::Cell;

    fn file() -> ArchiveFile {
        ArchiveFile {
            id: 1,
            acq: "acq".into(),
            name: "f".into(),
            size_b: 5,
            md5sum: "ABCDEF".into(),
            registered: Utc::now(),
        }
    }

    fn node(name: &str, role: NodeRole) -> StorageNode {
        StorageNode::new(name, format!("/{}", name), format!("{}_group", name)).with_role(role)
    }

    fn kept(name: &str) -> ArchiveFileCopy {
        ArchiveFileCopy::new(1, name, HasFile::Healthy, WantsFile::Keep)
    }

    #[test]
    fn test_check_missing() {
        assert_eq!(evaluate_check(&file(), None, || unreachable!()), CheckOutcome::Missing);
    }

    #[test]
    fn test_check_size_mismatch_skips_hash() {
        let hashed = Cell::new(false);
        let outcome = evaluate_check(&file(), Some(4), || {
            hashed.set(true);
            Some("abcdef".into())
        });
        assert_eq!(outcome, CheckOutcome::Corrupt);
        assert!(!hashed.get());
    }

    #[test]
    fn test_check_hash_mismatch() {
        let outcome = evaluate_check(&file(), Some(5), || Some("000000".into()));
        assert_eq!(outcome, CheckOutcome::Corrupt);
    }

    #[test]
    fn test_check_healthy_ignores_hex_case() {
        let outcome = evaluate_check(&file(), Some(5), || Some("abcdef".into()));
        assert_eq!(outcome, CheckOutcome::Healthy { size_b: 5 });
    }

    #[test]
    fn test_check_unreadable_is_suspect() {
        let outcome = evaluate_check(&file(), Some(5), || None);
        assert_eq!(outcome.has_file(), HasFile::Suspect);
    }

    #[test]
    fn test_apply_check_reports_new_health() {
        let mut copy = ArchiveFileCopy::new(1, "n", HasFile::Suspect, WantsFile::Keep);
        copy.ready = true;
        assert!(apply_check(&mut copy, &CheckOutcome::Healthy { size_b: 5 }));
        assert!(copy.ready);
        assert_eq!(copy.size_b, Some(5));
        // already healthy: not a new transition
        assert!(!apply_check(&mut copy, &CheckOutcome::Healthy { size_b: 5 }));
        assert!(!apply_check(&mut copy, &CheckOutcome::Missing));
        assert_eq!(copy.has_file, HasFile::Missing);
        assert!(!copy.ready);
    }

    #[test]
    fn test_pulled_copy() {
        let copy = pulled_copy(&file(), "dest", 5, false);
        assert!(copy.is_healthy_kept());
        assert!(!copy.ready);
        assert_eq!(copy.size_b, Some(5));
    }

    #[test]
    fn test_suspect_source_only_downgrades_healthy() {
        let mut copy = kept("src");
        suspect_source(&mut copy);
        assert_eq!(copy.has_file, HasFile::Suspect);
        let mut corrupt = ArchiveFileCopy::new(1, "src", HasFile::Corrupt, WantsFile::Keep);
        suspect_source(&mut corrupt);
        assert_eq!(corrupt.has_file, HasFile::Corrupt);
    }

    #[test]
    fn test_deleted() {
        let mut copy = kept("n");
        deleted(&mut copy);
        assert_eq!(copy.has_file, HasFile::Missing);
        assert_eq!(copy.wants_file, WantsFile::Released);
    }

    #[test]
    fn test_delete_gate_one_archive_two_field() {
        let archive = node("arc", NodeRole::Archive);
        let field1 = node("f1", NodeRole::Field);
        let field2 = node("f2", NodeRole::Field);
        let all = vec![
            (kept("arc"), archive.clone()),
            (kept("f1"), field1.clone()),
            (kept("f2"), field2.clone()),
        ];

        assert!(deletion_allowed(&field1, &all));
        assert!(deletion_allowed(&field2, &all));
        assert!(!deletion_allowed(&archive, &all));
    }

    #[test]
    fn test_delete_gate_needs_archive_copy() {
        let f1 = node("f1", NodeRole::Field);
        let others = vec![
            (kept("f2"), node("f2", NodeRole::Field)),
            (kept("f3"), node("f3", NodeRole::Field)),
        ];
        assert!(!deletion_allowed(&f1, &others));
    }

    #[test]
    fn test_delete_gate_ignores_unhealthy_and_released() {
        let f1 = node("f1", NodeRole::Field);
        let mut released = kept("a2");
        released.wants_file = WantsFile::Released;
        let suspect = ArchiveFileCopy::new(1, "a3", HasFile::Suspect, WantsFile::Keep);
        let others = vec![
            (kept("a1"), node("a1", NodeRole::Archive)),
            (released, node("a2", NodeRole::Archive)),
            (suspect, node("a3", NodeRole::Archive)),
        ];
        assert!(!deletion_allowed(&f1, &others));
    }

    #[test]
    fn test_delete_gate_archive_with_three_others() {
        let arc = node("arc", NodeRole::Archive);
        let others = vec![
            (kept("a1"), node("a1", NodeRole::Archive)),
            (kept("a2"), node("a2", NodeRole::Archive)),
            (kept("f1"), node("f1", NodeRole::Field)),
        ];
        assert!(deletion_allowed(&arc, &others));
    }

    #[test]
    fn test_delete_gate_ignores_inactive_nodes() {
        let f1 = node("f1", NodeRole::Field);
        let mut gone = node("a2", NodeRole::Archive);
        gone.active = false;
        let others = vec![(kept("a1"), node("a1", NodeRole::Archive)), (kept("a2"), gone)];
        assert!(!deletion_allowed(&f1, &others));
    }
}
