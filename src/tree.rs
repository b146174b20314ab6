use std::collections::{BTreeMap, BTreeSet};

use crate::paths::matches_prefixes;
use crate::types::{FileEntry, FileMetadata, Tree, TreePatch, WatchEvent, WatchEventType};

/// Apply one patch in place: upsert `added`, then remove `deleted`.
pub fn apply_patch(tree: &mut Tree, patch: &TreePatch) {
    apply_changes(tree, &patch.added, &patch.deleted);
}

/// Apply raw changes in place, upserts before removals.
pub fn apply_changes(
    tree: &mut Tree,
    added: &BTreeMap<String, FileMetadata>,
    deleted: &BTreeSet<String>,
) {
    for (path, meta) in added {
        tree.insert(path.clone(), meta.clone());
    }
    for path in deleted {
        tree.remove(path);
    }
}

/// Rebuild a tree by folding `patches`, in the given order, over the empty tree.
pub fn fold(patches: &[TreePatch]) -> Tree {
    let mut tree = Tree::new();
    for patch in patches {
        apply_patch(&mut tree, patch);
    }
    tree
}

/// `true` when applying the changes would leave `tree` exactly as it is.
///
/// Upserts compare the whole entry, timestamps included.
pub fn is_noop(
    tree: &Tree,
    added: &BTreeMap<String, FileMetadata>,
    deleted: &BTreeSet<String>,
) -> bool {
    added
        .iter()
        .all(|(path, meta)| tree.get(path) == Some(meta) && !deleted.contains(path))
        && deleted.iter().all(|path| !tree.contains_key(path))
}

/// Change events for `patch`, given the tree as it was just before it.
///
/// Upserts of a path absent from `prev` are `Added`, otherwise `Modified`.
/// Removals of a present path are `Deleted`; removals of absent paths emit
/// nothing.
pub fn patch_events(prev: &Tree, patch: &TreePatch) -> Vec<WatchEvent> {
    let mut events = Vec::with_capacity(patch.added.len() + patch.deleted.len());

    for (path, meta) in &patch.added {
        if patch.deleted.contains(path) {
            continue;
        }
        let kind = if prev.contains_key(path) {
            WatchEventType::Modified
        } else {
            WatchEventType::Added
        };
        events.push(WatchEvent {
            kind,
            path: path.clone(),
            metadata: Some(meta.clone()),
            timestamp: patch.timestamp,
            patch_id: patch.id,
        });
    }

    for path in &patch.deleted {
        if !prev.contains_key(path) && !patch.added.contains_key(path) {
            continue;
        }
        events.push(WatchEvent {
            kind: WatchEventType::Deleted,
            path: path.clone(),
            metadata: None,
            timestamp: patch.timestamp,
            patch_id: patch.id,
        });
    }

    events
}

/// Entries whose path starts with any of `prefixes` (all entries if empty).
pub fn list(tree: &Tree, prefixes: &[String]) -> Vec<FileEntry> {
    tree.iter()
        .filter(|(path, _)| matches_prefixes(path, prefixes))
        .map(|(path, meta)| FileEntry {
            path: path.clone(),
            metadata: meta.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(addr: &str) -> FileMetadata {
        FileMetadata {
            address: addr.into(),
            user_metadata: Default::default(),
            size_in_bytes: 1,
            mtime: 1,
            ctime: 1,
        }
    }

    fn patch(id: u64, added: &[(&str, &str)], deleted: &[&str]) -> TreePatch {
        TreePatch {
            id,
            timestamp: id as i64 * 10,
            added: added
                .iter()
                .map(|(p, a)| (p.to_string(), meta(a)))
                .collect(),
            deleted: deleted.iter().map(|p| p.to_string()).collect(),
            metadata: None,
        }
    }

    #[test]
    fn fold_matches_incremental_application() {
        let patches = vec![
            patch(1, &[("/a", "x"), ("/b", "y")], &[]),
            patch(2, &[("/a", "z")], &["/b"]),
            patch(3, &[("/c", "w")], &[]),
        ];
        let mut live = Tree::new();
        for (n, p) in patches.iter().enumerate() {
            apply_patch(&mut live, p);
            assert_eq!(fold(&patches[..=n]), live);
        }
        assert_eq!(live.len(), 2);
        assert_eq!(live["/a"].address, "z");
    }

    #[test]
    fn deletes_apply_after_upserts() {
        let mut tree = Tree::new();
        apply_patch(&mut tree, &patch(1, &[("/a", "x")], &["/a"]));
        assert!(tree.is_empty());
    }

    #[test]
    fn noop_detection() {
        let mut tree = Tree::new();
        tree.insert("/a".into(), meta("x"));
        let same: BTreeMap<_, _> = [("/a".to_string(), meta("x"))].into();
        let none = BTreeSet::new();
        assert!(is_noop(&tree, &same, &none));
        assert!(is_noop(&tree, &BTreeMap::new(), &["/missing".to_string()].into()));
        assert!(!is_noop(&tree, &BTreeMap::new(), &["/a".to_string()].into()));
        let changed: BTreeMap<_, _> = [("/a".to_string(), meta("y"))].into();
        assert!(!is_noop(&tree, &changed, &none));
    }

    #[test]
    fn events_classify_against_previous_tree() {
        let mut prev = Tree::new();
        prev.insert("/old".into(), meta("x"));
        prev.insert("/gone".into(), meta("x"));
        let p = patch(4, &[("/old", "y"), ("/new", "z")], &["/gone", "/never"]);

        let events = patch_events(&prev, &p);
        let kinds: Vec<_> = events.iter().map(|e| (e.path.as_str(), e.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("/new", WatchEventType::Added),
                ("/old", WatchEventType::Modified),
                ("/gone", WatchEventType::Deleted),
            ]
        );
        assert!(events.iter().all(|e| e.patch_id == 4 && e.timestamp == 40));
    }

    #[test]
    fn list_filters_by_prefix() {
        let mut tree = Tree::new();
        tree.insert("/a/1".into(), meta("x"));
        tree.insert("/a/2".into(), meta("x"));
        tree.insert("/b/1".into(), meta("x"));
        assert_eq!(list(&tree, &[]).len(), 3);
        assert_eq!(list(&tree, &["/a/".into()]).len(), 2);
        assert_eq!(list(&tree, &["/b".into(), "/a/1".into()]).len(), 2);
        assert!(list(&tree, &["/c".into()]).is_empty());
    }
}
