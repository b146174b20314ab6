//! Directional tree diff and merge planning.
//!
//! `diff_trees(desired, current)` answers "what must `current` apply to
//! become `desired`". Merge turns that answer into write candidates that keep
//! the source's timestamps, so a merged file does not look like a fresh edit.

use std::collections::BTreeSet;

use crate::transaction::{Candidate, Resolved};
use crate::types::{DiffEntry, MergeResult, MergeStrategy, Tree};

/// Differences between two trees, sorted by path.
///
/// - only in `desired`: entry with its metadata (add)
/// - only in `current`: entry with `None` (delete)
/// - in both with a different address or user metadata: entry with the
///   desired metadata (modify)
///
/// Timestamps alone never make two entries differ.
pub fn diff_trees(desired: &Tree, current: &Tree) -> Vec<DiffEntry> {
    let mut out = Vec::new();

    for (path, want) in desired {
        match current.get(path) {
            Some(have) if have.same_version(want) => {}
            _ => out.push(DiffEntry {
                path: path.clone(),
                metadata: Some(want.clone()),
            }),
        }
    }

    for path in current.keys() {
        if !desired.contains_key(path) {
            out.push(DiffEntry {
                path: path.clone(),
                metadata: None,
            });
        }
    }

    out.sort_by(|a, b| a.path.cmp(&b.path));
    out
}

/// Merge candidates plus the add/modify/delete classification of each path.
#[derive(Debug, Clone, Default)]
pub struct MergePlan {
    pub candidates: Vec<Candidate>,
    pub added: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Turn a diff into merge candidates against `current`.
///
/// Values are taken verbatim from the diff, timestamps included. Under
/// [`MergeStrategy::LastWriteWins`] every modified or deleted path that
/// exists in `current` is conditioned on its current ctime, so a concurrent
/// edit between planning and committing is settled by mtime.
pub fn merge_plan(diff: Vec<DiffEntry>, current: &Tree, strategy: MergeStrategy) -> MergePlan {
    let mut plan = MergePlan::default();

    for entry in diff {
        let existing = current.get(&entry.path);
        match (&entry.metadata, existing) {
            (Some(_), Some(_)) => plan.modified.insert(entry.path.clone()),
            (Some(_), None) => plan.added.insert(entry.path.clone()),
            (None, _) => plan.deleted.insert(entry.path.clone()),
        };

        let expected_ctime = match strategy {
            MergeStrategy::Override => None,
            MergeStrategy::LastWriteWins => existing.map(|e| e.ctime),
        };

        plan.candidates.push(Candidate {
            mtime: entry.metadata.as_ref().map(|m| m.mtime),
            path: entry.path,
            value: entry.metadata,
            expected_ctime,
        });
    }

    plan
}

/// Fold resolution results into a [`MergeResult`]; lists keep only applied paths.
pub fn summarize(plan: &MergePlan, resolved: &Resolved) -> MergeResult {
    let mut result = MergeResult {
        success: true,
        conflicts: resolved.conflicts().cloned().collect(),
        ..Default::default()
    };

    for r in resolved.results.iter().filter(|r| r.success) {
        if plan.added.contains(&r.path) {
            result.added.push(r.path.clone());
        } else if plan.modified.contains(&r.path) {
            result.modified.push(r.path.clone());
        } else if plan.deleted.contains(&r.path) {
            result.deleted.push(r.path.clone());
        }
    }
    result.files_merged = result.added.len() + result.modified.len() + result.deleted.len();
    result
}
