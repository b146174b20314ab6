//! Candidate building and conflict resolution for multi-path writes.
//!
//! Everything here is synchronous and pure: the branch actor calls
//! [`resolve`] against its current tree and folds the outcome into a single
//! patch, so no other write can interleave between comparing and deciding.
//!
//! Two ways produce [`Candidate`]s:
//! - [`stamp`] for ordinary writes: timestamps come from the branch clock.
//! - `diff::merge_plan` for merges: timestamps are carried over from the
//!   source branch unchanged.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{Error, Result};
use crate::types::{
    BlobInfo, ConflictEntry, FileMetadata, Resolution, Tree, UserMetadata, WriteResult,
};

/// One path of a write after its content has been stored.
#[derive(Debug, Clone)]
pub struct Intent {
    pub path: String,
    /// `None` deletes.
    pub blob: Option<BlobInfo>,
    pub user_metadata: Option<UserMetadata>,
    pub expected_ctime: Option<i64>,
    pub mtime: Option<i64>,
}

/// A fully built value for one path, ready to be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: String,
    /// `None` deletes.
    pub value: Option<FileMetadata>,
    /// Declared mtime used by last-write-wins. `None` means the commit stamp,
    /// not the mtime kept on `value` by the timestamp law.
    pub mtime: Option<i64>,
    pub expected_ctime: Option<i64>,
}

impl Candidate {
    fn declared_mtime(&self, now: i64) -> i64 {
        self.mtime.unwrap_or(now)
    }
}

/// Outcome of resolving candidates against a tree.
#[derive(Debug, Clone, Default)]
pub struct Resolved {
    pub added: BTreeMap<String, FileMetadata>,
    pub deleted: BTreeSet<String>,
    /// One result per distinct path, in first-seen order.
    pub results: Vec<WriteResult>,
}

impl Resolved {
    pub fn conflicts(&self) -> impl Iterator<Item = &ConflictEntry> {
        self.results.iter().filter_map(|r| r.conflict.as_ref())
    }
}

/// Build candidates for ordinary writes, stamping with `now`.
///
/// Same address as the current file keeps its mtime; same address and same
/// user metadata keeps its ctime too. A declared `mtime` replaces the
/// stamped one.
pub fn stamp(tree: &Tree, intents: Vec<Intent>, now: i64) -> Vec<Candidate> {
    intents
        .into_iter()
        .map(|intent| {
            let value = intent.blob.map(|blob| {
                let user_metadata = intent.user_metadata.unwrap_or_default();
                let (mtime, ctime) = match tree.get(&intent.path) {
                    Some(cur) if cur.address == blob.hash => {
                        let ctime = if cur.user_metadata == user_metadata {
                            cur.ctime
                        } else {
                            now
                        };
                        (cur.mtime, ctime)
                    }
                    _ => (now, now),
                };
                FileMetadata {
                    address: blob.hash,
                    user_metadata,
                    size_in_bytes: blob.size,
                    mtime: intent.mtime.unwrap_or(mtime),
                    ctime,
                }
            });
            Candidate {
                path: intent.path,
                value,
                mtime: intent.mtime,
                expected_ctime: intent.expected_ctime,
            }
        })
        .collect()
}

/// Resolve `candidates` against `tree`.
///
/// A candidate without `expected_ctime`, or whose `expected_ctime` equals the
/// current ctime, is applied. On a mismatch:
/// - `force == false`: the whole call fails with [`Error::Conflict`].
/// - `force == true`: the candidate is applied if its declared mtime is newer
///   than the current mtime (or the file is absent), tagged
///   [`Resolution::Remote`]; otherwise the current value stays, tagged
///   [`Resolution::Local`], and the rest of the call still proceeds.
///
/// Later candidates for the same path replace earlier ones.
pub fn resolve(tree: &Tree, candidates: Vec<Candidate>, force: bool, now: i64) -> Result<Resolved> {
    let mut order: Vec<Candidate> = Vec::with_capacity(candidates.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for cand in candidates {
        match index.get(&cand.path) {
            Some(&i) => order[i] = cand,
            None => {
                index.insert(cand.path.clone(), order.len());
                order.push(cand);
            }
        }
    }

    let mut out = Resolved::default();
    for cand in order {
        let current = tree.get(&cand.path);
        let actual = current.map(|c| c.ctime);

        let conflict = match cand.expected_ctime {
            Some(expected) if actual != Some(expected) => {
                if !force {
                    return Err(Error::conflict(cand.path, expected, actual));
                }
                let remote_wins = match current {
                    Some(cur) => cand.declared_mtime(now) > cur.mtime,
                    None => true,
                };
                Some(ConflictEntry {
                    path: cand.path.clone(),
                    expected_ctime: expected,
                    actual_ctime: actual,
                    resolved: if remote_wins {
                        Resolution::Remote
                    } else {
                        Resolution::Local
                    },
                })
            }
            _ => None,
        };

        if matches!(&conflict, Some(c) if c.resolved == Resolution::Local) {
            out.results.push(WriteResult {
                path: cand.path,
                success: false,
                metadata: current.cloned(),
                address: current.map(|c| c.address.clone()),
                conflict,
            });
            continue;
        }

        match cand.value {
            Some(value) => {
                out.results.push(WriteResult {
                    path: cand.path.clone(),
                    success: true,
                    address: Some(value.address.clone()),
                    metadata: Some(value.clone()),
                    conflict,
                });
                out.added.insert(cand.path, value);
            }
            None => {
                if current.is_some() {
                    out.deleted.insert(cand.path.clone());
                }
                out.results.push(WriteResult {
                    path: cand.path,
                    success: true,
                    metadata: None,
                    address: None,
                    conflict,
                });
            }
        }
    }

    Ok(out)
}
