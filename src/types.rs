use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{Error, Result};

/// Free-form user metadata attached to a file.
pub type UserMetadata = serde_json::Map<String, serde_json::Value>;

/// Full `path → metadata` snapshot of a branch.
pub type Tree = BTreeMap<String, FileMetadata>;

// ---------------------------------------------------------------------------
// BlobInfo
// ---------------------------------------------------------------------------

/// Address and size of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobInfo {
    /// Lowercase SHA-256 hex of the content.
    pub hash: String,
    pub size: u64,
}

// ---------------------------------------------------------------------------
// FileMetadata
// ---------------------------------------------------------------------------

/// Metadata of one file in a tree.
///
/// `mtime` moves only when the content (address) changes; `ctime` moves when
/// the content or the user metadata changes. Both are milliseconds since the
/// UNIX epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub address: String,
    #[serde(default)]
    pub user_metadata: UserMetadata,
    pub size_in_bytes: u64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileMetadata {
    /// Same blob and deep-equal user metadata. Timestamps are ignored.
    pub fn same_version(&self, other: &FileMetadata) -> bool {
        self.address == other.address && self.user_metadata == other.user_metadata
    }
}

// ---------------------------------------------------------------------------
// TreePatch
// ---------------------------------------------------------------------------

/// What produced a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PatchKind {
    Seed,
    Write,
    Delete,
    Transaction,
    Merge,
    SoftDelete,
}

/// Optional annotation stored with a patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchMetadata {
    #[serde(rename = "type")]
    pub kind: PatchKind,
    /// Source branch of a merge or seed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl PatchMetadata {
    pub fn new(kind: PatchKind) -> Self {
        Self { kind, source: None }
    }

    pub fn with_source(kind: PatchKind, source: impl Into<String>) -> Self {
        Self {
            kind,
            source: Some(source.into()),
        }
    }
}

/// One append-only entry of a branch's patch log.
///
/// Applying `added` (upsert) and then `deleted` (remove) to the tree before
/// patch `id` yields the tree after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreePatch {
    pub id: u64,
    pub timestamp: i64,
    #[serde(default)]
    pub added: BTreeMap<String, FileMetadata>,
    #[serde(default)]
    pub deleted: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PatchMetadata>,
}

impl TreePatch {
    pub fn kind(&self) -> Option<PatchKind> {
        self.metadata.as_ref().map(|m| m.kind)
    }
}

// ---------------------------------------------------------------------------
// BranchKey / BranchState
// ---------------------------------------------------------------------------

/// Identity of a branch: `(project_id, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchKey {
    pub project_id: String,
    pub name: String,
}

impl BranchKey {
    pub fn new(project_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for BranchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.project_id, self.name)
    }
}

/// The single "current state" row of a branch, rewritten on every patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchState {
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub tree: Tree,
    /// Last stamp issued by the branch clock.
    #[serde(default)]
    pub updated_at: i64,
}

impl BranchState {
    pub fn empty(key: &BranchKey, origin: Option<String>) -> Self {
        Self {
            project_id: key.project_id.clone(),
            name: key.name.clone(),
            origin,
            seq: 0,
            tree: Tree::new(),
            updated_at: 0,
        }
    }

    pub fn key(&self) -> BranchKey {
        BranchKey::new(self.project_id.clone(), self.name.clone())
    }
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// One path of a transactional write. `content: None` deletes the path.
#[derive(Debug, Clone, Default)]
pub struct WriteRequest {
    pub path: String,
    pub content: Option<Bytes>,
    pub metadata: Option<UserMetadata>,
    /// Optimistic-concurrency token: the ctime the caller last observed.
    pub expected_ctime: Option<i64>,
    /// Declared modification time for last-write-wins; defaults to the commit stamp.
    pub mtime: Option<i64>,
}

impl WriteRequest {
    pub fn write(path: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, metadata: UserMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn if_ctime(mut self, expected_ctime: i64) -> Self {
        self.expected_ctime = Some(expected_ctime);
        self
    }

    pub fn with_mtime(mut self, mtime: i64) -> Self {
        self.mtime = Some(mtime);
        self
    }
}

/// Which side kept the path after a forced conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// The current value was kept; the candidate was dropped.
    Local,
    /// The candidate replaced the current value.
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEntry {
    pub path: String,
    pub expected_ctime: i64,
    pub actual_ctime: Option<i64>,
    pub resolved: Resolution,
}

/// Per-path outcome of a transactional write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResult {
    pub path: String,
    pub success: bool,
    /// New metadata when applied; current metadata when the local side won;
    /// `None` for deletions.
    pub metadata: Option<FileMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictEntry>,
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// A path and its metadata, as returned by listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub metadata: FileMetadata,
}

/// A listed file with its content inlined. Serializes content as base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileWithContent {
    pub path: String,
    pub metadata: FileMetadata,
    #[serde(serialize_with = "serialize_base64")]
    pub content: Bytes,
}

impl FileWithContent {
    pub fn content_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.content)
    }

    /// Content as UTF-8, if it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }
}

fn serialize_base64<S: Serializer>(content: &Bytes, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(content))
}

// ---------------------------------------------------------------------------
// Diff / merge
// ---------------------------------------------------------------------------

/// One path that differs. `metadata: None` means "delete to converge".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: String,
    pub metadata: Option<FileMetadata>,
}

impl DiffEntry {
    pub fn is_delete(&self) -> bool {
        self.metadata.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStrategy {
    /// The other branch's value always wins.
    #[default]
    Override,
    /// Forced conditional write; the newer declared mtime wins.
    LastWriteWins,
}

impl std::str::FromStr for MergeStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "override" => Ok(Self::Override),
            "last_write_wins" | "lww" => Ok(Self::LastWriteWins),
            other => Err(Error::invalid_argument(format!(
                "unknown merge strategy: {}",
                other
            ))),
        }
    }
}

/// Outcome of a merge. Path lists hold only paths that were applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub success: bool,
    pub files_merged: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<ConflictEntry>,
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

// ---------------------------------------------------------------------------
// Watch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// One change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub kind: WatchEventType,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FileMetadata>,
    pub timestamp: i64,
    pub patch_id: u64,
}

#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Replay patches with `timestamp > from_ctime` before going live.
    pub from_ctime: Option<i64>,
    /// Initial path prefixes; empty watches everything.
    pub path_filters: Vec<String>,
    /// Explicit watcher id; generated when `None`.
    pub watcher_id: Option<String>,
}

// ---------------------------------------------------------------------------
// OpenOptions / BranchConfig
// ---------------------------------------------------------------------------

/// Options for opening a `Store`.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// On-disk root; `None` keeps everything in memory.
    pub root: Option<PathBuf>,
    /// Create `root` if it doesn't exist.
    pub create: bool,
    /// Bound of each branch actor's command queue.
    pub mailbox_capacity: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            root: None,
            create: false,
            mailbox_capacity: 64,
        }
    }
}

impl OpenOptions {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn on_disk(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            create: true,
            ..Self::default()
        }
    }
}

/// Parameters for creating a branch.
#[derive(Debug, Clone, Default)]
pub struct BranchConfig {
    pub name: String,
    pub origin: Option<String>,
    /// Seeded as patch 1 when non-empty.
    pub initial_tree: Option<Tree>,
}

impl BranchConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_tree(mut self, tree: Tree) -> Self {
        self.initial_tree = Some(tree);
        self
    }
}
