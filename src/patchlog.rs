//! Durable branch rows: one "current state" row per branch plus an
//! append-only patch table.
//!
//! Rows read back from storage are normalized into [`BranchState`] and
//! [`TreePatch`] right here, so nothing above this module sees the stored
//! shape. Older rows that stored maps as `[path, value]` pair lists are
//! accepted alongside the map form.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::lock::with_branch_lock;
use crate::types::{BranchKey, BranchState, FileMetadata, PatchMetadata, TreePatch};

/// Row storage for branch state and patches.
#[async_trait]
pub trait PatchLog: Send + Sync {
    /// The current-state row, or `None` for a branch never persisted.
    async fn load_state(&self, key: &BranchKey) -> Result<Option<BranchState>>;

    /// Upsert the current-state row alone (no patch).
    async fn save_state(&self, state: &BranchState) -> Result<()>;

    /// Append `patch` and upsert `state` together.
    ///
    /// # Errors
    /// Rejects a patch whose id does not follow the last stored id.
    async fn commit(&self, patch: &TreePatch, state: &BranchState) -> Result<()>;

    /// Patches ordered by id, optionally only those with `timestamp > after`.
    async fn patches(&self, key: &BranchKey, after: Option<i64>) -> Result<Vec<TreePatch>>;
}

fn check_next_id(key: &BranchKey, last: Option<u64>, patch: &TreePatch) -> Result<()> {
    let expected = last.unwrap_or(0) + 1;
    if patch.id != expected {
        return Err(Error::storage_msg(format!(
            "patch {} out of order for {}: expected id {}",
            patch.id, key, expected
        )));
    }
    Ok(())
}

fn filter_after(patches: Vec<TreePatch>, after: Option<i64>) -> Vec<TreePatch> {
    match after {
        Some(ts) => patches.into_iter().filter(|p| p.timestamp > ts).collect(),
        None => patches,
    }
}

// ---------------------------------------------------------------------------
// Row normalization
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(untagged)]
enum MetadataRows {
    Map(BTreeMap<String, FileMetadata>),
    Pairs(Vec<(String, FileMetadata)>),
}

impl Default for MetadataRows {
    fn default() -> Self {
        Self::Map(BTreeMap::new())
    }
}

impl From<MetadataRows> for BTreeMap<String, FileMetadata> {
    fn from(rows: MetadataRows) -> Self {
        match rows {
            MetadataRows::Map(map) => map,
            MetadataRows::Pairs(pairs) => pairs.into_iter().collect(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PathRows {
    List(Vec<String>),
    Map(BTreeMap<String, serde_json::Value>),
}

impl Default for PathRows {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl From<PathRows> for BTreeSet<String> {
    fn from(rows: PathRows) -> Self {
        match rows {
            PathRows::List(list) => list.into_iter().collect(),
            PathRows::Map(map) => map.into_keys().collect(),
        }
    }
}

#[derive(Deserialize)]
struct PatchRecord {
    id: u64,
    timestamp: i64,
    #[serde(default)]
    added: MetadataRows,
    #[serde(default)]
    deleted: PathRows,
    #[serde(default)]
    metadata: Option<PatchMetadata>,
}

impl From<PatchRecord> for TreePatch {
    fn from(r: PatchRecord) -> Self {
        TreePatch {
            id: r.id,
            timestamp: r.timestamp,
            added: r.added.into(),
            deleted: r.deleted.into(),
            metadata: r.metadata,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateRecord {
    project_id: String,
    name: String,
    #[serde(default)]
    origin: Option<String>,
    #[serde(default)]
    seq: u64,
    #[serde(default)]
    tree: MetadataRows,
    #[serde(default)]
    updated_at: i64,
}

impl From<StateRecord> for BranchState {
    fn from(r: StateRecord) -> Self {
        BranchState {
            project_id: r.project_id,
            name: r.name,
            origin: r.origin,
            seq: r.seq,
            tree: r.tree.into(),
            updated_at: r.updated_at,
        }
    }
}

/// Parse one stored patch row.
pub fn parse_patch(row: &str) -> Result<TreePatch> {
    let record: PatchRecord = serde_json::from_str(row)?;
    Ok(record.into())
}

/// Parse one stored state row.
pub fn parse_state(row: &str) -> Result<BranchState> {
    let record: StateRecord = serde_json::from_str(row)?;
    Ok(record.into())
}

// ---------------------------------------------------------------------------
// MemoryPatchLog
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct BranchRows {
    state: Option<BranchState>,
    patches: Vec<TreePatch>,
}

/// In-memory rows, for tests and ephemeral stores.
#[derive(Debug, Default)]
pub struct MemoryPatchLog {
    rows: DashMap<BranchKey, BranchRows>,
}

impl MemoryPatchLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PatchLog for MemoryPatchLog {
    async fn load_state(&self, key: &BranchKey) -> Result<Option<BranchState>> {
        Ok(self.rows.get(key).and_then(|r| r.state.clone()))
    }

    async fn save_state(&self, state: &BranchState) -> Result<()> {
        self.rows.entry(state.key()).or_default().state = Some(state.clone());
        Ok(())
    }

    async fn commit(&self, patch: &TreePatch, state: &BranchState) -> Result<()> {
        let key = state.key();
        let mut rows = self.rows.entry(key.clone()).or_default();
        check_next_id(&key, rows.patches.last().map(|p| p.id), patch)?;
        rows.patches.push(patch.clone());
        rows.state = Some(state.clone());
        Ok(())
    }

    async fn patches(&self, key: &BranchKey, after: Option<i64>) -> Result<Vec<TreePatch>> {
        let patches = self
            .rows
            .get(key)
            .map(|r| r.patches.clone())
            .unwrap_or_default();
        Ok(filter_after(patches, after))
    }
}

// ---------------------------------------------------------------------------
// DiskPatchLog
// ---------------------------------------------------------------------------

/// Rows on disk: `<root>/<project>/branches/<name>/{state.json,patches.jsonl}`.
///
/// The patch table is JSON lines, appended and synced before the state row
/// is replaced (write to a temp file, then rename). If the state row cannot
/// be written the appended line is cut off again, so a failed commit leaves
/// no patch behind. A crash between the two steps leaves the log ahead of
/// the state row; `load_state` rolls the state forward from the log.
///
/// A final line that does not parse is a torn append: readers skip it and
/// the next commit truncates it.
#[derive(Debug, Clone)]
pub struct DiskPatchLog {
    root: PathBuf,
    /// Last known end of each patch file, so commits skip the full scan.
    tails: Arc<DashMap<BranchKey, LogTail>>,
}

#[derive(Debug, Clone, Copy)]
struct LogTail {
    len: u64,
    last_id: Option<u64>,
}

struct PatchFile {
    patches: Vec<TreePatch>,
    /// End of the last intact line.
    valid_len: u64,
    len: u64,
    /// Whether the intact part ends with a newline.
    terminated: bool,
}

const STATE_FILE: &str = "state.json";
const PATCH_FILE: &str = "patches.jsonl";

fn file_len(path: &Path) -> Result<u64> {
    match std::fs::metadata(path) {
        Ok(m) => Ok(m.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(Error::io(path, e)),
    }
}

impl DiskPatchLog {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| Error::io(&root, e))?;
        Ok(Self {
            root,
            tails: Arc::new(DashMap::new()),
        })
    }

    fn branch_dir(root: &Path, key: &BranchKey) -> PathBuf {
        root.join(&key.project_id).join("branches").join(&key.name)
    }

    fn read_patch_file(dir: &Path) -> Result<PatchFile> {
        let path = dir.join(PATCH_FILE);
        let data = match std::fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PatchFile {
                    patches: vec![],
                    valid_len: 0,
                    len: 0,
                    terminated: true,
                })
            }
            Err(e) => return Err(Error::io(&path, e)),
        };

        let mut lines = Vec::new();
        let mut start = 0;
        for (i, b) in data.iter().enumerate() {
            if *b == b'\n' {
                lines.push((start, i + 1));
                start = i + 1;
            }
        }
        if start < data.len() {
            lines.push((start, data.len()));
        }
        let blank = |(s, e): (usize, usize)| data[s..e].iter().all(u8::is_ascii_whitespace);
        let last = lines.iter().rposition(|&l| !blank(l));

        let mut patches = Vec::with_capacity(lines.len());
        let mut valid_len = data.len();
        for (i, &(s, e)) in lines.iter().enumerate() {
            if blank((s, e)) {
                continue;
            }
            let parsed = std::str::from_utf8(&data[s..e])
                .map_err(Error::storage)
                .and_then(|line| parse_patch(line.trim()));
            match parsed {
                Ok(p) => patches.push(p),
                Err(err) if Some(i) == last => {
                    tracing::warn!(path = %path.display(), error = %err, "ignoring torn patch log tail");
                    valid_len = s;
                }
                Err(err) => return Err(err),
            }
        }
        patches.sort_by_key(|p| p.id);
        Ok(PatchFile {
            patches,
            valid_len: valid_len as u64,
            len: data.len() as u64,
            terminated: data[..valid_len].last().map_or(true, |&b| b == b'\n'),
        })
    }

    fn read_patches(dir: &Path) -> Result<Vec<TreePatch>> {
        Ok(Self::read_patch_file(dir)?.patches)
    }

    fn read_state(dir: &Path) -> Result<Option<BranchState>> {
        let path = dir.join(STATE_FILE);
        match std::fs::read_to_string(&path) {
            Ok(c) => Ok(Some(parse_state(&c)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(&path, e)),
        }
    }

    fn write_state(dir: &Path, state: &BranchState) -> Result<()> {
        let path = dir.join(STATE_FILE);
        let tmp = dir.join(format!(".{}.tmp", STATE_FILE));
        let data = serde_json::to_vec(state)?;
        let mut f = std::fs::File::create(&tmp).map_err(|e| Error::io(&tmp, e))?;
        f.write_all(&data).map_err(|e| Error::io(&tmp, e))?;
        f.sync_all().map_err(|e| Error::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| Error::io(&path, e))?;
        Ok(())
    }

    fn append_patch(dir: &Path, patch: &TreePatch) -> Result<()> {
        let path = dir.join(PATCH_FILE);
        let line = serde_json::to_string(patch)?;
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;
        writeln!(f, "{}", line).map_err(|e| Error::io(&path, e))?;
        f.sync_data().map_err(|e| Error::io(&path, e))?;
        Ok(())
    }

    fn truncate(path: &Path, len: u64) -> Result<()> {
        let f = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| Error::io(path, e))?;
        f.set_len(len).map_err(|e| Error::io(path, e))?;
        f.sync_data().map_err(|e| Error::io(path, e))
    }

    /// Last stored id and the file length a new line is appended at.
    /// Falls back to a full scan when the file changed behind the cache,
    /// and repairs a torn tail on the way. Call with the branch lock held.
    fn log_tail(&self, dir: &Path, key: &BranchKey) -> Result<LogTail> {
        let path = dir.join(PATCH_FILE);
        let len = file_len(&path)?;
        if let Some(tail) = self.tails.get(key) {
            if tail.len == len {
                return Ok(*tail);
            }
        }

        let file = Self::read_patch_file(dir)?;
        let mut len = file.len;
        if file.valid_len < len {
            tracing::warn!(branch = %key, bytes = len - file.valid_len, "truncating torn patch log tail");
            Self::truncate(&path, file.valid_len)?;
            len = file.valid_len;
        }
        if !file.terminated {
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .map_err(|e| Error::io(&path, e))?;
            f.write_all(b"\n").map_err(|e| Error::io(&path, e))?;
            len += 1;
        }
        Ok(LogTail {
            len,
            last_id: file.patches.last().map(|p| p.id),
        })
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&DiskPatchLog) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || f(&this))
            .await
            .map_err(Error::storage)?
    }
}

#[async_trait]
impl PatchLog for DiskPatchLog {
    async fn load_state(&self, key: &BranchKey) -> Result<Option<BranchState>> {
        let key = key.clone();
        self.blocking(move |log| {
            let dir = Self::branch_dir(&log.root, &key);
            if !dir.is_dir() {
                return Ok(None);
            }
            with_branch_lock(&dir, || {
                let Some(mut state) = Self::read_state(&dir)? else {
                    return Ok(None);
                };

                let ahead: Vec<TreePatch> = Self::read_patches(&dir)?
                    .into_iter()
                    .filter(|p| p.id > state.seq)
                    .collect();
                if !ahead.is_empty() {
                    tracing::warn!(branch = %key, patches = ahead.len(), "state row behind patch log, rolling forward");
                    for patch in &ahead {
                        crate::tree::apply_patch(&mut state.tree, patch);
                        state.seq = patch.id;
                        state.updated_at = state.updated_at.max(patch.timestamp);
                    }
                }
                Ok(Some(state))
            })
        })
        .await
    }

    async fn save_state(&self, state: &BranchState) -> Result<()> {
        let state = state.clone();
        self.blocking(move |log| {
            let dir = Self::branch_dir(&log.root, &state.key());
            with_branch_lock(&dir, || Self::write_state(&dir, &state))
        })
        .await
    }

    async fn commit(&self, patch: &TreePatch, state: &BranchState) -> Result<()> {
        let patch = patch.clone();
        let state = state.clone();
        self.blocking(move |log| {
            let key = state.key();
            let dir = Self::branch_dir(&log.root, &key);
            let path = dir.join(PATCH_FILE);
            with_branch_lock(&dir, || {
                let tail = log.log_tail(&dir, &key)?;
                check_next_id(&key, tail.last_id, &patch)?;

                let written =
                    Self::append_patch(&dir, &patch).and_then(|()| Self::write_state(&dir, &state));
                if let Err(e) = written {
                    log.tails.remove(&key);
                    if let Err(undo) = Self::truncate(&path, tail.len) {
                        tracing::error!(branch = %key, error = %undo, "could not roll back patch append");
                    }
                    return Err(e);
                }

                let len = file_len(&path)?;
                log.tails.insert(
                    key,
                    LogTail {
                        len,
                        last_id: Some(patch.id),
                    },
                );
                Ok(())
            })
        })
        .await
    }

    async fn patches(&self, key: &BranchKey, after: Option<i64>) -> Result<Vec<TreePatch>> {
        let key = key.clone();
        let patches = self
            .blocking(move |log| {
                let dir = Self::branch_dir(&log.root, &key);
                if !dir.is_dir() {
                    return Ok(vec![]);
                }
                with_branch_lock(&dir, || Self::read_patches(&dir))
            })
            .await?;
        Ok(filter_after(patches, after))
    }
}
