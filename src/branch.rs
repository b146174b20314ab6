//! A branch: one owner task per `(project, name)` plus cheap handles.
//!
//! Every operation on a branch goes through its actor's command queue, one
//! at a time. Blob uploads happen in the handle before a command is sent,
//! so the actor only ever awaits the patch log. Conflict detection and
//! resolution run synchronously inside one command, which is what makes
//! [`Branch::transactional_write`] atomic without locks.
//!
//! Reads are answered from the actor's cached tree. A [`Snapshot`] is an
//! `Arc` of that tree: taking one is O(1), and later patches build a new
//! tree rather than touching the shared one.

use std::io::Cursor;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, oneshot};

use crate::blob::BlobStore;
use crate::diff;
use crate::error::{Error, Result};
use crate::patchlog::PatchLog;
use crate::paths::validate_path;
use crate::store::{Store, StoreInner};
use crate::transaction::{self, Candidate, Intent, Resolved};
use crate::tree;
use crate::types::{
    BranchConfig, BranchKey, BranchState, DiffEntry, FileEntry, FileMetadata, FileWithContent,
    MergeResult, MergeStrategy, PatchKind, PatchMetadata, Tree, TreePatch, UserMetadata,
    WatchOptions, WriteRequest, WriteResult,
};
use crate::watch::{WatchHub, WatchStream};

/// Point-in-time view of a branch.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub tree: Arc<Tree>,
    pub seq: u64,
    pub origin: Option<String>,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    Write {
        intents: Vec<Intent>,
        force: bool,
        kind: PatchKind,
        reply: Reply<Vec<WriteResult>>,
    },
    Merge {
        candidates: Vec<Candidate>,
        source: String,
        reply: Reply<Resolved>,
    },
    Delete {
        path: String,
        reply: Reply<bool>,
    },
    SoftDelete {
        reply: Reply<usize>,
    },
    SetOrigin {
        origin: Option<String>,
        reply: Reply<()>,
    },
    Watch {
        options: WatchOptions,
        reply: Reply<WatchStream>,
    },
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct BranchActor {
    key: BranchKey,
    origin: Option<String>,
    tree: Arc<Tree>,
    seq: u64,
    /// Last stamp issued; stamps strictly increase.
    clock: i64,
    log: Arc<dyn PatchLog>,
    hub: Arc<WatchHub>,
}

impl BranchActor {
    fn from_state(state: BranchState, log: Arc<dyn PatchLog>, hub: Arc<WatchHub>) -> Self {
        let clock = state
            .tree
            .values()
            .map(|m| m.ctime)
            .fold(state.updated_at, i64::max);
        Self {
            key: state.key(),
            origin: state.origin,
            tree: Arc::new(state.tree),
            seq: state.seq,
            clock,
            log,
            hub,
        }
    }

    fn tick(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.clock = now.max(self.clock + 1);
        self.clock
    }

    fn state_row(&self, tree: Tree) -> BranchState {
        BranchState {
            project_id: self.key.project_id.clone(),
            name: self.key.name.clone(),
            origin: self.origin.clone(),
            seq: self.seq,
            tree,
            updated_at: self.clock,
        }
    }

    /// Commit one patch: persist it with the new state row, swap the tree in,
    /// then notify watchers. Returns `None` when the change is a no-op.
    async fn patch(
        &mut self,
        added: std::collections::BTreeMap<String, FileMetadata>,
        deleted: std::collections::BTreeSet<String>,
        metadata: PatchMetadata,
        stamp: i64,
    ) -> Result<Option<TreePatch>> {
        if tree::is_noop(&self.tree, &added, &deleted) {
            return Ok(None);
        }

        let patch = TreePatch {
            id: self.seq + 1,
            timestamp: stamp,
            added,
            deleted,
            metadata: Some(metadata),
        };
        let mut next = (*self.tree).clone();
        tree::apply_patch(&mut next, &patch);

        let mut state = self.state_row(next);
        state.seq = patch.id;
        self.log.commit(&patch, &state).await?;

        let events = tree::patch_events(&self.tree, &patch);
        self.tree = Arc::new(state.tree);
        self.seq = patch.id;
        tracing::debug!(
            branch = %self.key,
            seq = patch.id,
            added = patch.added.len(),
            deleted = patch.deleted.len(),
            "patch committed"
        );
        self.hub.notify(&events);
        Ok(Some(patch))
    }

    async fn seed(&mut self, tree: Tree, source: Option<String>) -> Result<()> {
        let stamp = self.tick();
        let metadata = match source {
            Some(src) => PatchMetadata::with_source(PatchKind::Seed, src),
            None => PatchMetadata::new(PatchKind::Seed),
        };
        self.patch(tree, Default::default(), metadata, stamp).await?;
        Ok(())
    }

    fn log_conflicts(&self, resolved: &Resolved) {
        for c in resolved.conflicts() {
            tracing::warn!(
                branch = %self.key,
                path = %c.path,
                expected = c.expected_ctime,
                actual = ?c.actual_ctime,
                resolved = ?c.resolved,
                "write conflict resolved"
            );
        }
    }

    async fn write(&mut self, intents: Vec<Intent>, force: bool, kind: PatchKind) -> Result<Vec<WriteResult>> {
        let now = self.tick();
        let candidates = transaction::stamp(&self.tree, intents, now);
        let resolved = match transaction::resolve(&self.tree, candidates, force, now) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(branch = %self.key, error = %e, "transactional write rejected");
                return Err(e);
            }
        };
        self.log_conflicts(&resolved);
        self.patch(
            resolved.added.clone(),
            resolved.deleted.clone(),
            PatchMetadata::new(kind),
            now,
        )
        .await?;
        Ok(resolved.results)
    }

    async fn merge(&mut self, candidates: Vec<Candidate>, source: String) -> Result<Resolved> {
        let now = self.tick();
        let resolved = transaction::resolve(&self.tree, candidates, true, now)?;
        self.log_conflicts(&resolved);
        self.patch(
            resolved.added.clone(),
            resolved.deleted.clone(),
            PatchMetadata::with_source(PatchKind::Merge, source),
            now,
        )
        .await?;
        Ok(resolved)
    }

    async fn delete(&mut self, path: String) -> Result<bool> {
        if !self.tree.contains_key(&path) {
            return Ok(false);
        }
        let now = self.tick();
        let deleted = [path].into_iter().collect();
        self.patch(Default::default(), deleted, PatchMetadata::new(PatchKind::Delete), now)
            .await?;
        Ok(true)
    }

    async fn soft_delete(&mut self) -> Result<usize> {
        let deleted: std::collections::BTreeSet<String> = self.tree.keys().cloned().collect();
        let count = deleted.len();
        if count == 0 {
            return Ok(0);
        }
        let now = self.tick();
        self.patch(Default::default(), deleted, PatchMetadata::new(PatchKind::SoftDelete), now)
            .await?;
        tracing::info!(branch = %self.key, removed = count, "branch soft-deleted");
        Ok(count)
    }

    async fn set_origin(&mut self, origin: Option<String>) -> Result<()> {
        let previous = std::mem::replace(&mut self.origin, origin);
        let state = self.state_row((*self.tree).clone());
        if let Err(e) = self.log.save_state(&state).await {
            self.origin = previous;
            return Err(e);
        }
        Ok(())
    }

    async fn watch(&mut self, options: WatchOptions) -> Result<WatchStream> {
        let stream = self.hub.register(options.watcher_id, options.path_filters)?;
        if let Some(from) = options.from_ctime {
            // Nothing commits while this runs, so replay and live delivery
            // neither overlap nor leave a gap.
            let history = self.log.patches(&self.key, None).await?;
            let sent = self.hub.replay(stream.id(), &history, from);
            tracing::debug!(branch = %self.key, watcher = %stream.id(), replayed = sent, "watch replay queued");
        }
        Ok(stream)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Snapshot { reply } => {
                    let _ = reply.send(Snapshot {
                        tree: Arc::clone(&self.tree),
                        seq: self.seq,
                        origin: self.origin.clone(),
                    });
                }
                Command::Write {
                    intents,
                    force,
                    kind,
                    reply,
                } => {
                    let _ = reply.send(self.write(intents, force, kind).await);
                }
                Command::Merge {
                    candidates,
                    source,
                    reply,
                } => {
                    let _ = reply.send(self.merge(candidates, source).await);
                }
                Command::Delete { path, reply } => {
                    let _ = reply.send(self.delete(path).await);
                }
                Command::SoftDelete { reply } => {
                    let _ = reply.send(self.soft_delete().await);
                }
                Command::SetOrigin { origin, reply } => {
                    let _ = reply.send(self.set_origin(origin).await);
                }
                Command::Watch { options, reply } => {
                    let _ = reply.send(self.watch(options).await);
                }
            }
        }
        self.hub.close_all();
        tracing::debug!(branch = %self.key, "branch actor stopped");
    }
}

// ---------------------------------------------------------------------------
// FileStream
// ---------------------------------------------------------------------------

/// A file's metadata plus a reader over its content.
#[derive(Debug)]
pub struct FileStream {
    pub metadata: FileMetadata,
    reader: Cursor<Bytes>,
}

impl FileStream {
    /// Consume the stream and return the remaining bytes.
    pub fn into_bytes(self) -> Bytes {
        let pos = self.reader.position() as usize;
        self.reader.into_inner().slice(pos..)
    }
}

impl AsyncRead for FileStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

// ---------------------------------------------------------------------------
// Branch
// ---------------------------------------------------------------------------

/// Handle to a branch. Cheap to clone; all clones talk to the same owner task.
#[derive(Clone)]
pub struct Branch {
    store: Weak<StoreInner>,
    key: BranchKey,
    tx: mpsc::Sender<Command>,
    blobs: Arc<dyn BlobStore>,
    log: Arc<dyn PatchLog>,
    hub: Arc<WatchHub>,
}

impl Branch {
    /// Start the owner task for an existing state row.
    pub(crate) fn spawn(
        store: Weak<StoreInner>,
        state: BranchState,
        blobs: Arc<dyn BlobStore>,
        log: Arc<dyn PatchLog>,
        capacity: usize,
    ) -> Self {
        let key = state.key();
        let hub = WatchHub::new(key.to_string());
        let actor = BranchActor::from_state(state, Arc::clone(&log), Arc::clone(&hub));
        Self::start(store, key, actor, blobs, log, hub, capacity)
    }

    /// Persist a brand-new branch (seeding `initial_tree` as patch 1 when
    /// non-empty) and start its owner task.
    pub(crate) async fn create(
        store: Weak<StoreInner>,
        key: BranchKey,
        config: BranchConfig,
        blobs: Arc<dyn BlobStore>,
        log: Arc<dyn PatchLog>,
        capacity: usize,
    ) -> Result<Self> {
        let hub = WatchHub::new(key.to_string());
        let state = BranchState::empty(&key, config.origin.clone());
        let mut actor = BranchActor::from_state(state, Arc::clone(&log), Arc::clone(&hub));

        match config.initial_tree {
            Some(tree) if !tree.is_empty() => actor.seed(tree, config.origin).await?,
            _ => log.save_state(&actor.state_row(Tree::new())).await?,
        }
        tracing::info!(branch = %key, seq = actor.seq, origin = ?actor.origin, "branch created");
        Ok(Self::start(store, key, actor, blobs, log, hub, capacity))
    }

    fn start(
        store: Weak<StoreInner>,
        key: BranchKey,
        actor: BranchActor,
        blobs: Arc<dyn BlobStore>,
        log: Arc<dyn PatchLog>,
        hub: Arc<WatchHub>,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(actor.run(rx));
        Self {
            store,
            key,
            tx,
            blobs,
            log,
            hub,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| Error::branch_closed(self.key.to_string()))?;
        rx.await
            .map_err(|_| Error::branch_closed(self.key.to_string()))
    }

    fn store(&self) -> Result<Store> {
        self.store
            .upgrade()
            .map(Store::from_inner)
            .ok_or_else(|| Error::branch_closed(format!("{}: store dropped", self.key)))
    }

    pub fn key(&self) -> &BranchKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn project_id(&self) -> &str {
        &self.key.project_id
    }

    // -- Read ---------------------------------------------------------------

    /// Consistent point-in-time view of the tree.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// The current tree.
    pub async fn tree(&self) -> Result<Arc<Tree>> {
        Ok(self.snapshot().await?.tree)
    }

    /// The branch's logical clock: id of the last committed patch.
    pub async fn seq(&self) -> Result<u64> {
        Ok(self.snapshot().await?.seq)
    }

    pub async fn get_file_metadata(&self, path: &str) -> Result<Option<FileMetadata>> {
        Ok(self.tree().await?.get(path).cloned())
    }

    pub async fn has_file(&self, path: &str) -> Result<bool> {
        Ok(self.tree().await?.contains_key(path))
    }

    /// Metadata and a reader over the content, or `None` if absent.
    pub async fn get_file_stream(&self, path: &str) -> Result<Option<FileStream>> {
        let Some(metadata) = self.get_file_metadata(path).await? else {
            return Ok(None);
        };
        let data = self.blobs.get(&metadata.address).await?.ok_or_else(|| {
            Error::storage_msg(format!("blob {} missing for {}", metadata.address, path))
        })?;
        Ok(Some(FileStream {
            metadata,
            reader: Cursor::new(data),
        }))
    }

    /// Raw content, or `None` if absent.
    pub async fn get_file(&self, path: &str) -> Result<Option<Bytes>> {
        Ok(self.get_file_stream(path).await?.map(FileStream::into_bytes))
    }

    /// Files whose path starts with any of `prefixes` (all files if empty), sorted by path.
    pub async fn list_files(&self, prefixes: &[String]) -> Result<Vec<FileEntry>> {
        let tree = self.tree().await?;
        Ok(tree::list(&tree, prefixes))
    }

    /// Like [`list_files`](Self::list_files), with content inlined.
    ///
    /// Each distinct blob is fetched once, however many files share it.
    pub async fn list_files_with_content(&self, prefixes: &[String]) -> Result<Vec<FileWithContent>> {
        let entries = self.list_files(prefixes).await?;
        let hashes: Vec<String> = entries.iter().map(|e| e.metadata.address.clone()).collect();
        let blobs = self.blobs.get_batch(&hashes).await?;

        entries
            .into_iter()
            .map(|e| {
                let content = blobs.get(&e.metadata.address).cloned().ok_or_else(|| {
                    Error::storage_msg(format!("blob {} missing for {}", e.metadata.address, e.path))
                })?;
                Ok(FileWithContent {
                    path: e.path,
                    metadata: e.metadata,
                    content,
                })
            })
            .collect()
    }

    /// The patch log, optionally only patches with `timestamp > after`.
    pub async fn history(&self, after: Option<i64>) -> Result<Vec<TreePatch>> {
        self.log.patches(&self.key, after).await
    }

    // -- Write --------------------------------------------------------------

    /// Store `content` at `path` as a single-entry patch.
    pub async fn write_file(
        &self,
        path: &str,
        content: impl Into<Bytes>,
        metadata: Option<UserMetadata>,
    ) -> Result<FileMetadata> {
        validate_path(path)?;
        let blob = self.blobs.put(content.into()).await?;
        let intent = Intent {
            path: path.to_string(),
            blob: Some(blob),
            user_metadata: metadata,
            expected_ctime: None,
            mtime: None,
        };
        let results = self
            .request(|reply| Command::Write {
                intents: vec![intent],
                force: false,
                kind: PatchKind::Write,
                reply,
            })
            .await??;
        results
            .into_iter()
            .next()
            .and_then(|r| r.metadata)
            .ok_or_else(|| Error::storage_msg(format!("write to {} produced no metadata", path)))
    }

    /// Remove `path`. `false` if it was not there.
    pub async fn delete_file(&self, path: &str) -> Result<bool> {
        let path = path.to_string();
        self.request(|reply| Command::Delete { path, reply }).await?
    }

    /// Apply many writes and deletions as one patch, with optional
    /// per-path ctime conditions.
    ///
    /// Without `force`, any mismatched condition fails the whole call with
    /// [`Error::Conflict`] and nothing is applied. With `force`, each
    /// mismatch is settled by declared mtime and the rest still apply.
    pub async fn transactional_write(
        &self,
        requests: Vec<WriteRequest>,
        force: bool,
    ) -> Result<Vec<WriteResult>> {
        for req in &requests {
            validate_path(&req.path)?;
        }

        let contents: Vec<Bytes> = requests
            .iter()
            .filter_map(|r| r.content.clone())
            .collect();
        let mut infos = self.blobs.put_batch(contents).await?.into_iter();

        let mut intents = Vec::with_capacity(requests.len());
        for req in requests {
            let blob = match req.content {
                Some(_) => Some(infos.next().ok_or_else(|| {
                    Error::storage_msg("blob batch returned fewer results than inputs")
                })?),
                None => None,
            };
            intents.push(Intent {
                path: req.path,
                blob,
                user_metadata: req.metadata,
                expected_ctime: req.expected_ctime,
                mtime: req.mtime,
            });
        }

        self.request(|reply| Command::Write {
            intents,
            force,
            kind: PatchKind::Transaction,
            reply,
        })
        .await?
    }

    /// Empty the branch with one patch. Returns the number of files removed.
    pub async fn soft_delete(&self) -> Result<usize> {
        self.request(|reply| Command::SoftDelete { reply }).await?
    }

    // -- Lineage ------------------------------------------------------------

    /// Create `new_name` in the same project, seeded with this branch's
    /// current tree and with this branch as its origin.
    pub async fn branch(&self, new_name: &str) -> Result<Branch> {
        let snapshot = self.snapshot().await?;
        let config = BranchConfig::new(new_name)
            .with_origin(self.key.name.clone())
            .with_tree((*snapshot.tree).clone());
        self.store()?.create_branch(&self.key.project_id, config).await
    }

    pub async fn get_origin(&self) -> Result<Option<String>> {
        Ok(self.snapshot().await?.origin)
    }

    pub async fn set_origin(&self, origin: Option<String>) -> Result<()> {
        if let Some(name) = &origin {
            crate::paths::validate_branch_name(name)?;
        }
        self.request(|reply| Command::SetOrigin { origin, reply }).await?
    }

    async fn other(&self, other: Option<&str>) -> Result<Branch> {
        let name = match other {
            Some(name) => name.to_string(),
            None => self.get_origin().await?.ok_or_else(|| {
                Error::invalid_argument(format!("{} has no origin to compare against", self.key))
            })?,
        };
        self.store()?
            .get_branch(&self.key.project_id, &name)
            .await?
            .ok_or_else(|| Error::not_found(format!("branch '{}' not found", name)))
    }

    /// What this branch must apply to match `other` (the origin when `None`).
    pub async fn diff(&self, other: Option<&str>) -> Result<Vec<DiffEntry>> {
        let other = self.other(other).await?;
        let desired = other.tree().await?;
        let current = self.tree().await?;
        Ok(diff::diff_trees(&desired, &current))
    }

    /// Bring `other` (the origin when `None`) into this branch as one patch.
    ///
    /// Merged files keep the source's mtime and ctime.
    pub async fn merge(&self, other: Option<&str>, strategy: MergeStrategy) -> Result<MergeResult> {
        let other = self.other(other).await?;
        let desired = other.tree().await?;
        let current = self.tree().await?;
        let plan = diff::merge_plan(diff::diff_trees(&desired, &current), &current, strategy);
        if plan.is_empty() {
            return Ok(MergeResult {
                success: true,
                ..Default::default()
            });
        }

        let source = other.name().to_string();
        let candidates = plan.candidates.clone();
        let resolved = self
            .request(|reply| Command::Merge {
                candidates,
                source,
                reply,
            })
            .await??;
        let result = diff::summarize(&plan, &resolved);
        tracing::info!(
            branch = %self.key,
            from = %other.name(),
            strategy = ?strategy,
            merged = result.files_merged,
            conflicts = result.conflicts.len(),
            "merge applied"
        );
        Ok(result)
    }

    // -- Watch --------------------------------------------------------------

    /// Open a live event stream, optionally replaying changes since `from_ctime`.
    ///
    /// # Errors
    /// [`Error::WatcherExists`] if the watcher id is already live.
    pub async fn watch(&self, options: WatchOptions) -> Result<WatchStream> {
        self.request(|reply| Command::Watch { options, reply }).await?
    }

    /// See [`WatchHub::subscribe`].
    pub fn subscribe(
        &self,
        watcher_id: &str,
        path_filters: Option<Vec<String>>,
        subscription_id: Option<String>,
    ) -> Result<Option<String>> {
        self.hub.subscribe(watcher_id, path_filters, subscription_id)
    }

    pub fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.hub.unsubscribe(subscription_id)
    }

    /// Number of live watchers on this branch.
    pub fn watcher_count(&self) -> usize {
        self.hub.watcher_count()
    }
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Branch").field("key", &self.key).finish()
    }
}

impl std::fmt::Display for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Branch({})", self.key)
    }
}
