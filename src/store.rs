use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;

use crate::blob::{BlobStore, DiskBlobStore, MemoryBlobStore};
use crate::branch::Branch;
use crate::error::{Error, Result};
use crate::patchlog::{DiskPatchLog, MemoryPatchLog, PatchLog};
use crate::paths::{validate_branch_name, validate_project_id};
use crate::types::{BranchConfig, BranchKey, OpenOptions};

/// Internal state shared via `Arc`.
pub(crate) struct StoreInner {
    root: Option<PathBuf>,
    mailbox_capacity: usize,
    log: Arc<dyn PatchLog>,
    blobs: DashMap<String, Arc<dyn BlobStore>>,
    branches: DashMap<BranchKey, Branch>,
    /// Serializes branch creation and loading so each key gets one actor.
    opening: tokio::sync::Mutex<()>,
}

/// Branches grouped by project, each with its own patch log, sharing one
/// blob store per project.
///
/// Cheap to clone (`Arc` internally). Branch handles hold only a weak
/// reference back, so dropping every `Store` clone stops all branch tasks.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

impl Store {
    /// Open (or create) a store.
    ///
    /// With `options.root == None` everything lives in memory. Otherwise the
    /// layout under `root` is `<project>/blobs/` and `<project>/branches/<name>/`.
    pub fn open(options: OpenOptions) -> Result<Self> {
        let log: Arc<dyn PatchLog> = match &options.root {
            None => Arc::new(MemoryPatchLog::new()),
            Some(root) => {
                if !root.exists() && !options.create {
                    return Err(Error::not_found(format!(
                        "store not found: {}",
                        root.display()
                    )));
                }
                Arc::new(DiskPatchLog::new(root)?)
            }
        };

        tracing::debug!(root = ?options.root, "store opened");
        Ok(Store {
            inner: Arc::new(StoreInner {
                root: options.root,
                mailbox_capacity: options.mailbox_capacity,
                log,
                blobs: DashMap::new(),
                branches: DashMap::new(),
                opening: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<StoreInner>) -> Self {
        Store { inner }
    }

    /// On-disk root, or `None` for an in-memory store.
    pub fn root(&self) -> Option<&Path> {
        self.inner.root.as_deref()
    }

    /// The blob store shared by every branch of `project_id`.
    pub fn blobs(&self, project_id: &str) -> Result<Arc<dyn BlobStore>> {
        validate_project_id(project_id)?;
        if let Some(b) = self.inner.blobs.get(project_id) {
            return Ok(Arc::clone(b.value()));
        }
        let store: Arc<dyn BlobStore> = match &self.inner.root {
            None => Arc::new(MemoryBlobStore::new()),
            Some(root) => Arc::new(DiskBlobStore::new(root.join(project_id).join("blobs"))?),
        };
        Ok(Arc::clone(
            self.inner
                .blobs
                .entry(project_id.to_string())
                .or_insert(store)
                .value(),
        ))
    }

    /// Create a branch.
    ///
    /// A non-empty `initial_tree` is stored as patch 1, so the new branch's
    /// history starts from it.
    ///
    /// # Errors
    /// [`Error::BranchExists`] if the branch is live or persisted already.
    pub async fn create_branch(&self, project_id: &str, config: BranchConfig) -> Result<Branch> {
        validate_project_id(project_id)?;
        validate_branch_name(&config.name)?;
        if let Some(origin) = &config.origin {
            validate_branch_name(origin)?;
        }
        let key = BranchKey::new(project_id, config.name.clone());

        let _guard = self.inner.opening.lock().await;
        if self.inner.branches.contains_key(&key)
            || self.inner.log.load_state(&key).await?.is_some()
        {
            return Err(Error::branch_exists(key.to_string()));
        }

        let branch = Branch::create(
            Arc::downgrade(&self.inner),
            key.clone(),
            config,
            self.blobs(project_id)?,
            Arc::clone(&self.inner.log),
            self.inner.mailbox_capacity,
        )
        .await?;
        self.inner.branches.insert(key, branch.clone());
        Ok(branch)
    }

    /// An existing branch, loading it from storage if needed.
    pub async fn get_branch(&self, project_id: &str, name: &str) -> Result<Option<Branch>> {
        validate_project_id(project_id)?;
        validate_branch_name(name)?;
        let key = BranchKey::new(project_id, name);
        if let Some(b) = self.inner.branches.get(&key) {
            return Ok(Some(b.clone()));
        }

        let _guard = self.inner.opening.lock().await;
        self.load(&key).await
    }

    /// A branch, created empty (no origin) if it doesn't exist.
    pub async fn branch(&self, project_id: &str, name: &str) -> Result<Branch> {
        if let Some(b) = self.get_branch(project_id, name).await? {
            return Ok(b);
        }
        match self.create_branch(project_id, BranchConfig::new(name)).await {
            Err(Error::BranchExists(_)) => self
                .get_branch(project_id, name)
                .await?
                .ok_or_else(|| Error::not_found(format!("branch '{}' not found", name))),
            other => other,
        }
    }

    /// Names of the branches of `project_id` that are live in this process.
    pub fn open_branches(&self, project_id: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .branches
            .iter()
            .filter(|e| e.key().project_id == project_id)
            .map(|e| e.key().name.clone())
            .collect();
        names.sort();
        names
    }

    /// Forget the cached handle. The branch task stops once every other
    /// handle is dropped too; the next lookup reloads it from storage.
    ///
    /// Returns `false` if the branch was not open.
    pub fn close_branch(&self, project_id: &str, name: &str) -> bool {
        let key = BranchKey::new(project_id, name);
        self.inner.branches.remove(&key).is_some()
    }

    /// Caller holds `opening`.
    async fn load(&self, key: &BranchKey) -> Result<Option<Branch>> {
        if let Some(b) = self.inner.branches.get(key) {
            return Ok(Some(b.clone()));
        }
        let Some(state) = self.inner.log.load_state(key).await? else {
            return Ok(None);
        };
        tracing::debug!(branch = %key, seq = state.seq, "branch loaded");
        let branch = Branch::spawn(
            Arc::downgrade(&self.inner),
            state,
            self.blobs(&key.project_id)?,
            Arc::clone(&self.inner.log),
            self.inner.mailbox_capacity,
        );
        self.inner.branches.insert(key.clone(), branch.clone());
        Ok(Some(branch))
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.inner.root)
            .field("open_branches", &self.inner.branches.len())
            .finish()
    }
}
