//! A branchable, versioned, content-addressed file store.
//!
//! `branchstore` keeps small files (configuration, documents) in named
//! branches. File contents live once in a per-project blob store keyed by
//! their SHA-256; each branch is a `path → metadata` tree whose every change
//! is recorded as an append-only patch.
//!
//! # Key types
//!
//! - [`Store`] — opens an in-memory or on-disk store and hands out branches.
//! - [`Branch`] — a handle to one branch. Every operation is serialized by
//!   the branch's owner task, so a [`transactional_write`](Branch::transactional_write)
//!   either applies entirely as one patch or not at all.
//! - [`WatchStream`] — live change events, optionally preceded by a replay
//!   of history.
//! - [`BlobStore`] — the content-addressed storage seam.
//!
//! # Quick example
//!
//! ```rust,no_run
//! use branchstore::{MergeStrategy, OpenOptions, Store, WriteRequest};
//!
//! # async fn demo() -> branchstore::Result<()> {
//! let store = Store::open(OpenOptions::on_disk("/tmp/my-store"))?;
//! let main = store.branch("acme", "main").await?;
//!
//! let meta = main.write_file("/app/config.json", "{}", None).await?;
//!
//! // Conditional write: fails with Error::Conflict if someone got there first.
//! main.transactional_write(
//!     vec![WriteRequest::write("/app/config.json", "{\"v\":2}").if_ctime(meta.ctime)],
//!     false,
//! )
//! .await?;
//!
//! let feature = main.branch("feature").await?;
//! feature.write_file("/app/extra.txt", "hi", None).await?;
//! main.merge(Some("feature"), MergeStrategy::Override).await?;
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod branch;
pub mod diff;
pub mod error;
pub mod lock;
pub mod patchlog;
pub mod paths;
pub mod store;
pub mod transaction;
pub mod tree;
pub mod types;
pub mod watch;

// Re-export primary public types at crate root.
pub use blob::{BlobStore, DiskBlobStore, MemoryBlobStore};
pub use branch::{Branch, FileStream, Snapshot};
pub use error::{Error, Result};
pub use patchlog::{DiskPatchLog, MemoryPatchLog, PatchLog};
pub use store::Store;
pub use types::*;
pub use watch::{WatchHub, WatchStream};
