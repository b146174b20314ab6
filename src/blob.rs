//! Content-addressed blob storage.
//!
//! Blobs are keyed by the SHA-256 hex of their bytes, so identical content
//! always lands at the same address and is stored once. One `BlobStore`
//! serves every branch of a project.
//!
//! - [`MemoryBlobStore`] keeps blobs in a `DashMap`.
//! - [`DiskBlobStore`] keeps one file per blob under a two-character fan-out
//!   directory (`ab/cdef…`).

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::types::BlobInfo;

/// SHA-256 of `data` as lowercase hex.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// `true` if `hash` looks like a SHA-256 hex address.
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Storage of immutable, hash-addressed byte blobs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` and return its address. Storing the same bytes twice is a no-op.
    async fn put(&self, data: Bytes) -> Result<BlobInfo>;

    /// Fetch a blob, or `None` if absent.
    async fn get(&self, hash: &str) -> Result<Option<Bytes>>;

    async fn has(&self, hash: &str) -> Result<bool>;

    /// Size and address without transferring the bytes.
    async fn info(&self, hash: &str) -> Result<Option<BlobInfo>>;

    /// Store many blobs at once. Results are in input order.
    ///
    /// Fails as a whole; callers must not assume any of the blobs landed.
    async fn put_batch(&self, items: Vec<Bytes>) -> Result<Vec<BlobInfo>>;

    /// Fetch many blobs. Duplicate and absent hashes are skipped.
    async fn get_batch(&self, hashes: &[String]) -> Result<HashMap<String, Bytes>>;

    /// Drain `reader` and store its content.
    async fn put_reader(&self, reader: &mut (dyn AsyncRead + Unpin + Send)) -> Result<BlobInfo> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        self.put(Bytes::from(buf)).await
    }
}

/// Hash every item on the blocking pool, in parallel, preserving order.
async fn hash_all(items: Vec<Bytes>) -> Result<Vec<(BlobInfo, Bytes)>> {
    let handles: Vec<_> = items
        .into_iter()
        .map(|data| {
            tokio::task::spawn_blocking(move || {
                let info = BlobInfo {
                    hash: hash_bytes(&data),
                    size: data.len() as u64,
                };
                (info, data)
            })
        })
        .collect();

    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        out.push(handle.await.map_err(Error::storage)?);
    }
    Ok(out)
}

fn unique_hashes(hashes: &[String]) -> BTreeSet<&str> {
    hashes.iter().map(String::as_str).collect()
}

// ---------------------------------------------------------------------------
// MemoryBlobStore
// ---------------------------------------------------------------------------

/// In-memory blob storage.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Bytes>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs held.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, data: Bytes) -> Result<BlobInfo> {
        let info = BlobInfo {
            hash: hash_bytes(&data),
            size: data.len() as u64,
        };
        self.blobs.entry(info.hash.clone()).or_insert(data);
        Ok(info)
    }

    async fn get(&self, hash: &str) -> Result<Option<Bytes>> {
        Ok(self.blobs.get(hash).map(|r| r.value().clone()))
    }

    async fn has(&self, hash: &str) -> Result<bool> {
        Ok(self.blobs.contains_key(hash))
    }

    async fn info(&self, hash: &str) -> Result<Option<BlobInfo>> {
        Ok(self.blobs.get(hash).map(|r| BlobInfo {
            hash: hash.to_string(),
            size: r.value().len() as u64,
        }))
    }

    async fn put_batch(&self, items: Vec<Bytes>) -> Result<Vec<BlobInfo>> {
        let hashed = hash_all(items).await?;
        let mut infos = Vec::with_capacity(hashed.len());
        for (info, data) in hashed {
            self.blobs.entry(info.hash.clone()).or_insert(data);
            infos.push(info);
        }
        Ok(infos)
    }

    async fn get_batch(&self, hashes: &[String]) -> Result<HashMap<String, Bytes>> {
        Ok(unique_hashes(hashes)
            .into_iter()
            .filter_map(|h| self.blobs.get(h).map(|r| (h.to_string(), r.value().clone())))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// DiskBlobStore
// ---------------------------------------------------------------------------

/// File-per-blob storage under a base directory.
#[derive(Debug, Clone)]
pub struct DiskBlobStore {
    base_path: PathBuf,
}

impl DiskBlobStore {
    /// Open (creating if needed) blob storage rooted at `base_path`.
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path).map_err(|e| Error::io(&base_path, e))?;
        Ok(Self { base_path })
    }

    pub fn path(&self) -> &Path {
        &self.base_path
    }

    /// `<base>/ab/cdef…`, or `None` for anything that isn't a hash.
    fn blob_path(base: &Path, hash: &str) -> Option<PathBuf> {
        if !is_valid_hash(hash) {
            return None;
        }
        Some(base.join(&hash[..2]).join(&hash[2..]))
    }

    /// Write one blob unless it already exists. Runs on the blocking pool.
    fn write_blob(base: &Path, info: &BlobInfo, data: &[u8]) -> Result<()> {
        let Some(path) = Self::blob_path(base, &info.hash) else {
            return Err(Error::storage_msg(format!("bad blob hash: {}", info.hash)));
        };
        if path.exists() {
            return Ok(());
        }
        let dir = path.parent().unwrap_or(base);
        std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;

        // Concurrent writers of the same hash race only on the rename, and
        // both renames carry identical bytes.
        let tmp = dir.join(format!(".{}.{}.tmp", &info.hash[2..], uuid::Uuid::new_v4()));
        let mut f = std::fs::File::create(&tmp).map_err(|e| Error::io(&tmp, e))?;
        f.write_all(data).map_err(|e| Error::io(&tmp, e))?;
        f.sync_all().map_err(|e| Error::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| Error::io(&path, e))?;
        Ok(())
    }

    fn read_blob(base: &Path, hash: &str) -> Result<Option<Bytes>> {
        let Some(path) = Self::blob_path(base, hash) else {
            return Ok(None);
        };
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(&path, e)),
        }
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let base = self.base_path.clone();
        tokio::task::spawn_blocking(move || f(&base))
            .await
            .map_err(Error::storage)?
    }
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    async fn put(&self, data: Bytes) -> Result<BlobInfo> {
        self.blocking(move |base| {
            let info = BlobInfo {
                hash: hash_bytes(&data),
                size: data.len() as u64,
            };
            Self::write_blob(base, &info, &data)?;
            Ok(info)
        })
        .await
    }

    async fn get(&self, hash: &str) -> Result<Option<Bytes>> {
        let hash = hash.to_string();
        self.blocking(move |base| Self::read_blob(base, &hash)).await
    }

    async fn has(&self, hash: &str) -> Result<bool> {
        Ok(Self::blob_path(&self.base_path, hash).is_some_and(|p| p.is_file()))
    }

    async fn info(&self, hash: &str) -> Result<Option<BlobInfo>> {
        let Some(path) = Self::blob_path(&self.base_path, hash) else {
            return Ok(None);
        };
        let hash = hash.to_string();
        self.blocking(move |_| match std::fs::metadata(&path) {
            Ok(meta) => Ok(Some(BlobInfo {
                hash,
                size: meta.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(&path, e)),
        })
        .await
    }

    async fn put_batch(&self, items: Vec<Bytes>) -> Result<Vec<BlobInfo>> {
        let hashed = hash_all(items).await?;
        self.blocking(move |base| {
            let mut infos = Vec::with_capacity(hashed.len());
            for (info, data) in hashed {
                Self::write_blob(base, &info, &data)?;
                infos.push(info);
            }
            Ok(infos)
        })
        .await
    }

    async fn get_batch(&self, hashes: &[String]) -> Result<HashMap<String, Bytes>> {
        let wanted: Vec<String> = unique_hashes(hashes).into_iter().map(String::from).collect();
        self.blocking(move |base| {
            let mut out = HashMap::with_capacity(wanted.len());
            for hash in wanted {
                if let Some(data) = Self::read_blob(base, &hash)? {
                    out.insert(hash, data);
                }
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_sha256_hex() {
        assert_eq!(
            hash_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(is_valid_hash(&hash_bytes(b"abc")));
        assert!(!is_valid_hash("../../etc/passwd"));
    }

    #[tokio::test]
    async fn memory_put_is_idempotent() {
        let store = MemoryBlobStore::new();
        let a = store.put(Bytes::from_static(b"hello")).await.unwrap();
        let b = store.put(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.size, 5);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn memory_batch_preserves_order() {
        let store = MemoryBlobStore::new();
        let infos = store
            .put_batch(vec![
                Bytes::from_static(b"one"),
                Bytes::from_static(b"two"),
                Bytes::from_static(b"one"),
            ])
            .await
            .unwrap();
        assert_eq!(infos.len(), 3);
        assert_eq!(infos[0], infos[2]);
        assert_eq!(infos[1].hash, hash_bytes(b"two"));
        assert_eq!(store.len(), 2);

        let got = store
            .get_batch(&[infos[0].hash.clone(), infos[0].hash.clone(), "missing".into()])
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[&infos[0].hash], Bytes::from_static(b"one"));
    }

    #[tokio::test]
    async fn disk_roundtrip_and_info() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::new(dir.path().join("blobs")).unwrap();
        let info = store.put(Bytes::from_static(b"content")).await.unwrap();
        assert!(store.has(&info.hash).await.unwrap());
        assert_eq!(store.info(&info.hash).await.unwrap(), Some(info.clone()));
        assert_eq!(
            store.get(&info.hash).await.unwrap(),
            Some(Bytes::from_static(b"content"))
        );
        // second put leaves exactly one file
        store.put(Bytes::from_static(b"content")).await.unwrap();
        let fanout = dir.path().join("blobs").join(&info.hash[..2]);
        assert_eq!(std::fs::read_dir(fanout).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn disk_missing_and_invalid_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::new(dir.path()).unwrap();
        assert_eq!(store.get(&hash_bytes(b"nope")).await.unwrap(), None);
        assert_eq!(store.get("../x").await.unwrap(), None);
        assert!(!store.has("zz").await.unwrap());
        assert_eq!(store.info(&hash_bytes(b"nope")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_reader_drains_source() {
        let store = MemoryBlobStore::new();
        let mut src: &[u8] = b"streamed bytes";
        let info = store.put_reader(&mut src).await.unwrap();
        assert_eq!(info.hash, hash_bytes(b"streamed bytes"));
    }
}
