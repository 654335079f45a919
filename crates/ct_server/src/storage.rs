// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Storage backends.
//!
//! Two narrow capability sets cover everything the log persists:
//!
//! - [`ObjectBackend`]: the public read surface (tiles, entry bundles,
//!   checkpoint, issuers). Everything written here is immediately visible to
//!   monitors.
//! - [`LockBackend`]: the private coordination store holding the
//!   authoritative checkpoint (compare-and-swap) and the staging bundle used
//!   for crash recovery.
//!
//! A POSIX directory implements both for single-machine deployments, and
//! in-memory variants back the tests. [`CasStore`] layers the
//! content-addressable issuer/root store over any object backend.

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use thiserror::Error;
use tokio::sync::Mutex;

/// Options for uploads to the object backend.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct UploadOptions {
    /// The MIME type of the data. If empty, defaults to
    /// "application/octet-stream".
    pub content_type: Option<String>,

    /// Immutable is true if the data is never updated after being uploaded.
    pub immutable: bool,
}

/// The public object store the log publishes into.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Uploads an object, overwriting any existing object at `key`.
    async fn upload(&self, key: &str, data: &[u8], opts: &UploadOptions) -> anyhow::Result<()>;

    /// Fetches an object, or `None` if it does not exist.
    async fn fetch(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Lists the keys under a prefix.
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>>;

    /// Deletes an object. Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// The private coordination store owning the authoritative checkpoint.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Writes a value unconditionally.
    async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()>;

    /// Reads a value; absent keys are an error.
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>>;

    /// Replaces the value at `key` with `new` only if it currently equals
    /// `old`.
    async fn swap(&self, key: &str, old: &[u8], new: &[u8]) -> anyhow::Result<()>;
}

/// An [`ObjectBackend`] over a POSIX directory. Writes go to a temporary
/// file in the same directory followed by a rename, so readers serving the
/// directory over HTTP never observe partial objects.
pub struct PosixObjectBackend {
    root: PathBuf,
}

impl PosixObjectBackend {
    /// Returns a backend rooted at `root`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> anyhow::Result<PathBuf> {
        if key.split('/').any(|part| {
            part.is_empty() || part == "." || part == ".." || part.contains('\\')
        }) {
            bail!("invalid object key: {key:?}");
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectBackend for PosixObjectBackend {
    async fn upload(&self, key: &str, data: &[u8], _opts: &UploadOptions) -> anyhow::Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }

    async fn fetch(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow!(e)).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(anyhow!(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if path.extension().is_none_or(|ext| ext != "tmp") {
                    let key = path
                        .strip_prefix(&self.root)
                        .expect("listing escaped the root")
                        .to_string_lossy()
                        .into_owned();
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow!(e)),
        }
    }
}

/// A [`LockBackend`] over a POSIX directory. A process-wide mutex serialises
/// the read-compare-write in [`LockBackend::swap`]; the sequencer is the only
/// writer, so no cross-process locking is needed.
pub struct PosixLockBackend {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl PosixLockBackend {
    /// Returns a backend rooted at `root`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    async fn write_atomic(&self, path: &Path, value: &[u8]) -> anyhow::Result<()> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl LockBackend for PosixLockBackend {
    async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_atomic(&self.path_for(key), value).await
    }

    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.path_for(key);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }

    async fn swap(&self, key: &str, old: &[u8], new: &[u8]) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(key);
        let current = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        if current != old {
            bail!("lock backend value for {key:?} does not match expected");
        }
        self.write_atomic(&path, new).await
    }
}

/// An in-memory [`ObjectBackend`] for tests.
#[derive(Default)]
pub struct MemoryObjectBackend {
    objects: StdMutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Returns whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectBackend for MemoryObjectBackend {
    async fn upload(&self, key: &str, data: &[u8], _opts: &UploadOptions) -> anyhow::Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn fetch(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.objects.lock().unwrap().get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

/// An in-memory [`LockBackend`] for tests.
#[derive(Default)]
pub struct MemoryLockBackend {
    values: StdMutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        self.values
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("no value for {key:?}"))
    }

    async fn swap(&self, key: &str, old: &[u8], new: &[u8]) -> anyhow::Result<()> {
        let mut values = self.values.lock().unwrap();
        match values.get(key) {
            Some(current) if current == old => {
                values.insert(key.to_string(), new.to_vec());
                Ok(())
            }
            _ => bail!("lock backend value for {key:?} does not match expected"),
        }
    }
}

/// An error from the content-addressable store.
#[derive(Error, Debug)]
pub enum CasError {
    #[error("non-idempotent write for preexisting key {0}")]
    NonIdempotent(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A content-addressable store over an object backend: values live at
/// `<prefix>/<lowercase-hex-sha256(value)>`.
#[derive(Clone)]
pub struct CasStore {
    prefix: &'static str,
    content_type: &'static str,
}

/// The store for issuer certificates referenced by entry fingerprints.
pub const ISSUERS_PREFIX: &str = "issuer";
/// The backup store for remote-fetched roots.
pub const ROOTS_PREFIX: &str = "roots";

impl CasStore {
    /// Returns the issuer certificate store.
    pub fn issuers() -> Self {
        Self {
            prefix: ISSUERS_PREFIX,
            content_type: "application/pkix-cert",
        }
    }

    /// Returns the remote-root backup store.
    pub fn roots() -> Self {
        Self {
            prefix: ROOTS_PREFIX,
            content_type: "application/pkix-cert",
        }
    }

    fn path_for(&self, key: &[u8; 32]) -> String {
        format!("{}/{}", self.prefix, hex::encode(key))
    }

    /// Stores each value under the SHA-256 of its contents unless an equal
    /// object already exists. A preexisting object with different contents
    /// fails the whole batch with [`CasError::NonIdempotent`]; concurrent
    /// writers storing equal bytes both succeed.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::NonIdempotent`] on a conflicting write, or a
    /// storage error.
    pub async fn add_if_not_exist(
        &self,
        object: &dyn ObjectBackend,
        values: &[&[u8]],
    ) -> Result<Vec<String>, CasError> {
        let mut added = Vec::new();
        for value in values {
            let key: [u8; 32] = Sha256::digest(value).into();
            let path = self.path_for(&key);
            match object.fetch(&path).await? {
                Some(existing) => {
                    if existing != *value {
                        return Err(CasError::NonIdempotent(path));
                    }
                }
                None => {
                    object
                        .upload(
                            &path,
                            value,
                            &UploadOptions {
                                content_type: Some(self.content_type.to_string()),
                                immutable: true,
                            },
                        )
                        .await?;
                    added.push(path);
                }
            }
        }
        Ok(added)
    }

    /// Loads every stored value, keyed by its hash.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or fetching fails, or if an object key is
    /// not a well-formed hash name.
    pub async fn load_all(
        &self,
        object: &dyn ObjectBackend,
    ) -> anyhow::Result<Vec<([u8; 32], Vec<u8>)>> {
        let mut out = Vec::new();
        for key in object.list(&format!("{}/", self.prefix)).await? {
            let name = key
                .strip_prefix(&format!("{}/", self.prefix))
                .ok_or_else(|| anyhow!("unexpected key {key:?}"))?;
            let hash: [u8; 32] = hex::decode(name)
                .ok()
                .and_then(|bytes| bytes.try_into().ok())
                .ok_or_else(|| anyhow!("malformed content-addressed name {name:?}"))?;
            let value = object
                .fetch(&key)
                .await?
                .ok_or_else(|| anyhow!("object vanished during load: {key:?}"))?;
            out.push((hash, value));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_posix_object_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = PosixObjectBackend::new(dir.path()).await.unwrap();

        assert!(backend.fetch("tile/0/000").await.unwrap().is_none());
        backend
            .upload("tile/0/000", b"hello", &UploadOptions::default())
            .await
            .unwrap();
        assert_eq!(
            backend.fetch("tile/0/000").await.unwrap().unwrap(),
            b"hello"
        );

        backend
            .upload("tile/0/000.p/5", b"partial", &UploadOptions::default())
            .await
            .unwrap();
        let keys = backend.list("tile/").await.unwrap();
        assert_eq!(keys, vec!["tile/0/000", "tile/0/000.p/5"]);

        backend.delete("tile/0/000.p/5").await.unwrap();
        backend.delete("tile/0/000.p/5").await.unwrap();
        assert_eq!(backend.list("tile/").await.unwrap(), vec!["tile/0/000"]);
    }

    #[tokio::test]
    async fn test_posix_object_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let backend = PosixObjectBackend::new(dir.path()).await.unwrap();
        backend
            .upload("../escape", b"x", &UploadOptions::default())
            .await
            .unwrap_err();
        backend.fetch("a//b").await.unwrap_err();
    }

    #[tokio::test]
    async fn test_posix_lock_swap() {
        let dir = tempfile::tempdir().unwrap();
        let backend = PosixLockBackend::new(dir.path()).await.unwrap();

        backend.get("checkpoint").await.unwrap_err();
        backend.put("checkpoint", b"v1").await.unwrap();
        backend.swap("checkpoint", b"v1", b"v2").await.unwrap();
        assert_eq!(backend.get("checkpoint").await.unwrap(), b"v2");
        backend.swap("checkpoint", b"v1", b"v3").await.unwrap_err();
        assert_eq!(backend.get("checkpoint").await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_cas_idempotence() {
        let object = MemoryObjectBackend::new();
        let cas = CasStore::issuers();

        let added = cas
            .add_if_not_exist(&object, &[b"issuer one"])
            .await
            .unwrap();
        assert_eq!(added.len(), 1);
        assert!(added[0].starts_with("issuer/"));

        // Same value again: success, nothing new.
        let added = cas
            .add_if_not_exist(&object, &[b"issuer one"])
            .await
            .unwrap();
        assert!(added.is_empty());

        // A colliding name with different contents is a hard error.
        let key: [u8; 32] = Sha256::digest(b"issuer two").into();
        object
            .upload(
                &format!("issuer/{}", hex::encode(key)),
                b"tampered",
                &UploadOptions::default(),
            )
            .await
            .unwrap();
        let err = cas
            .add_if_not_exist(&object, &[b"issuer two"])
            .await
            .unwrap_err();
        assert!(matches!(err, CasError::NonIdempotent(_)));
    }

    #[tokio::test]
    async fn test_cas_concurrent_equal_writers() {
        let object = std::sync::Arc::new(MemoryObjectBackend::new());
        let cas = CasStore::issuers();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let object = object.clone();
            let cas = cas.clone();
            tasks.push(tokio::spawn(async move {
                cas.add_if_not_exist(object.as_ref(), &[b"same issuer"]).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(object.len(), 1);
    }

    #[tokio::test]
    async fn test_cas_load_all() {
        let object = MemoryObjectBackend::new();
        let cas = CasStore::roots();
        cas.add_if_not_exist(&object, &[b"root a", b"root b"])
            .await
            .unwrap();
        let mut loaded = cas.load_all(&object).await.unwrap();
        loaded.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].0, <[u8; 32]>::from(Sha256::digest(b"root a")));
        assert_eq!(loaded[0].1, b"root a");
    }
}
