//! Where cache entries live.
//!
//! [`MemoryStore`] keeps entries for the process lifetime. [`DiskStore`]
//! persists them under a directory so they survive restarts, with a
//! [`MemoryStore`] in front for hot entries.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::{CacheEntry, CacheKey};

/// A storage failure. Never fatal to a request: the cache logs it and either
/// treats the read as a miss or serves the fetched bytes uncached.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache I/O on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cache metadata at {} is unreadable: {source}", .path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_owned(),
            source,
        }
    }
}

/// Boxed future returned by [`CacheStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Insert-only entry storage.
///
/// `put` for a key that is already stored keeps the existing entry.
pub trait CacheStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a CacheKey) -> StoreFuture<'a, Option<CacheEntry>>;

    fn put(&self, entry: CacheEntry) -> StoreFuture<'_, ()>;

    /// Number of stored entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-lifetime store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Returns `false` if the key was already present (the old entry wins).
    pub fn insert(&self, entry: CacheEntry) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(entry.key()) {
            return false;
        }
        entries.insert(entry.key().clone(), entry);
        true
    }

    pub fn count(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl CacheStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a CacheKey) -> StoreFuture<'a, Option<CacheEntry>> {
        let found = self.lookup(key);
        Box::pin(async move { Ok(found) })
    }

    fn put(&self, entry: CacheEntry) -> StoreFuture<'_, ()> {
        self.insert(entry);
        Box::pin(async { Ok(()) })
    }

    fn len(&self) -> usize {
        self.count()
    }
}

// On-disk sidecar next to each body file.
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    asset_id: String,
    content_type: String,
    content_length: u64,
}

const BODY_EXT: &str = "body";
const META_EXT: &str = "meta.json";

/// Directory-backed store.
///
/// Each entry is two files named after the hex-encoded key:
/// `<hex>.body` holds the raw bytes, `<hex>.meta.json` the recorded headers.
/// Both are written to a temporary name and renamed, body first, so a
/// metadata file only ever points at a complete body.
#[derive(Debug)]
pub struct DiskStore {
    dir: PathBuf,
    front: MemoryStore,
    on_disk: AtomicUsize,
    tmp_seq: AtomicU64,
}

impl DiskStore {
    /// Opens (creating if needed) the cache directory and counts existing entries.
    ///
    /// Entries already on disk are served as-is, and a later `put` for the
    /// same key keeps them.
    ///
    /// # Errors
    ///
    /// [`StoreError::Io`] if the directory cannot be created or listed.
    ///
    /// # Examples
    ///
    /// ```
    /// use bytes::Bytes;
    /// use rstash::cache::{CacheEntry, CacheKey, CacheStore, DiskStore};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let dir = tempfile::tempdir()?;
    /// let key = CacheKey::parse("logo.svg")?;
    ///
    /// let store = DiskStore::open(dir.path()).await?;
    /// store
    ///     .put(CacheEntry::new(key.clone(), Bytes::from_static(b"<svg/>"), "image/svg+xml".into()))
    ///     .await?;
    ///
    /// let reopened = DiskStore::open(dir.path()).await?;
    /// assert_eq!(reopened.len(), 1);
    /// let entry = reopened.get(&key).await?.ok_or("entry lost")?;
    /// assert_eq!(entry.content().as_ref(), b"<svg/>");
    /// # Ok(())
    /// # }
    /// ```
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;

        let mut existing = 0;
        let mut listing = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;
        while let Some(item) = listing
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&dir, e))?
        {
            if item.file_name().to_string_lossy().ends_with(META_EXT) {
                existing += 1;
            }
        }

        debug!(dir = %dir.display(), entries = existing, "opened disk cache");

        Ok(Self {
            dir,
            front: MemoryStore::new(),
            on_disk: AtomicUsize::new(existing),
            tmp_seq: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &CacheKey, ext: &str) -> PathBuf {
        let stem: String = key.as_str().bytes().map(|b| format!("{b:02x}")).collect();
        self.dir.join(format!("{stem}.{ext}"))
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), StoreError> {
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("tmp{seq}"));
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::io(path, e));
        }
        Ok(())
    }

    async fn read_from_disk(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let meta_path = self.path_for(key, META_EXT);
        let raw = match tokio::fs::read(&meta_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&meta_path, e)),
        };
        let meta: EntryMeta = serde_json::from_slice(&raw).map_err(|source| StoreError::Metadata {
            path: meta_path.clone(),
            source,
        })?;

        let body_path = self.path_for(key, BODY_EXT);
        let body = match tokio::fs::read(&body_path).await {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(key = %key, "metadata without body, ignoring entry");
                return Ok(None);
            }
            Err(e) => return Err(StoreError::io(&body_path, e)),
        };

        if body.len() as u64 != meta.content_length || meta.asset_id != key.as_str() {
            warn!(
                key = %key,
                expected = meta.content_length,
                found = body.len(),
                "disk entry does not match its metadata, ignoring"
            );
            return Ok(None);
        }

        Ok(Some(CacheEntry::new(
            key.clone(),
            Bytes::from(body),
            meta.content_type,
        )))
    }
}

impl CacheStore for DiskStore {
    fn get<'a>(&'a self, key: &'a CacheKey) -> StoreFuture<'a, Option<CacheEntry>> {
        Box::pin(async move {
            if let Some(entry) = self.front.lookup(key) {
                return Ok(Some(entry));
            }
            let entry = self.read_from_disk(key).await?;
            if let Some(entry) = &entry {
                self.front.insert(entry.clone());
            }
            Ok(entry)
        })
    }

    fn put(&self, entry: CacheEntry) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if self.front.lookup(entry.key()).is_some() {
                return Ok(());
            }
            // A valid entry from an earlier run wins; unreadable or mismatched
            // files are replaced.
            match self.read_from_disk(entry.key()).await {
                Ok(Some(existing)) => {
                    debug!(key = %entry.key(), "already on disk, keeping stored entry");
                    self.front.insert(existing);
                    return Ok(());
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %entry.key(), error = %e, "replacing unreadable disk entry");
                }
            }

            let meta_path = self.path_for(entry.key(), META_EXT);
            let existed = tokio::fs::try_exists(&meta_path).await.unwrap_or(false);

            let meta = EntryMeta {
                asset_id: entry.key().as_str().to_owned(),
                content_type: entry.content_type().to_owned(),
                content_length: entry.content_length(),
            };
            let meta = serde_json::to_vec_pretty(&meta).map_err(|source| StoreError::Metadata {
                path: meta_path.clone(),
                source,
            })?;

            self.write_atomic(&self.path_for(entry.key(), BODY_EXT), entry.content())
                .await?;
            self.write_atomic(&meta_path, &meta).await?;

            if !existed {
                self.on_disk.fetch_add(1, Ordering::Relaxed);
            }
            self.front.insert(entry);
            Ok(())
        })
    }

    fn len(&self) -> usize {
        self.on_disk.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, body: &'static [u8], content_type: &str) -> CacheEntry {
        CacheEntry::new(CacheKey::parse(id).unwrap(), Bytes::from_static(body), content_type.into())
    }

    #[tokio::test]
    async fn memory_store_keeps_first_entry() {
        let store = MemoryStore::new();
        assert!(store.is_empty());
        store.put(entry("a.js", b"first", "text/javascript")).await.unwrap();
        store.put(entry("a.js", b"second", "text/plain")).await.unwrap();

        let key = CacheKey::parse("a.js").unwrap();
        let got = store.get(&key).await.unwrap().unwrap();
        assert_eq!(got.content().as_ref(), b"first");
        assert_eq!(got.content_type(), "text/javascript");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DiskStore::open(dir.path()).await.unwrap();
            store.put(entry("font.woff2", b"\x00wOF2\xff", "font/woff2")).await.unwrap();
            assert_eq!(store.len(), 1);
        }

        let reopened = DiskStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.len(), 1);
        let key = CacheKey::parse("font.woff2").unwrap();
        let got = reopened.get(&key).await.unwrap().unwrap();
        assert_eq!(got.content().as_ref(), b"\x00wOF2\xff");
        assert_eq!(got.content_type(), "font/woff2");
        assert_eq!(got.content_length(), 6);
    }

    #[tokio::test]
    async fn disk_store_misses_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path().join("nested/cache")).await.unwrap();
        let key = CacheKey::parse("nothing.png").unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn truncated_body_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::parse("app.css").unwrap();
        {
            let store = DiskStore::open(dir.path()).await.unwrap();
            store.put(entry("app.css", b"body{margin:0}", "text/css")).await.unwrap();
            let body_path = store.path_for(&key, BODY_EXT);
            tokio::fs::write(&body_path, b"body{").await.unwrap();
        }

        let reopened = DiskStore::open(dir.path()).await.unwrap();
        assert!(reopened.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_metadata_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        let key = CacheKey::parse("x.js").unwrap();
        tokio::fs::write(store.path_for(&key, META_EXT), b"{not json")
            .await
            .unwrap();
        let err = store.get(&key).await.unwrap_err();
        assert!(matches!(err, StoreError::Metadata { .. }));
    }

    #[tokio::test]
    async fn second_put_keeps_first_entry_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::parse("a.js").unwrap();
        {
            let store = DiskStore::open(dir.path()).await.unwrap();
            store.put(entry("a.js", b"first", "text/javascript")).await.unwrap();
            store.put(entry("a.js", b"second!", "text/plain")).await.unwrap();
            let got = store.get(&key).await.unwrap().unwrap();
            assert_eq!(got.content().as_ref(), b"first");
        }

        // A fresh process has an empty front, so the put must consult the disk.
        let fresh = DiskStore::open(dir.path()).await.unwrap();
        fresh.put(entry("a.js", b"third", "text/plain")).await.unwrap();
        assert_eq!(fresh.len(), 1);

        let reopened = DiskStore::open(dir.path()).await.unwrap();
        let got = reopened.get(&key).await.unwrap().unwrap();
        assert_eq!(got.content().as_ref(), b"first");
        assert_eq!(got.content_type(), "text/javascript");
    }

    #[tokio::test]
    async fn put_replaces_corrupt_disk_entry() {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::parse("x.js").unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        tokio::fs::write(store.path_for(&key, META_EXT), b"{not json")
            .await
            .unwrap();

        store.put(entry("x.js", b"ok()", "text/javascript")).await.unwrap();

        let reopened = DiskStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.len(), 1);
        let got = reopened.get(&key).await.unwrap().unwrap();
        assert_eq!(got.content().as_ref(), b"ok()");
    }

    #[tokio::test]
    async fn rewriting_a_key_does_not_double_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        store.put(entry("a.js", b"1", "text/javascript")).await.unwrap();
        let fresh = DiskStore::open(dir.path()).await.unwrap();
        fresh.put(entry("a.js", b"1", "text/javascript")).await.unwrap();
        assert_eq!(fresh.len(), 1);
    }

    #[test]
    fn file_names_are_hex_of_the_key() {
        let store = DiskStore {
            dir: PathBuf::from("/cache"),
            front: MemoryStore::new(),
            on_disk: AtomicUsize::new(0),
            tmp_seq: AtomicU64::new(0),
        };
        let key = CacheKey::parse("a.b").unwrap();
        assert_eq!(store.path_for(&key, BODY_EXT), PathBuf::from("/cache/612e62.body"));
    }
}
