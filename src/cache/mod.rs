//! The asset cache: fetch once from upstream, serve from storage afterwards.
//!
//! Per key, an entry moves `Uncached → Fetching → Cached` and then never
//! changes. A failed fetch leaves the key `Uncached`, so the next request
//! tries again; failures are never stored.
//!
//! Concurrent misses for the same key are serialised behind a per-key async
//! mutex. The first holder fetches and stores; everyone queued behind it
//! re-checks the store on entry and is served from there.

pub mod store;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::upstream::{Fetch, FetchError, UpstreamCandidates, UpstreamResponse, fetch_first};

pub use store::{CacheStore, DiskStore, MemoryStore, StoreError};

/// Longest accepted asset identifier, in bytes. Keeps hex-encoded file names
/// under common 255-byte file name limits.
pub const MAX_KEY_LEN: usize = 120;

/// Used when an origin sends no `Content-Type`.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Identifies one asset: the `asset_id` path segment, verbatim.
///
/// # Examples
///
/// ```
/// use rstash::cache::CacheKey;
///
/// assert_eq!(CacheKey::parse("index-8d2f.js").unwrap().as_str(), "index-8d2f.js");
/// assert!(CacheKey::parse("").is_err());
/// assert!(CacheKey::parse("..").is_err());
/// assert!(CacheKey::parse("a/b").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// # Errors
    ///
    /// [`CacheError::NotFound`] when the identifier is empty, a dot segment,
    /// too long, or contains a path separator or control character.
    pub fn parse(asset_id: &str) -> Result<Self, CacheError> {
        let malformed = asset_id.is_empty()
            || asset_id == "."
            || asset_id == ".."
            || asset_id.len() > MAX_KEY_LEN
            || asset_id
                .chars()
                .any(|c| c == '/' || c == '\\' || c.is_control());

        if malformed {
            return Err(CacheError::NotFound(asset_id.to_owned()));
        }
        Ok(Self(asset_id.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One stored asset. Immutable once built.
///
/// `content_length` always equals `content.len()`, so it can be written as
/// `Content-Length` without breaking HTTP framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    key: CacheKey,
    content: Bytes,
    content_type: String,
    content_length: u64,
}

impl CacheEntry {
    pub fn new(key: CacheKey, content: Bytes, content_type: String) -> Self {
        let content_length = content.len() as u64;
        Self {
            key,
            content,
            content_type,
            content_length,
        }
    }

    /// Freezes an upstream answer, keeping the origin's headers.
    ///
    /// An origin `Content-Length` that disagrees with the bytes received is
    /// logged and replaced by the received length.
    pub fn from_upstream(key: CacheKey, response: UpstreamResponse) -> Self {
        let received = response.body.len() as u64;
        if let Some(declared) = response.content_length {
            if declared != received {
                warn!(
                    key = %key,
                    declared,
                    received,
                    "upstream Content-Length disagrees with body, using body length"
                );
            }
        }

        let content_type = response
            .content_type
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_owned());
        Self::new(key, response.body, content_type)
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }
}

/// How a lookup was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from the store, no network.
    Hit,
    /// Fetched from upstream and stored.
    Miss,
    /// Fetched from upstream, but the store refused it.
    Uncached,
}

impl CacheStatus {
    /// Value for the `X-Cache` response header.
    pub fn as_header(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss | Self::Uncached => "MISS",
        }
    }
}

/// Result of [`AssetCache::get`].
#[derive(Debug, Clone)]
pub struct Lookup {
    pub entry: CacheEntry,
    pub status: CacheStatus,
}

/// Why an asset could not be served.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no asset identifier in request (got {0:?})")]
    NotFound(String),

    #[error("no upstream could serve {key} ({} attempt(s) failed)", .attempts.len())]
    UpstreamUnavailable {
        key: CacheKey,
        attempts: Vec<FetchError>,
    },
}

impl CacheError {
    /// `true` when every upstream attempt failed by timing out.
    pub fn all_timed_out(&self) -> bool {
        match self {
            Self::UpstreamUnavailable { attempts, .. } => {
                !attempts.is_empty() && attempts.iter().all(FetchError::is_timeout)
            }
            Self::NotFound(_) => false,
        }
    }
}

type InFlight = Arc<tokio::sync::Mutex<()>>;

/// The cache service. Build one at startup and share it behind an [`Arc`].
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use rstash::cache::{AssetCache, MemoryStore};
/// use rstash::upstream::{HttpFetcher, UpstreamCandidates};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let candidates = UpstreamCandidates::new(["https://cdn-a.example", "https://cdn-b.example"])
///     .ok_or("no upstreams")?;
/// let fetcher = HttpFetcher::new(Duration::from_secs(10), None)?;
/// let cache = Arc::new(AssetCache::new(
///     Arc::new(MemoryStore::new()),
///     Arc::new(fetcher),
///     candidates,
/// ));
///
/// let lookup = cache.get("index-3f2a.js").await?;
/// println!("{} {}", lookup.status.as_header(), lookup.entry.content_type());
/// # Ok(())
/// # }
/// ```
pub struct AssetCache {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetch>,
    candidates: UpstreamCandidates,
    in_flight: Mutex<HashMap<CacheKey, InFlight>>,
}

impl AssetCache {
    /// # Arguments
    ///
    /// * `store` - where fetched entries are kept.
    /// * `fetcher` - performs the upstream requests.
    /// * `candidates` - origins, tried in order on every miss.
    pub fn new(
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetch>,
        candidates: UpstreamCandidates,
    ) -> Self {
        Self {
            store,
            fetcher,
            candidates,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Number of entries the store holds.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Returns the asset for `asset_id`, fetching it on a miss.
    ///
    /// Concurrent misses for one key share a single upstream fetch. Callers
    /// that waited on a fetch that failed try the upstreams themselves.
    ///
    /// # Returns
    ///
    /// The entry plus [`CacheStatus::Miss`] when this call fetched it, or
    /// [`CacheStatus::Hit`] when it came from the store.
    ///
    /// # Errors
    ///
    /// - [`CacheError::NotFound`] for a missing or malformed identifier; no
    ///   fetch is attempted.
    /// - [`CacheError::UpstreamUnavailable`] when every candidate failed;
    ///   nothing is stored.
    pub async fn get(&self, asset_id: &str) -> Result<Lookup, CacheError> {
        let key = CacheKey::parse(asset_id)?;

        if let Some(entry) = self.stored(&key).await {
            debug!(key = %key, "cache hit");
            return Ok(Lookup {
                entry,
                status: CacheStatus::Hit,
            });
        }

        let guard = self.guard_for(&key);
        let result = {
            let _fetching = guard.lock().await;
            match self.stored(&key).await {
                Some(entry) => {
                    debug!(key = %key, "filled while waiting");
                    Ok(Lookup {
                        entry,
                        status: CacheStatus::Hit,
                    })
                }
                None => self.fill(&key).await,
            }
        };
        self.release(&key, guard);

        result
    }

    async fn stored(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.store.get(key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    async fn fill(&self, key: &CacheKey) -> Result<Lookup, CacheError> {
        let (origin, response) = fetch_first(self.fetcher.as_ref(), &self.candidates, key.as_str())
            .await
            .map_err(|attempts| CacheError::UpstreamUnavailable {
                key: key.clone(),
                attempts,
            })?;

        let entry = CacheEntry::from_upstream(key.clone(), response);

        let status = match self.store.put(entry.clone()).await {
            Ok(()) => {
                info!(
                    key = %key,
                    origin = %origin,
                    bytes = entry.content_length(),
                    content_type = entry.content_type(),
                    "cached asset"
                );
                CacheStatus::Miss
            }
            Err(e) => {
                warn!(key = %key, error = %e, "cache write failed, serving uncached");
                CacheStatus::Uncached
            }
        };

        Ok(Lookup { entry, status })
    }

    fn guard_for(&self, key: &CacheKey) -> InFlight {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(in_flight.entry(key.clone()).or_default())
    }

    // Drops the map's guard once nobody else is queued on it.
    fn release(&self, key: &CacheKey, guard: InFlight) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&guard) == 2 {
            in_flight.remove(key);
        }
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
