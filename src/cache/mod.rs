use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, trace, warn};
use url::Url;

mod admission;
mod codec;
mod entry;
mod key;
mod maintenance;
mod metadata;
mod reader;
mod store;

pub use admission::{CacheControl, metadata_from_response, parse_cache_control};
pub use codec::{CACHE_MAGIC, CACHE_VERSION, CodecError, MAX_COMPRESSION_SIZE, can_compress};
pub use codec::fuzzing;
pub use entry::{CacheItem, SinkId};
pub use key::{CACHE_POSTFIX, CacheKey, unique_file_name};
pub use metadata::{
    Attributes, CacheMetadata, HTTP_REASON_PHRASE_ATTRIBUTE, HTTP_STATUS_CODE_ATTRIBUTE,
    REDIRECTION_TARGET_ATTRIBUTE,
};
pub use reader::CacheData;

use codec::{DecodedEntry, ReadMode};
use store::CacheStore;

pub const DEFAULT_MAXIMUM_CACHE_SIZE: u64 = 50 * 1024 * 1024;

/// Declared bodies above this percentage of the maximum are never cached.
const MAX_ENTRY_SHARE_PERCENT: u128 = 75;
const COPY_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidMetadata,
    NotSaveable,
    TooLarge { declared: u64, limit: u64 },
    /// The finished file alone would exceed the eviction goal.
    Oversized { size: u64, goal: u64 },
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::InvalidMetadata => "invalid_metadata",
            RejectReason::NotSaveable => "not_saveable",
            RejectReason::TooLarge { .. } => "too_large",
            RejectReason::Oversized { .. } => "oversized",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::TooLarge { declared, limit } => {
                write!(f, "declared length {declared} exceeds limit {limit}")
            }
            RejectReason::Oversized { size, goal } => {
                write!(f, "entry of {size} bytes exceeds size goal {goal}")
            }
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache directory is not set")]
    NotConfigured,
    #[error("unknown {0}")]
    UnknownSink(SinkId),
    #[error("entry rejected: {0}")]
    Rejected(RejectReason),
    #[error("no cached entry for {0}")]
    NotCached(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug)]
struct LastItem {
    key: CacheKey,
    metadata: CacheMetadata,
    data: Option<CacheData>,
}

/// On-disk HTTP response cache.
///
/// Entries are written through [`prepare`](Self::prepare) and the returned
/// sink, then published atomically by [`insert`](Self::insert). Reads take
/// `&mut self` because they refresh a single-entry memory slot holding the
/// most recently read entry. The cache has no internal locking; hosts that
/// share it across threads must wrap it in a mutex, and a directory must not
/// be shared between processes.
#[derive(Debug)]
pub struct DiskCache {
    store: Option<CacheStore>,
    maximum_cache_size: u64,
    current_cache_size: Option<u64>,
    in_flight: BTreeMap<SinkId, CacheItem>,
    next_sink: u64,
    last_item: Option<LastItem>,
}

impl Default for DiskCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskCache {
    /// An unconfigured cache. Every operation misses or fails until a
    /// directory is set.
    pub fn new() -> Self {
        Self {
            store: None,
            maximum_cache_size: DEFAULT_MAXIMUM_CACHE_SIZE,
            current_cache_size: None,
            in_flight: BTreeMap::new(),
            next_sink: 1,
            last_item: None,
        }
    }

    pub fn with_directory(
        dir: impl AsRef<Path>,
        maximum_cache_size: u64,
    ) -> Result<Self, CacheError> {
        let mut cache = Self::new();
        cache.maximum_cache_size = maximum_cache_size;
        cache.set_cache_directory(dir)?;
        Ok(cache)
    }

    pub fn cache_directory(&self) -> Option<&Path> {
        self.store.as_ref().map(CacheStore::root)
    }

    /// Points the cache at `dir`, creating its layout and removing staging
    /// files left by an earlier run. Entries still being written are dropped.
    pub fn set_cache_directory(&mut self, dir: impl AsRef<Path>) -> Result<(), CacheError> {
        let root = std::path::absolute(dir.as_ref())?;
        if !self.in_flight.is_empty() {
            debug!(count = self.in_flight.len(), "dropping in-flight cache entries");
            self.in_flight.clear();
        }
        let store = CacheStore::open(&root)?;
        debug!(path = %root.display(), "cache directory set");
        self.store = Some(store);
        self.current_cache_size = None;
        self.last_item = None;
        Ok(())
    }

    pub fn maximum_cache_size(&self) -> u64 {
        self.maximum_cache_size
    }

    /// Shrinking the maximum evicts right away.
    pub fn set_maximum_cache_size(&mut self, size: u64) {
        let shrinking = size < self.maximum_cache_size;
        self.maximum_cache_size = size;
        if !shrinking {
            return;
        }
        if self.current_cache_size.is_some_and(|current| current >= size) {
            self.current_cache_size = None;
        }
        if self.store.is_some() {
            self.expire();
        }
    }

    pub fn cache_size(&mut self) -> u64 {
        if self.store.is_none() {
            return 0;
        }
        match self.current_cache_size {
            Some(size) => size,
            None => self.expire(),
        }
    }

    /// Path the entry for `url` lives at, whether or not it exists.
    pub fn entry_path(&self, url: &Url) -> Option<PathBuf> {
        self.store
            .as_ref()
            .map(|store| store.entry_path(&CacheKey::new(url)))
    }

    /// Starts a new entry. Returns `None` when the metadata cannot be cached,
    /// in which case nothing was created.
    pub fn prepare(&mut self, metadata: &CacheMetadata) -> Option<SinkId> {
        match self.try_prepare(metadata) {
            Ok(id) => Some(id),
            Err(CacheError::Rejected(reason)) => {
                trace!(reason = %reason, "cache entry rejected");
                crate::metrics::record_cache_rejection(reason.as_str());
                None
            }
            Err(err) => {
                warn!(error = %err, "failed to prepare cache entry");
                None
            }
        }
    }

    fn try_prepare(&mut self, metadata: &CacheMetadata) -> Result<SinkId, CacheError> {
        let store = self.store.as_ref().ok_or(CacheError::NotConfigured)?;
        let url = metadata
            .url()
            .ok_or(CacheError::Rejected(RejectReason::InvalidMetadata))?;
        if !metadata.save_to_disk() {
            return Err(CacheError::Rejected(RejectReason::NotSaveable));
        }
        let limit = entry_limit(self.maximum_cache_size);
        if let Some(declared) = metadata.content_length()
            && declared > limit
        {
            return Err(CacheError::Rejected(RejectReason::TooLarge { declared, limit }));
        }

        let key = CacheKey::new(url);
        let item = if codec::can_compress(metadata) {
            CacheItem::in_memory(key, metadata.clone())
        } else {
            CacheItem::staged(key, metadata.clone(), store.create_temp_file()?)?
        };
        let id = SinkId::new(self.next_sink);
        self.next_sink += 1;
        self.in_flight.insert(id, item);
        Ok(id)
    }

    /// Write access to an entry between `prepare` and `insert`.
    pub fn sink(&mut self, id: SinkId) -> Option<&mut CacheItem> {
        self.in_flight.get_mut(&id)
    }

    /// Publishes a prepared entry, replacing any entry for the same URL. The
    /// sink is consumed whether or not this succeeds.
    pub fn insert(&mut self, id: SinkId) -> Result<(), CacheError> {
        let Some(item) = self.in_flight.remove(&id) else {
            warn!(sink = %id, "insert called for unknown sink");
            return Err(CacheError::UnknownSink(id));
        };
        let result = self.store_item(item);
        match &result {
            Ok(()) => crate::metrics::record_cache_store(),
            Err(err) => {
                warn!(sink = %id, error = %err, "failed to store cache entry");
                crate::metrics::record_cache_store_error();
            }
        }
        result
    }

    fn store_item(&mut self, item: CacheItem) -> Result<(), CacheError> {
        let store = self.store.clone().ok_or(CacheError::NotConfigured)?;
        let finished = item.finish(&store)?;
        let incoming = finished.file.as_file().metadata()?.len();
        // Bodies without a declared length are only measured here.
        let goal = maintenance::eviction_goal(self.maximum_cache_size);
        if incoming > goal {
            let reason = RejectReason::Oversized {
                size: incoming,
                goal,
            };
            crate::metrics::record_cache_rejection(reason.as_str());
            return Err(CacheError::Rejected(reason));
        }

        let path = store.entry_path(&finished.key);
        if let Some(size) = store::remove_entry_file(&path)? {
            self.subtract_size(size);
        }
        self.make_room(incoming);
        let (path, size) = store.commit(finished.file, &finished.key)?;
        if let Some(total) = &mut self.current_cache_size {
            *total = total.saturating_add(size);
        }
        if self
            .last_item
            .as_ref()
            .is_some_and(|last| last.key == finished.key)
        {
            self.last_item = None;
        }
        trace!(
            path = %path.display(),
            size,
            compressed = finished.compressed,
            "cache entry stored"
        );
        Ok(())
    }

    /// Convenience wrapper: prepare, write `body`, insert.
    pub fn store(&mut self, metadata: &CacheMetadata, body: &[u8]) -> Result<(), CacheError> {
        let id = self.try_prepare(metadata)?;
        let written = match self.in_flight.get_mut(&id) {
            Some(item) => item.write_all(body),
            None => return Err(CacheError::UnknownSink(id)),
        };
        if let Err(err) = written {
            self.in_flight.remove(&id);
            return Err(err.into());
        }
        self.insert(id)
    }

    /// Cancels an unfinished write for `url` if there is one; otherwise
    /// deletes the stored entry. Returns whether anything was removed.
    pub fn remove(&mut self, url: &Url) -> bool {
        let key = CacheKey::new(url);
        self.last_item = None;
        let pending = self
            .in_flight
            .iter()
            .find(|(_, item)| item.key() == &key)
            .map(|(id, _)| *id);
        if let Some(id) = pending {
            trace!(sink = %id, "cancelling in-flight cache entry");
            self.in_flight.remove(&id);
            return true;
        }

        let Some(path) = self.store.as_ref().map(|store| store.entry_path(&key)) else {
            return false;
        };
        match store::remove_entry_file(&path) {
            Ok(Some(size)) => {
                self.subtract_size(size);
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(error = %err, path = %path.display(), "failed to remove cache entry");
                false
            }
        }
    }

    pub fn metadata(&mut self, url: &Url) -> Option<CacheMetadata> {
        let key = CacheKey::new(url);
        if let Some(last) = &self.last_item
            && last.key == key
        {
            crate::metrics::record_cache_lookup(true);
            return Some(last.metadata.clone());
        }
        let path = self.store.as_ref()?.entry_path(&key);
        let Some(entry) = self.load(&path, ReadMode::MetadataOnly, &key) else {
            crate::metrics::record_cache_lookup(false);
            return None;
        };
        crate::metrics::record_cache_lookup(true);
        self.last_item = Some(LastItem {
            key,
            metadata: entry.metadata.clone(),
            data: None,
        });
        Some(entry.metadata)
    }

    /// Body of the entry for `url`. Uncompressed bodies are a mapped view of
    /// the entry file, so the view outlives a later replacement of the entry.
    pub fn data(&mut self, url: &Url) -> Option<CacheData> {
        let key = CacheKey::new(url);
        if let Some(last) = &self.last_item
            && last.key == key
            && let Some(data) = &last.data
        {
            crate::metrics::record_cache_lookup(true);
            return Some(data.clone());
        }
        let path = self.store.as_ref()?.entry_path(&key);
        let Some(entry) = self.load(&path, ReadMode::WithData, &key) else {
            crate::metrics::record_cache_lookup(false);
            return None;
        };
        let Some(data) = entry.data else {
            crate::metrics::record_cache_lookup(false);
            return None;
        };
        crate::metrics::record_cache_lookup(true);
        self.last_item = Some(LastItem {
            key,
            metadata: entry.metadata,
            data: entry.compressed.then(|| data.clone()),
        });
        Some(data)
    }

    /// Rewrites the stored metadata for `metadata.url()`, keeping the body.
    pub fn update_metadata(&mut self, metadata: &CacheMetadata) -> Result<(), CacheError> {
        let url = metadata
            .url()
            .cloned()
            .ok_or(CacheError::Rejected(RejectReason::InvalidMetadata))?;
        let Some(mut data) = self.data(&url) else {
            warn!(url = %url, "cannot update metadata of an uncached entry");
            return Err(CacheError::NotCached(url.to_string()));
        };
        let id = self.try_prepare(metadata)?;

        let copied = match self.in_flight.get_mut(&id) {
            Some(item) => copy_body(&mut data, item),
            None => return Err(CacheError::UnknownSink(id)),
        };
        if let Err(err) = copied {
            warn!(url = %url, error = %err, "failed to copy cache body");
            self.in_flight.remove(&id);
            return Err(err.into());
        }
        self.insert(id)
    }

    /// Metadata of an arbitrary entry file. Stale or corrupt entry files are
    /// deleted.
    pub fn file_metadata(&mut self, path: &Path) -> Option<CacheMetadata> {
        let entry = self.decode_or_heal(path, ReadMode::MetadataOnly)?;
        Some(entry.metadata)
    }

    /// Deletes every entry. In-flight writes are unaffected.
    pub fn clear(&mut self) {
        let maximum = self.maximum_cache_size;
        self.maximum_cache_size = 0;
        self.current_cache_size = None;
        self.expire();
        self.maximum_cache_size = maximum;
        self.last_item = None;
    }

    fn load(&mut self, path: &Path, mode: ReadMode, key: &CacheKey) -> Option<DecodedEntry> {
        let entry = self.decode_or_heal(path, mode)?;
        // A different URL with the same short id; not ours to delete.
        if &entry.key != key {
            trace!(path = %path.display(), "cache entry belongs to another url");
            return None;
        }
        Some(entry)
    }

    fn decode_or_heal(&mut self, path: &Path, mode: ReadMode) -> Option<DecodedEntry> {
        match codec::read_entry(path, mode) {
            Ok(entry) => Some(entry),
            Err(err) if err.is_not_found() => {
                trace!(path = %path.display(), "cache miss");
                None
            }
            Err(err) if err.should_remove() => {
                warn!(error = %err, path = %path.display(), "removing unusable cache entry");
                self.last_item = None;
                match store::remove_entry_file(path) {
                    Ok(Some(size)) => {
                        crate::metrics::record_cache_corrupt_removed();
                        if self.owns(path) {
                            self.subtract_size(size);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(error = %err, path = %path.display(), "failed to remove cache entry");
                    }
                }
                None
            }
            Err(err) => {
                warn!(error = %err, path = %path.display(), "failed to read cache entry");
                None
            }
        }
    }

    fn owns(&self, path: &Path) -> bool {
        self.store
            .as_ref()
            .is_some_and(|store| path.starts_with(store.root()))
    }

    fn subtract_size(&mut self, size: u64) {
        if let Some(total) = &mut self.current_cache_size {
            *total = total.saturating_sub(size);
        }
    }
}

fn entry_limit(maximum: u64) -> u64 {
    let limit = u128::from(maximum) * MAX_ENTRY_SHARE_PERCENT / 100;
    u64::try_from(limit).unwrap_or(u64::MAX)
}

fn copy_body(data: &mut CacheData, item: &mut CacheItem) -> io::Result<()> {
    let mut buf = [0u8; COPY_BUFFER_SIZE];
    loop {
        let n = data.read(&mut buf)?;
        if n == 0 {
            return item.flush();
        }
        item.write_all(&buf[..n])?;
    }
}
