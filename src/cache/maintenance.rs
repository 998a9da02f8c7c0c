use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};
use walkdir::WalkDir;

use super::DiskCache;
use super::store::is_entry_file;

/// Fraction of the maximum that eviction aims for, in tenths.
const EVICTION_GOAL_TENTHS: u128 = 9;

#[derive(Debug, Default)]
pub(super) struct ExpireStats {
    pub scanned: usize,
    pub removed: u64,
    pub bytes_reclaimed: u64,
    pub failed: usize,
}

#[derive(Debug)]
struct ScannedEntry {
    time: SystemTime,
    path: PathBuf,
    size: u64,
}

pub(super) fn eviction_goal(maximum: u64) -> u64 {
    let goal = u128::from(maximum) * EVICTION_GOAL_TENTHS / 10;
    u64::try_from(goal).unwrap_or(u64::MAX)
}

impl DiskCache {
    /// Brings the cache under its size goal and returns the resulting total.
    ///
    /// A known size below the maximum returns immediately. Otherwise the whole
    /// cache root is scanned and the oldest entries are deleted until the
    /// total is at most 90% of the maximum.
    pub fn expire(&mut self) -> u64 {
        if let Some(size) = self.current_cache_size
            && size < self.maximum_cache_size
        {
            return size;
        }
        self.evict_to(eviction_goal(self.maximum_cache_size))
    }

    /// Frees space for a file of `incoming` bytes so the total after adding it
    /// stays within the goal.
    pub(super) fn make_room(&mut self, incoming: u64) {
        let goal = eviction_goal(self.maximum_cache_size);
        if let Some(size) = self.current_cache_size
            && size.saturating_add(incoming) <= goal
        {
            return;
        }
        self.evict_to(goal.saturating_sub(incoming));
    }

    fn evict_to(&mut self, target: u64) -> u64 {
        let Some(store) = self.store.as_ref() else {
            return 0;
        };
        self.last_item = None;

        let mut entries = scan_entries(store.root());
        entries.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.path.cmp(&b.path)));

        let mut stats = ExpireStats {
            scanned: entries.len(),
            ..ExpireStats::default()
        };
        let mut total: u64 = entries.iter().map(|entry| entry.size).sum();
        for entry in &entries {
            if total <= target {
                break;
            }
            match fs::remove_file(&entry.path) {
                Ok(()) => {
                    total -= entry.size;
                    stats.removed += 1;
                    stats.bytes_reclaimed += entry.size;
                }
                Err(err) => {
                    stats.failed += 1;
                    warn!(error = %err, path = %entry.path.display(), "failed to evict cache entry");
                }
            }
        }

        if stats.removed > 0 || stats.failed > 0 {
            debug!(
                scanned = stats.scanned,
                removed = stats.removed,
                bytes_reclaimed = stats.bytes_reclaimed,
                failed = stats.failed,
                total,
                "cache eviction finished"
            );
        }
        crate::metrics::record_cache_evictions(stats.removed, stats.bytes_reclaimed);
        self.current_cache_size = Some(total);
        total
    }
}

fn scan_entries(root: &Path) -> Vec<ScannedEntry> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "failed to scan cache directory");
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_entry_file(entry.path()) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                warn!(error = %err, path = %entry.path().display(), "failed to stat cache entry");
                continue;
            }
        };
        let time = meta
            .created()
            .or_else(|_| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push(ScannedEntry {
            time,
            path: entry.into_path(),
            size: meta.len(),
        });
    }
    entries
}
