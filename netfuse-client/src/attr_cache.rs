//! Bounded, age-limited cache from absolute client path to a recent
//! `getattr`-equivalent snapshot.
//!
//! Grounded in `fs/attrcache.c`: a single mutex-guarded hash map, lookup
//! that evicts its own miss, and a two-pass shrink (first drop everything
//! already over max age, then drop arbitrary entries until the batch quota
//! is met). The pthread mutex becomes a `parking_lot::Mutex`; the
//! `hash_*` table becomes a `std::collections::HashMap`.

use std::collections::HashMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use fuser::FileAttr;
use parking_lot::Mutex;

/// A cached `stat`-equivalent snapshot plus the instant it was inserted.
#[derive(Clone)]
pub struct CacheEntry {
    pub attr: FileAttr,
    created_at: Instant,
}

impl CacheEntry {
    pub fn new(attr: FileAttr) -> Self {
        Self { attr, created_at: Instant::now() }
    }

    fn is_deprecated(&self, max_age_sec: u64) -> bool {
        self.created_at.elapsed().as_secs() > max_age_sec
    }
}

pub struct AttrCache {
    inner: Mutex<HashMap<String, CacheEntry>>,
    max_entries: usize,
    max_age_sec: u64,
    batch_size: usize,
}

impl AttrCache {
    pub fn new(max_entries: usize, max_age_sec: u64, batch_size: usize) -> Self {
        Self { inner: Mutex::new(HashMap::new()), max_entries, max_age_sec, batch_size }
    }

    /// Returns a copy of the cached snapshot for `path` if it exists and
    /// is not older than `max_age_sec`. A stale hit is evicted on the way
    /// out, same as `AttrCache_get`'s miss-on-deprecated path.
    pub fn copy_stat(&self, path: &str) -> Option<FileAttr> {
        let mut guard = self.inner.lock();
        match guard.get(path) {
            Some(entry) if !entry.is_deprecated(self.max_age_sec) => Some(entry.attr),
            Some(_) => {
                guard.remove(path);
                None
            }
            None => None,
        }
    }

    /// Inserts or replaces the entry for `path`, shrinking first if the
    /// cache is at capacity.
    pub fn set(&self, path: String, attr: FileAttr) {
        if self.max_entries == 0 {
            return;
        }
        let mut guard = self.inner.lock();
        if guard.len() >= self.max_entries && !guard.contains_key(&path) {
            Self::shrink_locked(&mut guard, self.max_age_sec, self.batch_size);
        }
        guard.insert(path, CacheEntry::new(attr));
    }

    /// Removes any entry for `path`. Called after every mutating
    /// operation succeeds on that path, per the cache's consistency
    /// invariant.
    pub fn remove(&self, path: &str) {
        self.inner.lock().remove(path);
    }

    /// Drops entries past `max_age_sec` first; if that alone doesn't free
    /// `batch_size` slots, drops arbitrary remaining entries until it
    /// does. Mirrors `AttrCache_shrink`'s two-pass policy exactly,
    /// including that the fallback pass has no ordering guarantee.
    pub fn shrink(&self) {
        let mut guard = self.inner.lock();
        Self::shrink_locked(&mut guard, self.max_age_sec, self.batch_size);
    }

    fn shrink_locked(map: &mut HashMap<String, CacheEntry>, max_age_sec: u64, batch_size: usize) {
        let target = batch_size.min(map.len());
        if target == 0 {
            return;
        }
        let deprecated: Vec<String> =
            map.iter().filter(|(_, entry)| entry.is_deprecated(max_age_sec)).map(|(k, _)| k.clone()).collect();
        let mut removed = 0;
        for key in deprecated {
            map.remove(&key);
            removed += 1;
        }
        if removed < target {
            let extra: Vec<String> = map.keys().take(target - removed).cloned().collect();
            for key in extra {
                map.remove(&key);
            }
        }
    }
}

/// Converts a [`SystemTime`] to seconds since the epoch, used when
/// translating protocol timestamps into `FileAttr`'s `SystemTime` fields.
pub fn unix_seconds(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + std::time::Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - std::time::Duration::from_secs((-secs) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuser::{FileType, INodeNo};
    use std::time::SystemTime;

    fn dummy_attr(ino: u64) -> FileAttr {
        FileAttr {
            ino: INodeNo(ino),
            size: 0,
            blocks: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            crtime: SystemTime::UNIX_EPOCH,
            kind: FileType::RegularFile,
            perm: 0o644,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    #[test]
    fn hit_then_miss_after_removal() {
        let cache = AttrCache::new(16, 60, 4);
        cache.set("/a".to_string(), dummy_attr(1));
        assert!(cache.copy_stat("/a").is_some());
        cache.remove("/a");
        assert!(cache.copy_stat("/a").is_none());
    }

    #[test]
    fn stale_entry_is_evicted_on_lookup() {
        let cache = AttrCache::new(16, 0, 4);
        cache.set("/a".to_string(), dummy_attr(1));
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(cache.copy_stat("/a").is_none());
    }

    #[test]
    fn shrink_makes_room_when_cache_is_full() {
        let cache = AttrCache::new(2, 3600, 1);
        cache.set("/a".to_string(), dummy_attr(1));
        cache.set("/b".to_string(), dummy_attr(2));
        // cache is at capacity; inserting a third must shrink first
        cache.set("/c".to_string(), dummy_attr(3));
        assert!(cache.copy_stat("/c").is_some());
    }
}
