//! Per-object shadow state: cached attributes, tracked size, freshness and
//! the open-handle set.

use crate::cache::PageCache;
use crate::handles::HandleSet;
use crate::transport::{OBJ_TYPE_DIRECTORY, OBJ_TYPE_FILE, OBJ_TYPE_SYMLINK, ObjInfo};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Staleness bookkeeping for one shadow.
///
/// Two counters make "needs refresh" monotonic: any locally-known mutation
/// bumps `stale`, and a completed re-stat raises `validated` to the value
/// `stale` had when that re-stat began. A mutation that lands mid-refresh
/// leaves `stale` ahead, so the finishing refresh cannot mask it.
#[derive(Debug)]
pub struct Freshness {
    stale: AtomicU64,
    validated: AtomicU64,
}

impl Freshness {
    /// New shadows start stale; the host is authoritative for attributes.
    pub fn stale() -> Self {
        Self {
            stale: AtomicU64::new(1),
            validated: AtomicU64::new(0),
        }
    }

    pub fn fresh() -> Self {
        Self {
            stale: AtomicU64::new(0),
            validated: AtomicU64::new(0),
        }
    }

    pub fn mark_stale(&self) {
        self.stale.fetch_add(1, Ordering::SeqCst);
    }

    pub fn needs_refresh(&self) -> bool {
        self.validated.load(Ordering::SeqCst) < self.stale.load(Ordering::SeqCst)
    }

    /// Token for the refresh about to run; hand it to [`finish_refresh`]
    /// once the new attributes are stored.
    ///
    /// [`finish_refresh`]: Freshness::finish_refresh
    pub fn begin_refresh(&self) -> u64 {
        self.stale.load(Ordering::SeqCst)
    }

    pub fn finish_refresh(&self, token: u64) {
        self.validated.fetch_max(token, Ordering::SeqCst);
    }
}

/// Guest-side record of one remote object.
pub struct InodeShadow {
    pub ino: u64,
    attr: Mutex<ObjInfo>,
    /// Tracked size, updated eagerly by writes so readers see extensions
    /// before the next re-stat.
    size: AtomicU64,
    pub freshness: Freshness,
    pub handles: HandleSet,
    pub pages: PageCache,
}

impl InodeShadow {
    pub fn new(ino: u64, info: ObjInfo) -> Self {
        let size = info.size;
        Self {
            ino,
            attr: Mutex::new(info),
            size: AtomicU64::new(size),
            freshness: Freshness::stale(),
            handles: HandleSet::new(),
            pages: PageCache::new(),
        }
    }

    pub fn info(&self) -> ObjInfo {
        let mut info = self.attr.lock().unwrap().clone();
        info.size = self.size();
        info
    }

    /// Replace the cached attributes with what the host reported.
    pub fn store_info(&self, info: ObjInfo) {
        self.size.store(info.size, Ordering::SeqCst);
        *self.attr.lock().unwrap() = info;
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn size_cell(&self) -> &AtomicU64 {
        &self.size
    }

    pub fn type_code(&self) -> u32 {
        self.attr.lock().unwrap().type_code()
    }

    pub fn is_dir(&self) -> bool {
        self.type_code() == OBJ_TYPE_DIRECTORY
    }

    pub fn is_file(&self) -> bool {
        self.type_code() == OBJ_TYPE_FILE
    }

    pub fn is_symlink(&self) -> bool {
        self.type_code() == OBJ_TYPE_SYMLINK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::OBJ_TYPE_FILE;

    #[test]
    fn test_staleness_is_monotonic_across_refresh() {
        let f = Freshness::stale();
        assert!(f.needs_refresh());

        let token = f.begin_refresh();
        // A mutation lands while the re-stat is in flight.
        f.mark_stale();
        f.finish_refresh(token);
        assert!(f.needs_refresh());

        let token = f.begin_refresh();
        f.finish_refresh(token);
        assert!(!f.needs_refresh());

        // An older token can never un-stale a later mutation.
        f.mark_stale();
        f.finish_refresh(token);
        assert!(f.needs_refresh());
    }

    #[test]
    fn test_size_tracks_ahead_of_attrs() {
        let shadow = InodeShadow::new(7, ObjInfo::new(OBJ_TYPE_FILE, 0o644, 100));
        shadow.size_cell().fetch_max(250, Ordering::SeqCst);
        assert_eq!(shadow.info().size, 250);

        shadow.store_info(ObjInfo::new(OBJ_TYPE_FILE, 0o644, 300));
        assert_eq!(shadow.size(), 300);
    }
}
