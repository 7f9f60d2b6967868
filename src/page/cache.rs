//! L2: a bounded LRU cache wrapping an inner `PageSource`, so repeated
//! descents into hot interior pages don't re-read or re-decrypt them. Grounded
//! on the teacher's `Pager`, which kept a `HashMap<PageNum, Rc<Page>>` with no
//! eviction; generalized here to a real bounded LRU via the `lru` crate so a
//! long-lived `Database` handle has a fixed memory ceiling (spec §4.2).

use std::num::NonZeroUsize;

use log::debug;
use lru::LruCache;

use super::{PageNum, PageSource};
use crate::error::Result;

/// Default capacity chosen to comfortably hold a few root-to-leaf paths of a
/// multi-level b-tree without thrashing; callers can override via
/// `CachingPageSource::with_capacity`.
pub const DEFAULT_CAPACITY: usize = 500;

/// Wraps `inner` with an LRU cache of decoded page bytes. Entries are
/// invalidated wholesale whenever `inner.data_version()` changes underneath
/// us, since a bumped `data_version` means pages may have been rewritten by a
/// writer and our cached bytes are stale (spec §3 "Snapshot/version token").
pub struct CachingPageSource<S> {
    inner: S,
    cache: LruCache<PageNum, Vec<u8>>,
    last_seen_version: u64,
}

impl<S: PageSource> CachingPageSource<S> {
    pub fn new(inner: S) -> Self {
        Self::with_capacity(inner, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(inner: S, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        let last_seen_version = inner.data_version();
        CachingPageSource {
            inner,
            cache: LruCache::new(capacity),
            last_seen_version,
        }
    }

    fn invalidate_if_stale(&mut self) {
        let current = self.inner.data_version();
        if current != self.last_seen_version {
            debug!(
                "page cache: data_version changed ({} -> {current}), dropping cached pages",
                self.last_seen_version
            );
            self.cache.clear();
            self.last_seen_version = current;
        }
    }
}

impl<S: PageSource> PageSource for CachingPageSource<S> {
    fn page_size(&self) -> u32 {
        self.inner.page_size()
    }

    fn page_count(&self) -> u32 {
        self.inner.page_count()
    }

    fn data_version(&self) -> u64 {
        self.inner.data_version()
    }

    fn get_page(&mut self, page_number: PageNum) -> Result<&[u8]> {
        self.invalidate_if_stale();
        if !self.cache.contains(&page_number) {
            let bytes = self.inner.get_page(page_number)?.to_vec();
            self.cache.put(page_number, bytes);
        }
        Ok(self.cache.get(&page_number).expect("just inserted"))
    }
}
