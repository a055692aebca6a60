//! Per-connection page cache and the process-wide purger.
//!
//! A write transaction pins every page it loaded until it commits or rolls
//! back. [`purge_eligible_page_cache_memory`] drops every unpinned page of
//! every live cache in the process.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use tracing::debug;

#[derive(Debug)]
struct CachedPage {
    data: Arc<[u8]>,
    pins: u32,
    last_used: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    pages: HashMap<u32, CachedPage>,
    tick: u64,
}

/// LRU page cache keyed by page number.
#[derive(Debug)]
pub struct PageCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

fn registry() -> &'static Mutex<Vec<Weak<PageCache>>> {
    static CACHES: OnceLock<Mutex<Vec<Weak<PageCache>>>> = OnceLock::new();
    CACHES.get_or_init(|| Mutex::new(Vec::new()))
}

impl PageCache {
    /// Creates a cache holding up to `capacity` unpinned pages and
    /// registers it with the purger.
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        let cache = Self::detached(capacity);
        let mut caches = registry().lock();
        caches.retain(|c| c.strong_count() > 0);
        caches.push(Arc::downgrade(&cache));
        cache
    }

    fn detached(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            inner: Mutex::new(CacheInner::default()),
        })
    }

    /// Returns a cached page.
    pub fn get(&self, pgno: u32) -> Option<Arc<[u8]>> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        inner.pages.get_mut(&pgno).map(|page| {
            page.last_used = tick;
            Arc::clone(&page.data)
        })
    }

    /// Caches a page, optionally pinning it. Replacing a page keeps its
    /// pins.
    pub fn insert(&self, pgno: u32, data: Arc<[u8]>, pin: bool) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let page = inner.pages.entry(pgno).or_insert_with(|| CachedPage {
            data: Arc::clone(&data),
            pins: 0,
            last_used: tick,
        });
        page.data = data;
        page.last_used = tick;
        if pin {
            page.pins += 1;
        }
        Self::evict(&mut inner, self.capacity);
    }

    fn evict(inner: &mut CacheInner, capacity: usize) {
        while inner.pages.len() > capacity {
            let victim = inner
                .pages
                .iter()
                .filter(|(_, page)| page.pins == 0)
                .min_by_key(|(_, page)| page.last_used)
                .map(|(pgno, _)| *pgno);
            match victim {
                Some(pgno) => {
                    inner.pages.remove(&pgno);
                }
                None => break,
            }
        }
    }

    /// Pins a cached page. Returns false if the page is not cached.
    pub fn pin(&self, pgno: u32) -> bool {
        match self.inner.lock().pages.get_mut(&pgno) {
            Some(page) => {
                page.pins += 1;
                true
            }
            None => false,
        }
    }

    /// Drops every pin.
    pub fn unpin_all(&self) {
        let mut inner = self.inner.lock();
        for page in inner.pages.values_mut() {
            page.pins = 0;
        }
        Self::evict(&mut inner, self.capacity);
    }

    /// Drops every page, pinned or not.
    pub fn clear(&self) {
        self.inner.lock().pages.clear();
    }

    /// Drops unpinned pages, returning how many went.
    pub fn purge_unpinned(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.pages.len();
        inner.pages.retain(|_, page| page.pins > 0);
        before - inner.pages.len()
    }

    /// Number of cached pages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of pinned pages.
    #[must_use]
    pub fn pinned(&self) -> usize {
        self.inner.lock().pages.values().filter(|p| p.pins > 0).count()
    }
}

/// Releases every cached page in the process that no transaction pins.
pub fn purge_eligible_page_cache_memory() {
    let caches: Vec<Arc<PageCache>> = {
        let mut caches = registry().lock();
        caches.retain(|c| c.strong_count() > 0);
        caches.iter().filter_map(Weak::upgrade).collect()
    };
    let freed: usize = caches.iter().map(|c| c.purge_unpinned()).sum();
    debug!(caches = caches.len(), pages = freed, "purged page caches");
}
