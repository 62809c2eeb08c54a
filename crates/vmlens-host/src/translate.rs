//! Address-translation cache — memoized VA→PA lookups per process.
//!
//! Page-table walks are cheap but not free, and interactive memory views
//! re-translate the same pages constantly.  [`AddressTranslationCache`]
//! sits above a [`PageTableWalker`] and caches results at page
//! granularity, including **negative** results: an unmapped page is a
//! common, stable answer and re-walking it every frame is wasted work.
//!
//! The cache can also be warmed from outside: PTE records harvested from
//! the beacon stream feed [`extend_from_ptes`], and a background
//! [`prefetch`] walks a window of pages around a focus address on a
//! worker thread.  Starting a new prefetch cancels the previous one.
//!
//! [`extend_from_ptes`]: AddressTranslationCache::extend_from_ptes
//! [`prefetch`]: AddressTranslationCache::prefetch

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use log::{debug, info};

use crate::walker::{PageTableWalker, PAGE_SIZE};

const PAGE_MASK: u64 = PAGE_SIZE - 1;

#[derive(Default)]
struct CacheState {
    /// Page-table root per PID, as learned from the guest.
    roots: HashMap<u32, u64>,
    /// Per-PID map of VA page → PA page; `None` caches "unmapped".
    entries: HashMap<u32, HashMap<u64, Option<u64>>>,
}

struct PrefetchHandle {
    cancel: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

/// Per-process translation cache over an architecture walker.
pub struct AddressTranslationCache {
    walker: Arc<dyn PageTableWalker + Send + Sync>,
    state: Arc<Mutex<CacheState>>,
    prefetch: Option<PrefetchHandle>,
}

impl AddressTranslationCache {
    pub fn new(walker: Arc<dyn PageTableWalker + Send + Sync>) -> Self {
        Self {
            walker,
            state: Arc::new(Mutex::new(CacheState::default())),
            prefetch: None,
        }
    }

    fn lock(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
        state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the page-table root for `pid`.
    ///
    /// A changed root drops every cached translation for the PID — the
    /// old entries described a different address space.
    pub fn set_root(&self, pid: u32, root: u64) {
        let mut state = Self::lock(&self.state);
        if state.roots.insert(pid, root) != Some(root) {
            state.entries.remove(&pid);
            debug!("pid {}: root set to {:#x}, cache cleared", pid, root);
        }
    }

    /// The page-table root recorded for `pid`, if any.
    pub fn root(&self, pid: u32) -> Option<u64> {
        Self::lock(&self.state).roots.get(&pid).copied()
    }

    /// Translate `va` for `pid`, walking the tables on a cache miss.
    ///
    /// Returns `None` when the page is unmapped or no root is known for
    /// the PID.  Both outcomes of a walk are cached, so a hot unmapped
    /// page costs one walk total, not one per query.
    pub fn lookup(&self, pid: u32, va: u64) -> Option<u64> {
        let page = va & !PAGE_MASK;

        let root = {
            let state = Self::lock(&self.state);
            if let Some(cached) = state.entries.get(&pid).and_then(|m| m.get(&page)) {
                return cached.map(|pa| pa | (va & PAGE_MASK));
            }
            state.roots.get(&pid).copied()?
        };

        // Walk outside the lock: descriptor reads go through the memory
        // backend and must not serialize against the prefetch worker.
        let pa = self.walker.translate(root, page).map(|m| m.pa & !PAGE_MASK);

        let mut state = Self::lock(&self.state);
        state.entries.entry(pid).or_default().insert(page, pa);
        pa.map(|pa| pa | (va & PAGE_MASK))
    }

    /// Seed the cache with externally resolved (VA, PA) pairs, such as
    /// PTE records published through the beacon.
    pub fn extend_from_ptes<I>(&self, pid: u32, ptes: I)
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        let mut state = Self::lock(&self.state);
        let entries = state.entries.entry(pid).or_default();
        let mut added = 0usize;
        for (va, pa) in ptes {
            entries.insert(va & !PAGE_MASK, Some(pa & !PAGE_MASK));
            added += 1;
        }
        debug!("pid {}: {} translations seeded from beacon", pid, added);
    }

    /// Number of cached pages (mapped or negative) for `pid`.
    pub fn cached_pages(&self, pid: u32) -> usize {
        Self::lock(&self.state)
            .entries
            .get(&pid)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Drop every cached translation for `pid`, keeping its root.
    ///
    /// Called when the target's address space is known to have changed
    /// (camera refocus, exec).
    pub fn invalidate(&self, pid: u32) {
        let mut state = Self::lock(&self.state);
        state.entries.remove(&pid);
    }

    /// Walk and cache `radius` pages on each side of `center_va` on a
    /// background thread.
    ///
    /// Starting a new prefetch cancels and replaces any running one.
    /// Pages already cached are skipped.  A PID with no known root makes
    /// this a no-op.
    pub fn prefetch(&mut self, pid: u32, center_va: u64, radius: usize) {
        self.cancel_prefetch();

        let Some(root) = self.root(pid) else {
            debug!("pid {}: prefetch skipped, no root known", pid);
            return;
        };

        let center = center_va & !PAGE_MASK;
        let start = center.saturating_sub(radius as u64 * PAGE_SIZE);
        let pages = 2 * radius + 1;

        let cancel = Arc::new(AtomicBool::new(false));
        let walker = Arc::clone(&self.walker);
        let state = Arc::clone(&self.state);
        let flag = Arc::clone(&cancel);

        let handle = thread::spawn(move || {
            let mut walked = 0usize;
            for i in 0..pages {
                if flag.load(Ordering::Relaxed) {
                    debug!("pid {}: prefetch cancelled after {} walks", pid, walked);
                    return;
                }
                let Some(page) = start.checked_add(i as u64 * PAGE_SIZE) else {
                    break;
                };
                {
                    let state = Self::lock(&state);
                    if state
                        .entries
                        .get(&pid)
                        .is_some_and(|m| m.contains_key(&page))
                    {
                        continue;
                    }
                }
                let pa = walker.translate(root, page).map(|m| m.pa & !PAGE_MASK);
                walked += 1;
                Self::lock(&state).entries.entry(pid).or_default().insert(page, pa);
            }
            info!("pid {}: prefetch complete, {} pages walked", pid, walked);
        });

        self.prefetch = Some(PrefetchHandle { cancel, handle });
    }

    /// Signal the running prefetch (if any) to stop and wait for it.
    pub fn cancel_prefetch(&mut self) {
        if let Some(prefetch) = self.prefetch.take() {
            prefetch.cancel.store(true, Ordering::Relaxed);
            let _ = prefetch.handle.join();
        }
    }

    /// Block until the running prefetch (if any) finishes.
    pub fn wait_for_prefetch(&mut self) {
        if let Some(prefetch) = self.prefetch.take() {
            let _ = prefetch.handle.join();
        }
    }
}

impl Drop for AddressTranslationCache {
    fn drop(&mut self) {
        self.cancel_prefetch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walker::PhysMapping;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Walker double: fixed VA→PA map plus a walk counter.
    struct MapWalker {
        map: HashMap<u64, u64>,
        walks: AtomicUsize,
        delay: Option<Duration>,
    }

    impl MapWalker {
        fn new(pairs: &[(u64, u64)]) -> Self {
            Self {
                map: pairs.iter().copied().collect(),
                walks: AtomicUsize::new(0),
                delay: None,
            }
        }

        fn walks(&self) -> usize {
            self.walks.load(Ordering::SeqCst)
        }
    }

    impl PageTableWalker for MapWalker {
        fn translate(&self, _root: u64, va: u64) -> Option<PhysMapping> {
            self.walks.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
            self.map.get(&(va & !PAGE_MASK)).map(|&pa| PhysMapping {
                pa: pa | (va & PAGE_MASK),
                page_size: PAGE_SIZE,
                writable: true,
                user: true,
                no_execute: false,
            })
        }
    }

    fn cache_with(pairs: &[(u64, u64)]) -> (AddressTranslationCache, Arc<MapWalker>) {
        let walker = Arc::new(MapWalker::new(pairs));
        let cache = AddressTranslationCache::new(walker.clone());
        cache.set_root(42, 0x1000);
        (cache, walker)
    }

    #[test]
    fn miss_walks_then_hits_cache() {
        let (cache, walker) = cache_with(&[(0x5000, 0x8_5000)]);

        assert_eq!(cache.lookup(42, 0x5000), Some(0x8_5000));
        assert_eq!(cache.lookup(42, 0x5000), Some(0x8_5000));
        assert_eq!(walker.walks(), 1);
    }

    #[test]
    fn lookup_preserves_page_offset() {
        let (cache, _) = cache_with(&[(0x5000, 0x8_5000)]);
        assert_eq!(cache.lookup(42, 0x5ABC), Some(0x8_5ABC));
    }

    #[test]
    fn unmapped_page_is_negatively_cached() {
        let (cache, walker) = cache_with(&[]);

        assert_eq!(cache.lookup(42, 0x7000), None);
        assert_eq!(cache.lookup(42, 0x7123), None);
        assert_eq!(walker.walks(), 1, "second query must hit the negative entry");
    }

    #[test]
    fn unknown_pid_never_walks() {
        let (cache, walker) = cache_with(&[(0x5000, 0x8_5000)]);
        assert_eq!(cache.lookup(999, 0x5000), None);
        assert_eq!(walker.walks(), 0);
    }

    #[test]
    fn seeded_ptes_satisfy_lookups_without_walking() {
        let (cache, walker) = cache_with(&[]);

        cache.extend_from_ptes(42, [(0x1000, 0xAA_1000), (0x2000, 0xBB_2000)]);
        assert_eq!(cache.lookup(42, 0x1004), Some(0xAA_1004));
        assert_eq!(cache.lookup(42, 0x2FFF), Some(0xBB_2FFF));
        assert_eq!(walker.walks(), 0);
        assert_eq!(cache.cached_pages(42), 2);
    }

    #[test]
    fn invalidate_forces_a_fresh_walk() {
        let (cache, walker) = cache_with(&[(0x5000, 0x8_5000)]);

        cache.lookup(42, 0x5000);
        cache.invalidate(42);
        assert_eq!(cache.cached_pages(42), 0);
        cache.lookup(42, 0x5000);
        assert_eq!(walker.walks(), 2);
        assert_eq!(cache.root(42), Some(0x1000), "root survives invalidation");
    }

    #[test]
    fn changed_root_clears_entries() {
        let (cache, walker) = cache_with(&[(0x5000, 0x8_5000)]);

        cache.lookup(42, 0x5000);
        cache.set_root(42, 0x2000);
        assert_eq!(cache.cached_pages(42), 0);

        // Re-setting the same root must not clear anything.
        cache.lookup(42, 0x5000);
        cache.set_root(42, 0x2000);
        assert_eq!(cache.cached_pages(42), 1);
        assert_eq!(walker.walks(), 2);
    }

    #[test]
    fn prefetch_populates_window() {
        let (mut cache, walker) = cache_with(&[
            (0x4000, 0x10_4000),
            (0x5000, 0x10_5000),
            (0x6000, 0x10_6000),
        ]);

        cache.prefetch(42, 0x5000, 1);
        cache.wait_for_prefetch();

        assert_eq!(cache.cached_pages(42), 3);
        let walked = walker.walks();
        assert_eq!(cache.lookup(42, 0x4000), Some(0x10_4000));
        assert_eq!(cache.lookup(42, 0x6000), Some(0x10_6000));
        assert_eq!(walker.walks(), walked, "hits after prefetch never walk");
    }

    #[test]
    fn prefetch_skips_already_cached_pages() {
        let (mut cache, walker) = cache_with(&[(0x5000, 0x10_5000)]);

        cache.extend_from_ptes(42, [(0x4000, 0xAA_4000), (0x6000, 0xAA_6000)]);
        cache.prefetch(42, 0x5000, 1);
        cache.wait_for_prefetch();

        assert_eq!(walker.walks(), 1, "only the center page needed a walk");
    }

    #[test]
    fn new_prefetch_cancels_the_previous_one() {
        let walker = Arc::new(MapWalker {
            map: HashMap::new(),
            walks: AtomicUsize::new(0),
            delay: Some(Duration::from_millis(2)),
        });
        let mut cache = AddressTranslationCache::new(walker.clone());
        cache.set_root(42, 0x1000);

        // A wide slow prefetch, immediately superseded by a tiny one.
        cache.prefetch(42, 0x100_0000, 500);
        cache.prefetch(42, 0x0, 1);
        cache.wait_for_prefetch();

        assert!(
            walker.walks() < 100,
            "cancelled prefetch must stop early, walked {}",
            walker.walks()
        );
    }

    #[test]
    fn prefetch_without_root_is_a_no_op() {
        let (mut cache, walker) = cache_with(&[]);
        cache.prefetch(7, 0x5000, 10);
        cache.wait_for_prefetch();
        assert_eq!(walker.walks(), 0);
        assert_eq!(cache.cached_pages(7), 0);
    }
}
