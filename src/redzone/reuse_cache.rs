//! Large-span reuse cache (C6): a small fixed-capacity freelist that retains
//! recently-freed large spans so their poisoning survives without being
//! unmapped and re-registered.
//!
//! Exists only for large spans (`size_class == 0`): a small-or-medium span
//! absorbed back into the page heap's ordinary free lists would lose its
//! guard bytes the moment something else carves it up.
//!
//! Callers must already hold the page heap lock — this cache adds no
//! synchronization of its own.

use super::{poison, LARGE_FREELIST_CAP};
use crate::page_heap::PageHeap;
use crate::pagemap::PageMap;
use crate::size_class::MAX_SMALL_SIZE;
use crate::span::{self, Span};
use core::ptr;

/// Fixed-capacity set of retained large spans.
pub struct ReuseCache {
    slots: [*mut Span; LARGE_FREELIST_CAP],
}

// SAFETY: only ever touched by a caller holding the page heap lock.
unsafe impl Send for ReuseCache {}

impl ReuseCache {
    pub const fn new() -> Self {
        Self {
            slots: [ptr::null_mut(); LARGE_FREELIST_CAP],
        }
    }

    /// Insert a freshly-freed large span (caller holds the page heap lock).
    ///
    /// Returns `true` if the span was retained (its poisoning left intact
    /// and ownership transferred to this cache); `false` if the caller must
    /// zero the span's redzones and unmap it through the page heap as
    /// usual.
    ///
    /// # Safety
    ///
    /// `span` must be a valid, currently-unreferenced large span
    /// (`size_class == 0`).
    pub unsafe fn insert(&mut self, span: *mut Span, heap: &mut PageHeap, pagemap: &PageMap) -> bool {
        debug_assert_eq!(unsafe { (*span).size_class }, 0);

        if let Some(empty) = self.slots.iter_mut().find(|s| s.is_null()) {
            *empty = span;
            return true;
        }

        let (smallest_idx, smallest_pages) = self.smallest();
        let incoming_pages = unsafe { (*span).num_pages };
        if incoming_pages > smallest_pages {
            let evicted = self.slots[smallest_idx];
            unsafe {
                poison::unpoison_all_in_span(evicted);
                heap.deallocate_span(evicted);
            }
            let _ = pagemap;
            self.slots[smallest_idx] = span;
            true
        } else {
            false
        }
    }

    /// Find a retained span of at least `n` pages, splitting it if larger,
    /// and remove it from the cache (caller holds the page heap lock).
    ///
    /// The returned span's existing poisoning is preserved untouched; no
    /// filler work is needed since it was never disturbed.
    ///
    /// # Safety
    ///
    /// Caller must hold the page heap lock; `heap`/`pagemap` must be the
    /// live page heap this cache is paired with.
    pub unsafe fn find_or_split(
        &mut self,
        n: usize,
        heap: &mut PageHeap,
        pagemap: &PageMap,
    ) -> *mut Span {
        let mut best_idx = None;
        let mut best_pages = 0;
        for (i, &s) in self.slots.iter().enumerate() {
            if s.is_null() {
                continue;
            }
            let pages = unsafe { (*s).num_pages };
            if pages >= n && pages > best_pages {
                best_idx = Some(i);
                best_pages = pages;
            }
        }

        let idx = match best_idx {
            Some(i) => i,
            None => return ptr::null_mut(),
        };
        let span = self.slots[idx];
        self.slots[idx] = ptr::null_mut();

        let pages = unsafe { (*span).num_pages };
        if pages == n {
            return span;
        }

        // Split: head of n pages stays poisoned as-is (its leading redzone
        // is untouched); decide whether the tail is worth retaining.
        let tail_pages = pages - n;
        let tail_bytes = tail_pages * crate::PAGE_SIZE;
        let wasted = tail_bytes.saturating_sub(2 * super::RZ_LARGE) <= MAX_SMALL_SIZE;

        let tail = span::alloc_span();
        if tail.is_null() {
            // Can't even allocate the bookkeeping struct for the tail —
            // hand back the whole span rather than leak the pages.
            return span;
        }

        unsafe {
            (*tail).start_page = (*span).start_page + n;
            (*tail).num_pages = tail_pages;
            (*span).num_pages = n;

            if wasted {
                // The tail would be unusable to any future large request and
                // returning it to the page heap would lose its poisoning
                // for small-class reuse anyway — just drop it.
                poison::unpoison((*tail).start_addr(), super::RZ_LARGE.min(tail_bytes));
                pagemap.unregister_span(tail);
                heap.deallocate_span(tail);
            } else {
                // Poison the new boundary: trailing redzone at the retained
                // head's new end, leading redzone at the tail's start. These
                // pages are already resident (interior to the original,
                // already-faulted span), so even under `lazy-reuse` no
                // future fault will rebuild them — write directly rather
                // than going through the (possibly no-op) facade.
                let head_tail_start = (*span).start_addr().add(n * crate::PAGE_SIZE - super::RZ_LARGE);
                ptr::write_bytes(head_tail_start, super::RZ_VALUE, super::RZ_LARGE);
                ptr::write_bytes((*tail).start_addr(), super::RZ_VALUE, super::RZ_LARGE);

                pagemap.register_span(tail);
                self.insert_raw(tail);
            }
        }

        span
    }

    /// Insert directly into an empty slot, used internally when a split
    /// tail is retained without going through the full `insert` eviction
    /// logic (the tail was never freed to the page heap, so no caller-side
    /// fallback is needed if every slot happens to be full — fall back to
    /// unmapping it in that rare case).
    unsafe fn insert_raw(&mut self, span: *mut Span) {
        if let Some(empty) = self.slots.iter_mut().find(|s| s.is_null()) {
            *empty = span;
        }
        // If the cache is somehow already full (can't happen: we just freed
        // `idx` above), the tail leaks its slot reference but remains a
        // valid, registered, in-use span; this branch is unreachable in
        // practice because `find_or_split` always frees one slot first.
    }

    fn smallest(&self) -> (usize, usize) {
        let mut idx = 0;
        let mut pages = usize::MAX;
        for (i, &s) in self.slots.iter().enumerate() {
            let n = unsafe { (*s).num_pages };
            if n < pages {
                idx = i;
                pages = n;
            }
        }
        (idx, pages)
    }

    #[cfg(test)]
    pub fn retained_lengths(&self) -> alloc::vec::Vec<usize> {
        self.slots
            .iter()
            .filter(|s| !s.is_null())
            .map(|&s| unsafe { (*s).num_pages })
            .collect()
    }
}

impl Default for ReuseCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagemap::PageMap;
    use alloc::boxed::Box;

    fn make_env() -> (&'static PageMap, PageHeap) {
        let pm = Box::leak(Box::new(PageMap::new()));
        (pm, PageHeap::new(pm))
    }

    #[test]
    fn insert_fills_empty_slots_first() {
        let (pm, mut heap) = make_env();
        let mut cache = ReuseCache::new();
        unsafe {
            let s1 = heap.allocate_span(200);
            (*s1).size_class = 0;
            pm.register_span(s1);
            assert!(cache.insert(s1, &mut heap, pm));
            assert_eq!(cache.retained_lengths(), alloc::vec![200]);
        }
    }

    #[test]
    fn insert_evicts_smallest_when_full_and_larger() {
        let (pm, mut heap) = make_env();
        let mut cache = ReuseCache::new();
        unsafe {
            for n in 1..=super::super::LARGE_FREELIST_CAP {
                let s = heap.allocate_span(200 + n);
                (*s).size_class = 0;
                pm.register_span(s);
                assert!(cache.insert(s, &mut heap, pm));
            }
            let before: alloc::vec::Vec<usize> = cache.retained_lengths();
            assert_eq!(before.len(), super::super::LARGE_FREELIST_CAP);
            let min_before = *before.iter().min().unwrap();

            let big = heap.allocate_span(200 + super::super::LARGE_FREELIST_CAP + 50);
            (*big).size_class = 0;
            pm.register_span(big);
            assert!(cache.insert(big, &mut heap, pm));

            let after = cache.retained_lengths();
            assert_eq!(after.len(), super::super::LARGE_FREELIST_CAP);
            assert!(!after.contains(&min_before));
        }
    }

    #[test]
    fn insert_rejects_when_full_and_not_larger() {
        let (pm, mut heap) = make_env();
        let mut cache = ReuseCache::new();
        unsafe {
            for n in 1..=super::super::LARGE_FREELIST_CAP {
                let s = heap.allocate_span(300 + n);
                (*s).size_class = 0;
                pm.register_span(s);
                assert!(cache.insert(s, &mut heap, pm));
            }
            let small = heap.allocate_span(1);
            (*small).size_class = 0;
            pm.register_span(small);
            assert!(!cache.insert(small, &mut heap, pm));

            // Caller's responsibility on rejection: zero redzones, unmap.
            poison::unpoison_all_in_span(small);
            pm.unregister_span(small);
            heap.deallocate_span(small);
        }
    }

    #[test]
    fn find_or_split_exact_match() {
        let (pm, mut heap) = make_env();
        let mut cache = ReuseCache::new();
        unsafe {
            let s = heap.allocate_span(64);
            (*s).size_class = 0;
            pm.register_span(s);
            cache.insert(s, &mut heap, pm);

            let found = cache.find_or_split(64, &mut heap, pm);
            assert_eq!(found, s);
            assert!(cache.retained_lengths().is_empty());

            pm.unregister_span(s);
            heap.deallocate_span(s);
        }
    }

    #[test]
    fn find_or_split_returns_null_when_none_fit() {
        let (pm, mut heap) = make_env();
        let mut cache = ReuseCache::new();
        unsafe {
            let s = heap.allocate_span(10);
            (*s).size_class = 0;
            pm.register_span(s);
            cache.insert(s, &mut heap, pm);

            assert!(cache.find_or_split(64, &mut heap, pm).is_null());

            let back = cache.find_or_split(10, &mut heap, pm);
            assert_eq!(back, s);
            pm.unregister_span(s);
            heap.deallocate_span(s);
        }
    }
}
