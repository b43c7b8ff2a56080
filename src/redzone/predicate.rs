//! Redzone predicate (C8): the slow-path `is_redzone` query consulted by
//! instrumented loads/stores.
//!
//! Side-effect-free besides the debug log on a genuine hit; never aborts by
//! itself — that decision belongs to the instrumentation call site.

use super::geometry::{self, Membership};
use crate::allocator::PAGE_MAP;
use crate::span::Span;
use core::sync::atomic::{AtomicU64, Ordering};

/// Result of a redzone query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No span owns this address (or it belongs to a stack span, which is
    /// out of scope here) — hand off to another checker.
    Unknown,
    /// The address lies in a redzone: a client bug.
    IsRedzone,
    /// The address lies within the object region of a live allocation.
    IsObject,
}

/// Count of confirmed redzone hits, for diagnostics and tests. Not used for
/// synchronization.
pub static REDZONE_HITS: AtomicU64 = AtomicU64::new(0);

/// `IsRedzone(ptr)`: look up the owning span, reject stack spans, and apply
/// the redzone geometry.
#[inline]
pub fn is_redzone(ptr: *const u8) -> Verdict {
    let page_id = (ptr as usize) >> crate::PAGE_SHIFT;
    let span = PAGE_MAP.get(page_id);
    if span.is_null() {
        return Verdict::Unknown;
    }

    // SAFETY: a non-null pagemap entry always points at a live span; the
    // page heap never frees the Span struct back to its slab while a page
    // of it is still registered.
    let s: &Span = unsafe { &*span };
    if s.is_stack || s.no_redzone {
        return Verdict::Unknown;
    }

    let base = s.start_addr() as usize;
    let addr = ptr as usize;
    if addr < base || addr >= base + s.byte_size() {
        // Pagemap entries for free spans only cover endpoints; a pointer
        // into the interior of an unmapped gap should never reach here via
        // a valid span lookup, but guard it anyway.
        return Verdict::Unknown;
    }
    let o = addr - base;

    match geometry::membership(s, o) {
        Membership::Redzone => {
            REDZONE_HITS.fetch_add(1, Ordering::Relaxed);
            Verdict::IsRedzone
        }
        Membership::Object => Verdict::IsObject,
    }
}

/// `IsRedzoneMulti(ptr, n_bytes)`: reserved for multi-byte bounded-access
/// checks from memory-intrinsic instrumentation (`memcpy`, `memset`, ...).
/// The core build stubs this as a hard abort rather than risk a wrong
/// answer on a bounded-access check it can't actually evaluate.
#[cold]
pub fn is_redzone_multi(_ptr: *const u8, n_bytes: usize) -> ! {
    if n_bytes <= 1 {
        // A single-byte multi-check degrades to the ordinary predicate;
        // callers should prefer `is_redzone` directly, but don't abort here.
        unreachable!("is_redzone_multi called with n_bytes <= 1; use is_redzone")
    }
    panic!("multibyte checks not yet supported (n_bytes = {n_bytes})")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{PAGE_HEAP, PAGE_MAP};

    #[test]
    fn unknown_address_is_unknown() {
        // A wildly out-of-range pointer has no span.
        assert_eq!(is_redzone(0xdead_beef as *const u8), Verdict::Unknown);
    }

    #[test]
    fn large_span_boundaries() {
        let span = unsafe { PAGE_HEAP.lock().allocate_span(16) };
        assert!(!span.is_null());
        unsafe {
            (*span).size_class = 0;
            PAGE_MAP.register_span(span);
        }
        let base = unsafe { (*span).start_addr() } as usize;
        let span_bytes = unsafe { (*span).byte_size() };

        assert_eq!(is_redzone(base as *const u8), Verdict::IsRedzone);
        assert_eq!(
            is_redzone((base + super::super::RZ_LARGE) as *const u8),
            Verdict::IsObject
        );
        assert_eq!(
            is_redzone((base + span_bytes - 1) as *const u8),
            Verdict::IsRedzone
        );

        unsafe {
            PAGE_MAP.unregister_span(span);
            PAGE_HEAP.lock().deallocate_span(span);
        }
    }

    #[test]
    #[should_panic(expected = "multibyte checks not yet supported")]
    fn multi_byte_check_aborts() {
        is_redzone_multi(core::ptr::null(), 4);
    }
}
