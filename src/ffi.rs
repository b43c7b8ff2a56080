//! C-ABI exports for external linking (e.g., from bench via build.rs).
//!
//! Gated behind `features = ["ffi"]`. Built as part of the staticlib.
//! With `testing` feature, export names are prefixed by variant:
//!   - `percpu`  → `rtmalloc_percpu_*`
//!   - `nightly` → `rtmalloc_nightly_*`
//!   - `std`     → `rtmalloc_std_*`
//!   - neither   → `rtmalloc_nostd_*`
//! Without `testing`, exports plain `rtmalloc_*` names.

use crate::allocator::RtMalloc;
use core::alloc::{GlobalAlloc, Layout};

static ALLOC: RtMalloc = RtMalloc;

// Note: percpu implies nightly, so the percpu check must come first.

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "percpu"),
    unsafe(export_name = "rtmalloc_percpu_alloc")
)]
#[cfg_attr(
    all(feature = "testing", feature = "nightly", not(feature = "percpu")),
    unsafe(export_name = "rtmalloc_nightly_alloc")
)]
#[cfg_attr(
    all(
        feature = "testing",
        feature = "std",
        not(any(feature = "nightly", feature = "percpu"))
    ),
    unsafe(export_name = "rtmalloc_std_alloc")
)]
#[cfg_attr(
    all(
        feature = "testing",
        not(any(feature = "nightly", feature = "std", feature = "percpu"))
    ),
    unsafe(export_name = "rtmalloc_nostd_alloc")
)]
pub unsafe extern "C" fn rtmalloc_alloc(size: usize, align: usize) -> *mut u8 {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.alloc(layout) }
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "percpu"),
    unsafe(export_name = "rtmalloc_percpu_dealloc")
)]
#[cfg_attr(
    all(feature = "testing", feature = "nightly", not(feature = "percpu")),
    unsafe(export_name = "rtmalloc_nightly_dealloc")
)]
#[cfg_attr(
    all(
        feature = "testing",
        feature = "std",
        not(any(feature = "nightly", feature = "percpu"))
    ),
    unsafe(export_name = "rtmalloc_std_dealloc")
)]
#[cfg_attr(
    all(
        feature = "testing",
        not(any(feature = "nightly", feature = "std", feature = "percpu"))
    ),
    unsafe(export_name = "rtmalloc_nostd_dealloc")
)]
pub unsafe extern "C" fn rtmalloc_dealloc(ptr: *mut u8, size: usize, align: usize) {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.dealloc(ptr, layout) }
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "percpu"),
    unsafe(export_name = "rtmalloc_percpu_realloc")
)]
#[cfg_attr(
    all(feature = "testing", feature = "nightly", not(feature = "percpu")),
    unsafe(export_name = "rtmalloc_nightly_realloc")
)]
#[cfg_attr(
    all(
        feature = "testing",
        feature = "std",
        not(any(feature = "nightly", feature = "percpu"))
    ),
    unsafe(export_name = "rtmalloc_std_realloc")
)]
#[cfg_attr(
    all(
        feature = "testing",
        not(any(feature = "nightly", feature = "std", feature = "percpu"))
    ),
    unsafe(export_name = "rtmalloc_nostd_realloc")
)]
pub unsafe extern "C" fn rtmalloc_realloc(
    ptr: *mut u8,
    size: usize,
    align: usize,
    new_size: usize,
) -> *mut u8 {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.realloc(ptr, layout, new_size) }
}

// ---------------------------------------------------------------------
// External interfaces: redzone predicate, emergency latch, and the
// fault-delegate registration hooks instrumentation and runtime libraries
// link against directly by these exact names (no variant prefixing — these
// symbols aren't exercised by the `testing`-feature multi-variant harness).
// ---------------------------------------------------------------------

use crate::redzone::predicate;

/// `is_redzone(ptr) -> bool`: the slow-path predicate instrumentation calls
/// on every candidate out-of-bounds access. Never inlined, never aborts by
/// itself — `false` on an address this allocator doesn't recognize.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn is_redzone(ptr: *const u8) -> bool {
    matches!(predicate::is_redzone(ptr), predicate::Verdict::IsRedzone)
}

/// `is_redzone_multi(ptr, n) -> bool`: reserved for multi-byte bounded-access
/// checks. The core build has no way to answer this correctly, so it aborts
/// rather than risk a false negative.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn is_redzone_multi(ptr: *const u8, n: usize) -> bool {
    predicate::is_redzone_multi(ptr, n)
}

/// `set_emergency_malloc(bool)`: set/clear the calling thread's emergency
/// latch (C9).
#[unsafe(no_mangle)]
pub extern "C" fn set_emergency_malloc(enabled: bool) {
    crate::emergency::set(enabled);
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", feature = "lazy-reuse"))] {
        use crate::redzone::uffd;

        /// `register_uffd_pages(ptr, len)`: register a heap range with the
        /// fault delegate. Weak in the original (a runtime without the
        /// delegate linked in just never gets called); there's no portable
        /// weak-symbol story on stable Rust, so this is an ordinary export
        /// that's simply absent from the binary when `lazy-reuse` or Linux
        /// itself isn't in the build.
        ///
        /// # Safety
        /// `ptr` must be `SYS_PAGE_SIZE`-aligned and `len` a positive
        /// multiple of it, from a reservation not yet populated.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn register_uffd_pages(ptr: *mut u8, len: usize) -> bool {
            unsafe { uffd::register_range(ptr, len) }.is_ok()
        }

        /// `unregister_uffd_pages(ptr, len)`: inverse of
        /// [`register_uffd_pages`].
        ///
        /// # Safety
        /// `ptr`/`len` must match (or sub-range) a prior successful
        /// registration.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn unregister_uffd_pages(ptr: *mut u8, len: usize) -> bool {
            unsafe { uffd::unregister_range(ptr, len) }.is_ok()
        }
    } else {
        /// Stubbed when the lazy page-fill delegate isn't built in: always
        /// reports failure rather than silently no-op succeeding, so a
        /// caller checking the return value notices it has no delegate.
        #[unsafe(no_mangle)]
        pub extern "C" fn register_uffd_pages(_ptr: *mut u8, _len: usize) -> bool {
            false
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn unregister_uffd_pages(_ptr: *mut u8, _len: usize) -> bool {
            false
        }
    }
}

/// `alloc_stack(size, guard, sizeclass)`: reserved for stack-redzone
/// integration (out of the core allocator's scope — stack redzones are a
/// separate scheme). Always returns null; a real stack-redzone runtime
/// registering [`crate::redzone::uffd::register_stack_hook`] is expected to
/// provide its own allocation path rather than go through this one.
#[unsafe(no_mangle)]
pub extern "C" fn alloc_stack(_size: usize, _guard: usize, _sizeclass: usize) -> *mut u8 {
    core::ptr::null_mut()
}

/// `free_stack(ptr)`: inverse of [`alloc_stack`]; a no-op in the core build.
#[unsafe(no_mangle)]
pub extern "C" fn free_stack(_ptr: *mut u8) {}

// ---------------------------------------------------------------------
// Typed-allocation front door: `tc_typed_*`. These wrap the ordinary
// allocation path and stamp the owning span's `type_tag`, an extra integer
// carried through from typed allocations, which is all the contract
// promises. For a small allocation this tags the whole span (shared by
// every slot of that size class), not the individual object; a full
// per-object type registry is a separate concern this allocator doesn't
// take on (see DESIGN.md).
// ---------------------------------------------------------------------

use crate::PAGE_SHIFT;
use crate::allocator::PAGE_MAP;

type TypeTag = i64;

unsafe fn tag_owning_span(ptr: *mut u8, tag: TypeTag) {
    if ptr.is_null() {
        return;
    }
    let page_id = (ptr as usize) >> PAGE_SHIFT;
    let span = PAGE_MAP.get(page_id);
    if !span.is_null() {
        unsafe { (*span).type_tag = tag };
    }
}

/// # Safety
/// Same contract as `malloc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tc_typed_malloc(size: usize, tag: TypeTag) -> *mut u8 {
    let layout = unsafe { Layout::from_size_align_unchecked(size, core::mem::align_of::<usize>()) };
    let ptr = unsafe { ALLOC.alloc(layout) };
    unsafe { tag_owning_span(ptr, tag) };
    ptr
}

/// # Safety
/// Same contract as `calloc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tc_typed_calloc(n: usize, elem_size: usize, tag: TypeTag) -> *mut u8 {
    let size = n.saturating_mul(elem_size);
    let layout = unsafe { Layout::from_size_align_unchecked(size, core::mem::align_of::<usize>()) };
    let ptr = unsafe { ALLOC.alloc_zeroed(layout) };
    unsafe { tag_owning_span(ptr, tag) };
    ptr
}

/// # Safety
/// Same contract as `realloc`; `old_ptr` may be null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tc_typed_realloc(
    old_ptr: *mut u8,
    new_size: usize,
    tag: TypeTag,
) -> *mut u8 {
    // `RtMalloc::realloc` recovers the real old size from the owning span's
    // metadata rather than trusting the layout argument (see its doc
    // comment); only `layout.align()` matters here, and typed allocations
    // all go through the same fixed alignment.
    let layout =
        unsafe { Layout::from_size_align_unchecked(new_size, core::mem::align_of::<usize>()) };
    let ptr = unsafe { ALLOC.realloc(old_ptr, layout, new_size) };
    unsafe { tag_owning_span(ptr, tag) };
    ptr
}

/// # Safety
/// Same contract as `tc_typed_malloc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tc_typed_new(size: usize, tag: TypeTag) -> *mut u8 {
    unsafe { tc_typed_malloc(size, tag) }
}

/// # Safety
/// Same contract as `memalign`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tc_typed_memalign(align: usize, size: usize, tag: TypeTag) -> *mut u8 {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    let ptr = unsafe { ALLOC.alloc(layout) };
    unsafe { tag_owning_span(ptr, tag) };
    ptr
}

/// # Safety
/// Same contract as `valloc`/`pvalloc`: size rounded up to a full page.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tc_typed_valloc(size: usize, tag: TypeTag) -> *mut u8 {
    let rounded = size.div_ceil(crate::PAGE_SIZE) * crate::PAGE_SIZE;
    unsafe { tc_typed_memalign(crate::PAGE_SIZE, rounded.max(crate::PAGE_SIZE), tag) }
}

/// # Safety
/// Same contract as `tc_typed_valloc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tc_typed_pvalloc(size: usize, tag: TypeTag) -> *mut u8 {
    unsafe { tc_typed_valloc(size, tag) }
}
