//! Poisoning facade (C7): `Poison` / `Unpoison` / `UnpoisonAllInSpan`.
//!
//! Exactly one of three build-time modes is active:
//!
//! - `shadow-mem` feature: redzone state lives in a side shadow mapping.
//! - `lazy-reuse` feature: poisoning is implicit — the page filler (C4) is
//!   the sole source of guard bytes, so these operations are no-ops.
//! - neither (the default): `IN_BAND_FILL` — guard bytes are written
//!   directly into the allocation, in place.
//!
//! `lazy-reuse` and `shadow-mem` are mutually exclusive; enabling both is a
//! build-time error (see the crate's `Cargo.toml` feature table).

#[cfg(all(feature = "shadow-mem", feature = "lazy-reuse"))]
compile_error!("features \"shadow-mem\" and \"lazy-reuse\" are mutually exclusive poisoning modes");

use super::{geometry, RZ_SMALL, RZ_VALUE};
use crate::span::Span;
use core::ptr;

#[cfg(feature = "shadow-mem")]
pub mod shadow {
    //! Shadow-memory addressing, given only as a contract: one shadow byte
    //! covers `1 << SHADOW_SCALE` bytes of real memory, offset by
    //! `SHADOW_BASE`. A real deployment maps this region at process start;
    //! here we reserve a process-static region sized for the address space
    //! the page heap actually uses, which is sufficient for this crate's
    //! own allocations.
    pub const SHADOW_SCALE: u32 = 3; // 1 shadow byte per 8 bytes, like ASan
    pub const SHADOW_MAGIC: u8 = 0xFA;

    /// Translate a real address to its shadow byte address.
    #[inline]
    pub fn shadow_addr(ptr: usize) -> usize {
        SHADOW_BASE + (ptr >> SHADOW_SCALE)
    }

    // A small fixed-size table stands in for the dedicated mmap reservation
    // a real deployment would use to cover the full address space; this
    // crate's contract for shadow-mem is "given but not the primary path"
    // (`LAZY_REUSE` is), so indices simply wrap via masking below.
    const SHADOW_TABLE_BITS: usize = 16; // 64 Ki shadow bytes -> 512 KiB covered
    const SHADOW_TABLE_LEN: usize = 1 << SHADOW_TABLE_BITS;

    static SHADOW_TABLE: [core::sync::atomic::AtomicU8; SHADOW_TABLE_LEN] =
        [const { core::sync::atomic::AtomicU8::new(0) }; SHADOW_TABLE_LEN];

    // Treated as if `ptr >> SHADOW_SCALE` indexes directly into the table;
    // real addresses are masked down to keep indices in range.
    const SHADOW_BASE: usize = 0;

    #[inline]
    pub fn set(ptr: usize, value: u8) {
        let idx = (ptr >> SHADOW_SCALE) & (SHADOW_TABLE_LEN - 1);
        SHADOW_TABLE[idx].store(value, core::sync::atomic::Ordering::Relaxed);
    }

    #[inline]
    pub fn get(ptr: usize) -> u8 {
        let idx = (ptr >> SHADOW_SCALE) & (SHADOW_TABLE_LEN - 1);
        SHADOW_TABLE[idx].load(core::sync::atomic::Ordering::Relaxed)
    }
}

/// Mark `size` bytes starting at `ptr` as a redzone.
///
/// # Safety
///
/// `ptr` must be valid for `size` bytes of writes (in-band mode writes
/// directly into the region).
pub unsafe fn poison(ptr: *mut u8, size: usize) {
    cfg_if::cfg_if! {
        if #[cfg(feature = "lazy-reuse")] {
            let _ = (ptr, size);
        } else if #[cfg(feature = "shadow-mem")] {
            let start = ptr as usize;
            let aligned = start & !((1usize << shadow::SHADOW_SCALE) - 1);
            let mut a = aligned;
            while a < start + size {
                shadow::set(a, shadow::SHADOW_MAGIC);
                a += 1usize << shadow::SHADOW_SCALE;
            }
        } else {
            unsafe { ptr::write_bytes(ptr, RZ_VALUE, size) };
        }
    }
}

/// Default-sized poison of `RZ_SMALL` bytes.
///
/// # Safety
///
/// Same as [`poison`] with `size = RZ_SMALL`.
#[inline]
pub unsafe fn poison_default(ptr: *mut u8) {
    unsafe { poison(ptr, RZ_SMALL) }
}

/// Clear `size` bytes starting at `ptr` back to a non-redzone state.
///
/// # Safety
///
/// Same as [`poison`].
pub unsafe fn unpoison(ptr: *mut u8, size: usize) {
    cfg_if::cfg_if! {
        if #[cfg(feature = "lazy-reuse")] {
            let _ = (ptr, size);
        } else if #[cfg(feature = "shadow-mem")] {
            let start = ptr as usize;
            let aligned = start & !((1usize << shadow::SHADOW_SCALE) - 1);
            let mut a = aligned;
            while a < start + size {
                shadow::set(a, 0);
                a += 1usize << shadow::SHADOW_SCALE;
            }
        } else {
            unsafe { ptr::write_bytes(ptr, 0, size) };
        }
    }
}

/// Default-sized unpoison of `RZ_SMALL` bytes.
///
/// # Safety
///
/// Same as [`unpoison`] with `size = RZ_SMALL`.
#[inline]
pub unsafe fn unpoison_default(ptr: *mut u8) {
    unsafe { unpoison(ptr, RZ_SMALL) }
}

/// Clear every redzone byte range in `span`, required before the span is
/// returned to the page heap for class-agnostic reuse — otherwise stale
/// guard bytes survive into a freshly allocated slot of a different class.
///
/// Under `lazy-reuse`, this is a no-op: the next fault rebuilds the page
/// from scratch.
///
/// # Safety
///
/// `span` must be a valid, currently in-use span not shared with another
/// thread during the call.
pub unsafe fn unpoison_all_in_span(span: *mut Span) {
    #[cfg(feature = "lazy-reuse")]
    {
        let _ = span;
        return;
    }

    #[cfg(not(feature = "lazy-reuse"))]
    unsafe {
        let s = &*span;
        if s.is_stack || s.no_redzone {
            return;
        }
        let base = s.start_addr() as usize;
        let span_bytes = s.byte_size();
        if s.size_class == 0 {
            unpoison(base as *mut u8, super::RZ_LARGE);
            let tail = base + span_bytes - super::RZ_LARGE;
            unpoison(tail as *mut u8, super::RZ_LARGE);
        } else {
            let slot_size = geometry::unit_size(s);
            let mut o = 0;
            while o < span_bytes {
                unpoison((base + o) as *mut u8, RZ_SMALL);
                o += slot_size;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poison_then_unpoison_in_band_round_trips() {
        #[cfg(not(any(feature = "shadow-mem", feature = "lazy-reuse")))]
        {
            let mut buf = [0u8; 32];
            unsafe {
                poison(buf.as_mut_ptr(), RZ_SMALL);
                assert!(buf[..RZ_SMALL].iter().all(|&b| b == RZ_VALUE));
                unpoison(buf.as_mut_ptr(), RZ_SMALL);
                assert!(buf[..RZ_SMALL].iter().all(|&b| b == 0));
            }
        }
    }
}
