//! Redzone geometry (C3): pure arithmetic over `(span, offset)`.
//!
//! Every function here is a total function of its inputs — no locks, no I/O,
//! no span mutation. This is what both the page filler (C4) and the redzone
//! predicate (C8) consult to agree on where the guard bytes live.

use super::{RZ_LARGE, RZ_SMALL};
use crate::size_class;
use crate::span::Span;

/// Outcome of a geometry query against a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    /// `o` falls in a redzone byte range.
    Redzone,
    /// `o` falls in a byte range a legal object may occupy.
    Object,
}

/// Byte offset, within a span's own slot size, of the first byte usable
/// by a legal object. The instrumentation hands out pointers here for
/// every small allocation.
pub const SMALL_OBJECT_OFFSET: usize = RZ_SMALL;

/// Decide whether byte offset `o` (measured from the span's first byte)
/// lies in a redzone, for a large span (`span.size_class == 0`).
///
/// The redzone is the leading `RZ_LARGE` bytes and the trailing `RZ_LARGE`
/// bytes of the span, the latter measured from the span's exact byte end,
/// not rounded down to a kernel page boundary.
#[inline]
pub fn large_membership(span_bytes: usize, o: usize) -> Membership {
    debug_assert!(o < span_bytes, "offset must be inside the span");
    if o < RZ_LARGE || o >= span_bytes.saturating_sub(RZ_LARGE) {
        Membership::Redzone
    } else {
        Membership::Object
    }
}

/// Decide whether byte offset `o` lies in a redzone, for a small (slot-cut)
/// span with slot size `slot_size`. Every slot carries its redzone at its
/// *head*; the instrumentation hands out object pointers at
/// `slot_base + RZ_SMALL`.
#[inline]
pub fn small_membership(slot_size: usize, o: usize) -> Membership {
    debug_assert!(slot_size > 0);
    if o % slot_size < RZ_SMALL {
        Membership::Redzone
    } else {
        Membership::Object
    }
}

/// Full membership query given a span and an absolute byte offset within it.
///
/// Callers must have already verified the span is not a stack span, and
/// that `o` is within `[0, span.byte_size())` — this function does not
/// consult the page map.
#[inline]
pub fn membership(span: &Span, o: usize) -> Membership {
    if span.size_class == 0 {
        large_membership(span.byte_size(), o)
    } else {
        let slot_size = size_class::class_to_size(span.size_class);
        small_membership(slot_size, o)
    }
}

/// The slot size backing a small span, or the whole span's byte size for a
/// large one. Convenience used by the poisoning facade and property tests.
#[inline]
pub fn unit_size(span: &Span) -> usize {
    if span.size_class == 0 {
        span.byte_size()
    } else {
        size_class::class_to_size(span.size_class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_head_and_tail() {
        let span_bytes = 16 * crate::PAGE_SIZE;
        assert_eq!(large_membership(span_bytes, 0), Membership::Redzone);
        assert_eq!(
            large_membership(span_bytes, RZ_LARGE - 1),
            Membership::Redzone
        );
        assert_eq!(large_membership(span_bytes, RZ_LARGE), Membership::Object);
        assert_eq!(
            large_membership(span_bytes, span_bytes - RZ_LARGE - 1),
            Membership::Object
        );
        assert_eq!(
            large_membership(span_bytes, span_bytes - RZ_LARGE),
            Membership::Redzone
        );
        assert_eq!(
            large_membership(span_bytes, span_bytes - 1),
            Membership::Redzone
        );
    }

    #[test]
    fn large_span_not_page_multiple_of_sys_page() {
        // SYS_PAGE_SIZE may not evenly divide PAGE_SIZE-based spans; the
        // trailing redzone is still measured from the exact byte end.
        let span_bytes = 3 * crate::PAGE_SIZE + 123;
        assert_eq!(
            large_membership(span_bytes, span_bytes - RZ_LARGE),
            Membership::Redzone
        );
        assert_eq!(
            large_membership(span_bytes, span_bytes - RZ_LARGE - 1),
            Membership::Object
        );
    }

    #[test]
    fn small_head_redzone_per_slot() {
        let slot = 64;
        assert_eq!(small_membership(slot, 0), Membership::Redzone);
        assert_eq!(small_membership(slot, RZ_SMALL - 1), Membership::Redzone);
        assert_eq!(small_membership(slot, RZ_SMALL), Membership::Object);
        assert_eq!(small_membership(slot, slot - 1), Membership::Object);
        assert_eq!(small_membership(slot, slot), Membership::Redzone); // next slot's head
        assert_eq!(small_membership(slot, 2 * slot - 1), Membership::Redzone);
    }

    #[test]
    fn object_pointer_is_never_a_redzone() {
        for &slot in &[16usize, 24, 32, 64, 128, 256, 1024] {
            assert_eq!(small_membership(slot, SMALL_OBJECT_OFFSET), Membership::Object);
        }
    }
}
