//! Page filler (C4): synthesizes one kernel-page-sized buffer of redzone
//! bytes for a not-yet-touched heap page.
//!
//! This is a pure function of `(span, offset of the faulted page within the
//! span)`. It never touches the OS or the fault delegate; [`crate::redzone::uffd`]
//! calls it once per fault and installs the result.

use super::{RZ_LARGE, RZ_SMALL, RZ_VALUE, SYS_PAGE_SIZE};
use crate::size_class;
use crate::span::Span;

/// Fill `buf` (exactly `SYS_PAGE_SIZE` bytes) with the pattern that belongs
/// at `page_offset` bytes into `span`. Bytes outside any redzone are left at
/// zero (the buffer must already be zeroed, or this overwrites it — here we
/// always zero first so callers may pass a reused scratch buffer).
///
/// # Panics
///
/// Panics if `span.is_stack` — stack spans use a different scheme and must
/// never reach this function; or if `buf.len() != SYS_PAGE_SIZE`.
pub fn fill_page(span: &Span, page_offset: usize, buf: &mut [u8]) {
    assert!(!span.is_stack, "heap filler invoked on a stack span");
    assert_eq!(buf.len(), SYS_PAGE_SIZE);
    buf.fill(0);

    if span.no_redzone {
        return;
    }

    if span.size_class == 0 {
        fill_large(span, page_offset, buf);
    } else {
        fill_small(span, page_offset, buf);
    }
}

/// Large span: only the page containing the span's first byte and the page
/// containing its last byte carry guard bytes; interior pages stay zero.
fn fill_large(span: &Span, page_offset: usize, buf: &mut [u8]) {
    let span_bytes = span.byte_size();

    if page_offset == 0 {
        buf[..RZ_LARGE].fill(RZ_VALUE);
    }

    // The last system page of the span may not start on a SYS_PAGE_SIZE
    // boundary relative to page_offset=0 if span_bytes isn't a multiple of
    // SYS_PAGE_SIZE, but the delegate always hands us the faulted page's
    // true base, so this comparison is exact.
    let last_page_base = span_bytes.saturating_sub(SYS_PAGE_SIZE);
    if page_offset == last_page_base {
        let tail_start_in_span = span_bytes - RZ_LARGE;
        let tail_start_in_page = tail_start_in_span - page_offset;
        buf[tail_start_in_page..].fill(RZ_VALUE);
    }
}

/// Small span: zero the buffer, then mark the head `RZ_SMALL` bytes of
/// every slot whose head falls within this page, plus the tail of a head
/// redzone that started on the previous page.
fn fill_small(span: &Span, page_offset: usize, buf: &mut [u8]) {
    let slot_size = size_class::class_to_size(span.size_class);
    let o = page_offset % slot_size;

    // Finish a redzone that started before this page.
    if o < RZ_SMALL {
        let remaining = RZ_SMALL - o;
        let n = remaining.min(SYS_PAGE_SIZE);
        buf[..n].fill(RZ_VALUE);
    }

    // Walk forward to the next slot boundary inside this page, then mark
    // each subsequent slot's head redzone (or its truncated tail if the
    // slot begins near the end of the page).
    let mut next_rz = slot_size - o;
    while next_rz < SYS_PAGE_SIZE {
        let end = (next_rz + RZ_SMALL).min(SYS_PAGE_SIZE);
        buf[next_rz..end].fill(RZ_VALUE);
        next_rz += slot_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::SpanState;

    fn make_span(size_class: usize, num_pages: usize) -> Span {
        Span {
            start_page: 0,
            num_pages,
            size_class,
            state: SpanState::InUse,
            allocated_count: 0,
            total_count: 0,
            is_stack: false,
            type_tag: 0,
            no_redzone: false,
            freelist: core::ptr::null_mut(),
            prev: core::ptr::null_mut(),
            next: core::ptr::null_mut(),
        }
    }

    #[test]
    fn large_first_page_has_head_redzone() {
        let span = make_span(0, 16); // 16 * 8192 = 131072 bytes
        let mut buf = [0u8; SYS_PAGE_SIZE];
        fill_page(&span, 0, &mut buf);
        assert!(buf[..RZ_LARGE].iter().all(|&b| b == RZ_VALUE));
        assert!(buf[RZ_LARGE..].iter().all(|&b| b == 0));
    }

    #[test]
    fn large_last_page_has_tail_redzone() {
        let span = make_span(0, 16);
        let span_bytes = span.byte_size();
        let last_page_base = span_bytes - SYS_PAGE_SIZE;
        let mut buf = [0u8; SYS_PAGE_SIZE];
        fill_page(&span, last_page_base, &mut buf);
        let tail_start_in_page = SYS_PAGE_SIZE - RZ_LARGE;
        assert!(buf[..tail_start_in_page].iter().all(|&b| b == 0));
        assert!(buf[tail_start_in_page..].iter().all(|&b| b == RZ_VALUE));
    }

    #[test]
    fn large_interior_page_is_zero() {
        let span = make_span(0, 16);
        let mut buf = [0u8; SYS_PAGE_SIZE];
        fill_page(&span, SYS_PAGE_SIZE * 4, &mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn small_span_marks_every_slot_head_in_page() {
        // slot size 64 fits SYS_PAGE_SIZE/64 = 64 slots per page exactly.
        let span = make_span(1, 1); // class 1 => size 8... use a span whose
        // class_to_size happens to be 64 in the generated table (class 8).
        let span = Span { size_class: 8, ..span };
        let mut buf = [0u8; SYS_PAGE_SIZE];
        fill_page(&span, 0, &mut buf);
        let slot_size = size_class::class_to_size(span.size_class);
        assert_eq!(slot_size, 64);
        let mut i = 0;
        while i < SYS_PAGE_SIZE {
            assert!(buf[i..i + RZ_SMALL].iter().all(|&b| b == RZ_VALUE), "slot at {i}");
            assert!(buf[i + RZ_SMALL..i + slot_size].iter().all(|&b| b == 0), "slot at {i}");
            i += slot_size;
        }
    }

    #[test]
    fn small_span_carries_partial_redzone_across_page_boundary() {
        // Choose a slot size that doesn't evenly divide SYS_PAGE_SIZE so a
        // redzone straddles the page boundary: class with size 24 (class 3).
        let span = make_span(3, 1);
        let slot_size = size_class::class_to_size(span.size_class);
        assert_eq!(slot_size, 24);
        assert_ne!(SYS_PAGE_SIZE % slot_size, 0);

        let mut first = [0u8; SYS_PAGE_SIZE];
        fill_page(&span, 0, &mut first);
        let mut second = [0u8; SYS_PAGE_SIZE];
        fill_page(&span, SYS_PAGE_SIZE, &mut second);

        // Whatever partial redzone carries into page 2 must start at offset 0.
        let o = SYS_PAGE_SIZE % slot_size;
        if o < RZ_SMALL {
            let remaining = RZ_SMALL - o;
            assert!(second[..remaining].iter().all(|&b| b == RZ_VALUE));
        }
    }
}
