//! Redzone subsystem integration tests, mirroring the specification's
//! end-to-end scenarios (small boundary, large boundary, reuse-cache
//! reuse, cross-thread type tagging). These exercise the public
//! `is_redzone` predicate against real allocations from the global
//! allocator rather than synthetic spans, so they catch integration bugs
//! the unit tests inside `src/redzone/*` can't see.

use rtmalloc::RtMalloc;
use rtmalloc::redzone::predicate::{self, Verdict};
use std::alloc::{GlobalAlloc, Layout};

#[global_allocator]
static GLOBAL: RtMalloc = RtMalloc;

/// S1: a 48-byte allocation lands in the 64-byte size class (48 + RZ_SMALL
/// == 64). The legal object occupies `[p, p+48)`; `p-1` and `p+48` are both
/// redzone bytes.
#[test]
fn small_allocation_boundary_matches_spec_scenario_s1() {
    let layout = Layout::from_size_align(48, 8).unwrap();
    let p = unsafe { GLOBAL.alloc(layout) };
    assert!(!p.is_null());

    unsafe {
        assert_eq!(predicate::is_redzone(p), Verdict::IsObject);
        assert_eq!(predicate::is_redzone(p.add(47)), Verdict::IsObject);
        assert_eq!(predicate::is_redzone(p.sub(1)), Verdict::IsRedzone);
        assert_eq!(predicate::is_redzone(p.add(48)), Verdict::IsRedzone);

        GLOBAL.dealloc(p, layout);
    }
}

/// S2: a 16 MiB large allocation has `RZ_LARGE`-sized guard strips at its
/// head and tail only; the first and last payload bytes are not redzones.
#[test]
fn large_allocation_boundary_matches_spec_scenario_s2() {
    let size = 16 * 1024 * 1024;
    let layout = Layout::from_size_align(size, 8).unwrap();
    let p = unsafe { GLOBAL.alloc(layout) };
    assert!(!p.is_null());

    unsafe {
        assert_eq!(predicate::is_redzone(p), Verdict::IsObject);
        assert_eq!(predicate::is_redzone(p.add(size - 1)), Verdict::IsObject);
        assert_eq!(predicate::is_redzone(p.sub(1)), Verdict::IsRedzone);
        assert_eq!(predicate::is_redzone(p.add(size)), Verdict::IsRedzone);

        GLOBAL.dealloc(p, layout);
    }
}

/// S3: freeing and immediately reallocating a large span of the same page
/// count returns the same pointer (serviced by the reuse cache, C6) rather
/// than handing back a freshly mapped range.
#[test]
fn large_span_reuse_returns_same_pointer() {
    let size = 256 * 8192; // 256 pages worth of payload, well above RZ_LARGE*2
    let layout = Layout::from_size_align(size, 8).unwrap();

    let p1 = unsafe { GLOBAL.alloc(layout) };
    assert!(!p1.is_null());
    unsafe { GLOBAL.dealloc(p1, layout) };

    let p2 = unsafe { GLOBAL.alloc(layout) };
    assert!(!p2.is_null());
    assert_eq!(p1, p2, "reuse cache should hand back the same large span");

    unsafe {
        assert_eq!(predicate::is_redzone(p2), Verdict::IsObject);
        GLOBAL.dealloc(p2, layout);
    }
}

/// S4-like: two threads allocating small objects concurrently never see a
/// false redzone hit on their own live object, and addresses never claimed
/// by this allocator stay `Unknown`.
#[test]
fn concurrent_small_allocations_never_self_trigger() {
    let handles: Vec<_> = (0..4)
        .map(|tid| {
            std::thread::spawn(move || {
                for i in 0..500 {
                    let size = [16usize, 32, 48, 96][(tid + i) % 4];
                    let layout = Layout::from_size_align(size, 8).unwrap();
                    let p = unsafe { GLOBAL.alloc(layout) };
                    assert!(!p.is_null());
                    unsafe {
                        assert_eq!(predicate::is_redzone(p), Verdict::IsObject);
                        p.write_bytes(0x42, size);
                        GLOBAL.dealloc(p, layout);
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}

/// An address never handed out by this allocator is `Unknown`, not a
/// false-positive redzone hit.
#[test]
fn unclaimed_address_is_unknown() {
    assert_eq!(predicate::is_redzone(0x1 as *const u8), Verdict::Unknown);
}

/// `is_redzone_multi` is reserved and must abort rather than guess (S6).
#[test]
#[should_panic(expected = "multibyte checks not yet supported")]
fn multibyte_check_aborts_per_spec_scenario_s6() {
    let layout = Layout::from_size_align(48, 8).unwrap();
    let p = unsafe { GLOBAL.alloc(layout) };
    assert!(!p.is_null());
    let _ = predicate::is_redzone_multi(p, 2);
}
