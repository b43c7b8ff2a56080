//! Emergency-malloc latch (C9): a per-thread boolean that diverts
//! allocation through a small bootstrap arena.
//!
//! Only two call sites need to set it: the fault delegate's own
//! initialization path (starting its poller thread may itself allocate a
//! stack, which must not in turn fault on the not-yet-registered heap
//! range), and the poller thread itself for the lifetime of its first
//! allocation. It is not a recursion counter — setting it twice is fine,
//! clearing it once is enough.
//!
//! Mirrors the thread-cache's own tiered TLS strategy: `#[thread_local]`
//! under `nightly`/`percpu`, `std::thread_local!` under `std`, and a single
//! process-wide flag when neither is available (no per-thread story exists
//! without TLS, so the fallback just serializes emergency allocation with
//! everything else via the one flag).

use core::sync::atomic::{AtomicBool, Ordering};

cfg_if::cfg_if! {
    if #[cfg(any(feature = "nightly", feature = "percpu"))] {
        #[thread_local]
        static LATCH: core::cell::Cell<bool> = core::cell::Cell::new(false);

        /// Set the calling thread's emergency-malloc latch.
        #[inline]
        pub fn set(value: bool) {
            LATCH.set(value);
        }

        /// Is the calling thread currently in emergency-malloc mode?
        #[inline]
        pub fn is_set() -> bool {
            LATCH.get()
        }
    } else if #[cfg(feature = "std")] {
        std::thread_local! {
            static LATCH: core::cell::Cell<bool> = const { core::cell::Cell::new(false) };
        }

        /// Set the calling thread's emergency-malloc latch.
        #[inline]
        pub fn set(value: bool) {
            let _ = LATCH.try_with(|l| l.set(value));
        }

        /// Is the calling thread currently in emergency-malloc mode?
        #[inline]
        pub fn is_set() -> bool {
            LATCH.try_with(|l| l.get()).unwrap_or(false)
        }
    } else {
        // No TLS story available (central-cache-only build): fall back to
        // one process-wide flag. Coarser than per-thread, but this build
        // configuration also has no concurrent thread-local fast path to
        // protect, so the only real use is during single-threaded startup.
        static LATCH: AtomicBool = AtomicBool::new(false);

        /// Set the process's emergency-malloc latch (no per-thread TLS in
        /// this build configuration).
        #[inline]
        pub fn set(value: bool) {
            LATCH.store(value, Ordering::Relaxed);
        }

        /// Is emergency-malloc mode currently active?
        #[inline]
        pub fn is_set() -> bool {
            LATCH.load(Ordering::Relaxed)
        }
    }
}

/// RAII helper: sets the latch on construction, restores the previous value
/// on drop. Used by the fault delegate around its own startup allocations.
pub struct EmergencyGuard {
    previous: bool,
}

impl EmergencyGuard {
    #[inline]
    pub fn acquire() -> Self {
        let previous = is_set();
        set(true);
        Self { previous }
    }
}

impl Drop for EmergencyGuard {
    #[inline]
    fn drop(&mut self) {
        set(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_defaults_clear_and_toggles() {
        assert!(!is_set());
        set(true);
        assert!(is_set());
        set(false);
        assert!(!is_set());
    }

    #[test]
    fn double_set_is_not_a_recursion_counter() {
        set(true);
        set(true);
        set(false);
        assert!(!is_set());
    }

    #[test]
    fn guard_restores_previous_value() {
        set(false);
        {
            let _g = EmergencyGuard::acquire();
            assert!(is_set());
        }
        assert!(!is_set());

        set(true);
        {
            let _g = EmergencyGuard::acquire();
            assert!(is_set());
        }
        assert!(is_set());
        set(false);
    }
}
