//! Fault delegate (C5): kernel-assisted lazy page fill via `userfaultfd`.
//!
//! Linux only, and only built under `lazy-reuse`. A single `userfaultfd`
//! descriptor is registered over the page heap's entire address range; a
//! background thread polls it, and for each fault looks the owning span up
//! in the page map, asks the page filler (C4) to synthesize one kernel
//! page's worth of guard bytes, and installs it with `UFFDIO_COPY`.
//!
//! Stack redzones are out of this module's scope — if the faulting page
//! belongs to a span this module doesn't own (or none at all), it defers to
//! a registrable hook rather than a linker-level weak symbol, since stable
//! Rust has no portable equivalent of the latter.

use super::RZ_LARGE;
use crate::allocator::{PAGE_HEAP, PAGE_MAP};
use crate::emergency::EmergencyGuard;
use core::ffi::{c_int, c_long, c_void};
use core::sync::atomic::{AtomicI32, AtomicPtr, Ordering};

const UFFD_API: u64 = 0xAA;
const UFFDIO_REGISTER_MODE_MISSING: u64 = 1;
const UFFDIO_COPY_MODE_NONE: u64 = 0;

// ioctl request numbers, per <linux/userfaultfd.h> on x86_64. Hardcoded
// rather than computed from the _IOC macros — this crate has no bindgen
// step and these values are stable kernel ABI.
const UFFDIO_API: u64 = 0xc018_aa3f;
const UFFDIO_REGISTER: u64 = 0xc020_aa00;
const UFFDIO_UNREGISTER: u64 = 0x8010_aa01;
const UFFDIO_COPY: u64 = 0xc028_aa03;
const UFFDIO_ZEROPAGE: u64 = 0xc020_aa04;

// Bit positions within `UffdioApi::ioctls`/`UffdioRegister::ioctls`,
// per the kernel's `enum { _UFFDIO_REGISTER, _UFFDIO_UNREGISTER, _UFFDIO_WAKE,
// _UFFDIO_COPY, _UFFDIO_ZEROPAGE, ... }` in <linux/userfaultfd.h>: bit N is
// set iff ioctl N is supported.
const UFFD_FEATURE_BIT_REGISTER: u64 = 1 << 0;
const UFFD_FEATURE_BIT_COPY: u64 = 1 << 3;

const UFFD_EVENT_PAGEFAULT: u8 = 0x12;
const POLLIN: i16 = 0x0001;

#[repr(C)]
struct UffdioApi {
    api: u64,
    features: u64,
    ioctls: u64,
}

#[repr(C)]
struct UffdioRange {
    start: u64,
    len: u64,
}

#[repr(C)]
struct UffdioRegister {
    range: UffdioRange,
    mode: u64,
    ioctls: u64,
}

#[repr(C)]
struct UffdioCopy {
    dst: u64,
    src: u64,
    len: u64,
    mode: u64,
    copy: i64,
}

/// Mirrors the kernel's `struct uffd_msg` for the single variant we read
/// (`pagefault`); the other union members are never used here.
#[repr(C)]
struct UffdMsg {
    event: u8,
    reserved1: u8,
    reserved2: u16,
    reserved3: u32,
    flags: u64,
    address: u64,
    ptid: u32,
    _pad: u32,
}

#[repr(C)]
struct PollFd {
    fd: c_int,
    events: i16,
    revents: i16,
}

unsafe extern "C" {
    fn syscall(number: c_long, ...) -> c_long;
    fn ioctl(fd: c_int, request: u64, ...) -> c_int;
    fn close(fd: c_int) -> c_int;
    fn poll(fds: *mut PollFd, nfds: u64, timeout: c_int) -> c_int;
    fn read(fd: c_int, buf: *mut c_void, count: usize) -> isize;
    fn pthread_atfork(
        prepare: Option<extern "C" fn()>,
        parent: Option<extern "C" fn()>,
        child: Option<extern "C" fn()>,
    ) -> c_int;
    #[cfg(target_os = "linux")]
    fn __errno_location() -> *mut c_int;
}

const EINTR: c_int = 4;
const EAGAIN: c_int = 11;

#[inline]
fn errno() -> c_int {
    unsafe { *__errno_location() }
}

#[cfg(target_arch = "x86_64")]
const SYS_USERFAULTFD: c_long = 323;
#[cfg(target_arch = "aarch64")]
const SYS_USERFAULTFD: c_long = 282;

/// -1 when not initialized or after a fork reset the descriptor.
static UFFD_FD: AtomicI32 = AtomicI32::new(-1);
static INIT_DONE: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

/// Optional callback for addresses this module doesn't recognize (stack
/// redzones, or any other not-yet-owned mapping). Registered in place of a
/// weak symbol; `None` means "fall back to `UFFDIO_ZEROPAGE`".
static STACK_HOOK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Register a callback invoked when a fault lands outside any span this
/// allocator owns. The callback receives the faulting address and must
/// return `true` if it installed a page itself (e.g. via its own
/// `UFFDIO_COPY`), `false` to fall back to zero-filling.
pub fn register_stack_hook(f: extern "C" fn(u64) -> bool) {
    STACK_HOOK.store(f as *mut (), Ordering::Release);
}

extern "C" fn reset_fd_after_fork() {
    UFFD_FD.store(-1, Ordering::SeqCst);
    INIT_DONE.store(false, Ordering::SeqCst);
}

/// Open the `userfaultfd`, perform the `UFFDIO_API` handshake, and spawn the
/// poller thread. Idempotent: a second call is a no-op once the first
/// succeeds.
///
/// Every failure here is fatal (an unsupported kernel feature is fatal at
/// init) rather than returned to the caller — a redzone detector that
/// silently runs without its lazy filler would let OOB accesses through
/// uncaught, which is worse than refusing to start.
///
/// The emergency latch is held across the poller thread's spawn, since
/// `std::thread::spawn` itself allocates (a stack and thread bookkeeping)
/// and must not fault against a heap range this module hasn't registered
/// yet.
pub fn initialize() -> Result<(), i32> {
    if INIT_DONE.load(Ordering::Acquire) {
        return Ok(());
    }

    let _guard = EmergencyGuard::acquire();

    const O_CLOEXEC: i32 = 0x80000;
    const O_NONBLOCK: i32 = 0x800;
    let fd = unsafe { syscall(SYS_USERFAULTFD, O_CLOEXEC | O_NONBLOCK) } as i32;
    if fd < 0 {
        super::fatal(format_args!("userfaultfd() failed: errno {}", errno()));
    }

    let mut api = UffdioApi { api: UFFD_API, features: 0, ioctls: 0 };
    let ret = unsafe { ioctl(fd, UFFDIO_API, &mut api as *mut UffdioApi) };
    if ret < 0 {
        unsafe { close(fd) };
        super::fatal(format_args!("UFFDIO_API handshake failed: errno {}", errno()));
    }
    if api.ioctls & UFFD_FEATURE_BIT_REGISTER == 0 {
        unsafe { close(fd) };
        super::fatal(format_args!("UFFDIO_REGISTER not supported by this kernel"));
    }

    UFFD_FD.store(fd, Ordering::SeqCst);

    unsafe {
        pthread_atfork(None, None, Some(reset_fd_after_fork));
    }

    if std::thread::Builder::new()
        .name("rtmalloc-uffd".into())
        .spawn(poller_loop)
        .is_err()
    {
        super::fatal(format_args!("failed to spawn the uffd poller thread"));
    }

    INIT_DONE.store(true, Ordering::Release);
    Ok(())
}

/// Register `[start, start+len)` for missing-page faults. `len` must be a
/// multiple of [`super::SYS_PAGE_SIZE`].
///
/// # Safety
///
/// `start` must be the base of a mapping obtained from the platform's
/// `page_alloc`, reserved (not yet populated) for the full length.
pub unsafe fn register_range(start: *mut u8, len: usize) -> Result<(), i32> {
    let sys_page = super::SYS_PAGE_SIZE;
    if (start as usize) % sys_page != 0 || len == 0 || len % sys_page != 0 {
        super::fatal(format_args!(
            "register_uffd_pages: range {:p}+{len:#x} is not {sys_page:#x}-aligned",
            start
        ));
    }

    if !INIT_DONE.load(Ordering::Acquire) {
        initialize()?;
    }
    let fd = UFFD_FD.load(Ordering::Acquire);
    if fd < 0 {
        return Err(-1);
    }
    let mut reg = UffdioRegister {
        range: UffdioRange { start: start as u64, len: len as u64 },
        mode: UFFDIO_REGISTER_MODE_MISSING,
        ioctls: 0,
    };
    let ret = unsafe { ioctl(fd, UFFDIO_REGISTER, &mut reg as *mut UffdioRegister) };
    if ret < 0 {
        return Err(ret);
    }
    if reg.ioctls & UFFD_FEATURE_BIT_COPY == 0 {
        super::fatal(format_args!(
            "UFFDIO_COPY not supported on range {:p}+{len:#x}",
            start
        ));
    }
    Ok(())
}

/// Unregister a previously-registered range (its pages are now either fully
/// resident or about to be unmapped).
///
/// # Safety
///
/// `start`/`len` must match a prior successful [`register_range`] call, or
/// a sub-range of it.
pub unsafe fn unregister_range(start: *mut u8, len: usize) -> Result<(), i32> {
    let fd = UFFD_FD.load(Ordering::Acquire);
    if fd < 0 {
        return Err(-1);
    }
    let range = UffdioRange { start: start as u64, len: len as u64 };
    let ret = unsafe { ioctl(fd, UFFDIO_UNREGISTER, &range as *const UffdioRange) };
    if ret < 0 {
        Err(ret)
    } else {
        Ok(())
    }
}

fn poller_loop() {
    loop {
        let fd = UFFD_FD.load(Ordering::Acquire);
        if fd < 0 {
            return;
        }

        let mut pfd = PollFd { fd, events: POLLIN, revents: 0 };
        let n = unsafe { poll(&mut pfd as *mut PollFd, 1, -1) };
        if n < 0 {
            if errno() == EINTR {
                continue;
            }
            super::fatal(format_args!("poll(uffd) failed: errno {}", errno()));
        }

        let mut msg = UffdMsg {
            event: 0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
            flags: 0,
            address: 0,
            ptid: 0,
            _pad: 0,
        };
        let r = unsafe {
            read(
                fd,
                &mut msg as *mut UffdMsg as *mut c_void,
                core::mem::size_of::<UffdMsg>(),
            )
        };
        if r < 0 {
            if errno() == EAGAIN {
                continue;
            }
            super::fatal(format_args!("read(uffd) failed: errno {}", errno()));
        }
        if r != core::mem::size_of::<UffdMsg>() as isize {
            super::fatal(format_args!("read(uffd) returned a short message ({r} bytes)"));
        }
        if msg.event != UFFD_EVENT_PAGEFAULT {
            super::fatal(format_args!(
                "unexpected uffd message type {:#x}, expected UFFD_EVENT_PAGEFAULT",
                msg.event
            ));
        }

        handle_fault(fd, msg.address);
    }
}

fn handle_fault(fd: c_int, address: u64) {
    let page_base = address & !(super::SYS_PAGE_SIZE as u64 - 1);
    let page_id = (page_base as usize) >> crate::PAGE_SHIFT;
    let span = PAGE_MAP.get(page_id);

    if span.is_null() {
        fallback_fill(fd, page_base);
        return;
    }

    // SAFETY: a non-null pagemap entry is a live span for as long as any of
    // its pages remain registered with this fd.
    let owns_stack = unsafe { (*span).is_stack };
    if owns_stack {
        fallback_fill(fd, page_base);
        return;
    }

    let span_start = unsafe { (*span).start_addr() } as u64;
    let page_offset = (page_base - span_start) as usize;

    let mut buf = [0u8; 4096];
    debug_assert_eq!(buf.len(), super::SYS_PAGE_SIZE);
    let span_ref = unsafe { &*span };
    super::filler::fill_page(span_ref, page_offset, &mut buf);

    let copy = UffdioCopy {
        dst: page_base,
        src: buf.as_ptr() as u64,
        len: super::SYS_PAGE_SIZE as u64,
        mode: UFFDIO_COPY_MODE_NONE,
        copy: 0,
    };
    let ret = unsafe { ioctl(fd, UFFDIO_COPY, &copy as *const UffdioCopy) };
    check_install_result(ret, "UFFDIO_COPY");
}

/// Address not owned by any known span (most often a stack page registered
/// by another subsystem): defer to the registered hook, or zero-fill.
fn fallback_fill(fd: c_int, page_base: u64) {
    let hook = STACK_HOOK.load(Ordering::Acquire);
    if !hook.is_null() {
        let f: extern "C" fn(u64) -> bool = unsafe { core::mem::transmute(hook) };
        if f(page_base) {
            return;
        }
    }

    let zero = UffdioRange { start: page_base, len: super::SYS_PAGE_SIZE as u64 };
    let ret = unsafe { ioctl(fd, UFFDIO_ZEROPAGE, &zero as *const UffdioRange) };
    check_install_result(ret, "UFFDIO_ZEROPAGE");
}

/// `ENOENT` here means the range was unregistered (e.g. by a concurrent
/// `unregister_range`, or a fork reset) between the fault firing and this
/// install — the faulting thread either already resumed via another path or
/// is itself being torn down; either way it's not this poller's bug. Every
/// other failure is fatal.
fn check_install_result(ret: c_int, op: &str) {
    const ENOENT: c_int = 2;
    if ret < 0 && errno() != ENOENT {
        super::fatal(format_args!("{op} failed: errno {}", errno()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_hook_slot_defaults_empty() {
        assert!(STACK_HOOK.load(Ordering::Acquire).is_null());
    }

    #[test]
    fn register_stack_hook_round_trips() {
        extern "C" fn noop(_addr: u64) -> bool {
            false
        }
        register_stack_hook(noop);
        let ptr = STACK_HOOK.load(Ordering::Acquire);
        assert!(!ptr.is_null());
        STACK_HOOK.store(core::ptr::null_mut(), Ordering::Release);
    }

    #[test]
    fn uffdio_api_struct_layout_matches_kernel_header() {
        assert_eq!(core::mem::size_of::<UffdioApi>(), 24);
        assert_eq!(core::mem::size_of::<UffdioRange>(), 16);
        assert_eq!(core::mem::size_of::<UffdioRegister>(), 32);
        assert_eq!(core::mem::size_of::<UffdioCopy>(), 32);
    }

    #[test]
    fn rz_large_fits_one_fill_buffer() {
        assert!(RZ_LARGE <= super::super::SYS_PAGE_SIZE);
    }
}
