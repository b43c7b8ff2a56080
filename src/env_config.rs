//! Environment-variable configuration, read once per process.
//!
//! Mirrors gperftools' `EnvToInt`/`EnvToBool` helpers in `system-alloc.cc`:
//! a numeric or boolean flag whose default is baked in at compile time and
//! whose value is fixed at first read. Only available with `feature = "std"`
//! since reading the environment needs an allocating, OS-backed API; builds
//! without `std` simply use the defaults everywhere these are consulted.

use std::env;
use std::sync::OnceLock;

/// Physical-memory range for `/dev/mem`-backed allocation (in MiB), and
/// whether the `sbrk`/`mmap` backends are allowed to run at all. This crate
/// has no `/dev/mem` or `sbrk` backend of its own — `page_alloc` is always
/// `mmap`/`VirtualAlloc` — so `devmem_*` and `skip_sbrk` are accepted for
/// interface compatibility but have no observable effect. `skip_mmap` does,
/// since mmap is the only backend this crate has: setting it makes every
/// OS-level page request fail as if the system were out of memory.
pub struct Config {
    pub devmem_start_mb: usize,
    pub devmem_limit_mb: usize,
    pub skip_sbrk: bool,
    pub skip_mmap: bool,
    pub disable_memory_release: bool,
}

fn env_to_usize(name: &str, default: usize) -> usize {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_to_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "t" | "yes" | "y"),
        Err(_) => default,
    }
}

fn load() -> Config {
    Config {
        devmem_start_mb: env_to_usize("TCMALLOC_DEVMEM_START", 0),
        devmem_limit_mb: env_to_usize("TCMALLOC_DEVMEM_LIMIT", 0),
        skip_sbrk: env_to_bool("TCMALLOC_SKIP_SBRK", false),
        skip_mmap: env_to_bool("TCMALLOC_SKIP_MMAP", false),
        // gperftools defaults this to true: by default the allocator holds
        // onto decommitted pages rather than handing them back to the OS.
        disable_memory_release: env_to_bool("TCMALLOC_DISABLE_MEMORY_RELEASE", true),
    }
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// The process-wide configuration, read from the environment on first call
/// and fixed thereafter.
pub fn get() -> &'static Config {
    CONFIG.get_or_init(load)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        // SAFETY: test-only, single-threaded access to process env vars the
        // rest of this test suite does not touch.
        unsafe {
            env::remove_var("TCMALLOC_SKIP_MMAP");
            env::remove_var("TCMALLOC_DISABLE_MEMORY_RELEASE");
        }
        assert!(!env_to_bool("TCMALLOC_SKIP_MMAP", false));
        assert!(env_to_bool("TCMALLOC_DISABLE_MEMORY_RELEASE", true));
    }

    #[test]
    fn bool_parses_common_truthy_spellings() {
        for v in ["1", "true", "t", "yes", "y"] {
            unsafe { env::set_var("RTMALLOC_TEST_BOOL", v) };
            assert!(env_to_bool("RTMALLOC_TEST_BOOL", false), "{v} should parse truthy");
        }
        unsafe { env::set_var("RTMALLOC_TEST_BOOL", "0") };
        assert!(!env_to_bool("RTMALLOC_TEST_BOOL", true));
        unsafe { env::remove_var("RTMALLOC_TEST_BOOL") };
    }

    #[test]
    fn usize_falls_back_on_garbage() {
        unsafe { env::set_var("RTMALLOC_TEST_INT", "not-a-number") };
        assert_eq!(env_to_usize("RTMALLOC_TEST_INT", 7), 7);
        unsafe { env::set_var("RTMALLOC_TEST_INT", "42") };
        assert_eq!(env_to_usize("RTMALLOC_TEST_INT", 7), 42);
        unsafe { env::remove_var("RTMALLOC_TEST_INT") };
    }
}
