//! The protection primitive.
//!
//! Wraps `mprotect(2)` so that callers can talk about a byte range instead
//! of the page-aligned superset the kernel actually requires. `mprotect` is
//! treated as async-signal-safe here: this is technically outside strict
//! POSIX, but holds on every mainstream Unix kernel the rest of this crate
//! targets, and the fault handler (§4.D of the design) relies on it.

use crate::page;
use bitflags::bitflags;

bitflags! {
    /// Access permitted on a page.
    ///
    /// Mirrors the `PROT_*` flags passed to `mprotect(2)`; kept as a
    /// bitflags type (rather than raw `c_int`) so the reconciliation logic
    /// in [`crate::pool`] can compare and combine modes with ordinary
    /// bitwise operators.
    pub struct Mode: i32 {
        /// No access at all (`PROT_NONE`).
        const NONE = libc::PROT_NONE;
        /// Read-only access (`PROT_READ`).
        const READ = libc::PROT_READ;
        /// Read and write access (`PROT_READ | PROT_WRITE`).
        const READ_WRITE = libc::PROT_READ | libc::PROT_WRITE;
    }
}

impl Mode {
    /// Returns the stricter (more restrictive) of two modes.
    ///
    /// `NONE` is stricter than `READ`, which is stricter than `READ_WRITE`.
    /// Used by the reconciliation pass to combine the requirements of
    /// several overlapping pending-copy records on the same page.
    pub fn strictest(self, other: Self) -> Self {
        fn rank(m: Mode) -> u8 {
            if m == Mode::NONE {
                0
            } else if m == Mode::READ {
                1
            } else {
                2
            }
        }
        if rank(self) <= rank(other) {
            self
        } else {
            other
        }
    }
}

/// Applies `mode` to the page-aligned superset of `[ptr, ptr + len)`.
///
/// This is called from both ordinary control flow and the `SIGSEGV`
/// handler (see [`crate::fault`]), so it never logs: a logger backend's
/// own I/O is not async-signal-safe, and this function has no way to know
/// which caller it's servicing.
///
/// # Safety
/// `ptr` must point into memory that the process actually owns (e.g. was
/// obtained from `mmap`), for `len` bytes. Calling this on arbitrary
/// addresses can silently change protections for unrelated mappings that
/// happen to share the rounded-up page.
pub unsafe fn protect(ptr: *mut u8, len: usize, mode: Mode) -> Result<(), crate::error::LazyCopyError> {
    debug_assert!(len > 0);
    let addr = ptr as usize;
    let base = page::page_base(addr);
    let end = page::page_ceil(addr + len);
    let span = end - base;
    let rc = libc::mprotect(base as *mut libc::c_void, span, mode.bits());
    if rc != 0 {
        let errno = std::io::Error::last_os_error();
        return Err(crate::error::LazyCopyError::ProtectionCallFailure(errno));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strictest_orders_none_below_read_below_rw() {
        assert_eq!(Mode::NONE.strictest(Mode::READ), Mode::NONE);
        assert_eq!(Mode::READ.strictest(Mode::READ_WRITE), Mode::READ);
        assert_eq!(Mode::READ_WRITE.strictest(Mode::READ_WRITE), Mode::READ_WRITE);
        assert_eq!(Mode::NONE.strictest(Mode::NONE), Mode::NONE);
    }

    #[test]
    fn protect_round_trips_on_a_real_mapping() {
        crate::page::init();
        let len = crate::page::size();
        unsafe {
            let p = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(p, libc::MAP_FAILED);
            let ptr = p as *mut u8;
            assert!(protect(ptr, len, Mode::READ).is_ok());
            assert!(protect(ptr, len, Mode::READ_WRITE).is_ok());
            libc::munmap(p, len);
        }
    }
}
