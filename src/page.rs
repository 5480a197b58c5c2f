//! Page arithmetic.
//!
//! This module provides the address-rounding and range-classification
//! primitives that every other component builds on. The page size itself
//! is not a compile-time constant: it is queried once from the kernel (see
//! [`init`]) and cached here, since POSIX does not guarantee a fixed page
//! size across platforms.
//!
//! ## Example:
//! ```
//! use lazycopy::page::{page_base, in_byte_range, in_page_range};
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

/// The cached page size, in bytes. Zero means "not yet initialized".
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Queries `sysconf(_SC_PAGESIZE)` and caches the result.
///
/// Safe to call more than once; later calls are no-ops if the page size is
/// already cached, since the OS page size cannot change within a process's
/// lifetime.
pub(crate) fn init() {
    if PAGE_SIZE.load(Ordering::Relaxed) != 0 {
        return;
    }
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    assert!(sz > 0, "sysconf(_SC_PAGESIZE) failed");
    PAGE_SIZE.store(sz as usize, Ordering::Relaxed);
}

/// Returns the cached page size.
///
/// # Panics
/// Panics if [`init`] has not yet run. The page-fault handler never calls
/// this before `init` has completed, so this is not reachable from the
/// signal path.
#[inline]
pub fn size() -> usize {
    let sz = PAGE_SIZE.load(Ordering::Relaxed);
    debug_assert_ne!(sz, 0, "page size queried before lazycopy::init()");
    sz
}

/// Rounds `addr` down to the start of the page that contains it.
#[inline]
pub fn page_base(addr: usize) -> usize {
    let p = size();
    addr & !(p - 1)
}

/// Rounds `addr` up to the start of the next page, unless it is already
/// page-aligned.
#[inline]
pub fn page_ceil(addr: usize) -> usize {
    let p = size();
    (addr + p - 1) & !(p - 1)
}

/// `true` if `a` lies within the byte range `[start, start + size)`.
#[inline]
pub fn in_byte_range(start: usize, size: usize, a: usize) -> bool {
    a >= start && a < start + size
}

/// `true` if `a` lies in any page touched by the byte range
/// `[start, start + size)`, i.e. `page_base(a)` falls between the page
/// containing `start` and the page containing the range's last byte.
#[inline]
pub fn in_page_range(start: usize, size: usize, a: usize) -> bool {
    debug_assert!(size > 0);
    let first = page_base(start);
    let last = page_base(start + size - 1);
    let pa = page_base(a);
    pa >= first && pa <= last
}

/// The number of pages touched by the byte range `[start, start + size)`.
#[inline]
pub fn page_span(start: usize, size: usize) -> usize {
    debug_assert!(size > 0);
    (page_base(start + size - 1) - page_base(start)) / self::size() + 1
}
