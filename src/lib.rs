//! Lazy, copy-on-access `memcpy`.
//!
//! [`lazy_copy`] returns immediately without touching a single byte of its
//! destination. Instead it write-protects the destination range and
//! read-protects the source range, and records the transfer in a pending-copy
//! pool. Whichever byte of either range the program next touches takes a
//! page fault; the installed `SIGSEGV` handler (see [`fault`]) materializes
//! just that page of the transfer — copying it for real — and lets the
//! faulting instruction resume.
//!
//! ## Example
//! ```no_run
//! lazycopy::init();
//! let mut dst = vec![0u8; 4096];
//! let src = vec![1u8; 4096];
//! lazycopy::lazy_copy(dst.as_mut_ptr(), src.as_ptr(), dst.len());
//! // Touching `dst[0]` here takes a fault and materializes the copy.
//! assert_eq!(dst[0], 1);
//! lazycopy::reset();
//! ```
//!
//! ## Ambient concerns
//! Outside the fault handler this crate logs through the [`log`] facade at
//! `trace`/`debug`/`info` level; install a subscriber (`env_logger` in
//! development) to see it. Nothing on the fault path logs: formatting and
//! any logger backend's own I/O are not async-signal-safe.
//!
//! This crate is Unix-only and assumes a single thread of control per
//! process (the only concurrency it tolerates is the asynchronous delivery
//! of `SIGSEGV` on the same thread that caused it).

#[cfg(not(unix))]
compile_error!("lazycopy relies on mprotect/sigaction/sysconf and only builds on Unix targets");

mod error;
mod fault;
pub mod page;
mod pool;
mod protect;

use std::sync::Once;

static INIT: Once = Once::new();

/// Queries the page size and installs the `SIGSEGV` handler.
///
/// Idempotent: later calls are no-ops. Must run before the first
/// [`lazy_copy`], since the fault handler it installs is what makes a
/// deferred copy's eventual access safe rather than a crash.
pub fn init() {
    INIT.call_once(|| {
        page::init();
        fault::install();
        log::info!("lazycopy initialized, page size = 0x{:x}", page::size());
    });
}

/// Defers a `size`-byte copy from `src` to `dst`.
///
/// Returns `dst` immediately, having copied nothing yet. `dst` is write
/// protected, `src` is write protected (but left readable so unrelated
/// reads of it keep working until they're forced to materialize), and a
/// record is queued so that the first fault on either range triggers the
/// real transfer for the page involved.
///
/// If an earlier pending copy would still write into this new `src` range,
/// that earlier copy is materialized for the overlapping pages right away
/// (via a volatile read of each) before `src` is protected — otherwise a
/// reader of the new copy could observe bytes `src` had before that earlier
/// write was due to land.
///
/// # Panics
/// Panics if `size` is zero.
///
/// # Safety
/// `dst` and `src` must each point to `size` bytes of memory this process
/// owns (e.g. pages obtained from `mmap`), and must not overlap each other.
/// This contract cannot be enforced by the type signature: both pointers
/// are about to be reprotected by the crate, and only the caller knows
/// what they point at.
pub fn lazy_copy(dst: *mut u8, src: *const u8, size: usize) -> *mut u8 {
    assert!(size > 0, "lazy_copy: size must be greater than zero");
    let dst_addr = dst as usize;
    let src_addr = src as usize;
    log::debug!("lazy_copy(dst=0x{dst_addr:x}, src=0x{src_addr:x}, size=0x{size:x})");

    let ps = page::size();
    let mut p = page::page_base(src_addr);
    let last = page::page_base(src_addr + size - 1);
    while p <= last {
        // SAFETY: `src` covers `size` bytes per this function's contract,
        // so every page in [page_base(src), page_base(src+size-1)] is
        // process-owned memory; reading its first byte either succeeds
        // outright or is caught and serviced by the fault handler.
        unsafe {
            std::ptr::read_volatile(p as *const u8);
        }
        p += ps;
    }

    unsafe {
        let pool = pool::POOL.get();
        match fault::insert(pool, dst_addr, src_addr, size, None) {
            Ok(_) => {}
            Err(e) => panic!("lazy_copy: failed to queue deferred copy: {e}"),
        }
    }
    dst
}

/// Materializes every pending copy, restores every page this crate has
/// touched to `READ_WRITE`, and empties the pool.
///
/// Intended for tests and for long-running processes that want to return
/// to a clean slate between uses of [`lazy_copy`] rather than accumulate
/// pending records indefinitely.
pub fn reset() {
    unsafe {
        let pool = pool::POOL.get();
        pool.reset();
    }
    log::info!("lazycopy reset");
}
