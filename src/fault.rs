//! The page-fault path.
//!
//! Everything reachable from [`sigsegv_handler`] runs on whatever stack the
//! kernel delivered the signal on, possibly in the middle of arbitrary
//! libc state. That rules out heap allocation, locking, and buffered I/O:
//! the handler only ever touches the static [`crate::pool::POOL`], calls
//! `mprotect`/`write`/`raise` directly, and copies bytes with
//! [`std::ptr::copy`].

use crate::error::LazyCopyError;
use crate::page;
use crate::pool::{self, Pool};
use crate::protect::{self, Mode};
use std::os::raw::c_int;

/// Installs the `SIGSEGV` handler. Idempotent is the caller's
/// responsibility (see [`crate::init`]'s `Once` guard).
pub(crate) fn install() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = sigsegv_handler as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut sa.sa_mask);
        let rc = libc::sigaction(libc::SIGSEGV, &sa, std::ptr::null_mut());
        assert_eq!(rc, 0, "sigaction(SIGSEGV) failed");
    }
}

extern "C" fn sigsegv_handler(_sig: c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let addr = unsafe { (*info).si_addr() } as usize;
    handle_fault(addr);
}

/// The fault-handling loop: repeatedly finds the record covering `addr`,
/// materializes one page of it, and re-queries, until no record covers
/// `addr` any more.
///
/// If no record ever covered `addr` this is a fault the crate was never
/// asked to manage, and the process is terminated with a diagnostic
/// rather than returning (returning would re-fault the same instruction
/// forever).
fn handle_fault(addr: usize) {
    unsafe {
        let pool = pool::POOL.get();
        if pool.find_covering(addr).is_none() {
            fatal_unmanaged_fault(addr);
        }
        let mut steps = 0usize;
        while let Some(idx) = pool.find_covering(addr) {
            if let Err(e) = materialize_one_page(pool, idx, addr) {
                fatal_protection_failure(e);
            }
            steps += 1;
            // A record is split into at most two on any one step and the
            // chain only ever shrinks otherwise, so this cannot loop past
            // the pool's own capacity without something being wrong.
            debug_assert!(steps <= pool::MAX_PENDING + 1, "fault loop exceeded the pool's bound");
        }
    }
}

/// Copies `cn` bytes from `cs` to `cd`, making both page-aligned ranges
/// writable first.
///
/// # Safety
/// `cs`/`cd` for `cn` bytes must describe memory this process owns.
unsafe fn real_copy(cd: usize, cs: usize, cn: usize) -> Result<(), LazyCopyError> {
    protect::protect(cs as *mut u8, cn, Mode::READ_WRITE)?;
    protect::protect(cd as *mut u8, cn, Mode::READ_WRITE)?;
    std::ptr::copy(cs as *const u8, cd as *mut u8, cn);
    Ok(())
}

/// Materializes a record in full. Used when the pool is full and the
/// chain head must be evicted to free a slot for a new insertion.
unsafe fn flush_full(pool: &mut Pool, idx: u32) -> Result<(), LazyCopyError> {
    let r = *pool.record(idx);
    real_copy(r.dst, r.src, r.size)?;
    pool.remove(idx);
    pool.reconcile_range(r.src, r.size)?;
    pool.reconcile_range(r.dst, r.size)?;
    Ok(())
}

/// Inserts a new pending record, forcing a flush of the chain head first
/// if the pool is full, then reconciles protection over the new record's
/// source and destination ranges.
pub(crate) unsafe fn insert(
    pool: &mut Pool,
    dst: usize,
    src: usize,
    size: usize,
    after: Option<u32>,
) -> Result<u32, LazyCopyError> {
    let idx = match pool.try_insert(dst, src, size, after) {
        Some(idx) => idx,
        None => {
            let head = pool
                .head()
                .ok_or(LazyCopyError::Invariant("pool reported full with an empty chain"))?;
            flush_full(pool, head)?;
            pool.try_insert(dst, src, size, after)
                .ok_or(LazyCopyError::Invariant("slot still unavailable after flushing the chain head"))?
        }
    };
    pool.reconcile_range(src, size)?;
    pool.reconcile_range(dst, size)?;
    Ok(idx)
}

/// Materializes exactly the page of `idx` that covers `addr`, then shrinks,
/// splits, or removes the record to reflect the bytes now copied.
///
/// Classification always keys off the source side's pages (`r.src + k`
/// where `k` is `addr`'s offset from whichever side actually faulted):
/// a record describes a byte-for-byte correspondence between its source
/// and destination ranges, so a single offset `k` identifies "the same"
/// page on both sides regardless of which side the kernel reported.
unsafe fn materialize_one_page(pool: &mut Pool, idx: u32, addr: usize) -> Result<(), LazyCopyError> {
    let ps = page::size();
    let r = *pool.record(idx);

    let on_src = page::in_page_range(r.src, r.size, addr);
    let side_base = if on_src { r.src } else { r.dst };
    debug_assert!(on_src || page::in_page_range(r.dst, r.size, addr));

    let k = addr as isize - side_base as isize;
    let ref_src = (r.src as isize + k) as usize;

    let first_page = page::page_base(r.src);
    let last_page = page::page_base(r.src + r.size - 1);
    let ref_page = page::page_base(ref_src);
    let is_first = ref_page == first_page;
    let is_last = ref_page == last_page;

    let (cs, cd, cn) = if is_first && is_last {
        (r.src, r.dst, r.size)
    } else if is_first {
        let off = r.src - first_page;
        (r.src, r.dst, ps - off)
    } else if is_last {
        let cs = last_page;
        let cd = page::page_base(r.dst + r.size - 1);
        (cs, cd, (r.src + r.size) - cs)
    } else {
        let cs = ref_page;
        let cd = page::page_base((r.dst as isize + k) as usize);
        (cs, cd, ps)
    };

    real_copy(cd, cs, cn)?;

    match (is_first, is_last) {
        (true, true) => {
            pool.remove(idx);
            pool.reconcile_range(r.src, r.size)?;
            pool.reconcile_range(r.dst, r.size)?;
        }
        (true, false) => {
            let new_src = r.src + cn;
            let new_dst = r.dst + cn;
            pool.set_extent(idx, new_src, new_dst, r.size - cn);
            pool.reconcile_range(cs, cn)?;
        }
        (false, true) => {
            let new_size = cs - r.src;
            pool.set_extent(idx, r.src, r.dst, new_size);
            pool.reconcile_range(cs, cn)?;
        }
        (false, false) => {
            let before_size = cs - r.src;
            let after_src = cs + cn;
            let after_dst = cd + cn;
            let after_size = r.size - before_size - cn;
            pool.set_extent(idx, r.src, r.dst, before_size);
            let new_idx = insert(pool, after_dst, after_src, after_size, Some(idx))?;
            debug_assert!(
                !page::in_page_range(after_src, after_size, addr),
                "split successor must not cover the faulting address"
            );
            let _ = new_idx;
            pool.reconcile_range(cs, cn)?;
        }
    }
    Ok(())
}

/// Writes a short diagnostic with the faulting address and terminates the
/// process with `SIGKILL`. Only raw `write`/`raise` are used, since this
/// runs on the signal path.
fn fatal_unmanaged_fault(addr: usize) -> ! {
    const PREFIX: &[u8] = b"lazycopy: unmanaged page fault at 0x";
    unsafe {
        raw_write(PREFIX);
        let mut buf = [0u8; 16];
        let n = format_hex(addr, &mut buf);
        raw_write(&buf[..n]);
        raw_write(b"\n");
        libc::raise(libc::SIGKILL);
    }
    loop {
        std::hint::spin_loop();
    }
}

/// Aborts the process after a `Result`-carrying failure surfaced on the
/// fault path (an `mprotect` call failing mid-handler). Treated as an
/// unrecoverable programming bug rather than something to propagate.
fn fatal_protection_failure(_e: LazyCopyError) -> ! {
    const MSG: &[u8] = b"lazycopy: protection call failed while servicing a page fault\n";
    unsafe {
        raw_write(MSG);
        libc::abort();
    }
    loop {
        std::hint::spin_loop();
    }
}

unsafe fn raw_write(buf: &[u8]) {
    libc::write(libc::STDERR_FILENO, buf.as_ptr() as *const libc::c_void, buf.len());
}

fn format_hex(mut v: usize, buf: &mut [u8; 16]) -> usize {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    if v == 0 {
        buf[0] = b'0';
        return 1;
    }
    let mut tmp = [0u8; 16];
    let mut i = 0;
    while v > 0 {
        tmp[i] = HEX[(v & 0xf) as usize];
        v >>= 4;
        i += 1;
    }
    for j in 0..i {
        buf[j] = tmp[i - 1 - j];
    }
    i
}
