//! The pending-copy table.
//!
//! A fixed-capacity array of [`Record`]s plus a singly linked chain
//! threading the in-use ones in insertion order. This is the only
//! "allocator" used on the fault path: a free slot is found by scanning an
//! `in_use` bit, never by calling into the heap allocator, because the
//! fault handler runs on a signal stack where allocation is not safe.
//!
//! The pool itself is process-global (see [`POOL`]) since the fault
//! handler is installed process-wide and has no way to receive a `&mut
//! Pool` argument from the kernel. Access is never exposed outside this
//! crate.

use crate::page;
use crate::protect::{self, Mode};
use crate::error::LazyCopyError;
use std::cell::UnsafeCell;

/// The maximum number of pending copies the pool can hold at once.
///
/// Chosen to match the teacher design's fixed-capacity default; raising it
/// only costs `size_of::<Record>() * N` bytes of static storage.
pub const MAX_PENDING: usize = 50;

/// A single pending, not-yet-materialized copy.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Record {
    /// Start of the source byte range.
    pub src: usize,
    /// Start of the destination byte range.
    pub dst: usize,
    /// Length in bytes of both ranges (always `> 0` while `in_use`).
    pub size: usize,
    in_use: bool,
    next: Option<u32>,
}

impl Record {
    const EMPTY: Record = Record {
        src: 0,
        dst: 0,
        size: 0,
        in_use: false,
        next: None,
    };
}

/// The pending-copy table: a fixed-size slot array plus the in-use chain.
pub(crate) struct Pool {
    slots: [Record; MAX_PENDING],
    head: Option<u32>,
}

impl Pool {
    pub const fn new() -> Self {
        Pool {
            slots: [Record::EMPTY; MAX_PENDING],
            head: None,
        }
    }

    /// The first record of the in-use chain, oldest-inserted first.
    pub fn head(&self) -> Option<u32> {
        self.head
    }

    /// The record at a given slot. Panics if the slot is not in use.
    pub fn record(&self, idx: u32) -> &Record {
        let r = &self.slots[idx as usize];
        debug_assert!(r.in_use);
        r
    }

    /// The chain successor of `idx`, or `None` at the tail.
    pub fn next(&self, idx: u32) -> Option<u32> {
        self.slots[idx as usize].next
    }

    /// The number of in-use records. `O(MAX_PENDING)`; used by tests and
    /// diagnostics, never on the fault path.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|r| r.in_use).count()
    }

    fn free_slot(&self) -> Option<u32> {
        self.slots.iter().position(|r| !r.in_use).map(|i| i as u32)
    }

    fn link(&mut self, idx: u32, after: Option<u32>) {
        match after {
            None => {
                match self.head {
                    None => {
                        self.head = Some(idx);
                        self.slots[idx as usize].next = None;
                    }
                    Some(mut cur) => {
                        while let Some(n) = self.slots[cur as usize].next {
                            cur = n;
                        }
                        self.slots[cur as usize].next = Some(idx);
                        self.slots[idx as usize].next = None;
                    }
                }
            }
            Some(after_idx) => {
                let next = self.slots[after_idx as usize].next;
                self.slots[after_idx as usize].next = Some(idx);
                self.slots[idx as usize].next = next;
            }
        }
    }

    /// Reserves a free slot, fills it with the given record, and links it
    /// into the chain. Returns `None` if no slot is free; the caller is
    /// responsible for forcing a flush (see [`crate::fault::insert`]) and
    /// retrying.
    pub fn try_insert(&mut self, dst: usize, src: usize, size: usize, after: Option<u32>) -> Option<u32> {
        debug_assert!(size > 0);
        let idx = self.free_slot()?;
        self.slots[idx as usize] = Record {
            src,
            dst,
            size,
            in_use: true,
            next: None,
        };
        self.link(idx, after);
        Some(idx)
    }

    /// Unlinks `idx` from the chain and frees its slot.
    pub fn remove(&mut self, idx: u32) {
        debug_assert!(self.slots[idx as usize].in_use);
        if self.head == Some(idx) {
            self.head = self.slots[idx as usize].next;
        } else {
            let mut cur = self.head;
            while let Some(c) = cur {
                if self.slots[c as usize].next == Some(idx) {
                    self.slots[c as usize].next = self.slots[idx as usize].next;
                    break;
                }
                cur = self.slots[c as usize].next;
            }
        }
        self.slots[idx as usize] = Record::EMPTY;
    }

    /// Rewrites the extent of an in-use record in place (used by the fault
    /// handler to shrink a record after materializing its first or last
    /// page).
    pub fn set_extent(&mut self, idx: u32, src: usize, dst: usize, size: usize) {
        debug_assert!(size > 0);
        debug_assert!(self.slots[idx as usize].in_use);
        let r = &mut self.slots[idx as usize];
        r.src = src;
        r.dst = dst;
        r.size = size;
    }

    /// Walks the chain from the head and returns the **first** in-use
    /// record whose source or destination page-range contains `addr`, or
    /// `None`. "First" here means earliest-inserted, which is what makes
    /// overlapping deferred copies materialize in insertion order.
    pub fn find_covering(&self, addr: usize) -> Option<u32> {
        let mut cur = self.head;
        while let Some(idx) = cur {
            let r = &self.slots[idx as usize];
            if page::in_page_range(r.src, r.size, addr) || page::in_page_range(r.dst, r.size, addr) {
                return Some(idx);
            }
            cur = r.next;
        }
        None
    }

    /// The strictest protection mode any in-use record requires of `page`
    /// (any address within the page will do): `NONE` if some record names
    /// it as a destination, else `READ` if some record names it as a
    /// source, else unrestricted (`READ_WRITE`).
    fn required_mode_for_page(&self, page: usize) -> Mode {
        let mut mode = Mode::READ_WRITE;
        let mut cur = self.head;
        while let Some(idx) = cur {
            let r = &self.slots[idx as usize];
            if page::in_page_range(r.dst, r.size, page) {
                mode = mode.strictest(Mode::NONE);
            }
            if page::in_page_range(r.src, r.size, page) {
                mode = mode.strictest(Mode::READ);
            }
            cur = r.next;
        }
        mode
    }

    /// Recomputes and applies the strictest protection required on every
    /// page touched by `[start, start + size)`, by scanning every in-use
    /// record. Adjacent pages that need the same mode are coalesced into a
    /// single `mprotect` call.
    ///
    /// This supplements the simpler model of re-protecting only the pages
    /// of the record at hand: because a page can be named by more than one
    /// record (one record's `src` page can equal another's `dst` page),
    /// re-protecting in isolation could leave a page under-protected.
    ///
    /// # Safety
    /// `[start, start + size)` must lie in memory this process owns.
    pub unsafe fn reconcile_range(&self, start: usize, size: usize) -> Result<(), LazyCopyError> {
        debug_assert!(size > 0);
        let ps = page::size();
        let first = page::page_base(start);
        let last = page::page_base(start + size - 1);

        let mut run_start = first;
        let mut run_mode = self.required_mode_for_page(first);
        let mut p = first + ps;
        while p <= last {
            let mode = self.required_mode_for_page(p);
            if mode != run_mode {
                protect::protect(run_start as *mut u8, p - run_start, run_mode)?;
                run_start = p;
                run_mode = mode;
            }
            p += ps;
        }
        protect::protect(run_start as *mut u8, (last + ps) - run_start, run_mode)?;
        Ok(())
    }

    /// Restores every in-use record's covered pages to `READ_WRITE` and
    /// discards all pending records. Used by [`crate::reset`].
    ///
    /// # Safety
    /// Every covered range must lie in memory this process owns.
    pub unsafe fn reset(&mut self) {
        let mut cur = self.head;
        while let Some(idx) = cur {
            let r = self.slots[idx as usize];
            // Best-effort: a failure here means the caller already tore
            // down the mapping, which reset() cannot do anything about.
            let _ = protect::protect(r.src as *mut u8, r.size, Mode::READ_WRITE);
            let _ = protect::protect(r.dst as *mut u8, r.size, Mode::READ_WRITE);
            cur = r.next;
        }
        *self = Pool::new();
    }
}

/// Process-wide singleton pool.
///
/// Plain `UnsafeCell`, not a `Mutex`: the design assumes a single thread of
/// control (possibly interrupted by a page-fault signal on that same
/// thread), and a lock the interrupted code might itself hold would
/// deadlock the process the moment the fault handler tried to acquire it.
pub(crate) struct PoolCell(UnsafeCell<Pool>);

// SAFETY: access is serialized by the single-threaded-process assumption
// documented on `PoolCell::get` and throughout the crate's module docs.
unsafe impl Sync for PoolCell {}

pub(crate) static POOL: PoolCell = PoolCell(UnsafeCell::new(Pool::new()));

impl PoolCell {
    /// Borrows the global pool mutably.
    ///
    /// # Safety
    /// The caller must not call this reentrantly in a way that produces
    /// two live `&mut Pool` at once. This holds under the single-threaded
    /// model: the only reentrant caller is the fault handler itself, which
    /// never calls back into code that calls `get` while an outer borrow
    /// is still alive.
    pub unsafe fn get(&self) -> &mut Pool {
        &mut *self.0.get()
    }
}
