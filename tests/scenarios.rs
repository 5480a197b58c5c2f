//! End-to-end scenarios exercising `lazy_copy` against real `mmap`-backed
//! memory, driven entirely through page faults rather than by calling any
//! internal materialization routine directly.
//!
//! The pool and the installed `SIGSEGV` handler are process-global, so
//! these tests assume `cargo test -- --test-threads=1`.

use lazycopy::page;
use std::ptr;

struct Region {
    ptr: *mut u8,
    pages: usize,
}

impl Region {
    fn new(pages: usize) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        lazycopy::init();
        let len = pages * page::size();
        unsafe {
            let p = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(p, libc::MAP_FAILED, "mmap failed");
            Region { ptr: p as *mut u8, pages }
        }
    }

    fn at(&self, offset: usize) -> *mut u8 {
        unsafe { self.ptr.add(offset) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.pages * page::size());
        }
    }
}

fn fill(ptr: *mut u8, len: usize, value: u8) {
    unsafe {
        std::ptr::write_bytes(ptr, value, len);
    }
}

fn slice(ptr: *const u8, len: usize) -> &'static [u8] {
    unsafe { std::slice::from_raw_parts(ptr, len) }
}

#[test]
fn s1_single_page_triggered_by_reading_destination() {
    let region = Region::new(4);
    let p = page::size();
    let a = region.at(0);
    let b = region.at(2 * p);
    fill(a, p, 0xaa);

    lazycopy::lazy_copy(b, a, p);
    let _ = unsafe { ptr::read_volatile(b) };

    assert_eq!(slice(b, p), slice(a, p));
    lazycopy::reset();
}

#[test]
fn s2_single_page_triggered_by_writing_destination() {
    let region = Region::new(4);
    let p = page::size();
    let a = region.at(0);
    let b = region.at(2 * p);
    fill(a, p, 0x10);

    lazycopy::lazy_copy(b, a, p);
    unsafe {
        *b += 1;
    }

    assert_eq!(unsafe { *b }, 0x11);
    assert_eq!(slice(unsafe { b.add(1) }, p - 1), slice(unsafe { a.add(1) }, p - 1));
    lazycopy::reset();
}

#[test]
fn s3_single_page_triggered_by_writing_source() {
    let region = Region::new(4);
    let p = page::size();
    let a = region.at(0);
    let b = region.at(2 * p);
    fill(a, p, 0x55);
    let original = unsafe { a.read_volatile() };

    lazycopy::lazy_copy(b, a, p);
    unsafe {
        *a += 1;
    }

    // B must hold the pre-mutation bytes of A: the write to `a` had to
    // materialize the pending copy before it could land.
    assert_eq!(unsafe { b.read_volatile() }, original);
    lazycopy::reset();
}

#[test]
fn s4_two_pages_materialize_independently() {
    let region = Region::new(6);
    let p = page::size();
    let a = region.at(0);
    let b = region.at(3 * p);
    fill(a, 2 * p, 0x77);

    lazycopy::lazy_copy(b, a, 2 * p);
    let _ = unsafe { ptr::read_volatile(b) };
    let _ = unsafe { ptr::read_volatile(b.add(p + 0x800)) };

    assert_eq!(slice(b, 2 * p), slice(a, 2 * p));
    lazycopy::reset();
}

#[test]
fn s5_unaligned_sub_page_range() {
    let region = Region::new(4);
    let p = page::size();
    let a = region.at(0);
    let b = region.at(2 * p);
    fill(unsafe { a.add(0x400) }, 0x200, 0x99);

    lazycopy::lazy_copy(unsafe { b.add(0x400) }, unsafe { a.add(0x400) }, 0x200);
    unsafe {
        *b.add(0x400) += 1;
    }

    assert_eq!(unsafe { b.add(0x400).read_volatile() }, 0x9a);
    assert_eq!(
        slice(unsafe { b.add(0x401) }, 0x1ff),
        slice(unsafe { a.add(0x401) }, 0x1ff)
    );
    lazycopy::reset();
}

#[test]
fn s6_middle_page_access_splits_the_record() {
    let region = Region::new(9);
    let p = page::size();
    let a = region.at(0);
    let b = region.at(4 * p);
    fill(a, 3 * p, 0x21);

    lazycopy::lazy_copy(b, a, 3 * p);
    unsafe {
        *b.add(p) += 1;
    }
    let _ = unsafe { ptr::read_volatile(b) };
    let _ = unsafe { ptr::read_volatile(b.add(2 * p)) };

    assert_eq!(unsafe { b.add(p).read_volatile() }, 0x22);
    assert_eq!(slice(b, p), slice(a, p));
    assert_eq!(unsafe { b.add(p + 1).read_volatile() }, 0x21);
    assert_eq!(slice(unsafe { b.add(2 * p) }, p), slice(unsafe { a.add(2 * p) }, p));
    lazycopy::reset();
}

#[test]
fn s7_chained_copies_materialize_in_order() {
    let region = Region::new(6);
    let p = page::size();
    let a = region.at(0);
    let b = region.at(2 * p);
    let c = region.at(4 * p);
    fill(a, p, 0x01);
    let original = unsafe { a.read_volatile() };

    lazycopy::lazy_copy(b, a, p);
    lazycopy::lazy_copy(c, b, p);
    unsafe {
        *b += 1;
    }

    assert_eq!(unsafe { c.read_volatile() }, original);
    assert_eq!(unsafe { b.read_volatile() }, original + 1);
    lazycopy::reset();
}

#[test]
fn reset_twice_is_the_same_as_reset_once() {
    let region = Region::new(4);
    let p = page::size();
    let a = region.at(0);
    let b = region.at(2 * p);
    fill(a, p, 0x66);

    lazycopy::lazy_copy(b, a, p);
    lazycopy::reset();
    lazycopy::reset();

    // Both regions must be plain read/write now, and the destination must
    // not have been silently materialized by the second reset.
    unsafe {
        *a = 0x01;
        *b = 0x02;
    }
    assert_eq!(unsafe { *a }, 0x01);
    assert_eq!(unsafe { *b }, 0x02);
}
