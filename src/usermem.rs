//! User-pointer validation at the system-call boundary.
//!
//! Every argument a syscall receives from user code is either a plain
//! scalar (already safe to use) or a pointer into the caller's address
//! space. Pointers are never dereferenced directly: each byte they cover
//! is probed through the thread's page directory first, mirroring
//! `userprog/syscall.c`'s byte-at-a-time `get_user`/`put_user` checks, and
//! any unmapped byte or out-of-range address turns into a
//! [`KernelError::FaultyUserArgument`] that `syscall.rs` converts into
//! process termination.

use crate::device::BlockDevice;
use crate::error::KernelError;
use crate::param::{PAGE_SIZE, USER_TOP};
use crate::thread::Thread;
use crate::vm::{FrameTable, VirtAddr};

/// Longest C string a syscall will walk before giving up (there is no
/// hardware fault to bound the search, unlike a real page-fault-driven
/// `get_user` loop).
pub const MAX_USER_STRING: usize = 512;

fn page_align(addr: VirtAddr) -> VirtAddr {
    addr & !(PAGE_SIZE - 1)
}

fn byte_mapped(thread: &Thread, addr: VirtAddr) -> bool {
    addr < USER_TOP && thread.page_dir.is_present(page_align(addr))
}

fn byte_writable(thread: &Thread, addr: VirtAddr) -> bool {
    thread.page_dir.is_writable(page_align(addr)) == Some(true)
}

/// Probes every byte of `[addr, addr+len)`. An empty range
/// still requires `addr` itself to be a legal user address, matching a
/// zero-length read/write that nonetheless named an address.
pub fn range_mapped(thread: &Thread, addr: VirtAddr, len: usize) -> bool {
    if addr >= USER_TOP {
        return false;
    }
    if len == 0 {
        return true;
    }
    let end = match addr.checked_add(len) {
        Some(e) if e <= USER_TOP => e,
        _ => return false,
    };
    (addr..end).all(|a| byte_mapped(thread, a))
}

fn read_one<D: BlockDevice>(frames: &FrameTable<D>, thread: &Thread, addr: VirtAddr) -> u8 {
    let page = page_align(addr);
    let kernel_addr = thread
        .page_dir
        .kernel_addr(page)
        .expect("byte was probed mapped just above");
    frames.read_bytes(kernel_addr)[addr - page]
}

fn write_one<D: BlockDevice>(frames: &FrameTable<D>, thread: &Thread, addr: VirtAddr, value: u8) {
    let page = page_align(addr);
    let kernel_addr = thread
        .page_dir
        .kernel_addr(page)
        .expect("byte was probed mapped just above");
    frames.with_page_mut(kernel_addr, |p| p[addr - page] = value);
    thread.page_dir.touch(page, true);
}

/// Copies `len` bytes out of `thread`'s address space starting at user
/// address `addr`, probing every one of them first. Pointer arguments
/// whose size depends on a length parameter are validated against that
/// length.
pub fn fetch_bytes<D: BlockDevice>(
    frames: &FrameTable<D>,
    thread: &Thread,
    addr: VirtAddr,
    len: usize,
) -> Result<Vec<u8>, KernelError> {
    if !range_mapped(thread, addr, len) {
        return Err(KernelError::FaultyUserArgument(
            "unmapped or out-of-range user pointer",
        ));
    }
    Ok((addr..addr + len).map(|a| read_one(frames, thread, a)).collect())
}

/// Writes `data` into `thread`'s address space at user address `addr`,
/// probing every byte for presence *and* writability first.
pub fn store_bytes<D: BlockDevice>(
    frames: &FrameTable<D>,
    thread: &Thread,
    addr: VirtAddr,
    data: &[u8],
) -> Result<(), KernelError> {
    if !range_mapped(thread, addr, data.len()) {
        return Err(KernelError::FaultyUserArgument(
            "unmapped or out-of-range user pointer",
        ));
    }
    if (0..data.len()).any(|i| !byte_writable(thread, addr + i)) {
        return Err(KernelError::FaultyUserArgument(
            "user pointer refers to a read-only page",
        ));
    }
    for (i, byte) in data.iter().enumerate() {
        write_one(frames, thread, addr + i, *byte);
    }
    Ok(())
}

/// Walks a NUL-terminated string starting at user address `addr`,
/// probing each byte before reading it. Returns the bytes without the
/// terminator.
pub fn fetch_cstr<D: BlockDevice>(
    frames: &FrameTable<D>,
    thread: &Thread,
    addr: VirtAddr,
) -> Result<Vec<u8>, KernelError> {
    let mut out = Vec::new();
    for i in 0..MAX_USER_STRING {
        let a = addr.checked_add(i).ok_or(KernelError::FaultyUserArgument(
            "user string pointer overflowed address space",
        ))?;
        if !byte_mapped(thread, a) {
            return Err(KernelError::FaultyUserArgument(
                "unmapped byte while walking user string",
            ));
        }
        let b = read_one(frames, thread, a);
        if b == 0 {
            return Ok(out);
        }
        out.push(b);
    }
    Err(KernelError::FaultyUserArgument(
        "user string exceeded the maximum syscall argument length",
    ))
}
