//! System-call boundary.
//!
//! [`Syscalls`] bundles the scheduler, the mounted filesystem, the frame
//! table and the process table behind a single surface: `halt`, `exit`,
//! `exec`, `wait`, `create`, `remove`, `open`, `filesize`, `read`,
//! `write`, `seek`, `tell`, `close`, `mmap`, `munmap`, `chdir`, `mkdir`,
//! `readdir`, `isdir`, `inumber`. Every user-supplied pointer is probed
//! through `usermem` before use; a faulty one terminates the calling
//! process rather than propagating into the kernel.
//!
//! Trap-frame decoding and argument marshalling off a raw register file
//! are out of scope here — this module only matters as the boundary to
//! the file system and scheduler. What is in scope, and implemented
//! here, is everything on the kernel side of that boundary: address
//! validation, fd lifecycle, and routing into filesys, the inode
//! layer, the directory layer and the scheduler. `exec` in particular
//! stands in for the ELF loader and userland argument passing — out of
//! scope as a separate booter/shell/user-program layer — by taking a
//! Rust closure as the "program" to run in the new process, rather
//! than loading one from a file.

use std::sync::Arc;

use crate::device::BlockDevice;
use crate::error::KernelError;
use crate::fs::inode::Inode;
use crate::fs::Filesys;
use crate::process::{Fd, MapId, Mapping, OpenFile, ProcessTable, FD_STDOUT};
use crate::thread::scheduler::Scheduler;
use crate::thread::{KernelCtx, ThreadId};
use crate::usermem;
use crate::vm::{BackingFile, FrameTable, PageKind, Residency, Spte, VirtAddr};

/// Per-call failure sentinel for calls that return a signed integer.
pub const FAIL: isize = KernelError::SYSCALL_FAIL;

/// Adapts an open [`Inode`] to the VM layer's [`BackingFile`] trait so a
/// memory-mapped file can be paged in/out through the ordinary page-fault
/// and eviction paths. Stores the
/// [`KernelCtx`] of the thread that created the mapping, since `Inode`'s
/// `read_at`/`write_at` need one and this hosted kernel never touches a
/// backing file from anywhere but a scheduled kernel thread.
struct InodeBackingFile<D> {
    inode: Arc<Inode<D>>,
    cx: KernelCtx,
}

impl<D: BlockDevice + 'static> BackingFile for InodeBackingFile<D> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        self.inode.read_at(&self.cx, buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        self.inode.write_at(&self.cx, buf, offset)
    }
}

/// The whole kernel's syscall-facing surface, owning a handle to every
/// subsystem module M routes into.
pub struct Syscalls<D> {
    scheduler: Arc<Scheduler>,
    fs: Arc<Filesys<D>>,
    frames: Arc<FrameTable<D>>,
    processes: Arc<ProcessTable<D>>,
}

impl<D: BlockDevice + 'static> Syscalls<D> {
    pub fn new(
        scheduler: Arc<Scheduler>,
        fs: Arc<Filesys<D>>,
        frames: Arc<FrameTable<D>>,
        processes: Arc<ProcessTable<D>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            fs,
            frames,
            processes,
        })
    }

    /// Registers the first (root) process. Must be called once before any
    /// other syscall runs on `cx`'s thread.
    pub fn register_root(&self, cx: &KernelCtx) {
        self.processes.register(cx.thread_id(), None);
    }

    /// `halt`: there is no real machine to power off in a
    /// hosted build, so this only logs the request.
    pub fn halt(&self) {
        log::info!("halt requested");
    }

    /// `exit(status)`: closes every open
    /// fd and tears down every memory mapping, then records the exit
    /// status and wakes a parent blocked in `wait`. Per this module's doc
    /// comment, the calling closure is expected to `return` immediately
    /// after calling this — there is no ELF-loaded user program whose
    /// control flow the kernel can forcibly cut off.
    pub fn exit(&self, cx: &KernelCtx, status: i32) {
        let pid = cx.thread_id();
        for file in self.processes.drain_files(pid) {
            self.fs.close(cx, &file.inode);
        }
        for mapping in self.processes.drain_mappings(pid) {
            self.unmap_pages(cx, &mapping);
        }
        for slot in cx.thread().spt.drain_swap_slots() {
            self.frames.swap().free(slot);
        }
        self.processes.exit(cx, pid, status);
    }

    /// `exec(entry)`: spawns a new process running `entry`
    /// as its program, registers it as a child of the caller, and returns
    /// its pid. Spec.md's `exec(cmdline: &str)` loads a named executable;
    /// see this module's doc comment for why that step is replaced by a
    /// caller-supplied closure here.
    pub fn exec<F>(&self, cx: &KernelCtx, name: &str, entry: F) -> ThreadId
    where
        F: FnOnce(&KernelCtx) + Send + 'static,
    {
        let parent = cx.thread_id();
        let child = self
            .scheduler
            .spawn(name, crate::thread::default_priority(), entry);
        // Cooperative scheduling guarantees the child is merely Ready,
        // not running, until the caller yields/blocks/exits — so
        // registering it here, strictly before the child's entry
        // closure can run, has no race with anything the child's own
        // syscalls might do.
        self.processes.register(child.id, Some(parent));
        child.id
    }

    /// `wait(pid)`.
    pub fn wait(&self, cx: &KernelCtx, pid: ThreadId) -> isize {
        match self.processes.wait(cx, cx.thread_id(), pid) {
            Some(status) => status as isize,
            None => FAIL,
        }
    }

    /// `create(name, size)`. Rejects an empty name up front.
    pub fn create(&self, cx: &KernelCtx, name: &str, size: usize) -> bool {
        if name.is_empty() {
            return false;
        }
        self.fs.create(cx, name, size).is_ok()
    }

    /// `remove(name)`.
    pub fn remove(&self, cx: &KernelCtx, name: &str) -> bool {
        self.fs.remove(cx, name).is_ok()
    }

    /// `mkdir(path)`, the directory-creation entry point that the
    /// inode and directory layers both rely on.
    pub fn mkdir(&self, cx: &KernelCtx, path: &str) -> bool {
        self.fs.mkdir(cx, path).is_ok()
    }

    /// `open(name)`: returns the new fd, or [`FAIL`].
    pub fn open(&self, cx: &KernelCtx, name: &str) -> isize {
        let inode = match self.fs.open(cx, name) {
            Ok(i) => i,
            Err(_) => return FAIL,
        };
        let is_dir = inode.is_dir(cx);
        self.processes.open(cx.thread_id(), inode, is_dir) as isize
    }

    fn open_file(&self, cx: &KernelCtx, fd: Fd) -> Option<Arc<OpenFile<D>>> {
        self.processes.get(cx.thread_id(), fd)
    }

    /// `filesize(fd)`.
    pub fn filesize(&self, cx: &KernelCtx, fd: Fd) -> isize {
        match self.open_file(cx, fd) {
            Some(f) => f.inode.length(cx) as isize,
            None => FAIL,
        }
    }

    /// `read(fd, buf, n)`: `buf` is a user virtual address,
    /// probed and written through [`usermem`] before the syscall returns.
    /// A faulty pointer is a [`KernelError::FaultyUserArgument`]
    ///; per this module's doc comment, deciding *when* that
    /// terminates the calling process is left to whatever drives the
    /// entry closure (the same split `vm::fault::handle_fault` uses,
    /// returning an outcome rather than acting on it directly), so this
    /// only reports the failure.
    pub fn read(&self, cx: &KernelCtx, fd: Fd, buf: VirtAddr, n: usize) -> Result<isize, KernelError> {
        let Some(file) = self.open_file(cx, fd) else {
            return Ok(FAIL);
        };
        if file.is_dir {
            return Ok(FAIL);
        }
        let mut tmp = vec![0u8; n];
        let pos = file.tell();
        let read = file.inode.read_at(cx, &mut tmp, pos);
        usermem::store_bytes(&self.frames, cx.thread(), buf, &tmp[..read])?;
        file.seek(pos + read as u64);
        Ok(read as isize)
    }

    /// `write(fd, buf, n)`. `fd == 1` writes to the console
    ///; this hosted build logs it
    /// instead of driving a VGA console. See [`Syscalls::read`] on why a
    /// faulty pointer is reported rather than acted on here.
    pub fn write(&self, cx: &KernelCtx, fd: Fd, buf: VirtAddr, n: usize) -> Result<isize, KernelError> {
        let data = usermem::fetch_bytes(&self.frames, cx.thread(), buf, n)?;
        if fd == FD_STDOUT {
            log::info!("console: {}", String::from_utf8_lossy(&data));
            return Ok(data.len() as isize);
        }
        let Some(file) = self.open_file(cx, fd) else {
            return Ok(FAIL);
        };
        if file.is_dir {
            return Ok(FAIL);
        }
        let pos = file.tell();
        let written = file.inode.write_at(cx, &data, pos);
        file.seek(pos + written as u64);
        Ok(written as isize)
    }

    /// `seek(fd, pos)`.
    pub fn seek(&self, cx: &KernelCtx, fd: Fd, pos: u64) {
        if let Some(file) = self.open_file(cx, fd) {
            file.seek(pos);
        }
    }

    /// `tell(fd)`.
    pub fn tell(&self, cx: &KernelCtx, fd: Fd) -> isize {
        match self.open_file(cx, fd) {
            Some(f) => f.tell() as isize,
            None => FAIL,
        }
    }

    /// `close(fd)`.
    pub fn close(&self, cx: &KernelCtx, fd: Fd) {
        if let Some(file) = self.processes.close(cx.thread_id(), fd) {
            self.fs.close(cx, &file.inode);
        }
    }

    /// `isdir(fd)`.
    pub fn isdir(&self, cx: &KernelCtx, fd: Fd) -> bool {
        self.open_file(cx, fd).map(|f| f.is_dir).unwrap_or(false)
    }

    /// `inumber(fd)`.
    pub fn inumber(&self, cx: &KernelCtx, fd: Fd) -> isize {
        match self.open_file(cx, fd) {
            Some(f) => f.inode.sector() as isize,
            None => FAIL,
        }
    }

    /// `readdir(fd, name)`: advances the fd's own readdir
    /// cursor and writes the next entry's name into the user buffer at
    /// `name_buf` (`NAME_MAX + 1` bytes, NUL-terminated).
    pub fn readdir(&self, cx: &KernelCtx, fd: Fd, name_buf: VirtAddr) -> bool {
        let Some(file) = self.open_file(cx, fd) else {
            return false;
        };
        if !file.is_dir {
            return false;
        }
        let mut pos = file.readdir_pos.lock().unwrap();
        let name = match self.fs.readdir(cx, &file.inode, &mut pos) {
            Some(n) => n,
            None => return false,
        };
        let mut bytes = name.into_bytes();
        bytes.push(0);
        usermem::store_bytes(&self.frames, cx.thread(), name_buf, &bytes).is_ok()
    }

    /// `chdir(path)`.
    pub fn chdir(&self, cx: &KernelCtx, path: &str) -> bool {
        self.fs.chdir(cx, path).is_ok()
    }

    /// `mmap(fd, addr)`: maps the whole file at `fd` into the
    /// caller's address space starting at `addr`, one page-kind `Mmap`
    /// SPTE per page, demand-loaded on first fault exactly like any other
    /// SPTE. Returns the new mapping id, or [`FAIL`].
    pub fn mmap(&self, cx: &KernelCtx, fd: Fd, addr: VirtAddr) -> isize {
        let Some(file) = self.open_file(cx, fd) else {
            return FAIL;
        };
        if file.is_dir {
            return FAIL;
        }
        let length = file.inode.length(cx);
        if length == 0 || addr % crate::param::PAGE_SIZE != 0 {
            return FAIL;
        }
        let backing: Arc<dyn BackingFile> = Arc::new(InodeBackingFile {
            inode: file.inode.clone(),
            cx: cx.clone(),
        });

        let page_size = crate::param::PAGE_SIZE as u64;
        let num_pages = ((length + page_size - 1) / page_size) as usize;
        let mut pages = Vec::with_capacity(num_pages);
        for i in 0..num_pages {
            let page_addr = addr + i * crate::param::PAGE_SIZE;
            if cx.thread().spt.contains(page_addr) || cx.thread().page_dir.is_present(page_addr) {
                // Overlaps an existing mapping; undo what we've installed
                // so far and fail.
                for installed in &pages {
                    cx.thread().spt.remove(*installed);
                }
                return FAIL;
            }
            let file_offset = i as u64 * page_size;
            let read_bytes = ((length - file_offset).min(page_size)) as usize;
            cx.thread().spt.insert(
                page_addr,
                Spte {
                    kind: PageKind::Mmap,
                    file: Some(backing.clone()),
                    file_offset,
                    read_bytes,
                    zero_bytes: crate::param::PAGE_SIZE - read_bytes,
                    writable: true,
                    residency: Residency::OnFile,
                },
            );
            pages.push(page_addr);
        }

        let mapping = Mapping {
            inode_sector: file.inode.sector(),
            pages,
        };
        self.processes.add_mapping(cx.thread_id(), mapping) as isize
    }

    /// `munmap(id)`: writes back every dirty page of the
    /// mapping and removes it from the address space.
    pub fn munmap(&self, cx: &KernelCtx, id: MapId) {
        if let Some(mapping) = self.processes.remove_mapping(cx.thread_id(), id) {
            self.unmap_pages(cx, &mapping);
        }
    }

    fn unmap_pages(&self, cx: &KernelCtx, mapping: &Mapping) {
        for &page in &mapping.pages {
            if cx.thread().page_dir.is_present(page) {
                if cx.thread().page_dir.dirty(page) {
                    if let Some(kernel_addr) = cx.thread().page_dir.kernel_addr(page) {
                        let bytes = self.frames.read_bytes(kernel_addr);
                        cx.thread().spt.with_entry(page, |s| {
                            if let Some(file) = &s.file {
                                file.write_at(&bytes[..s.read_bytes], s.file_offset);
                            }
                        });
                    }
                }
                cx.thread().page_dir.unmap(page);
            }
            cx.thread().spt.remove(page);
        }
    }
}
