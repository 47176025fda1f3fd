//! Process-level bookkeeping layered on top of a scheduled kernel
//! thread: file descriptors, memory mappings, child-process info
//! records, and exit status.
//!
//! Kept apart from [`crate::thread::ThreadShared`] rather than folded into
//! it: `ThreadShared` is shared, generic-free state the scheduler and VM
//! core (`thread`, `vm`, `sync`) operate on without ever knowing what block
//! device a filesystem is mounted over. File descriptors and memory
//! mappings, by contrast, name `Inode<D>` objects, so they live in their
//! own table keyed by [`ThreadId`] — a process's pid, since this hosted
//! kernel treats one kernel thread as one process. Whatever assembles a
//! full kernel (`syscall::Syscalls`) owns one [`ProcessTable`] alongside
//! the scheduler, frame table and mounted filesystem.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::device::SectorId;
use crate::fs::inode::Inode;
use crate::sync::semaphore::Semaphore;
use crate::thread::{KernelCtx, ThreadId};
use crate::vm::VirtAddr;

pub type Fd = i32;
/// Reserved for console input.
pub const FD_STDIN: Fd = 0;
/// Reserved for console output.
pub const FD_STDOUT: Fd = 1;
const FIRST_FD: Fd = 2;

pub type MapId = i32;

/// An open file or directory object. Opened files and directories share
/// one fd namespace per process.
pub struct OpenFile<D> {
    pub inode: Arc<Inode<D>>,
    pub is_dir: bool,
    pub position: Mutex<u64>,
    pub readdir_pos: Mutex<u64>,
}

impl<D> OpenFile<D> {
    fn new(inode: Arc<Inode<D>>, is_dir: bool) -> Self {
        Self {
            inode,
            is_dir,
            position: Mutex::new(0),
            readdir_pos: Mutex::new(0),
        }
    }

    pub fn tell(&self) -> u64 {
        *self.position.lock().unwrap()
    }

    pub fn seek(&self, pos: u64) {
        *self.position.lock().unwrap() = pos;
    }
}

/// One live `mmap` region: the page-aligned
/// user addresses it installed, so `munmap` can remove each SPTE and let
/// the ordinary eviction path in `vm::frame` write back any dirty ones.
pub struct Mapping {
    pub inode_sector: SectorId,
    pub pages: Vec<VirtAddr>,
}

/// A child process's completion record: the parent's `wait(pid)` blocks
/// on `done`, which a dying process signals to wake its parent. One
/// record per process, not per parent/child pair, since a process has
/// exactly one parent.
struct ChildRecord {
    done: Semaphore,
    exit_status: Mutex<Option<i32>>,
    /// A process may be waited for by its parent only once; a second
    /// `wait` on the same pid fails.
    waited: Mutex<bool>,
}

struct ProcessState<D> {
    files: HashMap<Fd, Arc<OpenFile<D>>>,
    next_fd: Fd,
    mappings: HashMap<MapId, Mapping>,
    next_mapid: MapId,
    children: Vec<ThreadId>,
}

impl<D> ProcessState<D> {
    fn new() -> Self {
        Self {
            files: HashMap::new(),
            next_fd: FIRST_FD,
            mappings: HashMap::new(),
            next_mapid: 0,
            children: Vec::new(),
        }
    }
}

struct Inner<D> {
    processes: HashMap<ThreadId, ProcessState<D>>,
    records: HashMap<ThreadId, Arc<ChildRecord>>,
}

/// The process table: per-pid file descriptors, memory mappings, and
/// parent/child exit-status bookkeeping.
pub struct ProcessTable<D> {
    inner: Mutex<Inner<D>>,
}

impl<D> Default for ProcessTable<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> ProcessTable<D> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                processes: HashMap::new(),
                records: HashMap::new(),
            }),
        }
    }

    /// Registers a freshly spawned process (root process or the product
    /// of `exec`). Must be called exactly once per pid before any other
    /// method is used with it.
    pub fn register(&self, pid: ThreadId, parent: Option<ThreadId>) {
        let mut inner = self.inner.lock().unwrap();
        inner.processes.insert(pid, ProcessState::new());
        inner.records.insert(
            pid,
            Arc::new(ChildRecord {
                done: Semaphore::new(0),
                exit_status: Mutex::new(None),
                waited: Mutex::new(false),
            }),
        );
        if let Some(parent) = parent {
            if let Some(state) = inner.processes.get_mut(&parent) {
                state.children.push(pid);
            }
        }
    }

    /// Opens `inode` for `pid`, returning the fd assigned. Fds start at
    /// 2 and increase monotonically.
    pub fn open(&self, pid: ThreadId, inode: Arc<Inode<D>>, is_dir: bool) -> Fd {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.processes.get_mut(&pid).expect("unknown pid");
        let fd = state.next_fd;
        state.next_fd += 1;
        state.files.insert(fd, Arc::new(OpenFile::new(inode, is_dir)));
        fd
    }

    pub fn get(&self, pid: ThreadId, fd: Fd) -> Option<Arc<OpenFile<D>>> {
        let inner = self.inner.lock().unwrap();
        inner.processes.get(&pid)?.files.get(&fd).cloned()
    }

    /// Closes `fd`, returning the inode it referenced so the caller can
    /// close it in the filesystem's inode table too.
    pub fn close(&self, pid: ThreadId, fd: Fd) -> Option<Arc<OpenFile<D>>> {
        let mut inner = self.inner.lock().unwrap();
        inner.processes.get_mut(&pid)?.files.remove(&fd)
    }

    /// Every still-open fd, for whole-process teardown on exit.
    pub fn drain_files(&self, pid: ThreadId) -> Vec<Arc<OpenFile<D>>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.processes.get_mut(&pid) {
            Some(state) => state.files.drain().map(|(_, f)| f).collect(),
            None => Vec::new(),
        }
    }

    pub fn add_mapping(&self, pid: ThreadId, mapping: Mapping) -> MapId {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.processes.get_mut(&pid).expect("unknown pid");
        let id = state.next_mapid;
        state.next_mapid += 1;
        state.mappings.insert(id, mapping);
        id
    }

    pub fn remove_mapping(&self, pid: ThreadId, id: MapId) -> Option<Mapping> {
        let mut inner = self.inner.lock().unwrap();
        inner.processes.get_mut(&pid)?.mappings.remove(&id)
    }

    /// Every still-live mapping, for whole-process teardown on exit.
    pub fn drain_mappings(&self, pid: ThreadId) -> Vec<Mapping> {
        let mut inner = self.inner.lock().unwrap();
        match inner.processes.get_mut(&pid) {
            Some(state) => state.mappings.drain().map(|(_, m)| m).collect(),
            None => Vec::new(),
        }
    }

    /// Records `pid`'s exit status and wakes anyone blocked in
    /// `wait(pid)`.
    pub fn exit(&self, cx: &KernelCtx, pid: ThreadId, status: i32) {
        let record = {
            let inner = self.inner.lock().unwrap();
            inner.records.get(&pid).cloned()
        };
        if let Some(record) = record {
            *record.exit_status.lock().unwrap() = Some(status);
            record.done.up(cx);
        }
    }

    /// `wait(pid)`: blocks until `pid` — which must be a
    /// live or already-exited child of `parent` — exits, then returns its
    /// status. Fails (returns `None`) if `pid` is not `parent`'s child or
    /// has already been waited for.
    pub fn wait(&self, cx: &KernelCtx, parent: ThreadId, pid: ThreadId) -> Option<i32> {
        let record = {
            let mut inner = self.inner.lock().unwrap();
            let state = inner.processes.get_mut(&parent)?;
            let idx = state.children.iter().position(|&c| c == pid)?;
            state.children.remove(idx);
            inner.records.get(&pid).cloned()?
        };
        {
            let mut waited = record.waited.lock().unwrap();
            if *waited {
                return None;
            }
            *waited = true;
        }
        record.done.down(cx);
        *record.exit_status.lock().unwrap()
    }

    /// Forgets `pid`'s bookkeeping entirely (used once a process has both
    /// exited and been reaped, or never had a parent to wait for it — the
    /// root process at kernel teardown).
    pub fn forget(&self, pid: ThreadId) {
        let mut inner = self.inner.lock().unwrap();
        inner.processes.remove(&pid);
        inner.records.remove(&pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use crate::testutil::run_with_scheduler;

    #[test]
    fn wait_blocks_until_child_exits_and_returns_its_status() {
        run_with_scheduler(|scheduler| {
            let table: Arc<ProcessTable<MemBlockDevice>> = Arc::new(ProcessTable::new());
            table.register(1, None);
            table.register(2, Some(1));

            let child_table = table.clone();
            scheduler.clone().spawn("child", 31, move |cx| {
                child_table.exit(cx, 2, 7);
            });

            let parent_table = table.clone();
            let (tx, rx) = std::sync::mpsc::channel();
            scheduler.spawn("parent", 31, move |cx| {
                let status = parent_table.wait(cx, 1, 2);
                let _ = tx.send(status);
            });
            assert_eq!(rx.recv().unwrap(), Some(7));
        });
    }

    #[test]
    fn waiting_for_a_non_child_fails() {
        run_with_scheduler(|scheduler| {
            let table: Arc<ProcessTable<MemBlockDevice>> = Arc::new(ProcessTable::new());
            table.register(1, None);
            table.register(2, None);

            let t = table.clone();
            let (tx, rx) = std::sync::mpsc::channel();
            scheduler.spawn("parent", 31, move |cx| {
                let status = t.wait(cx, 1, 2);
                let _ = tx.send(status);
            });
            assert_eq!(rx.recv().unwrap(), None);
        });
    }

    #[test]
    fn waiting_twice_for_the_same_child_fails_the_second_time() {
        run_with_scheduler(|scheduler| {
            let table: Arc<ProcessTable<MemBlockDevice>> = Arc::new(ProcessTable::new());
            table.register(1, None);
            table.register(2, Some(1));

            let child_table = table.clone();
            scheduler.clone().spawn("child", 31, move |cx| {
                child_table.exit(cx, 2, 0);
            });

            let t = table.clone();
            let (tx, rx) = std::sync::mpsc::channel();
            scheduler.spawn("parent", 31, move |cx| {
                let first = t.wait(cx, 1, 2);
                let second = t.wait(cx, 1, 2);
                let _ = tx.send((first, second));
            });
            assert_eq!(rx.recv().unwrap(), (Some(0), None));
        });
    }
}
