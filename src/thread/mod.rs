//! Threads.
//!
//! Each kernel thread here is a real host OS thread that spends almost
//! all of its life parked on its own condition variable, woken only
//! when the scheduler hands it the baton. At most one thread's OS
//! thread is ever unparked at a time, which gives us the single-CPU,
//! no-parallel-kernel-code invariant without needing real interrupts.

pub mod scheduler;

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::fixed_point::Fixed;
use crate::param::{NICE_DEFAULT, PRI_DEFAULT};
use crate::sync::semaphore::Semaphore;
use crate::vm::{PageDirectory, SupplementalPageTable};

/// Identifies a thread for its whole lifetime. Never reused.
pub type ThreadId = u64;

/// Identifies a lock, for the donation-chain bookkeeping: the list of
/// locks a thread currently holds, and the lock it is waiting on.
/// Kept as a plain integer rather than a pointer so the cyclic
/// thread-lock-thread structure has no pointer cycle in memory.
pub type LockId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Ready,
    Blocked,
    Dying,
}

/// What the baton-holding mechanism is doing right now, for one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Baton {
    /// Parked, waiting to be handed the baton.
    Parked,
    /// Has the baton; may run kernel code.
    Holding,
    /// Told to exit instead of running again (used to unpark a thread that
    /// is being torn down without giving it real work to do).
    Exit,
}

/// The thread control block.
pub struct ThreadShared {
    pub id: ThreadId,
    pub name: String,
    pub base_priority: AtomicU32,
    pub nice: AtomicI32,
    pub recent_cpu: Mutex<Fixed>,
    pub state: Mutex<ThreadState>,
    pub wake_at: Mutex<Option<u64>>,
    /// Locks currently held, in acquisition order.
    pub locks_held: Mutex<Vec<(LockId, Arc<crate::sync::lock::LockState>)>>,
    /// The lock this thread is blocked waiting to acquire, if any.
    pub lock_waiton: Mutex<Option<(LockId, Arc<crate::sync::lock::LockState>)>>,
    /// Per-thread wait semaphore used by `sleep` and made
    /// available generally as the primitive a thread parks on while
    /// blocked in a wait list it was pushed onto itself.
    pub wait_channel: Semaphore,
    /// This thread's address space: a per-process page directory and
    /// supplemental page table. One kernel thread is treated as one
    /// process for addressing purposes in this hosted kernel.
    pub page_dir: PageDirectory,
    pub spt: SupplementalPageTable,
    /// Sector of this thread's current working directory's inode, or
    /// `None` if it has never called `chdir`. Path resolution treats
    /// that the same as an absolute path: start at root.
    pub cwd: Mutex<Option<u32>>,
    /// Ticks the thread has run for in its current quantum (MLFQ + plain
    /// round robin preemption bookkeeping).
    ticks_in_slice: AtomicU32,
    is_idle: AtomicBool,
    baton: (Mutex<Baton>, Condvar),
}

pub type Thread = Arc<ThreadShared>;

impl ThreadShared {
    /// Effective priority: `max(base, max donated
    /// priority over held locks)`.
    pub fn effective_priority(&self) -> u32 {
        let base = self.base_priority.load(Ordering::SeqCst);
        let locks = self.locks_held.lock().unwrap();
        locks
            .iter()
            .map(|(_, lock)| lock.donated_priority())
            .fold(base, u32::max)
    }

    pub fn state(&self) -> ThreadState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, s: ThreadState) {
        *self.state.lock().unwrap() = s;
    }

    fn park_until_baton(&self) -> bool {
        let (lock, cvar) = &self.baton;
        let mut guard = lock.lock().unwrap();
        while *guard == Baton::Parked {
            guard = cvar.wait(guard).unwrap();
        }
        *guard == Baton::Holding
    }

    fn hand_baton(&self) {
        let (lock, cvar) = &self.baton;
        let mut guard = lock.lock().unwrap();
        *guard = Baton::Holding;
        cvar.notify_one();
    }

    fn request_exit(&self) {
        let (lock, cvar) = &self.baton;
        let mut guard = lock.lock().unwrap();
        *guard = Baton::Exit;
        cvar.notify_one();
    }

    fn reset_baton(&self) {
        let (lock, _cvar) = &self.baton;
        *lock.lock().unwrap() = Baton::Parked;
    }

    /// Current working directory's inode sector, if `chdir` has ever been
    /// called on this thread.
    pub fn cwd(&self) -> Option<u32> {
        *self.cwd.lock().unwrap()
    }

    pub fn set_cwd(&self, sector: u32) {
        *self.cwd.lock().unwrap() = Some(sector);
    }

    pub fn nice(&self) -> i32 {
        self.nice.load(Ordering::SeqCst)
    }

    pub(crate) fn set_nice(&self, n: i32) {
        self.nice.store(n, Ordering::SeqCst);
    }

    pub(crate) fn recent_cpu(&self) -> Fixed {
        *self.recent_cpu.lock().unwrap()
    }

    pub(crate) fn set_recent_cpu(&self, v: Fixed) {
        *self.recent_cpu.lock().unwrap() = v;
    }

    pub(crate) fn set_base_priority(&self, p: u32) {
        self.base_priority.store(p, Ordering::SeqCst);
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.is_idle.load(Ordering::SeqCst)
    }

    /// Whether this thread is being torn down (state == Dying).
    pub fn is_dying(&self) -> bool {
        self.state() == ThreadState::Dying
    }

    pub(crate) fn mark_idle(&self) {
        self.is_idle.store(true, Ordering::SeqCst);
    }

    /// Advances this thread's time-slice tick count by one, returning the
    /// new count. Used by the tick handler to decide round-robin/MLFQ
    /// preemption.
    pub(crate) fn bump_quantum(&self) -> u32 {
        self.ticks_in_slice.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn reset_quantum(&self) {
        self.ticks_in_slice.store(0, Ordering::SeqCst);
    }

    /// `recent_cpu += 1`, applied to the running thread once per tick in
    /// MLFQ mode.
    pub(crate) fn bump_recent_cpu(&self) {
        let mut rc = self.recent_cpu.lock().unwrap();
        *rc = rc.add_int(1);
    }
}

/// A handle passed to code running as the current thread, bundling the
/// thread's own control block with the scheduler it's registered in.
#[derive(Clone)]
pub struct KernelCtx {
    pub(crate) thread: Thread,
    pub(crate) scheduler: Arc<scheduler::Scheduler>,
}

impl KernelCtx {
    pub fn thread_id(&self) -> ThreadId {
        self.thread.id
    }

    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    pub fn scheduler(&self) -> &Arc<scheduler::Scheduler> {
        &self.scheduler
    }

    /// Gives up the CPU for one scheduling round.
    pub fn yield_cpu(&self) {
        self.scheduler.yield_now(&self.thread);
    }

    /// Puts the thread to sleep for `n_ticks` timer ticks.
    pub fn sleep(&self, n_ticks: u64) {
        self.scheduler.sleep(self, n_ticks);
    }
}

/// Creates a fresh thread control block. Does not register it with any
/// scheduler; use [`scheduler::Scheduler::spawn`] for that.
pub(crate) fn new_thread_shared(id: ThreadId, name: &str, priority: u32) -> Thread {
    assert!(
        name.len() <= 15,
        "thread name must be at most 15 bytes"
    );
    Arc::new(ThreadShared {
        id,
        name: name.to_string(),
        base_priority: AtomicU32::new(priority),
        nice: AtomicI32::new(NICE_DEFAULT),
        recent_cpu: Mutex::new(Fixed::ZERO),
        state: Mutex::new(ThreadState::Blocked),
        wake_at: Mutex::new(None),
        locks_held: Mutex::new(Vec::new()),
        lock_waiton: Mutex::new(None),
        wait_channel: Semaphore::new_raw(0),
        page_dir: PageDirectory::new(),
        spt: SupplementalPageTable::new(),
        cwd: Mutex::new(None),
        ticks_in_slice: AtomicU32::new(0),
        is_idle: AtomicBool::new(false),
        baton: (Mutex::new(Baton::Parked), Condvar::new()),
    })
}

pub(crate) fn default_priority() -> u32 {
    PRI_DEFAULT
}
