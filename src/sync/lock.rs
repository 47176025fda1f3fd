//! Lock with priority donation.
//!
//! A small scheduler-aware [`LockState`] handles acquisition and
//! donation, and the generic [`Lock<T>`] wraps it around a `T` the same
//! way a spinlock wraps its raw state.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use crate::param::PRI_MIN;
use crate::sync::semaphore::Semaphore;
use crate::thread::{KernelCtx, LockId, Thread};

/// The donation bookkeeping for one lock, shared between the [`Lock<T>`]
/// that owns it and every thread that currently holds it (via
/// `ThreadShared::locks_held`), so that `effective_priority()` can read a
/// lock's donated priority without re-entering the lock itself.
pub struct LockState {
    pub id: LockId,
    pub name: &'static str,
    holder: Mutex<Option<Thread>>,
    donated_priority: Mutex<u32>,
    sema: Semaphore,
}

impl LockState {
    pub fn donated_priority(&self) -> u32 {
        *self.donated_priority.lock().unwrap()
    }

    fn raise_donated(&self, priority: u32) {
        let mut dp = self.donated_priority.lock().unwrap();
        if priority > *dp {
            *dp = priority;
        }
    }

    fn recompute_donated(&self) {
        let highest = self.sema.peek_highest_waiter_priority();
        *self.donated_priority.lock().unwrap() = highest.unwrap_or(PRI_MIN);
    }

    pub fn holder(&self) -> Option<Thread> {
        self.holder.lock().unwrap().clone()
    }
}

/// Walks `lock -> lock.holder -> holder.lock_waiton -> ...`, raising every
/// lock's donated priority along the chain. Each holder found along the
/// way has its effective priority bumped by the raised donation; if that
/// holder is currently Ready rather than Running or Blocked, it must be
/// moved to the ready queue matching its new effective priority, since the
/// scheduler picks purely by queue index and never re-reads a thread's
/// priority once it is sitting in a queue.
fn donate_chain(cx: &KernelCtx, start: &Arc<LockState>, priority: u32) {
    let mut current = start.clone();
    loop {
        current.raise_donated(priority);
        let holder = match current.holder() {
            Some(h) => h,
            None => break,
        };
        cx.scheduler().requeue_for_new_priority(&holder);
        let next = holder.lock_waiton.lock().unwrap().clone();
        match next {
            Some((_, next_lock)) => current = next_lock,
            None => break,
        }
    }
}

static NEXT_LOCK_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// A mutual-exclusion lock that owns `T` and participates in priority
/// donation. No recursive acquisition.
pub struct Lock<T> {
    pub(crate) state: Arc<LockState>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Lock<T> {}
unsafe impl<T: Send> Sync for Lock<T> {}

pub struct LockGuard<'a, T> {
    lock: &'a Lock<T>,
    cx: &'a KernelCtx,
}

impl<T> Lock<T> {
    pub fn new(name: &'static str, data: T) -> Self {
        let id = NEXT_LOCK_ID.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Self {
            state: Arc::new(LockState {
                id,
                name,
                holder: Mutex::new(None),
                donated_priority: Mutex::new(PRI_MIN),
                sema: Semaphore::new(1),
            }),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock, donating the caller's effective priority along
    /// the blocking chain first.
    pub fn acquire<'a>(&'a self, cx: &'a KernelCtx) -> LockGuard<'a, T> {
        assert!(
            self.state.holder().map(|h| h.id) != Some(cx.thread_id()),
            "thread {} tried to acquire lock {} it already holds",
            cx.thread_id(),
            self.state.name
        );

        let my_priority = cx.thread().effective_priority();
        if self.state.holder().is_some() {
            donate_chain(cx, &self.state, my_priority);
        }
        *cx.thread().lock_waiton.lock().unwrap() = Some((self.state.id, self.state.clone()));
        self.state.sema.down(cx);
        *cx.thread().lock_waiton.lock().unwrap() = None;

        *self.state.holder.lock().unwrap() = Some(cx.thread().clone());
        cx.thread()
            .locks_held
            .lock()
            .unwrap()
            .push((self.state.id, self.state.clone()));

        LockGuard { lock: self, cx }
    }

    pub fn try_acquire<'a>(&'a self, cx: &'a KernelCtx) -> Option<LockGuard<'a, T>> {
        if !self.state.sema.try_down() {
            return None;
        }
        *self.state.holder.lock().unwrap() = Some(cx.thread().clone());
        cx.thread()
            .locks_held
            .lock()
            .unwrap()
            .push((self.state.id, self.state.clone()));
        Some(LockGuard { lock: self, cx })
    }

    pub fn holding(&self, cx: &KernelCtx) -> bool {
        self.state.holder().map(|h| h.id) == Some(cx.thread_id())
    }

    fn release(&self, cx: &KernelCtx) {
        assert!(
            self.holding(cx),
            "thread {} released lock {} it did not hold",
            cx.thread_id(),
            self.state.name
        );
        cx.thread()
            .locks_held
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != self.state.id);
        *self.state.holder.lock().unwrap() = None;
        self.state.sema.up(cx);
        self.state.recompute_donated();
    }
}

impl<'a, T> LockGuard<'a, T> {
    /// Exposes the guard's context and owning lock so [`super::condvar::Condvar`]
    /// can release and later re-acquire the same lock around a wait.
    pub(crate) fn cx(&self) -> &'a KernelCtx {
        self.cx
    }

    pub(crate) fn lock(&self) -> &'a Lock<T> {
        self.lock
    }
}

impl<'a, T> Deref for LockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for LockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for LockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release(self.cx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{run_in_kernel_thread, run_with_scheduler};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn spin_until(mut cond: impl FnMut() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(
                start.elapsed() < Duration::from_secs(5),
                "condition did not become true in time"
            );
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn try_acquire_fails_while_another_thread_holds_it() {
        let lock: Arc<Lock<u32>> = Arc::new(Lock::new("t", 0));
        let held = lock.clone();
        run_in_kernel_thread(move |cx| {
            let _guard = held.acquire(cx);
            assert!(lock.try_acquire(cx).is_none());
        });
    }

    #[test]
    #[should_panic(expected = "already holds")]
    fn acquiring_a_lock_the_caller_already_holds_panics() {
        run_in_kernel_thread(|cx| {
            let lock = Lock::new("t", 0);
            let _g1 = lock.acquire(cx);
            let _g2 = lock.acquire(cx);
        });
    }

    #[test]
    #[should_panic(expected = "did not hold")]
    fn releasing_a_lock_nobody_holds_panics() {
        run_in_kernel_thread(|cx| {
            let lock = Lock::new("t", 0);
            lock.release(cx);
        });
    }

    #[test]
    fn two_threads_serialize_through_the_same_lock() {
        run_with_scheduler(|scheduler| {
            let lock: Arc<Lock<u32>> = Arc::new(Lock::new("counter", 0));
            let (tx, rx) = mpsc::channel();

            for _ in 0..2 {
                let lock = lock.clone();
                let tx = tx.clone();
                scheduler.spawn("bumper", crate::param::PRI_DEFAULT, move |cx| {
                    for _ in 0..100 {
                        let mut guard = lock.acquire(cx);
                        *guard += 1;
                        cx.yield_cpu();
                    }
                    let _ = tx.send(());
                });
            }
            rx.recv().unwrap();
            rx.recv().unwrap();
            assert_eq!(*lock.acquire_for_test(), 200);
        });
    }

    impl<T> Lock<T> {
        fn acquire_for_test(&self) -> &T {
            unsafe { &*self.data.get() }
        }
    }

    /// A low-priority thread holding a lock a higher-priority thread
    /// needs has its effective priority
    /// raised to the highest priority anywhere in the blocking chain, and
    /// loses the boost the instant it releases the lock.
    #[test]
    fn donation_raises_effective_priority_along_the_whole_chain() {
        run_with_scheduler(|scheduler| {
            let lock_a: Arc<Lock<()>> = Arc::new(Lock::new("A", ()));
            let lock_b: Arc<Lock<()>> = Arc::new(Lock::new("B", ()));
            let (order_tx, order_rx) = mpsc::channel::<&'static str>();

            let (l_holds_a_tx, l_holds_a_rx) = mpsc::channel::<()>();
            let (release_l_tx, release_l_rx) = mpsc::channel::<()>();
            let a_for_l = lock_a.clone();
            let order_tx_l = order_tx.clone();
            let low = scheduler.clone().spawn("low", 20, move |cx| {
                let guard = a_for_l.acquire(cx);
                l_holds_a_tx.send(()).unwrap();
                while release_l_rx.try_recv().is_err() {
                    cx.yield_cpu();
                }
                order_tx_l.send("low").unwrap();
                drop(guard);
            });
            l_holds_a_rx.recv().unwrap();
            assert_eq!(low.effective_priority(), 20);

            let (m_holds_b_tx, m_holds_b_rx) = mpsc::channel::<()>();
            let a_for_m = lock_a.clone();
            let b_for_m = lock_b.clone();
            let order_tx_m = order_tx.clone();
            scheduler.clone().spawn("mid", 31, move |cx| {
                let guard_b = b_for_m.acquire(cx);
                m_holds_b_tx.send(()).unwrap();
                let guard_a = a_for_m.acquire(cx);
                order_tx_m.send("mid").unwrap();
                drop(guard_a);
                drop(guard_b);
            });
            m_holds_b_rx.recv().unwrap();
            spin_until(|| low.effective_priority() == 31);

            let b_for_h = lock_b.clone();
            scheduler.clone().spawn("high", 40, move |cx| {
                let guard_b = b_for_h.acquire(cx);
                order_tx.send("high").unwrap();
                drop(guard_b);
            });
            spin_until(|| low.effective_priority() == 40);

            release_l_tx.send(()).unwrap();

            assert_eq!(order_rx.recv().unwrap(), "low");
            assert_eq!(order_rx.recv().unwrap(), "mid");
            assert_eq!(order_rx.recv().unwrap(), "high");
        });
    }
}
