//! Counting semaphore.
//!
//! Invariant: the counter is zero whenever the wait list is non-empty.
//! Waiters are woken in order of effective priority at wake time, FIFO
//! among equals — see [`pop_highest`].

use std::sync::Mutex;

use crate::thread::scheduler::Scheduler;
use crate::thread::{KernelCtx, Thread};

struct SemInner {
    count: u64,
    waiters: Vec<Thread>,
}

pub struct Semaphore {
    inner: Mutex<SemInner>,
}

impl Semaphore {
    pub fn new(initial: u64) -> Self {
        Self {
            inner: Mutex::new(SemInner {
                count: initial,
                waiters: Vec::new(),
            }),
        }
    }

    /// Alias used where a semaphore must be constructed before a
    /// [`Scheduler`] handle exists to hand it (e.g. a thread's own wait
    /// channel, created as part of the thread control block itself).
    pub fn new_raw(initial: u64) -> Self {
        Self::new(initial)
    }

    pub fn value(&self) -> u64 {
        self.inner.lock().unwrap().count
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().unwrap().waiters.len()
    }

    /// "Down"/P: waits for the value to become positive, then decrements
    /// it. May block the calling kernel thread.
    pub fn down(&self, cx: &KernelCtx) {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.count > 0 {
                    inner.count -= 1;
                    return;
                }
                inner.waiters.push(cx.thread().clone());
            }
            cx.scheduler().block_current(cx.thread());
        }
    }

    /// Non-blocking variant; returns whether the semaphore was acquired.
    pub fn try_down(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.count > 0 {
            inner.count -= 1;
            true
        } else {
            false
        }
    }

    /// "Up"/V from a scheduled kernel thread: increments the value and, if
    /// a thread was waiting, wakes the highest-effective-priority one. If
    /// that waiter now outranks the caller, the caller yields before
    /// returning.
    pub fn up(&self, cx: &KernelCtx) {
        self.up_impl(cx.scheduler(), Some(cx.thread()));
    }

    /// "Up"/V from the timer tick handler. Readies the waiter but never
    /// forces an immediate yield — the yield happens on interrupt
    /// return instead.
    pub fn up_from_interrupt(&self, scheduler: &Scheduler) {
        self.up_impl(scheduler, None);
    }

    fn up_impl(&self, scheduler: &Scheduler, current: Option<&Thread>) {
        let popped = {
            let mut inner = self.inner.lock().unwrap();
            inner.count += 1;
            pop_highest(&mut inner.waiters)
        };
        if let Some(waiter) = popped {
            scheduler.unblock(&waiter, current);
        }
    }

    pub(crate) fn peek_highest_waiter_priority(&self) -> Option<u32> {
        let inner = self.inner.lock().unwrap();
        inner.waiters.iter().map(|t| t.effective_priority()).max()
    }
}

/// Removes and returns the waiter with the highest effective priority,
/// breaking ties in favor of whoever has been waiting longest (FIFO).
fn pop_highest(waiters: &mut Vec<Thread>) -> Option<Thread> {
    if waiters.is_empty() {
        return None;
    }
    let mut best_idx = 0;
    let mut best_pri = waiters[0].effective_priority();
    for (i, t) in waiters.iter().enumerate().skip(1) {
        let p = t.effective_priority();
        if p > best_pri {
            best_pri = p;
            best_idx = i;
        }
    }
    Some(waiters.remove(best_idx))
}
