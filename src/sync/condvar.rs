//! Condition variable, Mesa-style: no atomic hand-off,
//! a woken waiter just re-acquires the lock and re-checks its condition.

use std::sync::{Arc, Mutex};

use crate::sync::lock::LockGuard;
use crate::sync::semaphore::Semaphore;
use crate::thread::{KernelCtx, Thread};

pub struct Condvar {
    waiters: Mutex<Vec<(Thread, Arc<Semaphore>)>>,
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl Condvar {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Releases `guard`'s lock, blocks until signaled, then re-acquires
    /// the same lock and returns a fresh guard. Mesa semantics: callers
    /// must re-check their wait condition in a loop.
    pub fn wait<'a, T>(&self, guard: LockGuard<'a, T>) -> LockGuard<'a, T> {
        let cx = guard.cx();
        let lock = guard.lock();
        let waiter_sema = Arc::new(Semaphore::new(0));
        {
            let mut waiters = self.waiters.lock().unwrap();
            waiters.push((cx.thread().clone(), waiter_sema.clone()));
        }
        drop(guard);
        waiter_sema.down(cx);
        lock.acquire(cx)
    }

    /// Wakes the waiter with the highest effective priority, if any.
    pub fn signal(&self, cx: &KernelCtx) {
        let popped = {
            let mut waiters = self.waiters.lock().unwrap();
            pop_highest(&mut waiters)
        };
        if let Some((_, sema)) = popped {
            sema.up(cx);
        }
    }

    /// Signals every waiter.
    pub fn broadcast(&self, cx: &KernelCtx) {
        loop {
            let empty = self.waiters.lock().unwrap().is_empty();
            if empty {
                break;
            }
            self.signal(cx);
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}

fn pop_highest(waiters: &mut Vec<(Thread, Arc<Semaphore>)>) -> Option<(Thread, Arc<Semaphore>)> {
    if waiters.is_empty() {
        return None;
    }
    let mut best_idx = 0;
    let mut best_pri = waiters[0].0.effective_priority();
    for (i, (t, _)) in waiters.iter().enumerate().skip(1) {
        let p = t.effective_priority();
        if p > best_pri {
            best_pri = p;
            best_idx = i;
        }
    }
    Some(waiters.remove(best_idx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::lock::Lock;
    use crate::testutil::run_with_scheduler;
    use std::sync::mpsc;

    /// Classic bounded-queue-style wait: a consumer blocks on the condvar
    /// until a producer both fills the shared cell and signals it, then
    /// re-checks its condition in a loop (Mesa semantics).
    #[test]
    fn wait_blocks_until_signaled_and_rechecks_its_condition() {
        run_with_scheduler(|scheduler| {
            let lock = Arc::new(Lock::new("cell", None::<u32>));
            let cv = Arc::new(Condvar::new());
            let (tx, rx) = mpsc::channel();

            let l = lock.clone();
            let c = cv.clone();
            scheduler.spawn("consumer", crate::param::PRI_DEFAULT, move |cx| {
                let mut guard = l.acquire(cx);
                while guard.is_none() {
                    guard = c.wait(guard);
                }
                let _ = tx.send(guard.unwrap());
            });

            let l = lock.clone();
            let c = cv.clone();
            scheduler.spawn("producer", crate::param::PRI_DEFAULT, move |cx| {
                let mut guard = l.acquire(cx);
                *guard = Some(42);
                drop(guard);
                c.signal(cx);
            });

            assert_eq!(rx.recv().unwrap(), 42);
        });
    }

    #[test]
    fn broadcast_wakes_every_waiter() {
        run_with_scheduler(|scheduler| {
            let lock = Arc::new(Lock::new("cell", false));
            let cv = Arc::new(Condvar::new());
            let (tx, rx) = mpsc::channel();

            for _ in 0..3 {
                let l = lock.clone();
                let c = cv.clone();
                let tx = tx.clone();
                scheduler.spawn("waiter", crate::param::PRI_DEFAULT, move |cx| {
                    let mut guard = l.acquire(cx);
                    while !*guard {
                        guard = c.wait(guard);
                    }
                    let _ = tx.send(());
                });
            }
            while cv.waiter_count() < 3 {
                std::thread::yield_now();
            }

            let l = lock.clone();
            let c = cv.clone();
            scheduler.spawn("waker", crate::param::PRI_DEFAULT, move |cx| {
                let mut guard = l.acquire(cx);
                *guard = true;
                drop(guard);
                c.broadcast(cx);
            });

            rx.recv().unwrap();
            rx.recv().unwrap();
            rx.recv().unwrap();
        });
    }
}
