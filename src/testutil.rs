//! Test-only scaffolding for running code that needs a live [`KernelCtx`] —
//! most of the synchronization, cache, and scheduler surface can only be
//! exercised from inside a scheduled kernel thread.

#![cfg(test)]

use std::sync::mpsc;
use std::sync::Arc;

use crate::param::KernelConfig;
use crate::thread::scheduler::Scheduler;
use crate::thread::KernelCtx;

/// Spawns a kernel thread, runs `f` inside it, and blocks the calling test
/// thread until it returns, propagating `f`'s result back out.
pub fn run_in_kernel_thread<F, R>(f: F) -> R
where
    F: FnOnce(&KernelCtx) -> R + Send + 'static,
    R: Send + 'static,
{
    let scheduler = Scheduler::new(KernelConfig::default());
    let (tx, rx) = mpsc::channel();
    scheduler.spawn("test", crate::param::PRI_DEFAULT, move |cx| {
        let result = f(cx);
        let _ = tx.send(result);
    });
    rx.recv().expect("kernel thread did not send a result")
}

/// Like [`run_in_kernel_thread`] but gives the closure the scheduler handle
/// too, for tests that spawn more than one cooperating thread.
pub fn run_with_scheduler<F, R>(f: F) -> R
where
    F: FnOnce(Arc<Scheduler>) -> R,
{
    let scheduler = Scheduler::new(KernelConfig::default());
    f(scheduler)
}
