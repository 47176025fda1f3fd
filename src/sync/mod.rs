//! Synchronization primitives, all built on the scheduler's
//! baton hand-off (`thread::scheduler`) instead of hardware interrupts.
//!
//! Every primitive here distinguishes two kinds of "wake" call: a normal
//! one made by a scheduled kernel thread (which may immediately yield to a
//! just-woken higher-priority thread) and one made from "interrupt
//! context" — in this hosted edition, the timer tick handler — which only
//! readies the woken thread and leaves the actual yield for the next
//! natural scheduling point instead.

pub mod condvar;
pub mod lock;
pub mod rwlock;
pub mod semaphore;

pub use condvar::Condvar;
pub use lock::Lock;
pub use rwlock::RwLock;
pub use semaphore::Semaphore;
