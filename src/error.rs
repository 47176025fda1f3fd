//! Error taxonomy.
//!
//! These are kinds, not a one-to-one mapping of every failure site. Each
//! variant's doc comment states its propagation policy; callers match on
//! the kind to decide whether to return a failure sentinel to user code or
//! let the assertion bubble up as a panic.

use thiserror::Error;

/// The kernel-wide error type. Syscall-facing code converts this into the
/// per-call failure sentinel (`-1`, `false`, `0`); it never reaches a user
/// program as a Rust panic except for [`KernelError::AssertionViolation`],
/// a kernel-panic condition.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Unmapped user pointer, pointer into kernel space, oversized name,
    /// negative size, empty name on create. Policy: terminate the
    /// offending process with status -1.
    #[error("faulty user argument: {0}")]
    FaultyUserArgument(&'static str),

    /// Out of frames, out of file descriptors, allocator failure. Policy:
    /// for frames, evict and retry (handled internally, this variant is
    /// only surfaced if retry also fails); for fds/allocation, return a
    /// failure sentinel.
    #[error("transient allocation failure: {0}")]
    TransientAllocation(&'static str),

    /// Free-map exhausted on extend, or swap exhausted. Policy: free-map
    /// exhaustion propagates as a short write; swap exhaustion panics the
    /// kernel (see [`KernelError::AssertionViolation`] call sites in
    /// `vm::swap`).
    #[error("storage exhausted: {0}")]
    StorageExhaustion(&'static str),

    /// Duplicate directory entry, removed inode, wait on a non-child, or
    /// similar expected-but-illegal operation. Policy: return a failure
    /// sentinel; do not terminate the caller.
    #[error("logical conflict: {0}")]
    LogicalConflict(&'static str),

    /// Broken invariant: releasing a lock you don't hold, a cache entry
    /// marked dirty but not valid, a double free. Policy: kernel panic.
    /// Carried as a value (rather than panicking immediately) only so unit
    /// tests can assert that the check fires; non-test call sites should
    /// use `expect`/`panic!` directly instead.
    #[error("assertion violated: {0}")]
    AssertionViolation(&'static str),
}

impl KernelError {
    /// The syscall-boundary failure sentinel for calls that return `isize`.
    pub const SYSCALL_FAIL: isize = -1;
}
