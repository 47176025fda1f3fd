//! Virtual memory: supplemental page table, frame table with
//! second-chance eviction, swap area, and the page-fault handler that ties
//! file-backed, anonymous, stack, and mmap'd pages together with demand
//! loading.

pub mod fault;
pub mod frame;
pub mod pagedir;
pub mod spt;
pub mod swap;

pub use fault::{handle_fault, FaultOutcome};
pub use frame::{Frame, FrameTable};
pub use pagedir::PageDirectory;
pub use spt::{BackingFile, PageKind, Residency, Spte, SupplementalPageTable, VirtAddr};
