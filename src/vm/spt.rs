//! Supplemental page table: per-thread map from user virtual
//! page to where its data currently lives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::vm::swap::SlotId;

/// A user virtual address, always page-aligned when used as an SPT key.
pub type VirtAddr = usize;

/// Anything an SPTE can read from / write back to on eviction or removal —
/// implemented by the file-system's open-file object. Kept as a trait here
/// (rather than a direct dependency on `crate::fs`) so the VM subsystem
/// doesn't need to know about inodes, only about "a byte range I can read
/// and write".
pub trait BackingFile: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;
    fn write_at(&self, buf: &[u8], offset: u64) -> usize;
}

/// Closed tagged variant of page kinds: no trait object needed, since
/// eviction-time behavior is decided by a plain match on the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Code,
    Data,
    Stack,
    Mmap,
}

/// Where an SPTE's bytes currently live. Exactly one of {loaded to a
/// frame, resident in swap, still on its backing file} holds at any
/// time.
#[derive(Clone)]
pub enum Residency {
    /// Not yet loaded; materialize from `file` (or zero-fill if none).
    OnFile,
    /// Currently mapped at a frame's kernel address.
    Loaded(usize),
    /// Written out to swap.
    Swapped(SlotId),
}

pub struct Spte {
    pub kind: PageKind,
    pub file: Option<Arc<dyn BackingFile>>,
    pub file_offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
    pub writable: bool,
    pub residency: Residency,
}

impl Spte {
    pub fn is_loaded(&self) -> bool {
        matches!(self.residency, Residency::Loaded(_))
    }

    pub fn swap_slot(&self) -> Option<SlotId> {
        match self.residency {
            Residency::Swapped(slot) => Some(slot),
            _ => None,
        }
    }
}

/// Per-thread supplemental page table: a hash keyed by page-aligned user
/// virtual address.
#[derive(Default)]
pub struct SupplementalPageTable {
    entries: Mutex<HashMap<VirtAddr, Spte>>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Records a fresh entry. Overwriting an existing mapping for the same
    /// address is a logic error in every caller of this kernel, so it
    /// panics rather than silently discarding state.
    pub fn insert(&self, addr: VirtAddr, entry: Spte) {
        let mut entries = self.entries.lock().unwrap();
        assert!(
            entries.insert(addr, entry).is_none(),
            "SPTE already exists for {addr:#x}"
        );
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.entries.lock().unwrap().contains_key(&addr)
    }

    pub fn with_entry<R>(&self, addr: VirtAddr, f: impl FnOnce(&mut Spte) -> R) -> Option<R> {
        let mut entries = self.entries.lock().unwrap();
        entries.get_mut(&addr).map(f)
    }

    /// Removes the entry for `addr`, freeing any swap slot it still owns
    /// (the caller is responsible for freeing the swap area itself via the
    /// returned slot, since the SPT doesn't hold a reference to the swap
    /// area).
    pub fn remove(&self, addr: VirtAddr) -> Option<Spte> {
        self.entries.lock().unwrap().remove(&addr)
    }

    /// Destruction on thread exit: returns every swap slot still owned
    /// by an entry so the caller can free them from the swap area.
    pub fn drain_swap_slots(&self) -> Vec<SlotId> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter_map(|e| e.swap_slot())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_entry(kind: PageKind) -> Spte {
        Spte {
            kind,
            file: None,
            file_offset: 0,
            read_bytes: 0,
            zero_bytes: crate::param::PAGE_SIZE,
            writable: true,
            residency: Residency::OnFile,
        }
    }

    #[test]
    fn insert_and_lookup() {
        let spt = SupplementalPageTable::new();
        spt.insert(0x1000, bare_entry(PageKind::Stack));
        assert!(spt.contains(0x1000));
        assert!(!spt.contains(0x2000));
    }

    #[test]
    #[should_panic(expected = "SPTE already exists")]
    fn double_insert_panics() {
        let spt = SupplementalPageTable::new();
        spt.insert(0x1000, bare_entry(PageKind::Data));
        spt.insert(0x1000, bare_entry(PageKind::Data));
    }

    #[test]
    fn drain_swap_slots_collects_only_swapped_entries() {
        let spt = SupplementalPageTable::new();
        let mut swapped = bare_entry(PageKind::Data);
        swapped.residency = Residency::Swapped(3);
        spt.insert(0x1000, swapped);
        spt.insert(0x2000, bare_entry(PageKind::Code));
        assert_eq!(spt.drain_swap_slots(), vec![3]);
    }
}
