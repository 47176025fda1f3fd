//! A process's page directory plus the hardware accessed/dirty bits a
//! real MMU would carry per PTE. Hosted as a plain map rather than real
//! page tables; the frame evictor only ever needs "is this address mapped,
//! and has it been touched".

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::vm::spt::VirtAddr;

struct Pte {
    kernel_addr: usize,
    writable: bool,
    accessed: AtomicBool,
    dirty: AtomicBool,
}

/// A map from user virtual page to the physical frame presently backing
/// it, with per-entry accessed/dirty bits standing in for the MMU's.
pub struct PageDirectory {
    entries: Mutex<HashMap<VirtAddr, Pte>>,
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDirectory {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn map(&self, addr: VirtAddr, kernel_addr: usize, writable: bool) {
        self.entries.lock().unwrap().insert(
            addr,
            Pte {
                kernel_addr,
                writable,
                accessed: AtomicBool::new(false),
                dirty: AtomicBool::new(false),
            },
        );
    }

    pub fn unmap(&self, addr: VirtAddr) {
        self.entries.lock().unwrap().remove(&addr);
    }

    pub fn is_present(&self, addr: VirtAddr) -> bool {
        self.entries.lock().unwrap().contains_key(&addr)
    }

    pub fn kernel_addr(&self, addr: VirtAddr) -> Option<usize> {
        self.entries
            .lock()
            .unwrap()
            .get(&addr)
            .map(|pte| pte.kernel_addr)
    }

    pub fn is_writable(&self, addr: VirtAddr) -> Option<bool> {
        self.entries
            .lock()
            .unwrap()
            .get(&addr)
            .map(|pte| pte.writable)
    }

    /// Simulates a hardware memory access, setting the accessed bit (and
    /// the dirty bit, for writes).
    pub fn touch(&self, addr: VirtAddr, write: bool) {
        let entries = self.entries.lock().unwrap();
        if let Some(pte) = entries.get(&addr) {
            pte.accessed.store(true, Ordering::SeqCst);
            if write {
                pte.dirty.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn accessed(&self, addr: VirtAddr) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(&addr)
            .map(|pte| pte.accessed.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn clear_accessed(&self, addr: VirtAddr) {
        let entries = self.entries.lock().unwrap();
        if let Some(pte) = entries.get(&addr) {
            pte.accessed.store(false, Ordering::SeqCst);
        }
    }

    pub fn dirty(&self, addr: VirtAddr) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(&addr)
            .map(|pte| pte.dirty.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn clear_dirty(&self, addr: VirtAddr) {
        let entries = self.entries.lock().unwrap();
        if let Some(pte) = entries.get(&addr) {
            pte.dirty.store(false, Ordering::SeqCst);
        }
    }
}
