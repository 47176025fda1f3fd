//! Swap area: page-sized groups of sectors on a dedicated
//! block device, bitmap-allocated.

use spin::Mutex;

use crate::device::BlockDevice;
use crate::param::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};

/// A swap slot index, identifying one `sectors_per_page`-sector group.
pub type SlotId = usize;

struct SwapState {
    /// One bit per slot; set = occupied.
    used: Vec<bool>,
}

/// Bitmap-allocated page-sized regions on a block device.
/// If no slot is available on `page_out`, the kernel panics — swap
/// exhaustion is a [`crate::error::KernelError::StorageExhaustion`] with
/// a panic policy rather than a recoverable error.
pub struct SwapArea<D> {
    device: D,
    state: Mutex<SwapState>,
}

impl<D: BlockDevice> SwapArea<D> {
    pub fn new(device: D) -> Self {
        let num_slots = device.size() / SECTORS_PER_PAGE;
        Self {
            device,
            state: Mutex::new(SwapState {
                used: vec![false; num_slots],
            }),
        }
    }

    pub fn num_slots(&self) -> usize {
        self.state.lock().used.len()
    }

    pub fn slots_in_use(&self) -> usize {
        self.state.lock().used.iter().filter(|b| **b).count()
    }

    /// Finds the first free slot, marks it used, and writes `frame` (one
    /// page's worth of bytes) to it group-by-group. Panics if the swap
    /// area is full.
    pub fn page_out(&self, frame: &[u8]) -> SlotId {
        assert_eq!(frame.len(), PAGE_SIZE, "page_out needs exactly one page");
        let slot = {
            let mut state = self.state.lock();
            let slot = state
                .used
                .iter()
                .position(|used| !used)
                .unwrap_or_else(|| panic!("swap area exhausted"));
            state.used[slot] = true;
            slot
        };
        for (i, chunk) in frame.chunks(SECTOR_SIZE).enumerate() {
            let sector = (slot * SECTORS_PER_PAGE + i) as u32;
            self.device.write(sector, chunk);
        }
        slot
    }

    /// Reads the page held in `slot` back into `kernel_addr` (which must be
    /// exactly one page long) and frees the slot.
    pub fn page_in(&self, kernel_addr: &mut [u8], slot: SlotId) {
        assert_eq!(kernel_addr.len(), PAGE_SIZE, "page_in needs exactly one page");
        {
            let mut state = self.state.lock();
            assert!(state.used[slot], "page_in on a free swap slot");
            state.used[slot] = false;
        }
        for (i, chunk) in kernel_addr.chunks_mut(SECTOR_SIZE).enumerate() {
            let sector = (slot * SECTORS_PER_PAGE + i) as u32;
            self.device.read(sector, chunk);
        }
    }

    /// Frees `slot` without reading it back, used when an
    /// SPTE or thread that owned swapped-out data is torn down.
    pub fn free(&self, slot: SlotId) {
        let mut state = self.state.lock();
        assert!(state.used[slot], "double free of swap slot {slot}");
        state.used[slot] = false;
    }
}
