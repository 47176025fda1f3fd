//! Page-fault handler & loader.

use crate::device::BlockDevice;
use crate::param::{PAGE_SIZE, PUSHA_SLACK, STACK_FLOOR, USER_TOP};
use crate::thread::Thread;
use crate::vm::frame::FrameTable;
use crate::vm::spt::{PageKind, Residency, Spte, VirtAddr};

/// What the caller (the syscall/trap boundary) should do after a fault.
#[derive(Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    Resolved,
    /// The offending process must be terminated; carries a reason for
    /// logging.
    Terminate(&'static str),
}

fn page_align(addr: VirtAddr) -> VirtAddr {
    addr & !(PAGE_SIZE - 1)
}

/// Is `fault_addr` a legitimate stack-growth access relative to the
/// faulting stack pointer `esp`?
fn is_legitimate_stack_growth(fault_addr: VirtAddr, esp: VirtAddr) -> bool {
    fault_addr + PUSHA_SLACK >= esp && fault_addr > STACK_FLOOR && fault_addr < USER_TOP
}

/// Handles a page fault for `thread` at `fault_addr`, with `esp` the
/// faulting stack pointer and `present` true iff the page was already
/// mapped (i.e. this is a permission violation, not a missing mapping).
pub fn handle_fault<D: BlockDevice>(
    frames: &FrameTable<D>,
    thread: &Thread,
    fault_addr: VirtAddr,
    esp: VirtAddr,
    present: bool,
) -> FaultOutcome {
    if present {
        return FaultOutcome::Terminate("access violated page permissions");
    }

    let page_addr = page_align(fault_addr);

    if !thread.spt.contains(page_addr) {
        if !is_legitimate_stack_growth(fault_addr, esp) {
            return FaultOutcome::Terminate("unmapped address outside any known stack growth");
        }
        thread.spt.insert(
            page_addr,
            Spte {
                kind: PageKind::Stack,
                file: None,
                file_offset: 0,
                read_bytes: 0,
                zero_bytes: PAGE_SIZE,
                writable: true,
                residency: Residency::Loaded(0),
            },
        );
        let frame = frames.allocate(thread, page_addr, true);
        frames.write_bytes(frame.kernel_addr, &[], 0);
        thread
            .spt
            .with_entry(page_addr, |s| s.residency = Residency::Loaded(frame.kernel_addr));
        frame.unpin();
        return FaultOutcome::Resolved;
    }

    load_existing_entry(frames, thread, page_addr)
}

/// A known SPTE exists; materialize it into a frame from swap or from
/// its backing file.
fn load_existing_entry<D: BlockDevice>(
    frames: &FrameTable<D>,
    thread: &Thread,
    page_addr: VirtAddr,
) -> FaultOutcome {
    let (writable, from_swap) = match thread
        .spt
        .with_entry(page_addr, |s| (s.writable, s.swap_slot()))
    {
        Some(v) => v,
        None => return FaultOutcome::Terminate("SPTE vanished before fault could be serviced"),
    };

    let frame = frames.allocate(thread, page_addr, writable);
    let _eviction_guard = frames.lock_eviction();

    if let Some(slot) = from_swap {
        let mut page = [0u8; PAGE_SIZE];
        frames.swap().page_in(&mut page, slot);
        frames.write_bytes(frame.kernel_addr, &page, PAGE_SIZE);
    } else {
        let (file, file_offset, read_bytes, zero_bytes) = thread
            .spt
            .with_entry(page_addr, |s| (s.file.clone(), s.file_offset, s.read_bytes, s.zero_bytes))
            .expect("SPTE present above");
        let mut buf = vec![0u8; read_bytes];
        if let Some(file) = &file {
            file.read_at(&mut buf, file_offset);
        }
        frames.write_bytes(frame.kernel_addr, &buf, read_bytes + zero_bytes);
    }

    thread
        .spt
        .with_entry(page_addr, |s| s.residency = Residency::Loaded(frame.kernel_addr));
    frame.unpin();
    FaultOutcome::Resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use crate::param::SECTORS_PER_PAGE;
    use crate::thread::new_thread_shared;
    use crate::vm::swap::SwapArea;
    use std::sync::Arc;

    fn frames(num: usize) -> FrameTable<MemBlockDevice> {
        let swap = Arc::new(SwapArea::new(MemBlockDevice::new(4 * SECTORS_PER_PAGE)));
        FrameTable::new(num, swap)
    }

    #[test]
    fn stack_growth_within_slack_succeeds() {
        let table = frames(2);
        let t = new_thread_shared(1, "t", 31);
        let esp = STACK_FLOOR + 10 * PAGE_SIZE;
        let fault_addr = esp - 4;
        let outcome = handle_fault(&table, &t, fault_addr, esp, false);
        assert_eq!(outcome, FaultOutcome::Resolved);
        assert!(t.spt.contains(page_align(fault_addr)));
    }

    #[test]
    fn stack_growth_far_below_esp_is_rejected() {
        let table = frames(2);
        let t = new_thread_shared(1, "t", 31);
        let esp = STACK_FLOOR + 10 * PAGE_SIZE;
        let fault_addr = esp - PUSHA_SLACK - 1;
        let outcome = handle_fault(&table, &t, fault_addr, esp, false);
        assert_eq!(
            outcome,
            FaultOutcome::Terminate("unmapped address outside any known stack growth")
        );
    }

    #[test]
    fn present_page_fault_is_a_rights_violation() {
        let table = frames(2);
        let t = new_thread_shared(1, "t", 31);
        let outcome = handle_fault(&table, &t, 0x4000, 0x4000, true);
        assert_eq!(outcome, FaultOutcome::Terminate("access violated page permissions"));
    }

    #[test]
    fn swapped_entry_reloads_through_swap_area() {
        let table = frames(1);
        let t = new_thread_shared(1, "t", 31);
        let esp = STACK_FLOOR + 10 * PAGE_SIZE;
        let fault_addr = esp - 4;
        handle_fault(&table, &t, fault_addr, esp, false);
        let page_addr = page_align(fault_addr);
        let kernel_addr = t.spt.with_entry(page_addr, |s| match s.residency {
            Residency::Loaded(k) => k,
            _ => panic!("expected loaded"),
        }).unwrap();
        table.write_bytes(kernel_addr, &[0x42; PAGE_SIZE], PAGE_SIZE);

        // Force eviction by allocating a second stack page with only one
        // physical frame available.
        let other = esp - PAGE_SIZE - 4;
        handle_fault(&table, &t, other, esp, false);

        let outcome = handle_fault(&table, &t, fault_addr, esp, false);
        assert_eq!(outcome, FaultOutcome::Resolved);
    }
}
