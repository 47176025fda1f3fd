//! Compile-time constants that fix the on-disk format and basic sizing.
//!
//! On-disk layout constants (sector size, inode geometry, directory entry
//! geometry) are `const` because they are wire-format invariants: changing
//! them at runtime would make existing disk images unreadable. Everything
//! that is a matter of taste rather than format (frame count, scheduler
//! mode, flush interval) lives in [`KernelConfig`] instead.

/// Bytes per disk sector. Fixed by the external block-device interface.
pub const SECTOR_SIZE: usize = 512;

/// Bytes per virtual-memory page.
pub const PAGE_SIZE: usize = 4096;

/// Sectors needed to hold one page, used by the swap area's bitmap grain.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// Number of direct block pointers in an on-disk inode.
pub const NUM_DIRECT: usize = 100;

/// Number of single-indirect block pointers in an on-disk inode.
pub const NUM_INDIRECT: usize = 24;

/// Number of double-indirect block pointers in an on-disk inode.
pub const NUM_DOUBLE_INDIRECT: usize = 1;

/// Number of block indices that fit in one index block.
pub const INDEX_BLOCK_SIZE: usize = 128;

/// Maximum bytes in a file, derived from the geometry above.
pub const MAX_FILE_SECTORS: usize = NUM_DIRECT
    + NUM_INDIRECT * INDEX_BLOCK_SIZE
    + NUM_DOUBLE_INDIRECT * INDEX_BLOCK_SIZE * INDEX_BLOCK_SIZE;

/// Maximum bytes in a file name component.
pub const NAME_MAX: usize = 14;

/// Fixed sector holding the root directory inode.
pub const ROOT_DIR_SECTOR: u32 = 0;

/// Fixed sector holding the free-map inode.
pub const FREE_MAP_SECTOR: u32 = 1;

/// First sector available for general allocation (inodes, data, indices).
pub const FIRST_DATA_SECTOR: u32 = 2;

/// On-disk inode magic number, asserted on every read.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Number of slots in the buffer cache.
pub const CACHE_SIZE: usize = 64;

/// Ticks between automatic write-behind flushes of the buffer cache.
pub const FLUSH_INTERVAL_TICKS: u64 = 30 * TIMER_FREQ_DEFAULT;

/// Lowest thread priority.
pub const PRI_MIN: u32 = 0;

/// Highest thread priority.
pub const PRI_MAX: u32 = 63;

/// Default thread priority for newly created threads.
pub const PRI_DEFAULT: u32 = 31;

/// Lowest nice value (MLFQ mode).
pub const NICE_MIN: i32 = -20;

/// Highest nice value (MLFQ mode).
pub const NICE_MAX: i32 = 20;

/// Default nice value.
pub const NICE_DEFAULT: i32 = 0;

/// Number of ticks in one thread quantum before a preemptive yield is
/// requested.
pub const TIME_SLICE_TICKS: u64 = 4;

/// Default timer frequency in Hz.
pub const TIMER_FREQ_DEFAULT: u64 = 100;

/// Lowest legal address a user stack may grow down to.
pub const STACK_FLOOR: usize = 0x0020_0000;

/// Top of user address space (exclusive).
pub const USER_TOP: usize = 0xc000_0000;

/// `esp - PUSHA_SLACK` is still a plausible stack-growth fault address.
pub const PUSHA_SLACK: usize = 32;

/// Runtime-tunable kernel configuration. A bare-metal boot loader would
/// set most of these from command-line flags; a hosted test harness or
/// demo binary builds this struct directly instead.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    /// Number of physical frames available to the frame table.
    /// Deliberately small in tests so eviction is exercised.
    pub num_frames: usize,
    /// Timer frequency in Hz. Must satisfy `19 <= timer_freq <= 1000`.
    pub timer_freq: u64,
    /// Whether the scheduler runs in MLFQ mode or plain
    /// fixed-priority round robin.
    pub mlfq: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            num_frames: 256,
            timer_freq: TIMER_FREQ_DEFAULT,
            mlfq: cfg!(feature = "mlfq"),
        }
    }
}

impl KernelConfig {
    /// Validates that the timer frequency is within the allowed range.
    pub fn validate(&self) -> Result<(), crate::error::KernelError> {
        if !(19..=1000).contains(&self.timer_freq) {
            return Err(crate::error::KernelError::AssertionViolation(
                "timer_freq out of the 19..=1000 Hz range",
            ));
        }
        Ok(())
    }
}
