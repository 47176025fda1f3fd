//! External collaborators: the block device and timer device boundary. A
//! real kernel talks to a virtio disk and a PIT; a hosted build only ever
//! needs "fixed-size sector read/write" and "ticks fire at a known
//! frequency", so both are traits with in-memory fakes for tests and the
//! demo binary.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::KernelError;
use crate::param::SECTOR_SIZE;
use crate::thread::scheduler::Scheduler;

/// A disk sector number.
pub type SectorId = u32;

/// A fixed-sector-size block device. Two named instances of this trait
/// exist at the kernel level: the file-system device and the swap device.
pub trait BlockDevice: Send + Sync {
    /// Number of sectors this device exposes.
    fn size(&self) -> usize;

    /// Reads exactly one sector into `buf`. `buf` must be
    /// [`SECTOR_SIZE`] bytes.
    fn read(&self, sector: SectorId, buf: &mut [u8]);

    /// Writes exactly one sector from `buf`. `buf` must be
    /// [`SECTOR_SIZE`] bytes.
    fn write(&self, sector: SectorId, buf: &[u8]);
}

/// An in-memory block device backing tests and the demo binary. Also
/// counts reads and writes so tests can assert on cache hit-rate by
/// watching how much traffic actually reaches the device.
pub struct MemBlockDevice {
    sectors: spin::Mutex<Vec<[u8; SECTOR_SIZE]>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemBlockDevice {
    pub fn new(num_sectors: usize) -> Self {
        Self {
            sectors: spin::Mutex::new(vec![[0u8; SECTOR_SIZE]; num_sectors]),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl BlockDevice for MemBlockDevice {
    fn size(&self) -> usize {
        self.sectors.lock().len()
    }

    fn read(&self, sector: SectorId, buf: &mut [u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE, "short read buffer");
        let sectors = self.sectors.lock();
        let data = sectors
            .get(sector as usize)
            .unwrap_or_else(|| panic!("sector {sector} out of range"));
        buf.copy_from_slice(data);
        self.reads.fetch_add(1, Ordering::SeqCst);
    }

    fn write(&self, sector: SectorId, buf: &[u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE, "short write buffer");
        let mut sectors = self.sectors.lock();
        let data = sectors
            .get_mut(sector as usize)
            .unwrap_or_else(|| panic!("sector {sector} out of range"));
        data.copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

/// A periodic source of timer ticks: delivers interrupts at a
/// compile-time-configured `TIMER_FREQ` in Hz, with the constraint
/// `19 <= TIMER_FREQ <= 1000`. A bare-metal kernel gets this from the PIT;
/// a hosted build either spawns a real background ticker
/// ([`SimTimer::spawn`]) or, in tests, calls [`SimTimer::fire`] by hand so
/// scenarios are deterministic.
pub struct SimTimer {
    freq_hz: u64,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl SimTimer {
    pub fn new(freq_hz: u64) -> Result<Self, KernelError> {
        if !(19..=1000).contains(&freq_hz) {
            return Err(KernelError::AssertionViolation(
                "timer frequency must be in 19..=1000 Hz",
            ));
        }
        Ok(Self {
            freq_hz,
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        })
    }

    pub fn freq_hz(&self) -> u64 {
        self.freq_hz
    }

    /// Delivers one tick by hand, for deterministic scenarios that want
    /// to control exactly when the scheduler sees time pass.
    pub fn fire(&self, scheduler: &Arc<Scheduler>) {
        scheduler.tick();
    }

    /// Spawns a background thread that calls `scheduler.tick()` every
    /// `1/freq_hz` seconds, standing in for the hardware timer interrupt
    /// until [`SimTimer::stop`] is called.
    pub fn spawn(&self, scheduler: Arc<Scheduler>) {
        let stop = self.stop.clone();
        let period = Duration::from_secs_f64(1.0 / self.freq_hz as f64);
        let handle = std::thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    std::thread::sleep(period);
                    scheduler.tick();
                }
            })
            .expect("failed to spawn timer thread");
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Stops a timer previously started with [`SimTimer::spawn`] and waits
    /// for its background thread to exit. A no-op if it was never spawned.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{KernelConfig, PRI_DEFAULT};
    use std::sync::mpsc;

    #[test]
    fn fire_advances_the_scheduler_by_exactly_one_tick() {
        let scheduler = Scheduler::new(KernelConfig::default());
        let timer = SimTimer::new(100).unwrap();
        assert_eq!(scheduler.current_ticks(), 0);
        timer.fire(&scheduler);
        assert_eq!(scheduler.current_ticks(), 1);
        timer.fire(&scheduler);
        assert_eq!(scheduler.current_ticks(), 2);
    }

    #[test]
    fn spawned_timer_eventually_wakes_a_sleeping_thread() {
        let scheduler = Scheduler::new(KernelConfig::default());
        let timer = SimTimer::new(200).unwrap();
        timer.spawn(scheduler.clone());

        let (tx, rx) = mpsc::channel();
        scheduler.spawn("sleeper", PRI_DEFAULT, move |cx| {
            cx.sleep(3);
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(5))
            .expect("background timer should have woken the sleeper");
        timer.stop();
    }
}
