//! Buffer cache: a 64-slot write-back cache over the block
//! device, clock/second-chance eviction, asynchronous read-ahead, and a
//! periodic flush thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use log::trace;

use crate::device::{BlockDevice, SectorId};
use crate::param::{CACHE_SIZE, FLUSH_INTERVAL_TICKS, SECTOR_SIZE};
use crate::sync::{Condvar, Lock, RwLock};
use crate::thread::KernelCtx;

#[derive(Clone, Copy)]
struct EntryMeta {
    sector: Option<SectorId>,
    valid: bool,
    dirty: bool,
    accessed: bool,
    pinned: u32,
    /// Set while a slot is being fetched from or evicted to disk, so a
    /// concurrent `get` doesn't hand it out mid-transition.
    busy: bool,
}

impl EntryMeta {
    const EMPTY: EntryMeta = EntryMeta {
        sector: None,
        valid: false,
        dirty: false,
        accessed: false,
        pinned: 0,
        busy: false,
    };
}

struct Table {
    meta: Vec<EntryMeta>,
    clock_hand: usize,
}

/// A 64-slot write-back buffer cache. Every sector read or
/// write in the file system goes through this layer.
pub struct Cache<D> {
    device: D,
    slots: Vec<RwLock<[u8; SECTOR_SIZE]>>,
    table: Lock<Table>,
    slot_freed: Condvar,
    read_ahead_queue: Lock<VecDeque<SectorId>>,
    read_ahead_ready: Condvar,
    /// Hit/miss counters,
    /// independent of the fake device's own read counter since a real
    /// device has no way to tell the cache's callers it was bypassed.
    hits: AtomicU64,
    misses: AtomicU64,
}

enum GetOutcome {
    Hit(usize),
    /// Caller must load `sector` into this freshly-reserved slot.
    Miss(usize),
}

impl<D: BlockDevice> Cache<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            slots: (0..CACHE_SIZE)
                .map(|_| RwLock::new("cache-entry", [0u8; SECTOR_SIZE]))
                .collect(),
            table: Lock::new(
                "cache-table",
                Table {
                    meta: vec![EntryMeta::EMPTY; CACHE_SIZE],
                    clock_hand: 0,
                },
            ),
            slot_freed: Condvar::new(),
            read_ahead_queue: Lock::new("cache-read-ahead-queue", VecDeque::new()),
            read_ahead_ready: Condvar::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Returns the index of the slot holding `sector`, fetching it from
    /// disk on a miss.
    fn get(&self, cx: &KernelCtx, sector: SectorId) -> usize {
        loop {
            match self.find_or_reserve(cx, sector) {
                GetOutcome::Hit(idx) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return idx;
                }
                GetOutcome::Miss(idx) => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let mut buf = [0u8; SECTOR_SIZE];
                    self.device.read(sector, &mut buf);
                    {
                        let mut table = self.table.acquire(cx);
                        table.meta[idx] = EntryMeta {
                            sector: Some(sector),
                            valid: true,
                            dirty: false,
                            accessed: true,
                            pinned: 0,
                            busy: false,
                        };
                    }
                    *self.slots[idx].write(cx) = buf;
                    self.slot_freed.broadcast(cx);
                    self.enqueue_read_ahead(cx, sector + 1);
                    return idx;
                }
            }
        }
    }

    fn find_or_reserve(&self, cx: &KernelCtx, sector: SectorId) -> GetOutcome {
        loop {
            let mut table = self.table.acquire(cx);
            if let Some(idx) = table
                .meta
                .iter()
                .position(|m| m.valid && m.sector == Some(sector))
            {
                if table.meta[idx].busy {
                    let _ = self.slot_freed.wait(table);
                    continue;
                }
                table.meta[idx].accessed = true;
                return GetOutcome::Hit(idx);
            }
            if let Some(idx) = table.meta.iter().position(|m| !m.valid && !m.busy) {
                table.meta[idx].busy = true;
                return GetOutcome::Miss(idx);
            }
            match self.pick_victim_locked(&mut table) {
                Some(idx) => {
                    let victim = table.meta[idx];
                    table.meta[idx].busy = true;
                    drop(table);
                    if victim.dirty {
                        self.writeback(cx, idx, victim.sector.expect("dirty slot has a sector"));
                    }
                    let mut table = self.table.acquire(cx);
                    table.meta[idx] = EntryMeta {
                        busy: true,
                        ..EntryMeta::EMPTY
                    };
                    drop(table);
                    return GetOutcome::Miss(idx);
                }
                None => {
                    let _ = self.slot_freed.wait(table);
                }
            }
        }
    }

    /// Clock/second-chance victim selection. Must be called with the
    /// table lock held.
    fn pick_victim_locked(&self, table: &mut Table) -> Option<usize> {
        let n = table.meta.len();
        for _ in 0..(2 * n) {
            let idx = table.clock_hand;
            table.clock_hand = (table.clock_hand + 1) % n;
            let m = &mut table.meta[idx];
            if !m.valid || m.pinned > 0 || m.busy {
                continue;
            }
            if m.accessed {
                m.accessed = false;
                continue;
            }
            return Some(idx);
        }
        None
    }

    fn writeback(&self, cx: &KernelCtx, idx: usize, sector: SectorId) {
        let data = *self.slots[idx].read(cx);
        self.device.write(sector, &data);
        trace!("cache: wrote back sector {sector} from slot {idx}");
    }

    pub fn read_full(&self, cx: &KernelCtx, sector: SectorId, buf: &mut [u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE);
        let idx = self.get(cx, sector);
        buf.copy_from_slice(&*self.slots[idx].read(cx));
    }

    pub fn write_full(&self, cx: &KernelCtx, sector: SectorId, buf: &[u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE);
        let idx = self.get(cx, sector);
        let mut guard = self.slots[idx].write(cx);
        guard.copy_from_slice(buf);
        drop(guard);
        self.mark_dirty(cx, idx);
    }

    pub fn read_chunk(&self, cx: &KernelCtx, sector: SectorId, offset: usize, buf: &mut [u8]) {
        let idx = self.get(cx, sector);
        let guard = self.slots[idx].read(cx);
        buf.copy_from_slice(&guard[offset..offset + buf.len()]);
    }

    pub fn write_chunk(&self, cx: &KernelCtx, sector: SectorId, offset: usize, buf: &[u8]) {
        let idx = self.get(cx, sector);
        let mut guard = self.slots[idx].write(cx);
        guard[offset..offset + buf.len()].copy_from_slice(buf);
        drop(guard);
        self.mark_dirty(cx, idx);
    }

    fn mark_dirty(&self, cx: &KernelCtx, idx: usize) {
        let mut table = self.table.acquire(cx);
        table.meta[idx].dirty = true;
    }

    /// Walks all entries, writing back any that are dirty.
    pub fn flush(&self, cx: &KernelCtx) {
        for idx in 0..self.slots.len() {
            let sector = {
                let mut table = self.table.acquire(cx);
                let m = &table.meta[idx];
                if !m.valid || !m.dirty {
                    continue;
                }
                table.meta[idx].busy = true;
                m.sector.expect("dirty slot has a sector")
            };
            self.writeback(cx, idx, sector);
            let mut table = self.table.acquire(cx);
            table.meta[idx].dirty = false;
            table.meta[idx].busy = false;
        }
    }

    /// Obtains a raw pin on `sector`'s slot so callers may hold a
    /// reference into it across multiple operations without risking
    /// eviction.
    pub fn pin(&self, cx: &KernelCtx, sector: SectorId) -> usize {
        let idx = self.get(cx, sector);
        self.table.acquire(cx).meta[idx].pinned += 1;
        idx
    }

    pub fn unpin(&self, cx: &KernelCtx, idx: usize) {
        let mut table = self.table.acquire(cx);
        assert!(table.meta[idx].pinned > 0, "unpin of a non-pinned slot");
        table.meta[idx].pinned -= 1;
        if table.meta[idx].pinned == 0 {
            drop(table);
            self.slot_freed.broadcast(cx);
        }
    }

    /// Reads the full contents of a slot obtained from [`Cache::pin`].
    pub fn read_pinned(&self, cx: &KernelCtx, idx: usize) -> [u8; SECTOR_SIZE] {
        *self.slots[idx].read(cx)
    }

    /// Overwrites the full contents of a slot obtained from [`Cache::pin`].
    pub fn write_pinned(&self, cx: &KernelCtx, idx: usize, data: &[u8]) {
        self.slots[idx].write(cx).copy_from_slice(data);
        self.mark_dirty(cx, idx);
    }

    fn enqueue_read_ahead(&self, cx: &KernelCtx, sector: SectorId) {
        if (sector as usize) >= self.device.size() {
            return;
        }
        self.read_ahead_queue.acquire(cx).push_back(sector);
        self.read_ahead_ready.signal(cx);
    }

    /// Body of the dedicated read-ahead thread: pops a queued sector and
    /// fetches it if not already cached.
    pub fn run_read_ahead_once(&self, cx: &KernelCtx) {
        let sector = loop {
            let mut guard = self.read_ahead_queue.acquire(cx);
            if let Some(s) = guard.pop_front() {
                break s;
            }
            self.read_ahead_ready.wait(guard);
        };
        let already_cached = self
            .table
            .acquire(cx)
            .meta
            .iter()
            .any(|m| m.valid && m.sector == Some(sector));
        if !already_cached {
            self.get(cx, sector);
        }
    }

    /// Body of the dedicated write-behind thread: sleep, then flush,
    /// forever.
    pub fn run_flush_loop(&self, cx: &KernelCtx) -> ! {
        loop {
            cx.sleep(FLUSH_INTERVAL_TICKS);
            self.flush(cx);
        }
    }
}
