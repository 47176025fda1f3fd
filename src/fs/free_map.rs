//! Free-sector map: a persistent bitmap of free disk
//! sectors, one bit per sector, stored in the sectors immediately
//! following [`FREE_MAP_SECTOR`].
//!
//! Bootstrapped directly over the cache rather than through the inode
//! layer, since it writes its bitmap with raw sector I/O before any
//! inode exists to own it.

use std::sync::Arc;

use crate::device::{BlockDevice, SectorId};
use crate::error::KernelError;
use crate::fs::cache::Cache;
use crate::param::{FREE_MAP_SECTOR, SECTOR_SIZE};
use crate::sync::Lock;
use crate::thread::KernelCtx;

struct FreeMapState {
    /// One bit per sector on the filesystem device, word-packed.
    bits: Vec<u64>,
    num_sectors: usize,
}

const BITS_PER_WORD: usize = 64;

impl FreeMapState {
    fn is_set(&self, sector: usize) -> bool {
        self.bits[sector / BITS_PER_WORD] & (1 << (sector % BITS_PER_WORD)) != 0
    }

    fn set(&mut self, sector: usize, used: bool) {
        let word = &mut self.bits[sector / BITS_PER_WORD];
        if used {
            *word |= 1 << (sector % BITS_PER_WORD);
        } else {
            *word &= !(1 << (sector % BITS_PER_WORD));
        }
    }
}

/// How many sectors the bitmap itself occupies once serialized, for
/// `num_sectors` total sectors on the device.
fn bitmap_sector_span(num_sectors: usize) -> usize {
    let total_bytes = (num_sectors + 7) / 8;
    (total_bytes + SECTOR_SIZE - 1) / SECTOR_SIZE
}

/// Persistent bitmap of free sectors on the filesystem device. One
/// mutex serializes every operation, giving the free-map a single
/// global lock.
pub struct FreeMap<D> {
    cache: Arc<Cache<D>>,
    state: Lock<FreeMapState>,
}

impl<D: BlockDevice> FreeMap<D> {
    /// Reads the map from its backing sectors. If
    /// `format` is set, the map is reset instead: every sector is marked
    /// free except the ones the map itself and the root directory occupy.
    pub fn open(cache: Arc<Cache<D>>, cx: &KernelCtx, format: bool) -> Self {
        let num_sectors = cache.device().size();
        let span = bitmap_sector_span(num_sectors);
        let mut bits = vec![0u64; (num_sectors + BITS_PER_WORD - 1) / BITS_PER_WORD];

        if format {
            let reserved = FREE_MAP_SECTOR as usize + span;
            for sector in 0..reserved.min(num_sectors) {
                bits[sector / BITS_PER_WORD] |= 1 << (sector % BITS_PER_WORD);
            }
        } else {
            let mut raw = vec![0u8; span * SECTOR_SIZE];
            for (i, chunk) in raw.chunks_mut(SECTOR_SIZE).enumerate() {
                cache.read_full(cx, FREE_MAP_SECTOR + i as u32, chunk);
            }
            for (i, word) in bits.iter_mut().enumerate() {
                let start = i * 8;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&raw[start..start + 8]);
                *word = u64::from_le_bytes(buf);
            }
        }

        let map = Self {
            cache,
            state: Lock::new("free-map", FreeMapState { bits, num_sectors }),
        };
        if format {
            map.persist(cx);
        }
        map
    }

    /// Finds `n` contiguous free sectors and marks them used. `n` is
    /// always 1 at every call site in this kernel, but the search is
    /// written generally.
    pub fn allocate(&self, cx: &KernelCtx, n: usize) -> Result<SectorId, KernelError> {
        let mut state = self.state.acquire(cx);
        let mut run_start = None;
        let mut run_len = 0;
        for sector in 0..state.num_sectors {
            if !state.is_set(sector) {
                if run_start.is_none() {
                    run_start = Some(sector);
                }
                run_len += 1;
                if run_len == n {
                    let start = run_start.unwrap();
                    for s in start..start + n {
                        state.set(s, true);
                    }
                    drop(state);
                    self.persist(cx);
                    return Ok(start as SectorId);
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        Err(KernelError::StorageExhaustion("free-map: no contiguous run of free sectors"))
    }

    /// Clears `n` sectors starting at `start`.
    pub fn release(&self, cx: &KernelCtx, start: SectorId, n: usize) {
        {
            let mut state = self.state.acquire(cx);
            for s in start as usize..start as usize + n {
                assert!(state.is_set(s), "double release of free-map sector {s}");
                state.set(s, false);
            }
        }
        self.persist(cx);
    }

    pub fn sectors_free(&self, cx: &KernelCtx) -> usize {
        let state = self.state.acquire(cx);
        (0..state.num_sectors).filter(|s| !state.is_set(*s)).count()
    }

    /// Writes the bitmap back to its backing sectors.
    pub fn persist(&self, cx: &KernelCtx) {
        let state = self.state.acquire(cx);
        let span = bitmap_sector_span(state.num_sectors);
        let mut raw = vec![0u8; span * SECTOR_SIZE];
        for (i, word) in state.bits.iter().enumerate() {
            raw[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
        }
        drop(state);
        for (i, chunk) in raw.chunks(SECTOR_SIZE).enumerate() {
            self.cache.write_full(cx, FREE_MAP_SECTOR + i as u32, chunk);
        }
    }

    /// Flushes the map and releases it.
    pub fn close(&self, cx: &KernelCtx) {
        self.persist(cx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use crate::testutil::run_in_kernel_thread;

    fn cache(sectors: usize) -> Arc<Cache<MemBlockDevice>> {
        Arc::new(Cache::new(MemBlockDevice::new(sectors)))
    }

    #[test]
    fn allocate_then_release_makes_sector_reusable_again() {
        run_in_kernel_thread(|cx| {
            let map = FreeMap::open(cache(64), cx, true);
            let first_free = map.sectors_free(cx);
            let s = map.allocate(cx, 1).unwrap();
            assert_eq!(map.sectors_free(cx), first_free - 1);
            map.release(cx, s, 1);
            assert_eq!(map.sectors_free(cx), first_free);
        });
    }

    #[test]
    fn format_reserves_the_map_and_root_sectors() {
        run_in_kernel_thread(|cx| {
            let map = FreeMap::open(cache(64), cx, true);
            let first = map.allocate(cx, 1).unwrap();
            assert!(first as usize >= crate::param::FIRST_DATA_SECTOR as usize);
        });
    }

    #[test]
    fn exhausted_map_returns_storage_exhaustion() {
        run_in_kernel_thread(|cx| {
            let map = FreeMap::open(cache(4), cx, true);
            loop {
                if map.allocate(cx, 1).is_err() {
                    break;
                }
            }
            assert!(matches!(
                map.allocate(cx, 1),
                Err(KernelError::StorageExhaustion(_))
            ));
        });
    }

    #[test]
    fn reopen_without_format_reads_back_the_persisted_bitmap() {
        run_in_kernel_thread(|cx| {
            let dev = cache(64);
            let s = {
                let map = FreeMap::open(dev.clone(), cx, true);
                let s = map.allocate(cx, 1).unwrap();
                map.close(cx);
                s
            };
            let reopened = FreeMap::open(dev, cx, false);
            // The sector allocated before closing must still show used.
            let before = reopened.sectors_free(cx);
            reopened.release(cx, s, 1);
            assert_eq!(reopened.sectors_free(cx), before + 1);
        });
    }
}
