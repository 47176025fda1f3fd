//! Indexed inodes: direct / single-indirect / double-indirect
//! block addressing, sparse growth under an extension lock, and reference
//! counted in-memory inodes shared across every opener of the same sector.

use std::collections::HashMap;
use std::sync::Arc;

use zerocopy::{AsBytes, FromBytes};

use crate::device::{BlockDevice, SectorId};
use crate::error::KernelError;
use crate::fs::cache::Cache;
use crate::fs::free_map::FreeMap;
use crate::param::{
    INDEX_BLOCK_SIZE, INODE_MAGIC, NUM_DIRECT, NUM_DOUBLE_INDIRECT, NUM_INDIRECT, SECTOR_SIZE,
};
use crate::sync::Lock;
use crate::thread::KernelCtx;

/// On-disk inode: must be exactly [`SECTOR_SIZE`] bytes.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct DiskInode {
    length: u32,
    direct: [u32; NUM_DIRECT],
    indirect: [u32; NUM_INDIRECT],
    double_indirect: [u32; NUM_DOUBLE_INDIRECT],
    is_dir: u8,
    _pad: [u8; 3],
    magic: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<DiskInode>(), SECTOR_SIZE);

fn bytes_to_sectors(size: usize) -> usize {
    (size + SECTOR_SIZE - 1) / SECTOR_SIZE
}

fn read_index_entry<D: BlockDevice>(
    cache: &Cache<D>,
    cx: &KernelCtx,
    index_sector: SectorId,
    pos: usize,
) -> SectorId {
    let mut buf = [0u8; 4];
    cache.read_chunk(cx, index_sector, pos * 4, &mut buf);
    u32::from_le_bytes(buf)
}

fn write_index_entry<D: BlockDevice>(
    cache: &Cache<D>,
    cx: &KernelCtx,
    index_sector: SectorId,
    pos: usize,
    value: SectorId,
) {
    cache.write_chunk(cx, index_sector, pos * 4, &value.to_le_bytes());
}

/// Resolves data-block index `index`. Callers
/// must only ask for an index already covered by the inode's allocated
/// sector count.
fn lookup_data_sector<D: BlockDevice>(
    cache: &Cache<D>,
    cx: &KernelCtx,
    disk: &DiskInode,
    index: usize,
) -> SectorId {
    if index < NUM_DIRECT {
        return disk.direct[index];
    }
    let single_span = NUM_INDIRECT * INDEX_BLOCK_SIZE;
    if index < NUM_DIRECT + single_span {
        let rel = index - NUM_DIRECT;
        let table_idx = rel / INDEX_BLOCK_SIZE;
        let pos = rel % INDEX_BLOCK_SIZE;
        return read_index_entry(cache, cx, disk.indirect[table_idx], pos);
    }
    let rel = index - NUM_DIRECT - single_span;
    let double_span = INDEX_BLOCK_SIZE * INDEX_BLOCK_SIZE;
    let table_idx = rel / double_span;
    let rel2 = rel % double_span;
    let first_idx = rel2 / INDEX_BLOCK_SIZE;
    let pos = rel2 % INDEX_BLOCK_SIZE;
    let first_sector = read_index_entry(cache, cx, disk.double_indirect[table_idx], first_idx);
    read_index_entry(cache, cx, first_sector, pos)
}

/// Allocates data indices `from..to` (sector-index space, not bytes),
/// creating whatever index blocks are needed along the way. Rolls back
/// everything it allocated if any single allocation fails partway
/// through, so a failed extension never leaves a half-grown inode.
fn grow<D: BlockDevice>(
    cache: &Cache<D>,
    free_map: &FreeMap<D>,
    cx: &KernelCtx,
    disk: &mut DiskInode,
    from: usize,
    to: usize,
) -> Result<(), KernelError> {
    let mut allocated: Vec<SectorId> = Vec::new();
    let result = try_grow(cache, free_map, cx, disk, from, to, &mut allocated);
    if result.is_err() {
        for sector in allocated {
            free_map.release(cx, sector, 1);
        }
    }
    result
}

fn try_grow<D: BlockDevice>(
    cache: &Cache<D>,
    free_map: &FreeMap<D>,
    cx: &KernelCtx,
    disk: &mut DiskInode,
    from: usize,
    to: usize,
    allocated: &mut Vec<SectorId>,
) -> Result<(), KernelError> {
    let single_span = NUM_INDIRECT * INDEX_BLOCK_SIZE;
    let double_span = INDEX_BLOCK_SIZE * INDEX_BLOCK_SIZE;

    for index in from..to {
        let data_sector = free_map.allocate(cx, 1)?;
        allocated.push(data_sector);
        cache.write_full(cx, data_sector, &[0u8; SECTOR_SIZE]);

        if index < NUM_DIRECT {
            disk.direct[index] = data_sector;
            continue;
        }

        if index < NUM_DIRECT + single_span {
            let rel = index - NUM_DIRECT;
            let table_idx = rel / INDEX_BLOCK_SIZE;
            let pos = rel % INDEX_BLOCK_SIZE;
            if pos == 0 {
                let idx_sector = free_map.allocate(cx, 1)?;
                allocated.push(idx_sector);
                cache.write_full(cx, idx_sector, &[0u8; SECTOR_SIZE]);
                disk.indirect[table_idx] = idx_sector;
            }
            write_index_entry(cache, cx, disk.indirect[table_idx], pos, data_sector);
            continue;
        }

        let rel = index - NUM_DIRECT - single_span;
        let table_idx = rel / double_span;
        let rel2 = rel % double_span;
        let first_idx = rel2 / INDEX_BLOCK_SIZE;
        let pos = rel2 % INDEX_BLOCK_SIZE;

        if first_idx == 0 && pos == 0 {
            let dbl_sector = free_map.allocate(cx, 1)?;
            allocated.push(dbl_sector);
            cache.write_full(cx, dbl_sector, &[0u8; SECTOR_SIZE]);
            disk.double_indirect[table_idx] = dbl_sector;
        }
        if pos == 0 {
            let idx_sector = free_map.allocate(cx, 1)?;
            allocated.push(idx_sector);
            cache.write_full(cx, idx_sector, &[0u8; SECTOR_SIZE]);
            write_index_entry(cache, cx, disk.double_indirect[table_idx], first_idx, idx_sector);
        }
        let first_sector = read_index_entry(cache, cx, disk.double_indirect[table_idx], first_idx);
        write_index_entry(cache, cx, first_sector, pos, data_sector);
    }
    Ok(())
}

/// Releases every sector an inode owns, including the index blocks that
/// address them.
fn free_all_blocks<D: BlockDevice>(
    cache: &Cache<D>,
    free_map: &FreeMap<D>,
    cx: &KernelCtx,
    disk: &DiskInode,
) {
    let sectors = bytes_to_sectors(disk.length as usize);
    let single_span = NUM_INDIRECT * INDEX_BLOCK_SIZE;
    let double_span = INDEX_BLOCK_SIZE * INDEX_BLOCK_SIZE;

    for index in 0..sectors {
        if index < NUM_DIRECT {
            free_map.release(cx, disk.direct[index], 1);
            continue;
        }
        if index < NUM_DIRECT + single_span {
            let rel = index - NUM_DIRECT;
            let table_idx = rel / INDEX_BLOCK_SIZE;
            let pos = rel % INDEX_BLOCK_SIZE;
            let data_sector = read_index_entry(cache, cx, disk.indirect[table_idx], pos);
            free_map.release(cx, data_sector, 1);
            if pos == INDEX_BLOCK_SIZE - 1 || index == sectors - 1 {
                free_map.release(cx, disk.indirect[table_idx], 1);
            }
            continue;
        }
        let rel = index - NUM_DIRECT - single_span;
        let table_idx = rel / double_span;
        let rel2 = rel % double_span;
        let first_idx = rel2 / INDEX_BLOCK_SIZE;
        let pos = rel2 % INDEX_BLOCK_SIZE;
        let first_sector = read_index_entry(cache, cx, disk.double_indirect[table_idx], first_idx);
        let data_sector = read_index_entry(cache, cx, first_sector, pos);
        free_map.release(cx, data_sector, 1);
        if pos == INDEX_BLOCK_SIZE - 1 || index == sectors - 1 {
            free_map.release(cx, first_sector, 1);
        }
        if index == sectors - 1 {
            free_map.release(cx, disk.double_indirect[table_idx], 1);
        }
    }
}

struct InodeMeta {
    open_count: u32,
    removed: bool,
    deny_write_count: u32,
}

/// An in-memory inode, shared by every
/// opener of the same on-disk sector.
pub struct Inode<D> {
    sector: SectorId,
    meta: Lock<InodeMeta>,
    extension_lock: Lock<()>,
    disk: Lock<DiskInode>,
    cache: Arc<Cache<D>>,
    free_map: Arc<FreeMap<D>>,
}

impl<D: BlockDevice> Inode<D> {
    pub fn sector(&self) -> SectorId {
        self.sector
    }

    pub fn length(&self, cx: &KernelCtx) -> u64 {
        self.disk.acquire(cx).length as u64
    }

    pub fn is_dir(&self, cx: &KernelCtx) -> bool {
        self.disk.acquire(cx).is_dir != 0
    }

    pub fn is_removed(&self, cx: &KernelCtx) -> bool {
        self.meta.acquire(cx).removed
    }

    /// Marks this inode for deletion once the last opener closes it.
    pub fn mark_removed(&self, cx: &KernelCtx) {
        self.meta.acquire(cx).removed = true;
    }

    pub fn deny_write(&self, cx: &KernelCtx) {
        let mut meta = self.meta.acquire(cx);
        meta.deny_write_count += 1;
        assert!(
            meta.deny_write_count <= meta.open_count,
            "deny_write_count exceeded open_count"
        );
    }

    pub fn allow_write(&self, cx: &KernelCtx) {
        let mut meta = self.meta.acquire(cx);
        assert!(meta.deny_write_count > 0, "allow_write without a matching deny_write");
        meta.deny_write_count -= 1;
    }

    /// Standard chunk-loop read.
    pub fn read_at(&self, cx: &KernelCtx, buf: &mut [u8], offset: u64) -> usize {
        let length = self.length(cx);
        let mut bytes_read = 0usize;
        while bytes_read < buf.len() {
            let pos = offset + bytes_read as u64;
            if pos >= length {
                break;
            }
            let index = (pos / SECTOR_SIZE as u64) as usize;
            let sector_ofs = (pos % SECTOR_SIZE as u64) as usize;
            let inode_left = (length - pos) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let want = buf.len() - bytes_read;
            let chunk = want.min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }
            let data_sector = {
                let disk = self.disk.acquire(cx);
                lookup_data_sector(&self.cache, cx, &disk, index)
            };
            self.cache
                .read_chunk(cx, data_sector, sector_ofs, &mut buf[bytes_read..bytes_read + chunk]);
            bytes_read += chunk;
        }
        bytes_read
    }

    /// `write_at`: extends under the
    /// extension-lock when writing past EOF, otherwise writes in place.
    pub fn write_at(&self, cx: &KernelCtx, buf: &[u8], offset: u64) -> usize {
        if self.meta.acquire(cx).deny_write_count > 0 {
            return 0;
        }
        let size = buf.len() as u64;
        let snapshot_length = self.length(cx);

        if offset >= snapshot_length {
            let _ext = self.extension_lock.acquire(cx);
            let length = self.length(cx);
            if offset >= length {
                let old_sectors = bytes_to_sectors(length as usize);
                let new_sectors = bytes_to_sectors((offset + size) as usize);
                if new_sectors > old_sectors {
                    let mut disk = self.disk.acquire(cx);
                    if grow(&self.cache, &self.free_map, cx, &mut disk, old_sectors, new_sectors).is_err() {
                        drop(disk);
                        // Free-map exhaustion on extend propagates as a
                        // short write, not process termination. `grow`
                        // already rolled back whatever it allocated.
                        return self.write_bounded(cx, buf, offset, length);
                    }
                }
                let new_length = offset + size;
                let written = self.write_bounded(cx, buf, offset, new_length);
                self.disk.acquire(cx).length = new_length as u32;
                return written;
            }
            // A racing writer already extended past us; fall through and
            // write bounded by the now-current length.
        }

        let length = self.length(cx);
        self.write_bounded(cx, buf, offset, length)
    }

    fn write_bounded(&self, cx: &KernelCtx, buf: &[u8], offset: u64, length: u64) -> usize {
        let mut bytes_written = 0usize;
        while bytes_written < buf.len() {
            let pos = offset + bytes_written as u64;
            if pos >= length {
                break;
            }
            let index = (pos / SECTOR_SIZE as u64) as usize;
            let sector_ofs = (pos % SECTOR_SIZE as u64) as usize;
            let inode_left = (length - pos) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let want = buf.len() - bytes_written;
            let chunk = want.min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }
            let data_sector = {
                let disk = self.disk.acquire(cx);
                lookup_data_sector(&self.cache, cx, &disk, index)
            };
            self.cache
                .write_chunk(cx, data_sector, sector_ofs, &buf[bytes_written..bytes_written + chunk]);
            bytes_written += chunk;
        }
        bytes_written
    }
}

/// The table of currently-open inodes: opening the same inode twice
/// returns the same in-memory object, reference-counted. Also the
/// entry points for creating and destroying inodes.
pub struct InodeTable<D> {
    open: Lock<HashMap<SectorId, Arc<Inode<D>>>>,
    cache: Arc<Cache<D>>,
    free_map: Arc<FreeMap<D>>,
}

impl<D: BlockDevice> InodeTable<D> {
    pub fn new(cache: Arc<Cache<D>>, free_map: Arc<FreeMap<D>>) -> Self {
        Self {
            open: Lock::new("inode-table", HashMap::new()),
            cache,
            free_map,
        }
    }

    /// Allocates a sector, builds a zeroed inode of `length` bytes on it,
    /// and persists it. Fully rolls back every
    /// sector reserved — including the inode's own — on failure.
    pub fn create(&self, cx: &KernelCtx, length: usize, is_dir: bool) -> Result<SectorId, KernelError> {
        let sector = self.free_map.allocate(cx, 1)?;
        let mut disk = DiskInode {
            length: 0,
            direct: [0; NUM_DIRECT],
            indirect: [0; NUM_INDIRECT],
            double_indirect: [0; NUM_DOUBLE_INDIRECT],
            is_dir: is_dir as u8,
            _pad: [0; 3],
            magic: INODE_MAGIC,
        };
        let sectors_needed = bytes_to_sectors(length);
        if let Err(e) = grow(&self.cache, &self.free_map, cx, &mut disk, 0, sectors_needed) {
            self.free_map.release(cx, sector, 1);
            return Err(e);
        }
        disk.length = length as u32;
        self.cache.write_full(cx, sector, disk.as_bytes());
        Ok(sector)
    }

    /// Builds a zeroed inode of `length` bytes directly on `sector`, which
    /// the caller is responsible for having already reserved (used only by
    /// filesystem formatting to plant the root directory on the fixed
    /// [`crate::param::ROOT_DIR_SECTOR`], which predates the free-map that
    /// would otherwise hand it out).
    pub fn create_at(&self, cx: &KernelCtx, sector: SectorId, length: usize, is_dir: bool) -> Result<(), KernelError> {
        let mut disk = DiskInode {
            length: 0,
            direct: [0; NUM_DIRECT],
            indirect: [0; NUM_INDIRECT],
            double_indirect: [0; NUM_DOUBLE_INDIRECT],
            is_dir: is_dir as u8,
            _pad: [0; 3],
            magic: INODE_MAGIC,
        };
        let sectors_needed = bytes_to_sectors(length);
        grow(&self.cache, &self.free_map, cx, &mut disk, 0, sectors_needed)?;
        disk.length = length as u32;
        self.cache.write_full(cx, sector, disk.as_bytes());
        Ok(())
    }

    /// Opens `sector`, returning the already-open in-memory inode if one
    /// exists.
    pub fn open(&self, cx: &KernelCtx, sector: SectorId) -> Arc<Inode<D>> {
        let mut table = self.open.acquire(cx);
        if let Some(existing) = table.get(&sector) {
            existing.meta.acquire(cx).open_count += 1;
            return existing.clone();
        }
        let mut raw = [0u8; SECTOR_SIZE];
        self.cache.read_full(cx, sector, &mut raw);
        let disk = DiskInode::read_from(&raw[..]).expect("buffer is exactly one sector");
        assert_eq!(disk.magic, INODE_MAGIC, "inode at sector {sector} has a bad magic number");

        let inode = Arc::new(Inode {
            sector,
            meta: Lock::new(
                "inode-meta",
                InodeMeta {
                    open_count: 1,
                    removed: false,
                    deny_write_count: 0,
                },
            ),
            extension_lock: Lock::new("inode-extension", ()),
            disk: Lock::new("inode-disk", disk),
            cache: self.cache.clone(),
            free_map: self.free_map.clone(),
        });
        table.insert(sector, inode.clone());
        inode
    }

    /// Closes one reference to `inode`, writing it back and, if this was
    /// the last opener of a removed inode, freeing its storage.
    pub fn close(&self, cx: &KernelCtx, inode: &Arc<Inode<D>>) {
        let sector = inode.sector;
        let (should_drop, removed) = {
            let mut meta = inode.meta.acquire(cx);
            meta.open_count -= 1;
            (meta.open_count == 0, meta.removed)
        };
        {
            let disk = inode.disk.acquire(cx);
            self.cache.write_full(cx, sector, disk.as_bytes());
        }
        if should_drop {
            self.open.acquire(cx).remove(&sector);
            if removed {
                let disk = inode.disk.acquire(cx);
                free_all_blocks(&self.cache, &self.free_map, cx, &disk);
                drop(disk);
                self.free_map.release(cx, sector, 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use crate::testutil::run_in_kernel_thread;

    fn table(cx: &KernelCtx, sectors: usize) -> InodeTable<MemBlockDevice> {
        let cache = Arc::new(Cache::new(MemBlockDevice::new(sectors)));
        let free_map = Arc::new(FreeMap::open(cache.clone(), cx, true));
        InodeTable::new(cache, free_map)
    }

    #[test]
    fn create_open_read_write_round_trips() {
        run_in_kernel_thread(|cx| {
            let t = table(cx, 512);
            let sector = t.create(cx, 0, false).unwrap();
            let inode = t.open(cx, sector);
            let written = inode.write_at(cx, b"hello, inode", 0);
            assert_eq!(written, 12);
            assert_eq!(inode.length(cx), 12);
            let mut buf = [0u8; 12];
            let read = inode.read_at(cx, &mut buf, 0);
            assert_eq!(read, 12);
            assert_eq!(&buf, b"hello, inode");
            t.close(cx, &inode);
        });
    }

    #[test]
    fn sparse_write_zero_fills_the_gap() {
        run_in_kernel_thread(|cx| {
            let t = table(cx, 4096);
            let sector = t.create(cx, 0, false).unwrap();
            let inode = t.open(cx, sector);
            let far_offset = 1_000_000u64;
            let written = inode.write_at(cx, &[0x42], far_offset);
            assert_eq!(written, 1);
            assert_eq!(inode.length(cx), far_offset + 1);

            let mut buf = [0xffu8; 1];
            inode.read_at(cx, &mut buf, 500_000);
            assert_eq!(buf, [0u8]);

            let mut last = [0u8; 1];
            inode.read_at(cx, &mut last, far_offset);
            assert_eq!(last, [0x42]);
            t.close(cx, &inode);
        });
    }

    #[test]
    fn write_across_indirect_boundary_allocates_an_index_block() {
        run_in_kernel_thread(|cx| {
            let t = table(cx, 20_000);
            let sector = t.create(cx, 0, false).unwrap();
            let inode = t.open(cx, sector);
            let boundary_offset = (NUM_DIRECT * SECTOR_SIZE) as u64;
            let written = inode.write_at(cx, &[7u8; 8], boundary_offset);
            assert_eq!(written, 8);
            let mut buf = [0u8; 8];
            inode.read_at(cx, &mut buf, boundary_offset);
            assert_eq!(buf, [7u8; 8]);
            t.close(cx, &inode);
        });
    }

    #[test]
    fn zero_byte_write_at_eof_does_not_grow_or_change_length() {
        run_in_kernel_thread(|cx| {
            let t = table(cx, 512);
            let sector = t.create(cx, 10, false).unwrap();
            let inode = t.open(cx, sector);
            let free_before = t.free_map.sectors_free(cx);
            let written = inode.write_at(cx, &[], 10);
            assert_eq!(written, 0);
            assert_eq!(inode.length(cx), 10);
            assert_eq!(t.free_map.sectors_free(cx), free_before);
            t.close(cx, &inode);
        });
    }

    #[test]
    fn removing_and_closing_frees_storage() {
        run_in_kernel_thread(|cx| {
            let t = table(cx, 512);
            let sector = t.create(cx, 100, false).unwrap();
            let free_after_create = t.free_map.sectors_free(cx);
            let inode = t.open(cx, sector);
            inode.mark_removed(cx);
            t.close(cx, &inode);
            assert!(t.free_map.sectors_free(cx) > free_after_create);
        });
    }

    #[test]
    fn reopening_the_same_sector_shares_one_inode() {
        run_in_kernel_thread(|cx| {
            let t = table(cx, 512);
            let sector = t.create(cx, 0, false).unwrap();
            let a = t.open(cx, sector);
            let b = t.open(cx, sector);
            assert!(Arc::ptr_eq(&a, &b));
            t.close(cx, &a);
            t.close(cx, &b);
        });
    }
}
