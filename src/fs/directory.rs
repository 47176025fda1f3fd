//! Hierarchical directories: a directory is just an inode
//! whose data is a packed array of fixed-size entries, mirroring
//! `filesys/directory.c`'s `struct dir_entry` layout exactly.

use std::sync::Arc;

use zerocopy::{AsBytes, FromBytes};

use crate::device::{BlockDevice, SectorId};
use crate::error::KernelError;
use crate::fs::inode::{Inode, InodeTable};
use crate::param::{NAME_MAX, ROOT_DIR_SECTOR};
use crate::thread::KernelCtx;

/// One packed directory entry, read and written through the owning
/// directory's inode like any other file data.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct DirEntry {
    sector: u32,
    name: [u8; NAME_MAX + 1],
    in_use: u8,
}

fn entry_size() -> usize {
    std::mem::size_of::<DirEntry>()
}

fn entry_name(entry: &DirEntry) -> String {
    let end = entry.name.iter().position(|&b| b == 0).unwrap_or(entry.name.len());
    String::from_utf8_lossy(&entry.name[..end]).into_owned()
}

/// Scans every entry of `inode`, calling `f(offset, entry)` for each. `f`
/// returns `false` to stop early.
fn each_entry<D: BlockDevice>(inode: &Inode<D>, cx: &KernelCtx, mut f: impl FnMut(u64, DirEntry) -> bool) {
    let size = entry_size();
    let mut ofs = 0u64;
    loop {
        let mut buf = vec![0u8; size];
        if inode.read_at(cx, &mut buf, ofs) != size {
            break;
        }
        let entry = DirEntry::read_from(&buf[..]).expect("buffer is exactly one directory entry");
        if !f(ofs, entry) {
            break;
        }
        ofs += size as u64;
    }
}

/// A directory: an inode plus the fixed-size-entry
/// conventions that give it structure.
pub struct Directory<D> {
    inode: Arc<Inode<D>>,
}

impl<D: BlockDevice> Directory<D> {
    pub fn open(inode: Arc<Inode<D>>) -> Self {
        Self { inode }
    }

    pub fn open_root(table: &InodeTable<D>, cx: &KernelCtx) -> Self {
        Self::open(table.open(cx, ROOT_DIR_SECTOR))
    }

    pub fn inode(&self) -> &Arc<Inode<D>> {
        &self.inode
    }

    /// Builds a directory inode with room for `entry_capacity` entries,
    /// allocating a fresh sector for it.
    pub fn create(table: &InodeTable<D>, cx: &KernelCtx, entry_capacity: usize) -> Result<SectorId, KernelError> {
        table.create(cx, entry_capacity * entry_size(), true)
    }

    /// Plants the root directory at its fixed sector. Only called once, by
    /// filesystem formatting.
    pub fn format_root(table: &InodeTable<D>, cx: &KernelCtx, entry_capacity: usize) {
        table
            .create_at(cx, ROOT_DIR_SECTOR, entry_capacity * entry_size(), true)
            .expect("formatting must be able to plant the root directory");
    }

    fn find(&self, cx: &KernelCtx, name: &str) -> Option<(u64, DirEntry)> {
        let mut found = None;
        each_entry(&self.inode, cx, |ofs, e| {
            if e.in_use != 0 && entry_name(&e) == name {
                found = Some((ofs, e));
                false
            } else {
                true
            }
        });
        found
    }

    /// Looks up `name`, returning the sector of its inode.
    pub fn lookup(&self, cx: &KernelCtx, name: &str) -> Option<SectorId> {
        self.find(cx, name).map(|(_, e)| e.sector)
    }

    /// Adds `name -> sector` to this directory.
    /// Fails on an empty or oversized name, or a name already present.
    pub fn add(&self, cx: &KernelCtx, name: &str, sector: SectorId) -> Result<(), KernelError> {
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(KernelError::FaultyUserArgument("directory entry name is empty or too long"));
        }
        if self.find(cx, name).is_some() {
            return Err(KernelError::LogicalConflict("directory already contains an entry with that name"));
        }

        let mut target_ofs = None;
        each_entry(&self.inode, cx, |ofs, e| {
            if e.in_use == 0 {
                target_ofs = Some(ofs);
                false
            } else {
                true
            }
        });
        let ofs = target_ofs.unwrap_or_else(|| self.inode.length(cx));

        let mut name_bytes = [0u8; NAME_MAX + 1];
        name_bytes[..name.len()].copy_from_slice(name.as_bytes());
        let entry = DirEntry {
            sector,
            name: name_bytes,
            in_use: 1,
        };
        let written = self.inode.write_at(cx, entry.as_bytes(), ofs);
        if written == entry_size() {
            Ok(())
        } else {
            Err(KernelError::TransientAllocation("short write while adding a directory entry"))
        }
    }

    /// Removes `name`'s entry and marks its inode for deletion. The
    /// inode's storage is reclaimed once its last opener closes it.
    pub fn remove(&self, cx: &KernelCtx, table: &InodeTable<D>, name: &str) -> Result<(), KernelError> {
        let (ofs, mut entry) = self
            .find(cx, name)
            .ok_or(KernelError::LogicalConflict("no such directory entry to remove"))?;

        let target = table.open(cx, entry.sector);
        entry.in_use = 0;
        let written = self.inode.write_at(cx, entry.as_bytes(), ofs);
        if written != entry_size() {
            table.close(cx, &target);
            return Err(KernelError::TransientAllocation("short write while removing a directory entry"));
        }
        target.mark_removed(cx);
        table.close(cx, &target);
        Ok(())
    }

    /// Advances `*pos` to the next in-use entry and returns its name
    ///, or `None` once the directory is
    /// exhausted.
    pub fn readdir(&self, cx: &KernelCtx, pos: &mut u64) -> Option<String> {
        let size = entry_size() as u64;
        loop {
            let mut buf = vec![0u8; size as usize];
            if self.inode.read_at(cx, &mut buf, *pos) != size as usize {
                return None;
            }
            *pos += size;
            let entry = DirEntry::read_from(&buf[..]).expect("buffer is exactly one directory entry");
            if entry.in_use != 0 {
                return Some(entry_name(&entry));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use crate::fs::cache::Cache;
    use crate::fs::free_map::FreeMap;
    use crate::testutil::run_in_kernel_thread;

    fn harness(cx: &KernelCtx, sectors: usize) -> InodeTable<MemBlockDevice> {
        let cache = Arc::new(Cache::new(MemBlockDevice::new(sectors)));
        let free_map = Arc::new(FreeMap::open(cache.clone(), cx, true));
        InodeTable::new(cache, free_map)
    }

    #[test]
    fn add_then_lookup_finds_the_entry() {
        run_in_kernel_thread(|cx| {
            let table = harness(cx, 512);
            let root_sector = Directory::create(&table, cx, 4).unwrap();
            let dir = Directory::open(table.open(cx, root_sector));
            let file_sector = table.create(cx, 0, false).unwrap();
            dir.add(cx, "hello.txt", file_sector).unwrap();
            assert_eq!(dir.lookup(cx, "hello.txt"), Some(file_sector));
            assert_eq!(dir.lookup(cx, "nonexistent"), None);
        });
    }

    #[test]
    fn adding_a_duplicate_name_fails() {
        run_in_kernel_thread(|cx| {
            let table = harness(cx, 512);
            let root_sector = Directory::create(&table, cx, 4).unwrap();
            let dir = Directory::open(table.open(cx, root_sector));
            let a = table.create(cx, 0, false).unwrap();
            let b = table.create(cx, 0, false).unwrap();
            dir.add(cx, "x", a).unwrap();
            assert!(matches!(dir.add(cx, "x", b), Err(KernelError::LogicalConflict(_))));
        });
    }

    #[test]
    fn remove_marks_entry_unused_and_inode_removed() {
        run_in_kernel_thread(|cx| {
            let table = harness(cx, 512);
            let root_sector = Directory::create(&table, cx, 4).unwrap();
            let dir = Directory::open(table.open(cx, root_sector));
            let file_sector = table.create(cx, 0, false).unwrap();
            dir.add(cx, "x", file_sector).unwrap();
            dir.remove(cx, &table, "x").unwrap();
            assert_eq!(dir.lookup(cx, "x"), None);
        });
    }

    #[test]
    fn readdir_skips_removed_entries_and_terminates() {
        run_in_kernel_thread(|cx| {
            let table = harness(cx, 512);
            let root_sector = Directory::create(&table, cx, 4).unwrap();
            let dir = Directory::open(table.open(cx, root_sector));
            let a = table.create(cx, 0, false).unwrap();
            let b = table.create(cx, 0, false).unwrap();
            dir.add(cx, "a", a).unwrap();
            dir.add(cx, "b", b).unwrap();
            dir.remove(cx, &table, "a").unwrap();

            let mut pos = 0u64;
            let mut names = Vec::new();
            while let Some(name) = dir.readdir(cx, &mut pos) {
                names.push(name);
            }
            assert_eq!(names, vec!["b".to_string()]);
        });
    }

    #[test]
    fn two_directories_keep_same_named_entries_distinct() {
        run_in_kernel_thread(|cx| {
            let table = harness(cx, 2048);
            let root_sector = Directory::create(&table, cx, 4).unwrap();
            let root = Directory::open(table.open(cx, root_sector));

            let a_sector = Directory::create(&table, cx, 4).unwrap();
            root.add(cx, "a", a_sector).unwrap();
            let b_sector = Directory::create(&table, cx, 4).unwrap();
            root.add(cx, "b", b_sector).unwrap();

            let dir_a = Directory::open(table.open(cx, a_sector));
            let dir_b = Directory::open(table.open(cx, b_sector));
            let x_in_a = table.create(cx, 0, false).unwrap();
            let x_in_b = table.create(cx, 0, false).unwrap();
            dir_a.add(cx, "x", x_in_a).unwrap();
            dir_b.add(cx, "x", x_in_b).unwrap();

            assert_ne!(dir_a.lookup(cx, "x"), dir_b.lookup(cx, "x"));
        });
    }
}
