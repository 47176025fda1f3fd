//! On-disk filesystem. Four layers:
//!   + Free map: a persistent bitmap of free sectors.
//!   + Cache: a write-back buffer cache every other layer reads and writes
//!     through instead of touching the block device directly.
//!   + Inodes: indexed files, addressed by direct/indirect/double-indirect
//!     block pointers.
//!   + Directories: inodes whose contents are fixed-size name/sector pairs.
//!
//! This module is the facade tying the four together and resolving paths;
//! the layers themselves live in their own submodules.

pub mod cache;
pub mod directory;
pub mod free_map;
pub mod inode;

use std::sync::Arc;

use crate::device::{BlockDevice, SectorId};
use crate::error::KernelError;
use crate::fs::cache::Cache;
use crate::fs::directory::Directory;
use crate::fs::free_map::FreeMap;
use crate::fs::inode::{Inode, InodeTable};
use crate::param::ROOT_DIR_SECTOR;
use crate::thread::KernelCtx;

/// Default entry capacity given to a newly created directory. Directories
/// grow past this anyway; it
/// just sizes the inode's initial allocation.
const DEFAULT_DIR_ENTRIES: usize = 16;

/// The mounted filesystem.
pub struct Filesys<D> {
    cache: Arc<Cache<D>>,
    free_map: Arc<FreeMap<D>>,
    inodes: InodeTable<D>,
}

impl<D: BlockDevice> Filesys<D> {
    /// Mounts `device`. If `format`, writes a fresh free-map and root
    /// directory instead of reading an existing ones.
    pub fn init(device: D, cx: &KernelCtx, format: bool) -> Self {
        let cache = Arc::new(Cache::new(device));
        let free_map = Arc::new(FreeMap::open(cache.clone(), cx, format));
        let inodes = InodeTable::new(cache.clone(), free_map.clone());
        if format {
            Directory::format_root(&inodes, cx, DEFAULT_DIR_ENTRIES);
        }
        Self { cache, free_map, inodes }
    }

    /// Flushes the free-map and the buffer cache.
    pub fn done(&self, cx: &KernelCtx) {
        self.free_map.close(cx);
        self.cache.flush(cx);
    }

    fn root(&self, cx: &KernelCtx) -> Directory<D> {
        Directory::open_root(&self.inodes, cx)
    }

    /// Resolves `path` to a directory.
    /// Absolute paths, and paths from a thread with no CWD, start at root;
    /// otherwise resolution starts at `cx.thread().cwd()`. A trailing `/`
    /// (or the empty path) returns the directory itself.
    fn resolve_dir(&self, cx: &KernelCtx, path: &str) -> Result<Directory<D>, KernelError> {
        let mut dir = if path.starts_with('/') || cx.thread().cwd().is_none() {
            self.root(cx)
        } else {
            let sector = cx.thread().cwd().unwrap();
            Directory::open(self.inodes.open(cx, sector))
        };

        for component in path.split('/').filter(|c| !c.is_empty()) {
            let child_sector = match dir.lookup(cx, component) {
                Some(s) => s,
                None => {
                    self.inodes.close(cx, dir.inode());
                    return Err(KernelError::LogicalConflict("path component does not exist"));
                }
            };
            let child_inode = self.inodes.open(cx, child_sector);
            if !child_inode.is_dir(cx) {
                self.inodes.close(cx, &child_inode);
                self.inodes.close(cx, dir.inode());
                return Err(KernelError::LogicalConflict("path component is not a directory"));
            }
            self.inodes.close(cx, dir.inode());
            dir = Directory::open(child_inode);
        }
        Ok(dir)
    }

    /// `convert_path(path) -> (parent_path, filename)`:
    /// splits off the leaf component from the directory path that must
    /// contain it.
    fn split_leaf(path: &str) -> Result<(&str, &str), KernelError> {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(KernelError::FaultyUserArgument("path has no leaf component"));
        }
        match trimmed.rfind('/') {
            Some(idx) => Ok((&trimmed[..=idx], &trimmed[idx + 1..])),
            None => Ok(("", trimmed)),
        }
    }

    /// Resolves `path`'s parent directory, returning it with the leaf
    /// component name.
    fn resolve_parent<'a>(&self, cx: &KernelCtx, path: &'a str) -> Result<(Directory<D>, &'a str), KernelError> {
        let (parent_path, name) = Self::split_leaf(path)?;
        let parent = if parent_path.is_empty() {
            if path.starts_with('/') {
                self.root(cx)
            } else if let Some(sector) = cx.thread().cwd() {
                Directory::open(self.inodes.open(cx, sector))
            } else {
                self.root(cx)
            }
        } else {
            self.resolve_dir(cx, parent_path)?
        };
        Ok((parent, name))
    }

    /// Creates a plain file: resolves the parent,
    /// allocates an inode, and links it into the parent directory.
    pub fn create(&self, cx: &KernelCtx, path: &str, size: usize) -> Result<(), KernelError> {
        let (parent, name) = self.resolve_parent(cx, path)?;
        let sector = self.inodes.create(cx, size, false)?;
        let result = parent.add(cx, name, sector);
        self.inodes.close(cx, parent.inode());
        if let Err(e) = result {
            let leaked = self.inodes.open(cx, sector);
            leaked.mark_removed(cx);
            self.inodes.close(cx, &leaked);
            return Err(e);
        }
        Ok(())
    }

    /// Creates a directory.
    pub fn mkdir(&self, cx: &KernelCtx, path: &str) -> Result<(), KernelError> {
        let (parent, name) = self.resolve_parent(cx, path)?;
        let sector = Directory::create(&self.inodes, cx, DEFAULT_DIR_ENTRIES)?;
        let result = parent.add(cx, name, sector);
        self.inodes.close(cx, parent.inode());
        if let Err(e) = result {
            let leaked = self.inodes.open(cx, sector);
            leaked.mark_removed(cx);
            self.inodes.close(cx, &leaked);
            return Err(e);
        }
        Ok(())
    }

    /// Opens `path`'s inode.
    pub fn open(&self, cx: &KernelCtx, path: &str) -> Result<Arc<Inode<D>>, KernelError> {
        if path == "/" || path.is_empty() {
            return Ok(self.inodes.open(cx, ROOT_DIR_SECTOR));
        }
        let (parent, name) = self.resolve_parent(cx, path)?;
        let found = parent.lookup(cx, name);
        self.inodes.close(cx, parent.inode());
        let sector = found.ok_or(KernelError::LogicalConflict("no such file or directory"))?;
        Ok(self.inodes.open(cx, sector))
    }

    /// Unlinks `path` from its parent directory.
    pub fn remove(&self, cx: &KernelCtx, path: &str) -> Result<(), KernelError> {
        let (parent, name) = self.resolve_parent(cx, path)?;
        let result = parent.remove(cx, &self.inodes, name);
        self.inodes.close(cx, parent.inode());
        result
    }

    /// Closes an inode previously returned by [`Filesys::open`] or obtained
    /// from the root.
    pub fn close(&self, cx: &KernelCtx, inode: &Arc<Inode<D>>) {
        self.inodes.close(cx, inode);
    }

    /// Changes `thread`'s current working directory to `path`. Fails
    /// unless `path` names an existing directory.
    ///
    /// The CWD is remembered as a bare sector number, not a held-open
    /// inode reference: every lookup that starts from CWD reopens it
    /// for the duration of that lookup instead.
    pub fn chdir(&self, cx: &KernelCtx, path: &str) -> Result<(), KernelError> {
        let dir = self.resolve_dir(cx, path)?;
        let sector = dir.inode().sector();
        self.inodes.close(cx, dir.inode());
        cx.thread().set_cwd(sector);
        Ok(())
    }

    /// Enumerates the next entry of a directory inode.
    pub fn readdir(&self, cx: &KernelCtx, inode: &Arc<Inode<D>>, pos: &mut u64) -> Option<String> {
        let dir = Directory::open(inode.clone());
        dir.readdir(cx, pos)
    }

    pub fn free_sectors(&self, cx: &KernelCtx) -> usize {
        self.free_map.sectors_free(cx)
    }

    /// Lists the entry names of the directory at `path`, in the same order
    /// [`Filesys::readdir`] would walk them one at a time. A `fsutil`-style
    /// bulk-listing convenience the distilled syscall surface exposes only
    /// one entry at a time.
    pub fn list(&self, cx: &KernelCtx, path: &str) -> Result<Vec<String>, KernelError> {
        let dir = self.resolve_dir(cx, path)?;
        let mut pos = 0u64;
        let mut names = Vec::new();
        while let Some(name) = dir.readdir(cx, &mut pos) {
            names.push(name);
        }
        self.inodes.close(cx, dir.inode());
        Ok(names)
    }

    /// Removes `path`, recursing into its entries first if it names a
    /// directory. A plain
    /// file is removed directly, same as [`Filesys::remove`].
    pub fn remove_recursive(&self, cx: &KernelCtx, path: &str) -> Result<(), KernelError> {
        let inode = self.open(cx, path)?;
        let is_dir = inode.is_dir(cx);
        self.close(cx, &inode);
        if is_dir {
            let trimmed = path.trim_end_matches('/');
            for name in self.list(cx, path)? {
                self.remove_recursive(cx, &format!("{trimmed}/{name}"))?;
            }
        }
        self.remove(cx, path)
    }
}

/// Sector the root directory is guaranteed to occupy, for callers that need
/// it without going through path resolution (e.g. process bootstrap).
pub fn root_sector() -> SectorId {
    ROOT_DIR_SECTOR
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use crate::testutil::run_in_kernel_thread;

    fn mount(cx: &KernelCtx, sectors: usize) -> Filesys<MemBlockDevice> {
        Filesys::init(MemBlockDevice::new(sectors), cx, true)
    }

    #[test]
    fn create_then_open_succeeds_remove_then_open_fails() {
        run_in_kernel_thread(|cx| {
            let fs = mount(cx, 4096);
            fs.create(cx, "/hello.txt", 0).unwrap();
            let inode = fs.open(cx, "/hello.txt").unwrap();
            fs.close(cx, &inode);

            fs.remove(cx, "/hello.txt").unwrap();
            assert!(fs.open(cx, "/hello.txt").is_err());
        });
    }

    #[test]
    fn mkdir_chdir_create_then_absolute_open_succeeds() {
        run_in_kernel_thread(|cx| {
            let fs = mount(cx, 4096);
            fs.mkdir(cx, "/a").unwrap();
            fs.chdir(cx, "/a").unwrap();
            fs.create(cx, "b", 0).unwrap();
            fs.chdir(cx, "/").unwrap();
            let inode = fs.open(cx, "/a/b").unwrap();
            fs.close(cx, &inode);
        });
    }

    #[test]
    fn directory_isolation_distinct_inodes_for_same_leaf_name() {
        run_in_kernel_thread(|cx| {
            let fs = mount(cx, 4096);
            fs.mkdir(cx, "/a").unwrap();
            fs.mkdir(cx, "/b").unwrap();
            fs.create(cx, "/a/x", 0).unwrap();
            fs.create(cx, "/b/x", 0).unwrap();

            let ax = fs.open(cx, "/a/x").unwrap();
            let bx = fs.open(cx, "/b/x").unwrap();
            assert_ne!(ax.sector(), bx.sector());
            fs.close(cx, &ax);
            fs.close(cx, &bx);
        });
    }

    #[test]
    fn sparse_write_allocates_exactly_the_needed_data_and_index_blocks() {
        run_in_kernel_thread(|cx| {
            let fs = mount(cx, 8192);
            fs.create(cx, "/sparse", 0).unwrap();
            let inode = fs.open(cx, "/sparse").unwrap();
            let free_before = fs.free_sectors(cx);
            let written = inode.write_at(cx, &[0x7a], 1_000_000);
            assert_eq!(written, 1);
            assert_eq!(inode.length(cx), 1_000_001);

            let mut zero = [0xffu8; 1];
            inode.read_at(cx, &mut zero, 500_000);
            assert_eq!(zero, [0u8]);

            // Sectors for the 1,000,001 bytes themselves, plus exactly the
            // single-indirect index blocks needed to address the ones past
            // NUM_DIRECT (this offset does not reach the double-indirect
            // range).
            let data_sectors = (1_000_001usize + crate::param::SECTOR_SIZE - 1) / crate::param::SECTOR_SIZE;
            let via_indirect = data_sectors.saturating_sub(crate::param::NUM_DIRECT);
            let index_blocks = if via_indirect == 0 {
                0
            } else {
                (via_indirect + crate::param::INDEX_BLOCK_SIZE - 1) / crate::param::INDEX_BLOCK_SIZE
            };
            assert_eq!(free_before - fs.free_sectors(cx), data_sectors + index_blocks);

            fs.close(cx, &inode);
        });
    }

    #[test]
    fn list_returns_every_entry_name_in_a_directory() {
        run_in_kernel_thread(|cx| {
            let fs = mount(cx, 4096);
            fs.mkdir(cx, "/dir").unwrap();
            fs.create(cx, "/dir/a", 0).unwrap();
            fs.create(cx, "/dir/b", 0).unwrap();

            let mut names = fs.list(cx, "/dir").unwrap();
            names.sort();
            assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        });
    }

    #[test]
    fn remove_recursive_deletes_a_directory_and_everything_under_it() {
        run_in_kernel_thread(|cx| {
            let fs = mount(cx, 4096);
            fs.mkdir(cx, "/dir").unwrap();
            fs.create(cx, "/dir/a", 0).unwrap();
            fs.mkdir(cx, "/dir/sub").unwrap();
            fs.create(cx, "/dir/sub/b", 0).unwrap();

            fs.remove_recursive(cx, "/dir").unwrap();

            assert!(fs.open(cx, "/dir").is_err());
            assert!(fs.open(cx, "/dir/a").is_err());
            assert!(fs.open(cx, "/dir/sub/b").is_err());
        });
    }

    #[test]
    fn remove_recursive_on_a_plain_file_behaves_like_remove() {
        run_in_kernel_thread(|cx| {
            let fs = mount(cx, 4096);
            fs.create(cx, "/solo", 0).unwrap();
            fs.remove_recursive(cx, "/solo").unwrap();
            assert!(fs.open(cx, "/solo").is_err());
        });
    }
}
