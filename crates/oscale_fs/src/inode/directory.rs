//! Directories.
//!
//! A directory's on-disk content is a dense sequence of fixed-size entries;
//! a tombstone is an entry whose inum is zero. In memory each directory
//! carries a hashed index from name to `(inum, offset)`, built lazily on
//! first access by scanning the on-disk entries. An entry's offset is
//! assigned when the name is inserted and stays stable until deletion;
//! deleted slots are never reused, so a re-created name gets a fresh
//! trailing offset.

use std::{collections::HashMap, sync::Arc};

use oscale_fs_types::{BSIZE, DIRSIZ, DirEntry, InodeNo};
use dataview::PodMethods as _;

use crate::{
    error::FsError,
    fs::FsCore,
    journal::Transaction,
};

use super::{Inode, InodeRef, InodeType, content, iget};

pub(crate) const DIRENT_SIZE: usize = size_of::<DirEntry>();

/// Fixed-width directory-entry name, NUL-padded.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct DirName([u8; DIRSIZ]);

impl DirName {
    pub(crate) fn new(name: &[u8]) -> Self {
        assert!(name.len() <= DIRSIZ);
        let mut bytes = [0; DIRSIZ];
        bytes[..name.len()].copy_from_slice(name);
        Self(bytes)
    }
}

#[derive(Clone, Copy)]
pub(crate) struct DirEntryInfo {
    /// Zero marks a tombstoned index entry mid-removal.
    pub(crate) inum: u32,
    /// Byte offset of the entry within the directory file; stable for the
    /// entry's lifetime.
    pub(crate) offset: u32,
}

pub(crate) struct DirIndex {
    map: HashMap<DirName, DirEntryInfo>,
    /// The next entry is inserted at this offset; equals the directory file
    /// size at steady state.
    next_offset: u32,
}

impl DirIndex {
    pub(crate) fn next_offset(&self) -> u32 {
        self.next_offset
    }
}

/// Builds the in-memory index from the on-disk entries if it does not exist
/// yet. Tombstones are skipped, but their offsets stay consumed.
pub(crate) fn dir_init(core: &FsCore, dp: &Inode) -> Result<(), FsError> {
    let mut dir = dp.dir.lock().unwrap();
    if dir.is_some() {
        return Ok(());
    }
    assert!(
        dp.ty() == InodeType::Dir,
        "dir_init: inode {} is not a directory",
        dp.inum()
    );

    let mut map = HashMap::new();
    let size = dp.size() as usize;
    let mut dir_offset = 0_usize;

    for block_off in (0..size).step_by(BSIZE) {
        assert_eq!(dir_offset, block_off);
        let bn = match content::bmap(core, dp, block_off / BSIZE, None, true) {
            Ok(bn) => bn,
            Err(FsError::OutOfBlocks) => panic!("dir_init: out of blocks"),
            Err(e) => return Err(e),
        };
        let buf = core.buf.get(dp.dev(), bn)?;
        let g = buf.read();

        let mut in_block = 0;
        while in_block < BSIZE && dir_offset < size {
            let de: &DirEntry = g.data_at(in_block);
            if let Some(inum) = de.inum() {
                map.insert(
                    DirName::new(de.name()),
                    DirEntryInfo {
                        inum: inum.value(),
                        offset: dir_offset as u32,
                    },
                );
            }
            in_block += DIRENT_SIZE;
            dir_offset += DIRENT_SIZE;
        }
    }

    *dir = Some(DirIndex {
        map,
        next_offset: dir_offset as u32,
    });
    Ok(())
}

/// Looks up `name` in directory `dp`.
///
/// Returns `None` for absent and tombstoned names alike.
pub(crate) fn dirlookup(
    core: &Arc<FsCore>,
    dp: &Inode,
    name: &[u8],
) -> Result<Option<InodeRef>, FsError> {
    dir_init(core, dp)?;

    if name.len() > DIRSIZ {
        return Ok(None);
    }
    let inum = {
        let dir = dp.dir.lock().unwrap();
        let dir = dir.as_ref().unwrap();
        match dir.map.get(&DirName::new(name)) {
            Some(info) if info.inum != 0 => info.inum,
            _ => return Ok(None),
        }
    };
    iget(core, dp.dev(), InodeNo::new(inum)).map(Some)
}

/// Writes a new directory entry `(name, inum)` into `dp`.
///
/// Bumps the target inode's link count, and — when `inc_link` is set and the
/// name is not `".."` — the directory's own link count too. A directory's
/// `".."` is not counted as an incoming link, hence the exception.
///
/// Caller must hold the write latch on `dp`.
pub(crate) fn dirlink(
    core: &Arc<FsCore>,
    dp: &Inode,
    name: &[u8],
    inum: InodeNo,
    inc_link: bool,
    tx: &Transaction,
) -> Result<(), FsError> {
    if name.is_empty() {
        return Err(FsError::InvalidPath);
    }
    if name.len() > DIRSIZ {
        return Err(FsError::NameTooLong);
    }
    dir_init(core, dp)?;

    {
        let mut dir = dp.dir.lock().unwrap();
        let dir = dir.as_mut().unwrap();
        let key = DirName::new(name);
        if dir.map.get(&key).is_some_and(|info| info.inum != 0) {
            return Err(FsError::Exists);
        }
        dir.map.insert(
            key,
            DirEntryInfo {
                inum: inum.value(),
                offset: dir.next_offset,
            },
        );
        dir.next_offset += DIRENT_SIZE as u32;
    }

    if name != b".." {
        let ip = iget(core, dp.dev(), inum)?;
        ip.link();
        if inc_link {
            dp.link();
        }
    }

    dir_flush_entry(core, dp, name, tx)
}

/// Removes the entry `name` from `dp`: tombstones the on-disk record at the
/// entry's stable offset and drops it from the index.
///
/// Link counts move with the same `".."` exception as [`dirlink`]. An absent
/// name fails with [`FsError::NotFound`] and has no side effects.
///
/// Caller must hold the write latch on `dp`.
pub(crate) fn dirunlink(
    core: &Arc<FsCore>,
    dp: &Inode,
    name: &[u8],
    inum: InodeNo,
    dec_link: bool,
    tx: &Transaction,
) -> Result<(), FsError> {
    if name.is_empty() || name.len() > DIRSIZ {
        return Err(FsError::NotFound);
    }
    dir_init(core, dp)?;

    {
        let mut dir = dp.dir.lock().unwrap();
        let dir_mut = dir.as_mut().unwrap();
        let key = DirName::new(name);
        match dir_mut.map.get_mut(&key) {
            Some(info) if info.inum != 0 => info.inum = 0,
            _ => return Err(FsError::NotFound),
        }
        flush_entry_locked(core, dp, dir_mut, name, tx)?;
        dir_mut.map.remove(&key);
    }

    if name != b".." {
        let ip = iget(core, dp.dev(), inum)?;
        ip.unlink();
        if dec_link {
            dp.unlink();
        }
    }
    Ok(())
}

/// Flushes exactly one directory entry to its on-disk offset.
///
/// If the write extended the directory file, the directory size is updated
/// and the inode logged; the rest of the directory is never rewritten.
///
/// Caller must hold the write latch on `dp`.
pub(crate) fn dir_flush_entry(
    core: &FsCore,
    dp: &Inode,
    name: &[u8],
    tx: &Transaction,
) -> Result<(), FsError> {
    let mut dir = dp.dir.lock().unwrap();
    let Some(dir) = dir.as_mut() else {
        return Ok(());
    };
    flush_entry_locked(core, dp, dir, name, tx)
}

fn flush_entry_locked(
    core: &FsCore,
    dp: &Inode,
    dir: &mut DirIndex,
    name: &[u8],
    tx: &Transaction,
) -> Result<(), FsError> {
    let info = *dir
        .map
        .get(&DirName::new(name))
        .expect("flushing a directory entry that is not indexed");

    let mut de = DirEntry::zeroed();
    de.set_name(name);
    de.set_inum(if info.inum == 0 {
        None
    } else {
        Some(InodeNo::new(info.inum))
    });

    let n = content::writei(core, dp, de.as_bytes(), info.offset as usize, Some(tx), false)?;
    assert_eq!(n, DIRENT_SIZE, "dir_flush_entry: short write");

    let end = info.offset + DIRENT_SIZE as u32;
    if dp.size() < end {
        dp.set_size(end);
    }
    content::iupdate(core, dp, Some(tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeviceNo, LockMode, inode::tests::fresh_fs};

    fn with_tx<R>(fs: &crate::FileSystem, f: impl FnOnce(&Transaction) -> R) -> R {
        let tx = fs.begin_transaction();
        let r = f(&tx);
        fs.commit_transaction(tx).unwrap();
        fs.flush_journal().unwrap();
        r
    }

    #[test]
    fn link_then_lookup() {
        let (_device, fs) = fresh_fs();
        let root = fs.root();
        let ip = fs.ialloc(DeviceNo::ROOT, InodeType::File).unwrap();
        ip.iunlock();

        root.ilock(LockMode::Write);
        with_tx(&fs, |tx| {
            fs.dirlink(&root, b"a.txt", ip.inum(), false, tx).unwrap();
        });
        root.iunlock();

        assert_eq!(ip.nlink(), 1);
        let found = fs.dirlookup(&root, b"a.txt").unwrap().unwrap();
        assert_eq!(found.inum(), ip.inum());
        assert!(fs.dirlookup(&root, b"missing").unwrap().is_none());
    }

    #[test]
    fn duplicate_link_fails() {
        let (_device, fs) = fresh_fs();
        let root = fs.root();
        let ip = fs.ialloc(DeviceNo::ROOT, InodeType::File).unwrap();
        ip.iunlock();

        root.ilock(LockMode::Write);
        with_tx(&fs, |tx| {
            fs.dirlink(&root, b"x", ip.inum(), false, tx).unwrap();
            assert!(matches!(
                fs.dirlink(&root, b"x", ip.inum(), false, tx),
                Err(FsError::Exists)
            ));
        });
        root.iunlock();
        assert_eq!(ip.nlink(), 1);
    }

    #[test]
    fn name_too_long_changes_nothing() {
        let (_device, fs) = fresh_fs();
        let root = fs.root();
        let before_size = root.size();
        let long = [b'n'; DIRSIZ + 1];

        root.ilock(LockMode::Write);
        with_tx(&fs, |tx| {
            assert!(matches!(
                fs.dirlink(&root, &long, InodeNo::new(5), false, tx),
                Err(FsError::NameTooLong)
            ));
        });
        root.iunlock();
        assert_eq!(root.size(), before_size);
        assert!(fs.dirlookup(&root, &long[..DIRSIZ]).unwrap().is_none());
    }

    #[test]
    fn offsets_are_monotonic_and_stable() {
        let (_device, fs) = fresh_fs();
        let root = fs.root();
        let ip = fs.ialloc(DeviceNo::ROOT, InodeType::File).unwrap();
        ip.iunlock();

        // Force the index to exist before sampling the insertion point.
        assert!(fs.dirlookup(&root, b"one").unwrap().is_none());

        root.ilock(LockMode::Write);
        let before = {
            let dir = root.dir.lock().unwrap();
            dir.as_ref().unwrap().next_offset()
        };
        with_tx(&fs, |tx| {
            fs.dirlink(&root, b"one", ip.inum(), false, tx).unwrap();
            fs.dirlink(&root, b"two", ip.inum(), false, tx).unwrap();
        });
        let after = {
            let dir = root.dir.lock().unwrap();
            dir.as_ref().unwrap().next_offset()
        };
        root.iunlock();
        assert_eq!(after, before + 2 * DIRENT_SIZE as u32);
        assert_eq!(after, root.size(), "insertion point tracks the file size");
    }

    #[test]
    fn unlink_tombstones_and_preserves_offsets() {
        let (_device, fs) = fresh_fs();
        let root = fs.root();
        let ip = fs.ialloc(DeviceNo::ROOT, InodeType::File).unwrap();
        ip.iunlock();

        root.ilock(LockMode::Write);
        with_tx(&fs, |tx| {
            fs.dirlink(&root, b"doomed", ip.inum(), false, tx).unwrap();
            fs.dirlink(&root, b"keeper", ip.inum(), false, tx).unwrap();
        });
        let size_before = root.size();
        with_tx(&fs, |tx| {
            fs.dirunlink(&root, b"doomed", ip.inum(), false, tx).unwrap();
        });
        root.iunlock();

        // The slot is tombstoned in place, never compacted.
        assert_eq!(root.size(), size_before);
        assert!(fs.dirlookup(&root, b"doomed").unwrap().is_none());
        assert!(fs.dirlookup(&root, b"keeper").unwrap().is_some());
        assert_eq!(ip.nlink(), 1);

        // Re-creating the name appends at a fresh offset.
        root.ilock(LockMode::Write);
        with_tx(&fs, |tx| {
            fs.dirlink(&root, b"doomed", ip.inum(), false, tx).unwrap();
        });
        root.iunlock();
        assert_eq!(root.size(), size_before + DIRENT_SIZE as u32);
    }

    #[test]
    fn unlink_absent_name_has_no_side_effects() {
        let (_device, fs) = fresh_fs();
        let root = fs.root();
        let size = root.size();

        root.ilock(LockMode::Write);
        with_tx(&fs, |tx| {
            assert!(matches!(
                fs.dirunlink(&root, b"ghost", InodeNo::new(9), false, tx),
                Err(FsError::NotFound)
            ));
        });
        root.iunlock();
        assert_eq!(root.size(), size);
    }

    #[test]
    fn index_rebuild_matches_disk() {
        let (device, fs) = fresh_fs();
        let root = fs.root();
        let ip = fs.ialloc(DeviceNo::ROOT, InodeType::File).unwrap();
        ip.iunlock();

        root.ilock(LockMode::Write);
        with_tx(&fs, |tx| {
            fs.dirlink(&root, b"persisted", ip.inum(), false, tx).unwrap();
            fs.dirlink(&root, b"gone", ip.inum(), false, tx).unwrap();
        });
        with_tx(&fs, |tx| {
            fs.dirunlink(&root, b"gone", ip.inum(), false, tx).unwrap();
        });
        root.iunlock();
        drop(ip);
        drop(root);
        drop(fs);

        // A fresh mount rebuilds the index from the on-disk entries.
        let fs =
            crate::FileSystem::mount(device as std::sync::Arc<dyn crate::BlockDevice>).unwrap();
        let root = fs.root();
        assert!(fs.dirlookup(&root, b"persisted").unwrap().is_some());
        assert!(fs.dirlookup(&root, b"gone").unwrap().is_none());
    }
}
