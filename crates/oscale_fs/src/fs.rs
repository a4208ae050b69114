//! Superblock, bootstrap, and the operation surface handed to the layers
//! above (VFS, page cache).

use std::sync::{
    Arc,
    atomic::{AtomicU32, AtomicU64, Ordering},
};

use epoch_gc::Collector;
use log::info;
use oscale_fs_types::{BlockNo, InodeNo, NRECLAIM_INODES, SuperBlock};

use crate::{
    block_alloc::{self, BlockAlloc},
    buffer::BufCache,
    device::{BlockDevice, DeviceNo},
    error::FsError,
    inode::{
        self, InodeRef, InodeType,
        alloc::{self, InumAlloc},
        content, directory,
        table::InodeTable,
    },
    journal::{Journal, Transaction},
    params::NCPU,
};

/// Everything the file system layers share. Inodes hold a weak reference
/// back here; the hash table holds uncounted pointers to inodes, so there is
/// no ownership cycle.
pub(crate) struct FsCore {
    pub(crate) dev: DeviceNo,
    pub(crate) sb: SuperBlock,
    pub(crate) buf: BufCache,
    pub(crate) balloc: BlockAlloc,
    pub(crate) inums: InumAlloc,
    pub(crate) itable: InodeTable,
    pub(crate) gc: Collector,
    pub(crate) journal: Journal,
    /// Per-CPU: where `ialloc`'s scan resumes. Unsynchronized by design;
    /// a stale read only costs a longer scan.
    pub(crate) last_inode: [AtomicU32; NCPU],
    tx_clock: AtomicU64,
}

/// A mounted file system.
pub struct FileSystem {
    core: Arc<FsCore>,
    root: InodeRef,
}

impl FileSystem {
    /// Mounts the file system on `device`.
    ///
    /// Reads the superblock, replays any committed-but-uninstalled journal
    /// transaction, mirrors the free bitmap and free-inum lists into memory,
    /// and constructs the root inode.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Self, FsError> {
        let dev = DeviceNo::ROOT;
        let buf = BufCache::new(dev, device);

        let sb = {
            let b = buf.get(dev, SuperBlock::SUPER_BLOCK_NO)?;
            let g = b.read();
            g.data::<SuperBlock>().clone()
        };
        assert_eq!(sb.magic, SuperBlock::FS_MAGIC, "bad file system magic");

        Journal::recover(&buf, &sb, dev)?;

        let balloc = BlockAlloc::from_disk(&buf, &sb, dev)?;
        let inums = InumAlloc::from_disk(&buf, &sb, dev)?;

        let core = Arc::new(FsCore {
            dev,
            sb,
            buf,
            balloc,
            inums,
            itable: InodeTable::new(),
            gc: Collector::new(),
            journal: Journal::new(dev),
            last_inode: std::array::from_fn(|_| AtomicU32::new(0)),
            tx_clock: AtomicU64::new(1),
        });

        let root = inode::iget(&core, dev, InodeNo::ROOT)?;
        assert!(root.is_dir(), "root inode is not a directory");

        info!(
            "mounted dev {}: {} blocks, {} inodes, {} journal blocks",
            dev, core.sb.size, core.sb.ninodes, core.sb.njournal
        );
        Ok(Self { core, root })
    }

    pub(crate) fn core(&self) -> &Arc<FsCore> {
        &self.core
    }

    /// A counted reference to the root directory.
    pub fn root(&self) -> InodeRef {
        self.root.clone()
    }

    /// A copy of the superblock. The reclaim-inode list is included only on
    /// request; it is meaningful on the mount-time reclaim path and nowhere
    /// else.
    pub fn get_superblock(&self, get_reclaim_inodes: bool) -> SuperBlock {
        let mut sb = self.core.sb.clone();
        if !get_reclaim_inodes {
            sb.num_reclaim_inodes = 0;
            sb.reclaim_inodes = [0; NRECLAIM_INODES];
        }
        sb
    }

    // Transactions and the journal.

    /// Opens a transaction. Mutating operations record their dirty blocks
    /// and allocation intents into it.
    pub fn begin_transaction(&self) -> Transaction {
        Transaction::new(self.core.tx_clock.fetch_add(1, Ordering::Relaxed))
    }

    /// Reconciles the transaction's allocation intents into the on-disk
    /// bitmap (and the superblock's reclaim list, if it created inodes),
    /// then seals it into the journal queue.
    ///
    /// Nothing reaches the disk until [`flush_journal`](Self::flush_journal).
    pub fn commit_transaction(&self, tx: Transaction) -> Result<(), FsError> {
        let core = &self.core;
        // Queue position must match the order the commit-time snapshots
        // below are taken in, or a later bitmap image could be overwritten
        // by an earlier one at install time.
        let _order = core.journal.lock_order();

        let (mut allocated, mut freed) = tx.take_bitmap_intents();
        if !allocated.is_empty() {
            block_alloc::apply_bitmap_to_disk(core, &mut allocated, &tx, true)?;
        }
        if !freed.is_empty() {
            block_alloc::apply_bitmap_to_disk(core, &mut freed, &tx, false)?;
        }

        let new_files = tx.new_files();
        if !new_files.is_empty() {
            let b = core.buf.get(core.dev, SuperBlock::SUPER_BLOCK_NO)?;
            let mut g = b.write();
            let sb = g.data_mut::<SuperBlock>();
            let n = usize::min(new_files.len(), NRECLAIM_INODES);
            sb.num_reclaim_inodes = n as u32;
            sb.reclaim_inodes = [0; NRECLAIM_INODES];
            for (slot, ino) in sb.reclaim_inodes.iter_mut().zip(&new_files[..n]) {
                *slot = ino.value();
            }
            g.add_to_transaction(&tx);
        }

        core.journal.add(tx);
        Ok(())
    }

    /// Commits every queued transaction to disk, in order.
    pub fn flush_journal(&self) -> Result<(), FsError> {
        self.core.journal.flush(&self.core)
    }

    // Inode operations.

    /// Finds the cached inode for `(dev, inum)`, loading it from disk if
    /// needed.
    pub fn iget(&self, dev: DeviceNo, inum: InodeNo) -> Result<InodeRef, FsError> {
        inode::iget(&self.core, dev, inum)
    }

    /// Allocates a fresh inode of type `ty`. Returned write-locked.
    pub fn ialloc(&self, dev: DeviceNo, ty: InodeType) -> Result<InodeRef, FsError> {
        alloc::ialloc(&self.core, dev, ty)
    }

    /// Reads file data; see the content-layer locking contract.
    pub fn readi(&self, ip: &InodeRef, dst: &mut [u8], off: usize) -> Result<usize, FsError> {
        content::readi(&self.core, ip, dst, off)
    }

    /// Writes file data. Caller holds the write latch; size is updated
    /// separately via [`update_size`](Self::update_size).
    pub fn writei(
        &self,
        ip: &InodeRef,
        src: &[u8],
        off: usize,
        tx: Option<&Transaction>,
        writeback: bool,
    ) -> Result<usize, FsError> {
        content::writei(&self.core, ip, src, off, tx, writeback)
    }

    /// Sets the file size and flushes the inode once, after a write batch.
    pub fn update_size(&self, ip: &InodeRef, size: u32, tx: &Transaction) -> Result<(), FsError> {
        content::update_size(&self.core, ip, size, tx)
    }

    /// Flushes the inode metadata to its table slot.
    pub fn iupdate(&self, ip: &InodeRef, tx: Option<&Transaction>) -> Result<(), FsError> {
        content::iupdate(&self.core, ip, tx)
    }

    /// Frees file content from byte `offset` onward.
    pub fn itrunc(&self, ip: &InodeRef, offset: usize, tx: &Transaction) -> Result<(), FsError> {
        content::itrunc(&self.core, ip, offset, tx)
    }

    /// Evicts the inode's clean blocks from the buffer cache.
    pub fn drop_bufcache(&self, ip: &InodeRef) -> Result<(), FsError> {
        content::drop_bufcache(&self.core, ip)
    }

    // Directory operations.

    pub fn dirlookup(&self, dp: &InodeRef, name: &[u8]) -> Result<Option<InodeRef>, FsError> {
        directory::dirlookup(&self.core, dp, name)
    }

    pub fn dirlink(
        &self,
        dp: &InodeRef,
        name: &[u8],
        inum: InodeNo,
        inc_link: bool,
        tx: &Transaction,
    ) -> Result<(), FsError> {
        directory::dirlink(&self.core, dp, name, inum, inc_link, tx)
    }

    pub fn dirunlink(
        &self,
        dp: &InodeRef,
        name: &[u8],
        inum: InodeNo,
        dec_link: bool,
        tx: &Transaction,
    ) -> Result<(), FsError> {
        directory::dirunlink(&self.core, dp, name, inum, dec_link, tx)
    }

    pub fn dir_flush_entry(
        &self,
        dp: &InodeRef,
        name: &[u8],
        tx: &Transaction,
    ) -> Result<(), FsError> {
        directory::dir_flush_entry(&self.core, dp, name, tx)
    }

    // Inode numbers and reclamation.

    /// Takes a free inode number from the per-CPU allocator.
    pub fn alloc_inum(&self) -> Result<u32, FsError> {
        self.core.inums.alloc()
    }

    /// Returns an inode number to the per-CPU allocator.
    pub fn free_inum(&self, inum: u32) {
        self.core.inums.free(inum);
    }

    /// Drops the reference taken when the inode was first loaded.
    ///
    /// The page-cache layer calls this once, when the last open descriptor
    /// for an unlinked file goes away. Must not be called twice for one
    /// load.
    pub fn release_retained(&self, ip: &InodeRef) {
        inode::release_retained(ip);
    }

    /// Frees an unlinked inode's storage: truncates the content, marks the
    /// on-disk inode free, returns its number to the allocator, and drops
    /// the retained reference.
    ///
    /// The caller passes its last counted reference in.
    pub fn reclaim_inode(&self, ip: InodeRef, tx: &Transaction) -> Result<(), FsError> {
        assert_eq!(ip.nlink(), 0, "reclaiming a linked inode");
        ip.ilock(crate::LockMode::Write);
        content::itrunc(&self.core, &ip, 0, tx)?;
        ip.set_type(InodeType::Free);
        content::iupdate(&self.core, &ip, Some(tx))?;
        ip.iunlock();
        self.core.inums.free(ip.inum().value());
        self.release_retained(&ip);
        drop(ip);
        Ok(())
    }

    // Diagnostics used by tests and tooling.

    /// Whether `bno` is allocated in the in-memory bitmap.
    pub fn block_allocated(&self, bno: BlockNo) -> bool {
        self.core.balloc.is_allocated(bno)
    }

    /// Free blocks according to the in-memory bitmap.
    pub fn free_block_count(&self) -> u32 {
        self.core.balloc.free_count()
    }

    /// Sealed transactions waiting in the journal queue.
    pub fn queued_transactions(&self) -> usize {
        self.core.journal.queued()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        MemDevice,
        mkfs::{self, MkfsOptions},
    };

    #[test]
    #[should_panic(expected = "bad file system magic")]
    fn mount_rejects_unformatted_device() {
        let device = Arc::new(MemDevice::new(64));
        let _ = FileSystem::mount(device as Arc<dyn BlockDevice>);
    }

    #[test]
    fn superblock_queries() {
        let device = Arc::new(MemDevice::new(512));
        mkfs::format(
            &(Arc::clone(&device) as Arc<dyn BlockDevice>),
            &MkfsOptions {
                size: 512,
                ninodes: 64,
                njournal: 32,
            },
        )
        .unwrap();
        let fs = FileSystem::mount(device as Arc<dyn BlockDevice>).unwrap();

        let sb = fs.get_superblock(false);
        assert_eq!(sb.size, 512);
        assert_eq!(sb.ninodes, 64);
        assert_eq!(sb.num_reclaim_inodes, 0);
        assert!(sb.nblocks > 0);
        assert_eq!(
            sb.data_start() + sb.nblocks,
            sb.size,
            "data region accounts for every remaining block"
        );
    }
}
