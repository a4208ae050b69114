//! Disk block allocator.
//!
//! The in-memory free-bit-vector is the authority while the file system
//! runs: [`balloc`] and [`bfree`] touch only it. The on-disk bitmap changes
//! exclusively through the journal — at commit, the transaction's recorded
//! allocation and free intents are folded into the bitmap blocks by
//! [`apply_bitmap_to_disk`], grouped so each affected bitmap block is
//! written (and logged) exactly once.

use std::sync::Mutex;

use log::warn;
use oscale_fs_types::{BPB, BitmapBlock, BlockNo, SuperBlock};

use crate::{
    buffer::BufCache,
    device::DeviceNo,
    error::FsError,
    fs::FsCore,
    journal::Transaction,
};

struct Bitmap {
    /// One bit per block of the device, mirroring the on-disk encoding.
    bytes: Vec<u8>,
    nblocks: u32,
    /// Scan resumes here; freshly freed blocks pull it back.
    hint: usize,
}

impl Bitmap {
    fn bit(&self, bno: u32) -> bool {
        self.bytes[bno as usize / 8] & (1 << (bno % 8)) != 0
    }

    fn set(&mut self, bno: u32) {
        assert!(!self.bit(bno), "balloc: block {bno} already in use");
        self.bytes[bno as usize / 8] |= 1 << (bno % 8);
    }

    fn clear(&mut self, bno: u32) {
        assert!(self.bit(bno), "bfree: block {bno} already free");
        self.bytes[bno as usize / 8] &= !(1 << (bno % 8));
    }
}

pub(crate) struct BlockAlloc {
    inner: Mutex<Bitmap>,
}

impl BlockAlloc {
    /// Mirrors the on-disk bitmap into memory. Metadata blocks (boot,
    /// superblock, inode table, bitmap, journal) were marked in-use by mkfs
    /// and stay that way.
    pub(crate) fn from_disk(
        buf: &BufCache,
        sb: &SuperBlock,
        dev: DeviceNo,
    ) -> Result<Self, FsError> {
        let nblocks = sb.size;
        let mut bytes = vec![0_u8; sb.bitmap_blocks() as usize * (BPB / 8)];
        for (i, chunk) in bytes.chunks_mut(BPB / 8).enumerate() {
            let b = buf.get(dev, BlockNo::new(sb.bitmap_start() + i as u32))?;
            let g = b.read();
            chunk.copy_from_slice(&g.bytes()[..BPB / 8]);
        }
        Ok(Self {
            inner: Mutex::new(Bitmap {
                bytes,
                nblocks,
                hint: sb.data_start() as usize,
            }),
        })
    }

    fn alloc(&self) -> Option<BlockNo> {
        let mut bm = self.inner.lock().unwrap();
        let n = bm.nblocks as usize;
        for step in 0..n {
            let bno = ((bm.hint + step) % n) as u32;
            if !bm.bit(bno) {
                bm.set(bno);
                bm.hint = bno as usize + 1;
                return Some(BlockNo::new(bno));
            }
        }
        None
    }

    fn free(&self, bno: BlockNo) {
        let mut bm = self.inner.lock().unwrap();
        bm.clear(bno.value());
        bm.hint = usize::min(bm.hint, bno.as_index());
    }

    pub(crate) fn is_allocated(&self, bno: BlockNo) -> bool {
        self.inner.lock().unwrap().bit(bno.value())
    }

    pub(crate) fn free_count(&self) -> u32 {
        let bm = self.inner.lock().unwrap();
        (0..bm.nblocks).filter(|&b| !bm.bit(b)).count() as u32
    }
}

/// Allocates a disk block, touching only the in-memory bitmap.
///
/// The allocation is recorded in `tx` for on-disk bitmap reconciliation at
/// commit; with `zero_on_alloc`, the block's buffer-cache image is zeroed.
pub(crate) fn balloc(
    core: &FsCore,
    dev: DeviceNo,
    tx: Option<&Transaction>,
    zero_on_alloc: bool,
) -> Result<BlockNo, FsError> {
    assert_eq!(dev, core.dev, "block allocation on a foreign device");
    let Some(bno) = core.balloc.alloc() else {
        warn!("balloc: out of blocks");
        return Err(FsError::OutOfBlocks);
    };
    if let Some(tx) = tx {
        tx.add_allocated_block(bno);
    }
    if zero_on_alloc {
        bzero(core, dev, bno);
    }
    Ok(bno)
}

/// Zeroes the buffer-cache image of a block without reading the device.
pub(crate) fn bzero(core: &FsCore, dev: DeviceNo, bno: BlockNo) {
    let buf = core.buf.get_uncached(dev, bno);
    buf.write().fill_zero();
}

/// Frees a disk block. Contents are never zeroed on free.
///
/// With `delayed`, the in-memory release waits until the owning transaction
/// commits, so the block cannot be handed out again before its release is
/// durable.
pub(crate) fn bfree(
    core: &FsCore,
    dev: DeviceNo,
    bno: BlockNo,
    tx: Option<&Transaction>,
    delayed: bool,
) {
    assert_eq!(dev, core.dev, "block free on a foreign device");
    assert!(!delayed || tx.is_some(), "delayed free outside a transaction");
    if !delayed {
        core.balloc.free(bno);
    }
    if let Some(tx) = tx {
        tx.add_free_block(bno, delayed);
    }
}

/// Releases a delayed free into the in-memory bitmap. Called by the journal
/// once the owning transaction's commit record is durable.
pub(crate) fn release_block(core: &FsCore, bno: BlockNo) {
    core.balloc.free(bno);
}

/// Folds a batch of bit flips into the on-disk bitmap.
///
/// Blocks are sorted so updates walk the bitmap region front to back; all
/// flips that land in the same bitmap block are applied in one pass and that
/// bitmap block is logged into `tx` exactly once. Setting a set bit or
/// clearing a clear one means the allocation accounting is broken, and
/// panics.
pub(crate) fn apply_bitmap_to_disk(
    core: &FsCore,
    blocks: &mut Vec<BlockNo>,
    tx: &Transaction,
    alloc: bool,
) -> Result<(), FsError> {
    blocks.sort_unstable();

    let mut i = 0;
    while i < blocks.len() {
        let first = blocks[i];
        let buf = core.buf.get(core.dev, core.sb.bitmap_block(first.value()))?;
        let mut g = buf.write();

        // Highest block number this bitmap block covers.
        let max_bno = first.value() | (BPB as u32 - 1);
        while i < blocks.len() && blocks[i].value() <= max_bno {
            let bi = blocks[i].as_index() % BPB;
            let bb = g.data_mut::<BitmapBlock>();
            if alloc {
                assert!(
                    !bb.bit(bi),
                    "apply_bitmap_to_disk: block {} already in use",
                    blocks[i]
                );
                bb.set_bit(bi);
            } else {
                assert!(
                    bb.bit(bi),
                    "apply_bitmap_to_disk: block {} already free",
                    blocks[i]
                );
                bb.clear_bit(bi);
            }
            i += 1;
        }

        g.add_to_transaction(tx);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::tests::fresh_fs;

    #[test]
    fn bitmap_set_clear() {
        let bm = BlockAlloc {
            inner: Mutex::new(Bitmap {
                bytes: vec![0; 16],
                nblocks: 128,
                hint: 0,
            }),
        };
        let a = bm.alloc().unwrap();
        let b = bm.alloc().unwrap();
        assert_ne!(a, b);
        assert!(bm.is_allocated(a));
        bm.free(a);
        assert!(!bm.is_allocated(a));
    }

    #[test]
    #[should_panic(expected = "already free")]
    fn double_free_is_fatal() {
        let bm = BlockAlloc {
            inner: Mutex::new(Bitmap {
                bytes: vec![0; 16],
                nblocks: 128,
                hint: 0,
            }),
        };
        let a = bm.alloc().unwrap();
        bm.free(a);
        bm.free(a);
    }

    #[test]
    fn alloc_exhaustion() {
        let bm = BlockAlloc {
            inner: Mutex::new(Bitmap {
                bytes: vec![0; 1],
                nblocks: 8,
                hint: 0,
            }),
        };
        for _ in 0..8 {
            assert!(bm.alloc().is_some());
        }
        assert!(bm.alloc().is_none());
    }

    #[test]
    fn mount_mirrors_disk_bitmap() {
        let (_device, fs) = fresh_fs();
        let sb = fs.get_superblock(false);
        // Every metadata block is in use; the data region is free except the
        // root directory's first block.
        for bno in 0..sb.data_start() {
            assert!(fs.block_allocated(BlockNo::new(bno)), "metadata block {bno} free");
        }
        let free = (sb.data_start()..sb.size)
            .filter(|&b| !fs.block_allocated(BlockNo::new(b)))
            .count() as u32;
        assert_eq!(free, sb.size - sb.data_start() - 1);
    }
}
