//! Inode content.
//!
//! The data of each inode lives in a sequence of disk blocks. The first
//! `NDIRECT` block numbers sit in `addrs[..NDIRECT]`; the next `NINDIRECT`
//! are listed in the indirect block `addrs[NDIRECT]`; the next `NINDIRECT^2`
//! hang off the doubly-indirect block `addrs[NDIRECT + 1]`.
//!
//! Locking protocol: `writei` (and everything that mutates the block map)
//! requires the write latch. `readi` takes no latch at all: it only runs
//! against clean ranges — the page cache above serves reads of dirty pages
//! itself and only flushes dirty data through `writei`, so a concurrent
//! `readi`/`writei` pair on one inode always touches disjoint blocks.

use log::warn;
use oscale_fs_types::{
    BSIZE, BlockNo, IndirectBlock, InodeBlock, MAXFILE, NDIRECT, NINDIRECT,
};

use crate::{
    block_alloc::{balloc, bfree},
    error::FsError,
    fs::FsCore,
    journal::Transaction,
};

use super::{Inode, InodeType};

/// Returns the disk block backing logical block `bn` of `ip`, allocating it
/// (and any missing indirect blocks on the way) if absent.
///
/// Indirect-tier roots are always zeroed on allocation; leaves honor
/// `zero_on_alloc`. Newly written indirect slots are snapshotted into `tx`.
pub(crate) fn bmap(
    core: &FsCore,
    ip: &Inode,
    bn: usize,
    tx: Option<&Transaction>,
    zero_on_alloc: bool,
) -> Result<BlockNo, FsError> {
    if bn < NDIRECT {
        let a = ip.addr(bn);
        if a != 0 {
            return Ok(BlockNo::new(a));
        }
        let b = balloc(core, ip.dev(), tx, zero_on_alloc)?;
        ip.set_addr(bn, b.value());
        return Ok(b);
    }
    let bn = bn - NDIRECT;

    if bn < NINDIRECT {
        let root = match ip.addr(NDIRECT) {
            0 => {
                let b = balloc(core, ip.dev(), tx, true)?;
                ip.set_addr(NDIRECT, b.value());
                b
            }
            a => BlockNo::new(a),
        };

        let buf = core.buf.get(ip.dev(), root)?;
        let mut g = buf.write();
        if let Some(b) = g.data::<IndirectBlock>().get(bn) {
            return Ok(b);
        }
        let b = balloc(core, ip.dev(), tx, zero_on_alloc)?;
        g.data_mut::<IndirectBlock>().set(bn, Some(b));
        if let Some(tx) = tx {
            g.add_to_transaction(tx);
        }
        return Ok(b);
    }
    let bn = bn - NINDIRECT;

    assert!(bn < NINDIRECT * NINDIRECT, "bmap: block {bn} out of range");

    let root = match ip.addr(NDIRECT + 1) {
        0 => {
            let b = balloc(core, ip.dev(), tx, true)?;
            ip.set_addr(NDIRECT + 1, b.value());
            b
        }
        a => BlockNo::new(a),
    };

    // First level of the doubly-indirect tree.
    let l1_buf = core.buf.get(ip.dev(), root)?;
    let mut l1 = l1_buf.write();
    let mid = match l1.data::<IndirectBlock>().get(bn / NINDIRECT) {
        Some(b) => b,
        None => {
            let b = balloc(core, ip.dev(), tx, true)?;
            l1.data_mut::<IndirectBlock>().set(bn / NINDIRECT, Some(b));
            if let Some(tx) = tx {
                l1.add_to_transaction(tx);
            }
            b
        }
    };

    // Second level.
    let l2_buf = core.buf.get(ip.dev(), mid)?;
    let mut l2 = l2_buf.write();
    if let Some(b) = l2.data::<IndirectBlock>().get(bn % NINDIRECT) {
        return Ok(b);
    }
    let b = balloc(core, ip.dev(), tx, zero_on_alloc)?;
    l2.data_mut::<IndirectBlock>().set(bn % NINDIRECT, Some(b));
    if let Some(tx) = tx {
        l2.add_to_transaction(tx);
    }
    Ok(b)
}

/// Reads up to `dst.len()` bytes at byte offset `off`.
///
/// No latch needed; see the module comment for why concurrent `writei`
/// traffic cannot overlap the requested range.
pub(crate) fn readi(
    core: &FsCore,
    ip: &Inode,
    dst: &mut [u8],
    off: usize,
) -> Result<usize, FsError> {
    if ip.ty() == InodeType::Dev {
        return Err(FsError::WrongType);
    }

    let size = ip.size() as usize;
    let mut n = dst.len();
    if off > size || off.checked_add(n).is_none() {
        return Err(FsError::BadOffset);
    }
    if off + n > size {
        n = size - off;
    }

    let mut tot = 0;
    while tot < n {
        let off = off + tot;
        let bn = match bmap(core, ip, off / BSIZE, None, true) {
            Ok(bn) => bn,
            // A read can only allocate to fill a hole with zeroes; running
            // out of blocks here means the accounting is broken.
            Err(FsError::OutOfBlocks) => panic!("readi: out of blocks"),
            Err(e) => return Err(e),
        };
        let buf = core.buf.get(ip.dev(), bn)?;
        let g = buf.read();
        let m = usize::min(n - tot, BSIZE - off % BSIZE);
        dst[tot..tot + m].copy_from_slice(&g.bytes()[off % BSIZE..][..m]);
        tot += m;
    }
    Ok(n)
}

/// Writes `src` at byte offset `off`.
///
/// Caller must hold the write latch. Modified buffers are either snapshotted
/// into `tx` (journaled path) or written straight back to the device
/// (`writeback == true`).
///
/// The inode size is *not* updated here; after flushing every dirty page the
/// caller makes one [`update_size`] call. Returns the number of bytes that
/// landed, which is less than `src.len()` only if the disk filled up
/// mid-write.
pub(crate) fn writei(
    core: &FsCore,
    ip: &Inode,
    src: &[u8],
    off: usize,
    tx: Option<&Transaction>,
    writeback: bool,
) -> Result<usize, FsError> {
    debug_assert!(ip.write_latched(), "writei without the write latch");

    if ip.ty() == InodeType::Dev {
        return Err(FsError::WrongType);
    }

    let mut n = src.len();
    if off.checked_add(n).is_none() || off >= MAXFILE * BSIZE {
        return Err(FsError::BadOffset);
    }
    if off + n > MAXFILE * BSIZE {
        n = MAXFILE * BSIZE - off;
    }

    let mut tot = 0;
    while tot < n {
        let off = off + tot;
        let m = usize::min(n - tot, BSIZE - off % BSIZE);
        // A whole-block overwrite never needs the old contents; skip the
        // disk read entirely.
        let skip_disk_read = off % BSIZE == 0 && m == BSIZE;

        let bn = match bmap(core, ip, off / BSIZE, tx, !skip_disk_read) {
            Ok(bn) => bn,
            Err(FsError::OutOfBlocks) => {
                warn!("writei: out of blocks");
                break;
            }
            Err(e) => return Err(e),
        };
        let buf = if skip_disk_read {
            core.buf.get_uncached(ip.dev(), bn)
        } else {
            core.buf.get(ip.dev(), bn)?
        };

        let mut g = buf.write();
        g.bytes_mut()[off % BSIZE..][..m].copy_from_slice(&src[tot..tot + m]);
        // Snapshot under the write guard so exactly this version commits.
        if !writeback
            && let Some(tx) = tx
        {
            g.add_to_transaction(tx);
        }
        if writeback {
            g.writeback()?;
        }

        tot += m;
    }

    if tot == 0 && n > 0 {
        return Err(FsError::OutOfBlocks);
    }
    Ok(tot)
}

/// Sets the file size and flushes the inode, once, after a batch of writes.
pub(crate) fn update_size(
    core: &FsCore,
    ip: &Inode,
    size: u32,
    tx: &Transaction,
) -> Result<(), FsError> {
    ip.set_size(size);
    iupdate(core, ip, Some(tx))
}

/// Copies the in-memory inode metadata into its inode-table slot and logs
/// the holding block.
///
/// Caller must hold the latch at least for read; holding it for write is
/// what makes the logged snapshot consistent.
pub(crate) fn iupdate(core: &FsCore, ip: &Inode, tx: Option<&Transaction>) -> Result<(), FsError> {
    let buf = core.buf.get(ip.dev(), core.sb.inode_block(ip.inum()))?;
    let mut g = buf.write();
    let dip = g.data_mut::<InodeBlock>().inode_mut(ip.inum());
    dip.ty = ip.ty() as i16;
    ip.with_meta(|meta| {
        dip.major = meta.major;
        dip.minor = meta.minor;
        dip.r#gen = meta.r#gen;
    });
    dip.nlink = ip.nlink();
    dip.size = ip.size();
    for (slot, a) in dip.addrs.iter_mut().enumerate() {
        *a = ip.addr(slot);
    }
    if let Some(tx) = tx {
        g.add_to_transaction(tx);
    }
    Ok(())
}

/// Frees every data block at logical offsets `>= offset`, in three tiers:
/// direct, indirect, doubly indirect. A tier root that becomes empty is
/// itself freed; a partially cleared indirect block is logged instead.
///
/// All frees are delayed, so nothing is reused before the transaction
/// commits. Sets `size = offset`; the caller flushes the inode.
///
/// Caller must hold the write latch.
pub(crate) fn itrunc(
    core: &FsCore,
    ip: &Inode,
    offset: usize,
    tx: &Transaction,
) -> Result<(), FsError> {
    debug_assert!(ip.write_latched(), "itrunc without the write latch");

    let size = ip.size() as usize;
    if size <= offset || offset >= MAXFILE * BSIZE {
        return Ok(());
    }

    // First logical block to wipe.
    let bn = offset.div_ceil(BSIZE);

    let (in_direct, in_indirect) = (bn < NDIRECT, bn >= NDIRECT && bn < NDIRECT + NINDIRECT);

    if in_direct {
        for i in bn..NDIRECT {
            let a = ip.addr(i);
            if a == 0 {
                break;
            }
            bfree(core, ip.dev(), BlockNo::new(a), Some(tx), true);
            ip.set_addr(i, 0);
        }
    }

    if bn < NDIRECT + NINDIRECT {
        let start = if in_indirect { bn - NDIRECT } else { 0 };
        let root = ip.addr(NDIRECT);
        if root != 0 {
            let root = BlockNo::new(root);
            {
                let buf = core.buf.get(ip.dev(), root)?;
                let mut g = buf.write();
                for i in start..NINDIRECT {
                    let Some(b) = g.data::<IndirectBlock>().get(i) else {
                        break;
                    };
                    bfree(core, ip.dev(), b, Some(tx), true);
                    g.data_mut::<IndirectBlock>().set(i, None);
                }
                if start != 0 {
                    // Partially cleared: the surviving block must commit.
                    g.add_to_transaction(tx);
                }
            }
            if start == 0 {
                bfree(core, ip.dev(), root, Some(tx), true);
                ip.set_addr(NDIRECT, 0);
            }
        }
    }

    {
        let start = bn.saturating_sub(NDIRECT + NINDIRECT);
        let root = ip.addr(NDIRECT + 1);
        if root != 0 {
            let root = BlockNo::new(root);
            {
                let l1_buf = core.buf.get(ip.dev(), root)?;
                let mut l1 = l1_buf.write();
                let mut begin = start;
                for i in begin / NINDIRECT..NINDIRECT {
                    let Some(mid) = l1.data::<IndirectBlock>().get(i) else {
                        break;
                    };
                    {
                        let l2_buf = core.buf.get(ip.dev(), mid)?;
                        let mut l2 = l2_buf.write();
                        for j in begin % NINDIRECT..NINDIRECT {
                            let Some(b) = l2.data::<IndirectBlock>().get(j) else {
                                break;
                            };
                            bfree(core, ip.dev(), b, Some(tx), true);
                            l2.data_mut::<IndirectBlock>().set(j, None);
                        }
                        if begin % NINDIRECT != 0 {
                            l2.add_to_transaction(tx);
                        }
                    }
                    if begin % NINDIRECT == 0 {
                        bfree(core, ip.dev(), mid, Some(tx), true);
                        l1.data_mut::<IndirectBlock>().set(i, None);
                    }
                    // Only the first second-level block starts mid-way.
                    begin = 0;
                }
                if start != 0 {
                    l1.add_to_transaction(tx);
                }
            }
            if start == 0 {
                bfree(core, ip.dev(), root, Some(tx), true);
                ip.set_addr(NDIRECT + 1, 0);
            }
        }
    }

    if offset == 0 {
        for i in 0..NDIRECT + 2 {
            assert_eq!(ip.addr(i), 0, "itrunc(0) left a block mapped");
        }
    }

    ip.set_size(offset as u32);
    Ok(())
}

/// Evicts this inode's clean cached blocks.
///
/// If an indirect or doubly-indirect block is itself absent from the cache,
/// none of the blocks under it can be cached either, so nothing is read from
/// the disk just to be thrown away.
pub(crate) fn drop_bufcache(core: &FsCore, ip: &Inode) -> Result<(), FsError> {
    let dev = ip.dev();

    for i in 0..NDIRECT {
        let a = ip.addr(i);
        if a != 0 {
            core.buf.drop_clean(dev, BlockNo::new(a));
        }
    }

    let root = ip.addr(NDIRECT);
    if root != 0 && core.buf.in_cache(dev, BlockNo::new(root)) {
        let root = BlockNo::new(root);
        let leaves = read_slots(core, ip, root)?;
        for b in leaves {
            core.buf.drop_clean(dev, b);
        }
        core.buf.drop_clean(dev, root);
    }

    let root = ip.addr(NDIRECT + 1);
    if root != 0 && core.buf.in_cache(dev, BlockNo::new(root)) {
        let root = BlockNo::new(root);
        let mids = read_slots(core, ip, root)?;
        for mid in mids {
            if !core.buf.in_cache(dev, mid) {
                continue;
            }
            let leaves = read_slots(core, ip, mid)?;
            for b in leaves {
                core.buf.drop_clean(dev, b);
            }
            core.buf.drop_clean(dev, mid);
        }
        core.buf.drop_clean(dev, root);
    }

    Ok(())
}

/// The non-empty slots of an indirect block, collected with the guard (and
/// the pin) released before the caller starts evicting.
fn read_slots(core: &FsCore, ip: &Inode, bno: BlockNo) -> Result<Vec<BlockNo>, FsError> {
    let buf = core.buf.get(ip.dev(), bno)?;
    let g = buf.read();
    let ind = g.data::<IndirectBlock>();
    Ok((0..NINDIRECT).filter_map(|i| ind.get(i)).collect())
}
