//! Inode allocation.
//!
//! Two cooperating mechanisms live here:
//!
//! * [`ialloc`] claims a free on-disk inode by type tag: it scans the inum
//!   space starting just past the CPU's previous allocation and flips
//!   `FREE -> ty` with a compare-exchange on the cached inode, so concurrent
//!   creators on different CPUs start from different positions and never
//!   clobber each other.
//! * [`InumAlloc`] hands out free inode *numbers* in O(1) from per-CPU
//!   freelists, refilled from a global reserve list. The record vector gives
//!   O(1) frees: `free(inum)` flips the record and pushes onto the calling
//!   CPU's list.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use log::warn;
use oscale_fs_types::{InodeBlock, InodeNo, T_FREE};

use crate::{
    buffer::BufCache,
    device::DeviceNo,
    error::FsError,
    fs::FsCore,
    params::{INUM_SEED_PER_CPU, NCPU, cpu_id},
};

use super::{InodeRef, LockMode, InodeType, iget};

/// Allocates a new inode with the given type on device `dev`.
///
/// Returns the inode locked for write. Fails with
/// [`FsError::NoInums`] when every inode is in use.
pub(crate) fn ialloc(
    core: &Arc<FsCore>,
    dev: DeviceNo,
    ty: InodeType,
) -> Result<InodeRef, FsError> {
    assert_ne!(ty as i16, T_FREE);

    let ninodes = core.sb.ninodes;
    let cpu = cpu_id();
    let start = core.last_inode[cpu].load(Ordering::Relaxed) % ninodes + 1;

    // Scan [start, ninodes) and then wrap once through [1, start).
    let mut inum = if start >= ninodes { 1 } else { start };
    for _ in 1..ninodes {
        let ip = iget(core, dev, InodeNo::new(inum))?;
        if ip
            .ty_raw()
            .compare_exchange(T_FREE, ty as i16, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // Freshly claimed: lock it before anyone can see a half-made
            // file, and bump the generation.
            core.inums.claim(inum);
            ip.ilock(LockMode::Write);
            ip.with_meta_mut(|meta| meta.r#gen += 1);
            if ip.nlink() != 0 || ip.size() != 0 || ip.addr(0) != 0 {
                panic!("ialloc: inode {inum} not zeroed");
            }
            core.last_inode[cpu].store(inum, Ordering::Relaxed);
            return Ok(ip);
        }

        inum += 1;
        if inum >= ninodes {
            inum = 1;
        }
    }

    warn!("ialloc: 0/{ninodes} inodes free");
    Err(FsError::NoInums)
}

struct FreeList {
    inums: Mutex<Vec<u32>>,
}

/// O(1) allocator for free inode numbers.
pub(crate) struct InumAlloc {
    /// `is_free` per inum; index is the inum itself.
    records: Vec<AtomicBool>,
    /// Per-CPU freelists; entries never move between CPU lists on the hot
    /// path.
    freelists: [FreeList; NCPU],
    /// Global reserve pool, drained in batches when a CPU list runs dry.
    reserve: FreeList,
}

impl InumAlloc {
    /// Builds the allocator by scanning the on-disk inode table: every inode
    /// whose type is free goes onto a list, seeding each CPU before the rest
    /// lands in the reserve.
    pub(crate) fn from_disk(
        buf: &BufCache,
        sb: &oscale_fs_types::SuperBlock,
        dev: DeviceNo,
    ) -> Result<Self, FsError> {
        let ninodes = sb.ninodes as usize;
        let mut records = Vec::with_capacity(ninodes);
        records.resize_with(ninodes, || AtomicBool::new(false));
        let freelists = std::array::from_fn(|_| FreeList {
            inums: Mutex::new(Vec::new()),
        });
        let reserve = FreeList {
            inums: Mutex::new(Vec::new()),
        };
        let alloc = Self {
            records,
            freelists,
            reserve,
        };

        let mut cpu = 0;
        for inum in 1..sb.ninodes {
            let ino = InodeNo::new(inum);
            let b = buf.get(dev, sb.inode_block(ino))?;
            let free = b.read().data::<InodeBlock>().inode(ino).is_free();
            if !free {
                continue;
            }
            alloc.records[inum as usize].store(true, Ordering::Relaxed);
            let seed_list = &alloc.freelists[cpu].inums;
            if seed_list.lock().unwrap().len() < INUM_SEED_PER_CPU {
                seed_list.lock().unwrap().push(inum);
                cpu = (cpu + 1) % NCPU;
            } else {
                alloc.reserve.inums.lock().unwrap().push(inum);
            }
        }
        Ok(alloc)
    }

    /// Takes a free inum, preferring this CPU's list and falling back to the
    /// reserve.
    ///
    /// The `is_free` record is the authority: a list entry whose record was
    /// already claimed (by the type-tag scan path) is stale and skipped.
    pub(crate) fn alloc(&self) -> Result<u32, FsError> {
        let cpu = cpu_id();
        let mut list = self.freelists[cpu].inums.lock().unwrap();
        loop {
            let Some(inum) = list.pop() else {
                // Refill from the reserve in one batch; lock order is
                // always CPU list then reserve.
                let mut reserve = self.reserve.inums.lock().unwrap();
                if reserve.is_empty() {
                    return Err(FsError::NoInums);
                }
                let take = usize::min(INUM_SEED_PER_CPU, reserve.len());
                let at = reserve.len() - take;
                list.extend(reserve.drain(at..));
                continue;
            };
            if self.records[inum as usize].swap(false, Ordering::SeqCst) {
                return Ok(inum);
            }
        }
    }

    /// Marks `inum` allocated without going through a freelist. The scan
    /// path calls this when it claims an inode by type tag; the list entry
    /// it leaves behind is skipped by [`alloc`](Self::alloc).
    pub(crate) fn claim(&self, inum: u32) {
        self.records[inum as usize].store(false, Ordering::SeqCst);
    }

    /// Returns `inum` to this CPU's freelist.
    pub(crate) fn free(&self, inum: u32) {
        let was_free = self.records[inum as usize].swap(true, Ordering::SeqCst);
        assert!(!was_free, "inum {inum} freed twice");
        self.freelists[cpu_id()].inums.lock().unwrap().push(inum);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::inode::tests::fresh_fs;

    #[test]
    fn inum_alloc_round_trip() {
        let (_device, fs) = fresh_fs();
        let a = fs.alloc_inum().unwrap();
        let b = fs.alloc_inum().unwrap();
        assert_ne!(a, b);
        fs.free_inum(a);
        fs.free_inum(b);
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_free_is_fatal() {
        let (_device, fs) = fresh_fs();
        let a = fs.alloc_inum().unwrap();
        fs.free_inum(a);
        fs.free_inum(a);
    }

    #[test]
    fn exhaustion_drains_reserve_then_fails() {
        let (_device, fs) = fresh_fs();
        let mut taken = Vec::new();
        loop {
            match fs.alloc_inum() {
                Ok(inum) => taken.push(inum),
                Err(FsError::NoInums) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        // Inum 1 (root) is live; everything else was free.
        let unique: HashSet<_> = taken.iter().copied().collect();
        assert_eq!(unique.len(), taken.len(), "inum handed out twice");
        assert_eq!(taken.len() as u32, 128 - 2); // inums 1..128, minus root
        for inum in taken {
            fs.free_inum(inum);
        }
    }

    #[test]
    fn concurrent_ialloc_distinct_inums() {
        let (_device, fs) = fresh_fs();
        let fs = std::sync::Arc::new(fs);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fs = std::sync::Arc::clone(&fs);
                std::thread::spawn(move || {
                    let ip = fs.ialloc(DeviceNo::ROOT, InodeType::File).unwrap();
                    let inum = ip.inum().value();
                    assert_eq!(ip.ty(), InodeType::File);
                    ip.iunlock();
                    inum
                })
            })
            .collect();
        let inums: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let unique: HashSet<_> = inums.iter().copied().collect();
        assert_eq!(unique.len(), inums.len(), "two creators claimed one inode");
    }
}
