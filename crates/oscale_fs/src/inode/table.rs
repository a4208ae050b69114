//! The inode cache hash: `(device, inode number)` to in-memory inode.
//!
//! Buckets carry their own latches, so lookups touching different buckets
//! never contend. The table holds weak (uncounted) pointers; the reference
//! count owns the inode's lifetime, and readers walking a bucket must be
//! inside an epoch critical section.

use std::{ptr::NonNull, sync::Mutex};

use oscale_fs_types::InodeNo;

use crate::{device::DeviceNo, params::NBUCKET};

use super::Inode;

struct Entry {
    dev: DeviceNo,
    inum: InodeNo,
    ptr: NonNull<Inode>,
}

pub(crate) struct InodeTable {
    buckets: Box<[Mutex<Vec<Entry>>]>,
}

unsafe impl Send for InodeTable {}
unsafe impl Sync for InodeTable {}

impl InodeTable {
    pub(crate) fn new() -> Self {
        Self {
            buckets: (0..NBUCKET).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    fn bucket(&self, dev: DeviceNo, inum: InodeNo) -> &Mutex<Vec<Entry>> {
        let h = (u64::from(dev.value()) << 32) | u64::from(inum.value());
        &self.buckets[(h % NBUCKET as u64) as usize]
    }

    pub(crate) fn lookup(&self, dev: DeviceNo, inum: InodeNo) -> Option<NonNull<Inode>> {
        let bucket = self.bucket(dev, inum).lock().unwrap();
        bucket
            .iter()
            .find(|e| e.dev == dev && e.inum == inum)
            .map(|e| e.ptr)
    }

    /// Publishes `ptr` under `(dev, inum)`. Returns `false` if the key is
    /// already present (the caller lost an insert race).
    pub(crate) fn insert(&self, dev: DeviceNo, inum: InodeNo, ptr: NonNull<Inode>) -> bool {
        let mut bucket = self.bucket(dev, inum).lock().unwrap();
        if bucket.iter().any(|e| e.dev == dev && e.inum == inum) {
            return false;
        }
        bucket.push(Entry { dev, inum, ptr });
        true
    }

    /// Unpublishes `(dev, inum)`; the stored pointer must be `ptr`.
    pub(crate) fn remove(&self, dev: DeviceNo, inum: InodeNo, ptr: NonNull<Inode>) {
        let mut bucket = self.bucket(dev, inum).lock().unwrap();
        let i = bucket
            .iter()
            .position(|e| e.dev == dev && e.inum == inum)
            .unwrap_or_else(|| panic!("inode {dev}.{inum} not in table"));
        assert_eq!(bucket[i].ptr, ptr, "inode table entry clobbered");
        bucket.swap_remove(i);
    }
}
