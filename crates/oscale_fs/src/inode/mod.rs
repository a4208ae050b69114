//! Inodes.
//!
//! An inode describes a single unnamed file. The inode disk structure holds
//! metadata: the file's type, its size, the number of links referring to it,
//! and the list of blocks holding the file's content.
//!
//! The kernel keeps a cache of in-use inodes in memory, keyed by
//! `(device, inode number)` in a hash table with per-bucket latches, to
//! provide a place for synchronizing access to inodes shared between
//! threads. The in-memory inode carries book-keeping that is not stored on
//! disk: the reference count, the `valid` flag, the latch, and the directory
//! index.
//!
//! An in-memory inode goes through a sequence of states:
//!
//! * **Uninit**: created by the losing half of [`iget`]'s publish step or by
//!   the winner before its disk metadata lands. Readers that find an
//!   un-initialized inode in the hash block on the condition variable until
//!   `valid` is set; `valid` becomes true exactly once.
//! * **Valid**: metadata matches the on-disk slot, modulo writes by latch
//!   holders. A non-zero link count contributes one reference, and every
//!   inode holds one extra reference from initialization until the reclaim
//!   path releases it, so an unlinked-but-open file stays cached.
//! * **Destructing**: the reference count hit zero. The inode is removed
//!   from the hash and handed to the epoch facility; destruction runs once
//!   every reader that might still observe the pointer has left its
//!   critical section.
//!
//! Locking: the `busy`/`readbusy` pair under the inode spinlock is a
//! single-writer/multi-reader latch that sleeps on the condition variable
//! (inode operations block on disk I/O, so a spinning reader/writer lock is
//! the wrong tool). Writers wait for both flags to clear; readers wait only
//! for `busy`. [`Inode::ilock`] is separate from [`iget`] so callers can hold
//! long-term references (open files, working directories) and lock only for
//! short critical sections.

use std::{
    cell::UnsafeCell,
    ptr::NonNull,
    sync::{
        Condvar, Mutex, Weak,
        atomic::{AtomicBool, AtomicI16, AtomicU32, AtomicU64, Ordering, fence},
    },
};

use oscale_fs_types::{Dinode, InodeBlock, InodeNo, NDIRECT, T_FREE};

use crate::{device::DeviceNo, error::FsError, fs::FsCore};

pub(crate) mod alloc;
pub(crate) mod content;
pub(crate) mod directory;
pub(crate) mod table;

use self::directory::DirIndex;

/// On-disk inode type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr)]
#[repr(i16)]
pub enum InodeType {
    Free = 0,
    Dir = 1,
    File = 2,
    Dev = 3,
}

#[derive(Debug, Clone, Copy)]
pub enum LockMode {
    Read,
    Write,
}

struct Latch {
    busy: bool,
    readbusy: u32,
}

/// Metadata mutated only under the write latch.
pub(crate) struct Meta {
    pub(crate) major: i16,
    pub(crate) minor: i16,
    pub(crate) r#gen: u32,
}

/// In-memory copy of an inode.
pub struct Inode {
    core: Weak<FsCore>,
    dev: DeviceNo,
    inum: InodeNo,

    /// Type tag; atomic so allocation can claim a free inode with a
    /// compare-exchange.
    ty: AtomicI16,
    nlink: AtomicI16,
    size: AtomicU32,
    valid: AtomicBool,
    refcount: AtomicU64,

    latch: Mutex<Latch>,
    cv: Condvar,

    meta: UnsafeCell<Meta>,
    addrs: [AtomicU32; NDIRECT + 2],

    pub(crate) dir: Mutex<Option<DirIndex>>,
}

// The UnsafeCell'd metadata is guarded by the busy/readbusy latch; every
// other field is atomic or lock-guarded.
unsafe impl Send for Inode {}
unsafe impl Sync for Inode {}

/// A counted reference to a cached inode.
pub struct InodeRef {
    ptr: NonNull<Inode>,
}

unsafe impl Send for InodeRef {}
unsafe impl Sync for InodeRef {}

struct SendPtr(NonNull<Inode>);
unsafe impl Send for SendPtr {}

impl std::ops::Deref for InodeRef {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        unsafe { self.ptr.as_ref() }
    }
}

impl Clone for InodeRef {
    fn clone(&self) -> Self {
        self.inc_ref();
        Self { ptr: self.ptr }
    }
}

impl Drop for InodeRef {
    fn drop(&mut self) {
        Inode::dec_ref(self.ptr);
    }
}

impl std::fmt::Debug for InodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeRef")
            .field("dev", &self.dev())
            .field("inum", &self.inum())
            .finish()
    }
}

impl Inode {
    fn new(core: &std::sync::Arc<FsCore>, dev: DeviceNo, inum: InodeNo) -> Box<Self> {
        Box::new(Self {
            core: std::sync::Arc::downgrade(core),
            dev,
            inum,
            ty: AtomicI16::new(T_FREE),
            nlink: AtomicI16::new(0),
            size: AtomicU32::new(0),
            valid: AtomicBool::new(false),
            refcount: AtomicU64::new(1),
            // Created holding the write latch so readers that find this
            // object before its metadata lands will wait.
            latch: Mutex::new(Latch {
                busy: true,
                readbusy: 1,
            }),
            cv: Condvar::new(),
            meta: UnsafeCell::new(Meta {
                major: 0,
                minor: 0,
                r#gen: 0,
            }),
            addrs: std::array::from_fn(|_| AtomicU32::new(0)),
            dir: Mutex::new(None),
        })
    }

    pub fn dev(&self) -> DeviceNo {
        self.dev
    }

    pub fn inum(&self) -> InodeNo {
        self.inum
    }

    pub fn ty(&self) -> InodeType {
        InodeType::from_repr(self.ty.load(Ordering::SeqCst)).expect("invalid inode type tag")
    }

    pub fn is_dir(&self) -> bool {
        self.ty() == InodeType::Dir
    }

    pub fn nlink(&self) -> i16 {
        self.nlink.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> u32 {
        self.size.load(Ordering::SeqCst)
    }

    pub(crate) fn set_size(&self, size: u32) {
        self.size.store(size, Ordering::SeqCst);
    }

    pub(crate) fn set_type(&self, ty: InodeType) {
        self.ty.store(ty as i16, Ordering::SeqCst);
    }

    pub(crate) fn ty_raw(&self) -> &AtomicI16 {
        &self.ty
    }

    /// The `i`th slot of the block map: direct blocks, then the indirect
    /// root, then the doubly-indirect root. Zero means absent.
    pub fn addr(&self, i: usize) -> u32 {
        self.addrs[i].load(Ordering::SeqCst)
    }

    pub(crate) fn set_addr(&self, i: usize, bno: u32) {
        self.addrs[i].store(bno, Ordering::SeqCst);
    }

    pub(crate) fn with_meta<R>(&self, f: impl FnOnce(&Meta) -> R) -> R {
        // Caller holds the latch at least for read.
        unsafe { f(&*self.meta.get()) }
    }

    pub(crate) fn with_meta_mut<R>(&self, f: impl FnOnce(&mut Meta) -> R) -> R {
        debug_assert!(self.write_latched());
        unsafe { f(&mut *self.meta.get()) }
    }

    /// Locks the inode, for write if `mode` is [`LockMode::Write`] and for
    /// read otherwise.
    pub fn ilock(&self, mode: LockMode) {
        let mut latch = self.latch.lock().unwrap();
        match mode {
            LockMode::Write => {
                while latch.busy || latch.readbusy > 0 {
                    latch = self.cv.wait(latch).unwrap();
                }
                latch.busy = true;
            }
            LockMode::Read => {
                while latch.busy {
                    latch = self.cv.wait(latch).unwrap();
                }
            }
        }
        latch.readbusy += 1;
        drop(latch);

        if !self.valid.load(Ordering::Acquire) {
            panic!("ilock: inode {}.{} valid flag is false", self.dev, self.inum);
        }
    }

    /// Unlocks the inode.
    pub fn iunlock(&self) {
        let mut latch = self.latch.lock().unwrap();
        if !latch.busy && latch.readbusy == 0 {
            panic!("iunlock: inode {}.{} not locked", self.dev, self.inum);
        }
        latch.readbusy -= 1;
        latch.busy = false;
        drop(latch);
        self.cv.notify_all();
    }

    pub(crate) fn write_latched(&self) -> bool {
        self.latch.lock().unwrap().busy
    }

    /// Bumps the link count. Crossing zero takes the reference the link
    /// count contributes.
    ///
    /// Caller must hold the write latch if the inode is reachable from
    /// multiple threads.
    pub(crate) fn link(&self) {
        if self.nlink.fetch_add(1, Ordering::SeqCst) == 0 {
            self.inc_ref();
        }
    }

    /// Drops the link count. Reaching zero releases the link-count
    /// reference; the initialization-time reference keeps the inode alive
    /// for any open descriptors.
    pub(crate) fn unlink(&self) {
        if self.nlink.fetch_sub(1, Ordering::SeqCst) == 1 {
            Inode::dec_ref(NonNull::from(self));
        }
    }

    pub(crate) fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::SeqCst)
    }

    fn inc_ref(&self) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    fn try_acquire(ptr: NonNull<Inode>) -> Option<InodeRef> {
        let ip = unsafe { ptr.as_ref() };
        let mut count = ip.refcount.load(Ordering::Relaxed);
        loop {
            if count == 0 {
                return None;
            }
            match ip.refcount.compare_exchange_weak(
                count,
                count + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(InodeRef { ptr }),
                Err(cur) => count = cur,
            }
        }
    }

    fn dec_ref(ptr: NonNull<Inode>) {
        let last = {
            let ip = unsafe { ptr.as_ref() };
            ip.refcount.fetch_sub(1, Ordering::Release) == 1
        };
        if last {
            fence(Ordering::Acquire);
            Self::onzero(ptr);
        }
    }

    /// Tears down an inode whose reference count reached zero: unpublish it
    /// from the hash, then defer destruction past every concurrent reader's
    /// epoch.
    fn onzero(ptr: NonNull<Inode>) {
        let (dev, inum, core) = {
            let ip = unsafe { ptr.as_ref() };
            {
                let mut latch = ip.latch.lock().unwrap();
                if latch.busy || latch.readbusy > 0 {
                    panic!("inode {}.{} destructed while busy", ip.dev, ip.inum);
                }
                if !ip.valid.load(Ordering::Acquire) {
                    panic!("inode {}.{} destructed while not valid", ip.dev, ip.inum);
                }
                latch.busy = true;
                latch.readbusy = 1;
            }
            (ip.dev, ip.inum, ip.core.upgrade())
        };

        match core {
            Some(core) => {
                core.itable.remove(dev, inum, ptr);
                let p = SendPtr(ptr);
                core.gc.defer(move || {
                    let p = p;
                    unsafe { drop(Box::from_raw(p.0.as_ptr())) };
                });
            }
            // The file system is gone, so no reader can hold this pointer.
            None => unsafe { drop(Box::from_raw(ptr.as_ptr())) },
        }
    }

    fn wait_valid(&self) {
        if self.valid.load(Ordering::Acquire) {
            return;
        }
        let mut latch = self.latch.lock().unwrap();
        while !self.valid.load(Ordering::Acquire) {
            latch = self.cv.wait(latch).unwrap();
        }
    }

    /// Fills in the metadata read from disk and publishes it to waiting
    /// readers. Runs under the creation latch.
    fn init_loaded(&self, dip: &Dinode) {
        self.ty.store(dip.ty, Ordering::SeqCst);
        self.nlink.store(dip.nlink, Ordering::SeqCst);
        self.size.store(dip.size, Ordering::SeqCst);
        unsafe {
            let meta = &mut *self.meta.get();
            meta.major = dip.major;
            meta.minor = dip.minor;
            meta.r#gen = dip.r#gen;
        }
        for (slot, &bno) in self.addrs.iter().zip(&dip.addrs) {
            slot.store(bno, Ordering::SeqCst);
        }

        if dip.nlink > 0 {
            self.inc_ref();
        }
        // Second increment: keeps the inode around until all open file
        // descriptors close, even if that happens after the last unlink.
        // The reclaim path releases it.
        self.inc_ref();

        let latch = self.latch.lock().unwrap();
        self.valid.store(true, Ordering::Release);
        drop(latch);
        self.cv.notify_all();
    }
}

/// Finds the inode with number `inum` on device `dev` and returns a counted
/// reference to the in-memory copy, creating it (and loading the disk
/// metadata) if it is not cached.
///
/// Two threads racing to create the same inode both build an object; the
/// loser of the hash insert discards its copy and walks the winner's.
pub(crate) fn iget(
    core: &std::sync::Arc<FsCore>,
    dev: DeviceNo,
    inum: InodeNo,
) -> Result<InodeRef, FsError> {
    loop {
        {
            let _epoch = core.gc.pin();
            if let Some(ptr) = core.itable.lookup(dev, inum) {
                if let Some(ip) = Inode::try_acquire(ptr) {
                    drop(_epoch);
                    ip.wait_valid();
                    return Ok(ip);
                }
                // The object is being destructed; wait for its removal.
                drop(_epoch);
                std::thread::yield_now();
                continue;
            }
        }

        // Read the disk inode before publishing anything, so an I/O error
        // leaves no half-made cache entry behind.
        let dip = {
            let buf = core.buf.get(dev, core.sb.inode_block(inum))?;
            let g = buf.read();
            g.data::<InodeBlock>().inode(inum).clone()
        };

        let ptr = NonNull::from(Box::leak(Inode::new(core, dev, inum)));
        if !core.itable.insert(dev, inum, ptr) {
            // Lost the insert race; retry and walk the winner's object.
            unsafe { drop(Box::from_raw(ptr.as_ptr())) };
            continue;
        }
        let ip = InodeRef { ptr };
        ip.init_loaded(&dip);
        ip.iunlock();
        return Ok(ip);
    }
}

/// Releases the reference taken at initialization time.
///
/// Called once per inode by the reclaim path after the last open descriptor
/// goes away; afterwards the inode's lifetime is governed by links and
/// outstanding references alone.
pub(crate) fn release_retained(ip: &InodeRef) {
    Inode::dec_ref(ip.ptr);
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        FileSystem, MemDevice,
        mkfs::{self, MkfsOptions},
    };

    pub(crate) fn fresh_fs() -> (Arc<MemDevice>, FileSystem) {
        let device = Arc::new(MemDevice::new(1024));
        mkfs::format(
            &(Arc::clone(&device) as Arc<dyn crate::BlockDevice>),
            &MkfsOptions {
                size: 1024,
                ninodes: 128,
                njournal: 64,
            },
        )
        .unwrap();
        let fs = FileSystem::mount(Arc::clone(&device) as Arc<dyn crate::BlockDevice>).unwrap();
        (device, fs)
    }

    #[test]
    fn iget_returns_cached_object() {
        let (_device, fs) = fresh_fs();
        let a = fs.iget(DeviceNo::ROOT, InodeNo::ROOT).unwrap();
        let b = fs.iget(DeviceNo::ROOT, InodeNo::ROOT).unwrap();
        assert!(std::ptr::eq(&*a, &*b));
        assert_eq!(a.ty(), InodeType::Dir);
    }

    #[test]
    fn concurrent_iget_single_object() {
        let (_device, fs) = fresh_fs();
        let fs = Arc::new(fs);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fs = Arc::clone(&fs);
                std::thread::spawn(move || {
                    let ip = fs.iget(DeviceNo::ROOT, InodeNo::ROOT).unwrap();
                    std::ptr::from_ref(&*ip) as usize
                })
            })
            .collect();
        let ptrs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ptrs.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn latch_excludes_writers() {
        let (_device, fs) = fresh_fs();
        let ip = fs.root();

        ip.ilock(LockMode::Read);
        let ip2 = ip.clone();
        let locked = Arc::new(AtomicBool::new(false));
        let locked2 = Arc::clone(&locked);
        let h = std::thread::spawn(move || {
            ip2.ilock(LockMode::Write);
            locked2.store(true, Ordering::SeqCst);
            ip2.iunlock();
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!locked.load(Ordering::SeqCst), "writer ran under read latch");
        ip.iunlock();
        h.join().unwrap();
        assert!(locked.load(Ordering::SeqCst));
    }

    #[test]
    fn read_latch_is_shared() {
        let (_device, fs) = fresh_fs();
        let ip = fs.root();

        ip.ilock(LockMode::Read);
        let ip2 = ip.clone();
        // A second reader must not block.
        let h = std::thread::spawn(move || {
            ip2.ilock(LockMode::Read);
            ip2.iunlock();
        });
        h.join().unwrap();
        ip.iunlock();
    }

    #[test]
    #[should_panic(expected = "not locked")]
    fn unlock_unlocked_is_fatal() {
        let (_device, fs) = fresh_fs();
        let ip = fs.root();
        ip.iunlock();
    }

    #[test]
    fn refcount_accounting() {
        let (_device, fs) = fresh_fs();
        let root = fs.root();
        // Outstanding handles (the mount's plus ours) + one for nlink > 0
        // + the initialization-time reference.
        assert_eq!(root.refcount(), 4);

        let extra = root.clone();
        assert_eq!(root.refcount(), 5);
        drop(extra);
        assert_eq!(root.refcount(), 4);
    }
}
