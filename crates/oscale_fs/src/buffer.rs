//! Buffer cache: pinned in-memory images of disk blocks.
//!
//! [`BufCache::get`] returns a reference-counted handle to the cached block,
//! reading it from the device on first access. Holding a [`BufRef`] pins the
//! block in the cache; eviction only considers clean, unreferenced blocks.
//!
//! Mutating operations never write home locations directly: they update the
//! cached image under the write guard and either snapshot it into a
//! [`Transaction`](crate::Transaction) (journaled path) or push it straight to
//! the device with [`BufWriteGuard::writeback`] (direct path).

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use dataview::Pod;
use oscale_fs_types::{Block, BlockNo};

use crate::{
    device::{BlockDevice, DeviceNo},
    error::FsError,
    journal::Transaction,
};

pub struct BufCache {
    dev: DeviceNo,
    device: Arc<dyn BlockDevice>,
    blocks: Mutex<HashMap<(DeviceNo, BlockNo), Arc<Buf>>>,
}

pub struct Buf {
    bno: BlockNo,
    device: Arc<dyn BlockDevice>,
    state: RwLock<BufData>,
}

struct BufData {
    valid: bool,
    dirty: bool,
    data: Box<Block>,
}

/// A pinned reference to a cached block.
#[derive(Clone)]
pub struct BufRef {
    buf: Arc<Buf>,
}

pub struct BufReadGuard<'a> {
    guard: RwLockReadGuard<'a, BufData>,
}

pub struct BufWriteGuard<'a> {
    buf: &'a Buf,
    guard: RwLockWriteGuard<'a, BufData>,
}

impl BufCache {
    pub fn new(dev: DeviceNo, device: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            device,
            blocks: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, dev: DeviceNo, bno: BlockNo) -> Arc<Buf> {
        assert_eq!(dev, self.dev, "buffer cache serves a single device");
        let mut blocks = self.blocks.lock().unwrap();
        Arc::clone(blocks.entry((dev, bno)).or_insert_with(|| {
            Arc::new(Buf {
                bno,
                device: Arc::clone(&self.device),
                state: RwLock::new(BufData {
                    valid: false,
                    dirty: false,
                    data: Box::new(Block::zeroed()),
                }),
            })
        }))
    }

    /// Returns the cached block, reading it from the device if the cached
    /// image is not yet valid.
    pub fn get(&self, dev: DeviceNo, bno: BlockNo) -> Result<BufRef, FsError> {
        let buf = self.entry(dev, bno);
        {
            let mut state = buf.state.write().unwrap();
            if !state.valid {
                buf.device.read(bno, &mut state.data)?;
                state.valid = true;
                state.dirty = false;
            }
        }
        Ok(BufRef { buf })
    }

    /// Returns the cached block without reading the device.
    ///
    /// A fresh (uncached) block comes back zero-filled; an already-cached
    /// block keeps its contents. Used when the caller will overwrite the
    /// whole block anyway.
    pub fn get_uncached(&self, dev: DeviceNo, bno: BlockNo) -> BufRef {
        let buf = self.entry(dev, bno);
        {
            let mut state = buf.state.write().unwrap();
            if !state.valid {
                state.valid = true;
                state.dirty = false;
            }
        }
        BufRef { buf }
    }

    pub fn in_cache(&self, dev: DeviceNo, bno: BlockNo) -> bool {
        self.blocks.lock().unwrap().contains_key(&(dev, bno))
    }

    /// Evicts the block if it is clean and no one holds a reference to it.
    pub fn drop_clean(&self, dev: DeviceNo, bno: BlockNo) {
        let mut blocks = self.blocks.lock().unwrap();
        let Some(buf) = blocks.get(&(dev, bno)) else {
            return;
        };
        if Arc::strong_count(buf) != 1 {
            return;
        }
        // The map lock excludes new references, so try_read cannot contend.
        let clean = buf.state.try_read().is_ok_and(|state| !state.dirty);
        if clean {
            blocks.remove(&(dev, bno));
        }
    }

    /// Number of cached blocks, for diagnostics and tests.
    pub fn len(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BufRef {
    pub fn bno(&self) -> BlockNo {
        self.buf.bno
    }

    pub fn read(&self) -> BufReadGuard<'_> {
        let guard = self.buf.state.read().unwrap();
        assert!(guard.valid, "reading invalid buffer");
        BufReadGuard { guard }
    }

    pub fn write(&self) -> BufWriteGuard<'_> {
        let guard = self.buf.state.write().unwrap();
        assert!(guard.valid, "writing invalid buffer");
        BufWriteGuard {
            buf: &self.buf,
            guard,
        }
    }
}

impl BufReadGuard<'_> {
    pub fn bytes(&self) -> &[u8] {
        self.guard.data.bytes()
    }

    pub fn data<T: Pod>(&self) -> &T {
        self.guard.data.data()
    }

    pub fn data_at<T: Pod>(&self, offset: usize) -> &T {
        self.guard.data.data_at(offset)
    }
}

impl BufWriteGuard<'_> {
    pub fn bytes(&self) -> &[u8] {
        self.guard.data.bytes()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.guard.dirty = true;
        self.guard.data.bytes_mut()
    }

    pub fn data<T: Pod>(&self) -> &T {
        self.guard.data.data()
    }

    pub fn data_mut<T: Pod>(&mut self) -> &mut T {
        self.guard.dirty = true;
        self.guard.data.data_mut()
    }

    /// Replaces the whole block image.
    pub fn set_data(&mut self, data: &Block) {
        self.guard.dirty = true;
        (*self.guard.data).clone_from(data);
    }

    pub fn fill_zero(&mut self) {
        self.guard.dirty = true;
        self.guard.data.fill_zero();
    }

    pub fn is_dirty(&self) -> bool {
        self.guard.dirty
    }

    /// Snapshots this block's current image into `tx`.
    ///
    /// The snapshot is taken under the write guard so exactly this version of
    /// the contents is what commits; the buffer is marked clean at the same
    /// moment.
    pub fn add_to_transaction(&mut self, tx: &Transaction) {
        tx.add_block(self.buf.bno, &self.guard.data);
        self.guard.dirty = false;
    }

    /// Writes the block image to the device.
    pub fn writeback(&mut self) -> io::Result<()> {
        assert!(self.guard.valid);
        self.buf.device.write(self.buf.bno, &self.guard.data)?;
        self.guard.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingDevice {
        inner: crate::device::MemDevice,
        reads: AtomicUsize,
        writes: AtomicUsize,
    }

    impl CountingDevice {
        fn new(nblocks: u32) -> Self {
            Self {
                inner: crate::device::MemDevice::new(nblocks),
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
            }
        }
    }

    impl BlockDevice for CountingDevice {
        fn read(&self, bno: BlockNo, data: &mut Block) -> io::Result<()> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read(bno, data)
        }

        fn write(&self, bno: BlockNo, data: &Block) -> io::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.write(bno, data)
        }

        fn size(&self) -> u32 {
            self.inner.size()
        }
    }

    fn cache(nblocks: u32) -> (Arc<CountingDevice>, BufCache) {
        let device = Arc::new(CountingDevice::new(nblocks));
        let cache = BufCache::new(DeviceNo::ROOT, Arc::clone(&device) as Arc<dyn BlockDevice>);
        (device, cache)
    }

    #[test]
    fn read_hits_device_once() {
        let (device, cache) = cache(8);
        let b0 = BlockNo::new(0);

        {
            let buf = cache.get(DeviceNo::ROOT, b0).unwrap();
            let mut g = buf.write();
            g.bytes_mut()[0] = 7;
            g.writeback().unwrap();
        }
        {
            let buf = cache.get(DeviceNo::ROOT, b0).unwrap();
            assert_eq!(buf.read().bytes()[0], 7);
        }

        assert_eq!(device.reads.load(Ordering::SeqCst), 1);
        assert_eq!(device.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn get_uncached_skips_disk_read() {
        let (device, cache) = cache(8);

        let buf = cache.get_uncached(DeviceNo::ROOT, BlockNo::new(3));
        assert_eq!(buf.read().bytes()[0], 0);
        assert_eq!(device.reads.load(Ordering::SeqCst), 0);

        // Once cached, a plain get does not read either.
        drop(buf);
        cache.get(DeviceNo::ROOT, BlockNo::new(3)).unwrap();
        assert_eq!(device.reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn add_to_transaction_marks_clean() {
        let (_device, cache) = cache(8);
        let tx = Transaction::new(1);

        let buf = cache.get(DeviceNo::ROOT, BlockNo::new(2)).unwrap();
        let mut g = buf.write();
        g.bytes_mut()[10] = 0xcc;
        assert!(g.is_dirty());
        g.add_to_transaction(&tx);
        assert!(!g.is_dirty());
    }

    #[test]
    fn drop_clean_respects_pins_and_dirt() {
        let (_device, cache) = cache(8);
        let b1 = BlockNo::new(1);

        let buf = cache.get(DeviceNo::ROOT, b1).unwrap();
        cache.drop_clean(DeviceNo::ROOT, b1);
        assert!(cache.in_cache(DeviceNo::ROOT, b1)); // pinned

        {
            let mut g = buf.write();
            g.bytes_mut()[0] = 1;
        }
        drop(buf);
        cache.drop_clean(DeviceNo::ROOT, b1);
        assert!(cache.in_cache(DeviceNo::ROOT, b1)); // dirty

        let buf = cache.get(DeviceNo::ROOT, b1).unwrap();
        buf.write().writeback().unwrap();
        drop(buf);
        cache.drop_clean(DeviceNo::ROOT, b1);
        assert!(!cache.in_cache(DeviceNo::ROOT, b1));
    }
}
