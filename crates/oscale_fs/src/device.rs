//! Block device interface and the devices shipped with the crate.

use std::{
    fmt,
    fs::File,
    io::{self, Read as _, Seek as _, SeekFrom, Write as _},
    path::Path,
    sync::Mutex,
};

use oscale_fs_types::{BSIZE, Block, BlockNo};

/// Device number. Device 1 is the root file system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct DeviceNo(u32);

impl DeviceNo {
    pub const ROOT: Self = Self(1);

    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A device addressable in [`BSIZE`]-byte blocks.
///
/// The driver behind this trait owns request queueing and completion; the
/// file system is synchronous on top of it.
pub trait BlockDevice: Send + Sync {
    fn read(&self, bno: BlockNo, data: &mut Block) -> io::Result<()>;

    fn write(&self, bno: BlockNo, data: &Block) -> io::Result<()>;

    /// Device capacity in blocks.
    fn size(&self) -> u32;
}

/// A memory-backed block device.
///
/// Supports point-in-time snapshots, which the crash-consistency tests use to
/// model power loss: snapshot the "disk", keep writing, then remount from the
/// snapshot.
pub struct MemDevice {
    blocks: Mutex<Vec<Block>>,
}

impl MemDevice {
    #[must_use]
    pub fn new(nblocks: u32) -> Self {
        Self {
            blocks: Mutex::new(vec![Block::zeroed(); nblocks as usize]),
        }
    }

    /// A new device holding a copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        Self {
            blocks: Mutex::new(self.blocks.lock().unwrap().clone()),
        }
    }
}

impl BlockDevice for MemDevice {
    fn read(&self, bno: BlockNo, data: &mut Block) -> io::Result<()> {
        let blocks = self.blocks.lock().unwrap();
        let Some(block) = blocks.get(bno.as_index()) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block {bno} out of range"),
            ));
        };
        data.clone_from(block);
        Ok(())
    }

    fn write(&self, bno: BlockNo, data: &Block) -> io::Result<()> {
        let mut blocks = self.blocks.lock().unwrap();
        let Some(block) = blocks.get_mut(bno.as_index()) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block {bno} out of range"),
            ));
        };
        block.clone_from(data);
        Ok(())
    }

    fn size(&self) -> u32 {
        self.blocks.lock().unwrap().len() as u32
    }
}

/// A block device backed by a regular file (a file system image).
pub struct FileDevice {
    file: Mutex<File>,
    nblocks: u32,
}

impl FileDevice {
    /// Creates (or truncates) an image file of `nblocks` blocks.
    pub fn create(path: &Path, nblocks: u32) -> io::Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(u64::from(nblocks) * BSIZE as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            nblocks,
        })
    }

    /// Opens an existing image file.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % BSIZE as u64 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "image size is not a multiple of the block size",
            ));
        }
        Ok(Self {
            file: Mutex::new(file),
            nblocks: u32::try_from(len / BSIZE as u64).unwrap(),
        })
    }
}

impl BlockDevice for FileDevice {
    fn read(&self, bno: BlockNo, data: &mut Block) -> io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(u64::from(bno.value()) * BSIZE as u64))?;
        file.read_exact(data.bytes_mut())?;
        Ok(())
    }

    fn write(&self, bno: BlockNo, data: &Block) -> io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(u64::from(bno.value()) * BSIZE as u64))?;
        file.write_all(data.bytes())?;
        Ok(())
    }

    fn size(&self) -> u32 {
        self.nblocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trip() {
        let dev = MemDevice::new(4);
        let mut block = Block::zeroed();
        block.bytes_mut()[0] = 0xab;
        dev.write(BlockNo::new(2), &block).unwrap();

        let mut out = Block::zeroed();
        dev.read(BlockNo::new(2), &mut out).unwrap();
        assert_eq!(out.bytes()[0], 0xab);
    }

    #[test]
    fn mem_device_snapshot_is_isolated() {
        let dev = MemDevice::new(2);
        let mut block = Block::zeroed();
        block.bytes_mut()[0] = 1;
        dev.write(BlockNo::new(0), &block).unwrap();

        let snap = dev.snapshot();
        block.bytes_mut()[0] = 2;
        dev.write(BlockNo::new(0), &block).unwrap();

        let mut out = Block::zeroed();
        snap.read(BlockNo::new(0), &mut out).unwrap();
        assert_eq!(out.bytes()[0], 1);
    }

    #[test]
    fn mem_device_out_of_range() {
        let dev = MemDevice::new(1);
        let mut block = Block::zeroed();
        assert!(dev.read(BlockNo::new(1), &mut block).is_err());
    }

    #[test]
    fn file_device_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fs.img");
        let dev = FileDevice::create(&path, 8).unwrap();

        let mut block = Block::zeroed();
        block.bytes_mut()[100] = 0x5a;
        dev.write(BlockNo::new(3), &block).unwrap();
        drop(dev);

        let dev = FileDevice::open(&path).unwrap();
        assert_eq!(dev.size(), 8);
        let mut out = Block::zeroed();
        dev.read(BlockNo::new(3), &mut out).unwrap();
        assert_eq!(out.bytes()[100], 0x5a);
    }
}
