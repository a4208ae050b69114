//! File system formatting.
//!
//! Lays out an empty file system on a block device: superblock, zeroed
//! inode table and journal, a free bitmap with every metadata block marked
//! in use, and a root directory holding `"."` and `".."`.

use std::sync::Arc;

use dataview::PodMethods as _;
use oscale_fs_types::{
    BPB, Block, BlockNo, DirEntry, Dinode, IPB, InodeNo, SuperBlock, T_DIR,
};

use crate::{device::BlockDevice, error::FsError};

pub struct MkfsOptions {
    /// Total image size in blocks.
    pub size: u32,
    /// Number of inodes (inum space is `1..ninodes`).
    pub ninodes: u32,
    /// Journal region length in blocks, header included.
    pub njournal: u32,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self {
            size: 4096,
            ninodes: 512,
            njournal: 512,
        }
    }
}

/// Formats `device` and returns the superblock that was written.
pub fn format(device: &Arc<dyn BlockDevice>, opts: &MkfsOptions) -> Result<SuperBlock, FsError> {
    assert!(opts.ninodes >= 2, "need at least the root inode");
    assert!(opts.njournal >= 2, "journal needs a header and a slot");
    assert!(
        device.size() >= opts.size,
        "device holds {} blocks, image wants {}",
        device.size(),
        opts.size
    );

    let inode_blocks = opts.ninodes.div_ceil(IPB as u32);
    let bitmap_blocks = opts.size.div_ceil(BPB as u32);
    let sb = SuperBlock {
        magic: SuperBlock::FS_MAGIC,
        size: opts.size,
        ninodes: opts.ninodes,
        nblocks: 0,
        journal_start: 2 + inode_blocks + bitmap_blocks,
        njournal: opts.njournal,
        num_reclaim_inodes: 0,
        reclaim_inodes: [0; oscale_fs_types::NRECLAIM_INODES],
    };
    let data_start = sb.data_start();
    assert!(
        data_start + 1 < opts.size,
        "image too small for its own metadata"
    );
    let sb = SuperBlock {
        nblocks: opts.size - data_start,
        ..sb
    };

    // Metadata region, zeroed: boot block, superblock slot, inode table,
    // bitmap, journal.
    let zero = Block::zeroed();
    for bno in 0..data_start {
        device.write(BlockNo::new(bno), &zero)?;
    }

    let mut block = Block::zeroed();
    *block.data_mut::<SuperBlock>() = sb.clone();
    device.write(SuperBlock::SUPER_BLOCK_NO, &block)?;

    // Root directory: "." and ".." both point at the root. "." counts as a
    // link; ".." never does.
    let root_block = data_start;
    let mut dinode = Dinode::zeroed();
    dinode.ty = T_DIR;
    dinode.nlink = 1;
    dinode.size = 2 * size_of::<DirEntry>() as u32;
    dinode.addrs[0] = root_block;

    // Root is inum 1; its slot sits inside the table block at
    // `inum * sizeof(Dinode)`.
    let inum = InodeNo::ROOT;
    let mut table = Block::zeroed();
    table.bytes_mut()[inum.as_index() * size_of::<Dinode>()..][..size_of::<Dinode>()]
        .copy_from_slice(dinode.as_bytes());
    device.write(sb.inode_block(inum), &table)?;

    let mut dir = Block::zeroed();
    let mut de = DirEntry::zeroed();
    de.set_name(b".");
    de.set_inum(Some(InodeNo::ROOT));
    dir.bytes_mut()[..size_of::<DirEntry>()].copy_from_slice(de.as_bytes());
    de.set_name(b"..");
    dir.bytes_mut()[size_of::<DirEntry>()..][..size_of::<DirEntry>()]
        .copy_from_slice(de.as_bytes());
    device.write(BlockNo::new(root_block), &dir)?;

    // Bitmap: metadata blocks and the root directory block are in use.
    let used = root_block + 1;
    for (i, bno0) in (0..used).step_by(BPB).enumerate() {
        let mut bitmap = Block::zeroed();
        for bno in bno0..u32::min(used, bno0 + BPB as u32) {
            let bi = bno as usize % BPB;
            bitmap.bytes_mut()[bi / 8] |= 1 << (bi % 8);
        }
        device.write(BlockNo::new(sb.bitmap_start() + i as u32), &bitmap)?;
    }

    Ok(sb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemDevice;

    #[test]
    fn format_then_mount() {
        let device = Arc::new(MemDevice::new(600));
        let sb = format(
            &(Arc::clone(&device) as Arc<dyn BlockDevice>),
            &MkfsOptions {
                size: 600,
                ninodes: 64,
                njournal: 32,
            },
        )
        .unwrap();
        assert_eq!(sb.data_start() + sb.nblocks, 600);

        let fs = crate::FileSystem::mount(device as Arc<dyn BlockDevice>).unwrap();
        let root = fs.root();
        assert!(root.is_dir());
        assert_eq!(root.nlink(), 1);

        // The root's own entries resolve back to it.
        let dot = fs.dirlookup(&root, b".").unwrap().unwrap();
        assert_eq!(dot.inum(), InodeNo::ROOT);
        let dotdot = fs.dirlookup(&root, b"..").unwrap().unwrap();
        assert_eq!(dotdot.inum(), InodeNo::ROOT);
    }

    #[test]
    #[should_panic(expected = "image too small")]
    fn rejects_undersized_image() {
        let device = Arc::new(MemDevice::new(16));
        let _ = format(
            &(Arc::clone(&device) as Arc<dyn BlockDevice>),
            &MkfsOptions {
                size: 16,
                ninodes: 64,
                njournal: 8,
            },
        );
    }
}
