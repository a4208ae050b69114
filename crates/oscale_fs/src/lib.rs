//! File system implementation.
//!
//! Five layers:
//!   + Blocks: allocator for raw disk blocks.
//!   + Journal: crash recovery for multi-step updates.
//!   + Files: inode allocator, reading, writing, metadata.
//!   + Directories: inode with special contents (list of other inodes!)
//!   + Names: paths like /usr/bin/ls for convenient naming.
//!
//! This crate contains the low-level file system manipulation routines:
//! everything between the block device below and the page cache / VFS layer
//! above. Higher layers drive it through [`FileSystem`], whose operations
//! mirror the classic interface: `namei`, `ialloc`, `readi`, `writei`,
//! `dirlink`, and friends.
//!
//! Dirty blocks are never written in place by a mutating operation. Instead
//! each operation records block snapshots into a [`Transaction`]; sealed
//! transactions queue in the journal and reach the disk atomically, in commit
//! order, via [`FileSystem::flush_journal`].

mod block_alloc;
mod buffer;
mod device;
mod error;
mod fs;
mod inode;
mod journal;
pub mod mkfs;
mod params;
mod path;

pub use self::{
    buffer::BufCache,
    device::{BlockDevice, DeviceNo, FileDevice, MemDevice},
    error::FsError,
    fs::FileSystem,
    inode::{Inode, InodeRef, InodeType, LockMode},
    journal::Transaction,
};

pub use oscale_fs_types::{
    BSIZE, Block, BlockNo, DIRSIZ, Dinode, InodeNo, JournalHeader, MAXFILE, NDIRECT, NINDIRECT,
    SuperBlock,
};
