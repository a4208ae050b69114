//! Transactions and the journal.
//!
//! A [`Transaction`] collects the dirty-block snapshots of one logical
//! operation (an fsync batch, a directory update, ...) together with its
//! allocation intents. Adding the transaction to the [`Journal`] seals it;
//! sealed transactions reach the disk in commit order.
//!
//! One committed transaction is published to stable storage in four phases:
//!
//! 1. every snapshot is written to its journal slot;
//! 2. the header block is written naming the home locations — this is the
//!    commit record, and the true point of no return;
//! 3. snapshots are copied from the journal to their home locations;
//! 4. the header is cleared.
//!
//! A crash before phase 2 discards the transaction; a crash after phase 2 is
//! repaired at mount by replaying the journal. Blocks freed with
//! `delayed = true` are released to the in-memory allocator only after
//! phase 2, so a block is never reused before its release is durable.

use std::{
    collections::HashMap,
    mem,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, info};
use oscale_fs_types::{Block, BlockNo, InodeNo, JournalHeader, SuperBlock};

use crate::{
    block_alloc,
    buffer::BufCache,
    device::DeviceNo,
    error::FsError,
    fs::FsCore,
};

/// A snapshot of one disk block's payload.
pub(crate) struct Snapshot {
    pub(crate) bno: BlockNo,
    pub(crate) data: Box<Block>,
    #[expect(dead_code, reason = "recorded for debugging commit order")]
    pub(crate) timestamp: u64,
}

#[derive(Default)]
struct TxBlocks {
    snaps: Vec<Snapshot>,
    by_bno: HashMap<BlockNo, usize>,
}

#[derive(Default)]
struct TxIntents {
    allocated: Vec<BlockNo>,
    freed: Vec<BlockNo>,
    delayed_release: Vec<BlockNo>,
    new_files: Vec<InodeNo>,
}

/// An atomic group of block updates plus allocation intents.
pub struct Transaction {
    timestamp: u64,
    blocks: Mutex<TxBlocks>,
    intents: Mutex<TxIntents>,
    sealed: AtomicBool,
}

impl Transaction {
    pub(crate) fn new(timestamp: u64) -> Self {
        Self {
            timestamp,
            blocks: Mutex::new(TxBlocks::default()),
            intents: Mutex::new(TxIntents::default()),
            sealed: AtomicBool::new(false),
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Appends a block snapshot.
    ///
    /// At most one snapshot per block number survives: a later snapshot of
    /// the same block replaces the earlier payload (last writer wins).
    pub(crate) fn add_block(&self, bno: BlockNo, data: &Block) {
        assert!(
            !self.sealed.load(Ordering::Acquire),
            "sealed transactions accept no more blocks"
        );
        let mut blocks = self.blocks.lock().unwrap();
        if let Some(&i) = blocks.by_bno.get(&bno) {
            let snap = &mut blocks.snaps[i];
            (*snap.data).clone_from(data);
            snap.timestamp = self.timestamp;
        } else {
            let i = blocks.snaps.len();
            blocks.snaps.push(Snapshot {
                bno,
                data: Box::new(data.clone()),
                timestamp: self.timestamp,
            });
            blocks.by_bno.insert(bno, i);
        }
    }

    /// Records that `bno` was allocated under this transaction.
    pub(crate) fn add_allocated_block(&self, bno: BlockNo) {
        self.intents.lock().unwrap().allocated.push(bno);
    }

    /// Records that `bno` was freed under this transaction.
    ///
    /// With `delayed`, the in-memory bitmap release is additionally held back
    /// until the commit record is durable.
    pub(crate) fn add_free_block(&self, bno: BlockNo, delayed: bool) {
        let mut intents = self.intents.lock().unwrap();
        intents.freed.push(bno);
        if delayed {
            intents.delayed_release.push(bno);
        }
    }

    /// Records an inode created under this transaction, for the mount-time
    /// reclaim pass.
    pub fn log_new_file(&self, ino: InodeNo) {
        self.intents.lock().unwrap().new_files.push(ino);
    }

    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    /// Takes the allocated/freed block lists for bitmap reconciliation.
    pub(crate) fn take_bitmap_intents(&self) -> (Vec<BlockNo>, Vec<BlockNo>) {
        let mut intents = self.intents.lock().unwrap();
        (mem::take(&mut intents.allocated), mem::take(&mut intents.freed))
    }

    pub(crate) fn new_files(&self) -> Vec<InodeNo> {
        self.intents.lock().unwrap().new_files.clone()
    }

    fn take_delayed_release(&self) -> Vec<BlockNo> {
        mem::take(&mut self.intents.lock().unwrap().delayed_release)
    }

    fn take_blocks(&self) -> Vec<Snapshot> {
        // All writers must have released the transaction by commit time;
        // a contended lock here is a bug.
        let mut blocks = self
            .blocks
            .try_lock()
            .expect("transaction writers still active at commit");
        blocks.by_bno.clear();
        mem::take(&mut blocks.snaps)
    }
}

/// The ordered queue of sealed transactions.
pub(crate) struct Journal {
    dev: DeviceNo,
    queue: Mutex<Vec<Transaction>>,
    /// Held across bitmap/superblock reconciliation *and* enqueueing, so a
    /// transaction's commit-time snapshots of shared metadata blocks land in
    /// the queue in the same order they were taken.
    order: Mutex<()>,
    /// Serializes flushes so transactions commit strictly in queue order.
    committing: Mutex<()>,
}

impl Journal {
    pub(crate) fn new(dev: DeviceNo) -> Self {
        Self {
            dev,
            queue: Mutex::new(Vec::new()),
            order: Mutex::new(()),
            committing: Mutex::new(()),
        }
    }

    pub(crate) fn lock_order(&self) -> std::sync::MutexGuard<'_, ()> {
        self.order.lock().unwrap()
    }

    /// Seals `tx` and appends it to the commit queue.
    pub(crate) fn add(&self, tx: Transaction) {
        tx.seal();
        self.queue.lock().unwrap().push(tx);
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Commits every queued transaction, oldest first.
    pub(crate) fn flush(&self, core: &FsCore) -> Result<(), FsError> {
        let _committing = self.committing.lock().unwrap();
        let queue = mem::take(&mut *self.queue.lock().unwrap());
        for tx in queue {
            self.commit_one(core, tx)?;
        }
        Ok(())
    }

    fn commit_one(&self, core: &FsCore, tx: Transaction) -> Result<(), FsError> {
        let snaps = tx.take_blocks();
        assert!(
            snaps.len() <= core.sb.max_journal_len(),
            "transaction of {} blocks overflows the journal",
            snaps.len()
        );

        if !snaps.is_empty() {
            // Phase 1: snapshots into journal slots.
            for (i, snap) in snaps.iter().enumerate() {
                let buf = core.buf.get_uncached(self.dev, core.sb.journal_slot(i));
                let mut g = buf.write();
                g.set_data(&snap.data);
                g.writeback()?;
            }

            // Phase 2: the commit record.
            let buf = core
                .buf
                .get_uncached(self.dev, core.sb.journal_header_block());
            let mut g = buf.write();
            g.fill_zero();
            let header = g.data_mut::<JournalHeader>();
            header.set_len(snaps.len());
            for (i, snap) in snaps.iter().enumerate() {
                header.set_block(i, snap.bno);
            }
            g.writeback()?;
        }

        // Delayed frees become reusable once the commit record is durable.
        for bno in tx.take_delayed_release() {
            block_alloc::release_block(core, bno);
        }

        if !snaps.is_empty() {
            // Phase 3: install home locations.
            for snap in &snaps {
                let buf = core.buf.get_uncached(self.dev, snap.bno);
                let mut g = buf.write();
                g.set_data(&snap.data);
                g.writeback()?;
            }

            // Phase 4: clear the commit record.
            let buf = core
                .buf
                .get_uncached(self.dev, core.sb.journal_header_block());
            let mut g = buf.write();
            g.fill_zero();
            g.writeback()?;
        }

        debug!(
            "journal: committed transaction {} ({} blocks)",
            tx.timestamp(),
            snaps.len()
        );
        Ok(())
    }

    /// Replays a committed-but-uninstalled transaction left behind by a
    /// crash. Runs before the file system is exposed.
    pub(crate) fn recover(
        buf: &BufCache,
        sb: &SuperBlock,
        dev: DeviceNo,
    ) -> Result<usize, FsError> {
        let header_buf = buf.get(dev, sb.journal_header_block())?;
        let len = header_buf.read().data::<JournalHeader>().len();
        if len == 0 {
            return Ok(0);
        }

        for i in 0..len {
            let home = header_buf.read().data::<JournalHeader>().block(i);
            let slot = buf.get(dev, sb.journal_slot(i))?;
            let slot_g = slot.read();
            let home_buf = buf.get_uncached(dev, home);
            let mut g = home_buf.write();
            g.bytes_mut().copy_from_slice(slot_g.bytes());
            g.writeback()?;
        }

        let mut g = header_buf.write();
        g.fill_zero();
        g.writeback()?;
        info!("journal: replayed {len} blocks after crash");
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_block_merges_by_blocknum() {
        let tx = Transaction::new(7);
        let mut a = Block::zeroed();
        a.bytes_mut()[0] = 1;
        let mut b = Block::zeroed();
        b.bytes_mut()[0] = 2;

        tx.add_block(BlockNo::new(5), &a);
        tx.add_block(BlockNo::new(9), &a);
        tx.add_block(BlockNo::new(5), &b);

        let snaps = tx.take_blocks();
        assert_eq!(snaps.len(), 2);
        let five = snaps.iter().find(|s| s.bno == BlockNo::new(5)).unwrap();
        assert_eq!(five.data.bytes()[0], 2, "last writer wins");
    }

    #[test]
    #[should_panic(expected = "sealed")]
    fn sealed_transaction_rejects_blocks() {
        let tx = Transaction::new(1);
        tx.seal();
        tx.add_block(BlockNo::new(1), &Block::zeroed());
    }

    #[test]
    fn free_intents_track_delayed() {
        let tx = Transaction::new(1);
        tx.add_free_block(BlockNo::new(10), false);
        tx.add_free_block(BlockNo::new(11), true);

        let (allocated, freed) = tx.take_bitmap_intents();
        assert!(allocated.is_empty());
        assert_eq!(freed, vec![BlockNo::new(10), BlockNo::new(11)]);
        assert_eq!(tx.take_delayed_release(), vec![BlockNo::new(11)]);
    }
}
