use std::{
    cell::Cell,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Width of the per-CPU state arrays (`last_inode`, inum freelists).
pub const NCPU: usize = 8;

/// Number of buckets in the inode cache hash.
pub const NBUCKET: usize = 509;

/// Free inums seeded into each CPU's freelist at mount; the rest stay in the
/// reserve list.
pub const INUM_SEED_PER_CPU: usize = 64;

static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CPU_ID: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// The calling thread's CPU slot.
///
/// Threads are assigned slots round-robin on first use; the hot paths index
/// per-CPU arrays with this and never share entries across slots.
pub(crate) fn cpu_id() -> usize {
    CPU_ID.with(|id| {
        if id.get() == usize::MAX {
            id.set(NEXT_CPU.fetch_add(1, Ordering::Relaxed) % NCPU);
        }
        id.get()
    })
}
