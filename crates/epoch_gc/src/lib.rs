//! Epoch-based deferred reclamation.
//!
//! Readers that walk lock-free-published pointers pin the current epoch with
//! [`Collector::pin`] before the first dereference and hold the returned
//! [`Guard`] for the duration of the critical section. [`Collector::defer`]
//! schedules a destructor that runs only once every reader that might still
//! observe the dead pointer has dropped its guard.
//!
//! A guard only protects pointers obtained *after* `pin()` through properly
//! synchronized containers (e.g. a mutex-guarded hash bucket): a pointer
//! unlinked before `defer()` is unreachable to any reader that pins later, so
//! birth-epoch comparison is sufficient to order destruction.

use std::{
    cell::RefCell,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

/// Maximum number of threads that may concurrently pin one collector.
///
/// Reader slots are claimed per thread on first use and are not returned
/// when the thread exits; this bound is sized for a fixed worker pool, not
/// for unbounded thread churn.
pub const MAX_READERS: usize = 64;

static COLLECTOR_IDS: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // (collector id, claimed slot index) pairs for this thread.
    static THREAD_SLOTS: RefCell<Vec<(u64, usize)>> = const { RefCell::new(Vec::new()) };
}

struct Slot {
    /// Epoch this reader pinned, or 0 when idle.
    active: AtomicU64,
    claimed: AtomicBool,
}

struct Bin {
    birth: u64,
    destroy: Box<dyn FnOnce() + Send>,
}

pub struct Collector {
    id: u64,
    epoch: AtomicU64,
    slots: Box<[Slot]>,
    garbage: Mutex<Vec<Bin>>,
}

/// An active reader critical section.
pub struct Guard<'a> {
    slot: Option<&'a Slot>,
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector {
    #[must_use]
    pub fn new() -> Self {
        let slots = (0..MAX_READERS)
            .map(|_| Slot {
                active: AtomicU64::new(0),
                claimed: AtomicBool::new(false),
            })
            .collect();
        Self {
            id: COLLECTOR_IDS.fetch_add(1, Ordering::Relaxed),
            epoch: AtomicU64::new(1),
            slots,
            garbage: Mutex::new(Vec::new()),
        }
    }

    /// Enters a reader critical section.
    ///
    /// Nested pins on the same thread are cheap; only the outermost guard
    /// publishes and clears the reader's epoch.
    pub fn pin(&self) -> Guard<'_> {
        let slot = &self.slots[self.thread_slot()];
        if slot.active.load(Ordering::Relaxed) != 0 {
            return Guard { slot: None };
        }
        let e = self.epoch.load(Ordering::SeqCst);
        slot.active.store(e, Ordering::SeqCst);
        Guard { slot: Some(slot) }
    }

    /// Schedules `destroy` to run once no reader pinned before this call
    /// remains active.
    pub fn defer(&self, destroy: impl FnOnce() + Send + 'static) {
        let birth = self.epoch.fetch_add(1, Ordering::SeqCst);
        self.garbage.lock().unwrap().push(Bin {
            birth,
            destroy: Box::new(destroy),
        });
        self.collect();
    }

    /// Runs every deferred destructor whose grace period has elapsed.
    pub fn collect(&self) {
        let ready = {
            let mut garbage = self.garbage.lock().unwrap();
            if garbage.is_empty() {
                return;
            }
            let min = self.min_active();
            let mut ready = Vec::new();
            garbage.retain_mut(|bin| {
                if bin.birth < min {
                    let destroy = std::mem::replace(&mut bin.destroy, Box::new(|| {}));
                    ready.push(destroy);
                    false
                } else {
                    true
                }
            });
            ready
        };
        for destroy in ready {
            destroy();
        }
    }

    /// Number of destructors still waiting for their grace period.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.garbage.lock().unwrap().len()
    }

    fn min_active(&self) -> u64 {
        self.slots
            .iter()
            .map(|s| s.active.load(Ordering::SeqCst))
            .filter(|&e| e != 0)
            .min()
            .unwrap_or(u64::MAX)
    }

    fn thread_slot(&self) -> usize {
        THREAD_SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            if let Some(&(_, idx)) = slots.iter().find(|(id, _)| *id == self.id) {
                return idx;
            }
            for (idx, slot) in self.slots.iter().enumerate() {
                if slot
                    .claimed
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    slots.push((self.id, idx));
                    return idx;
                }
            }
            panic!("epoch_gc: more than {MAX_READERS} reader threads");
        })
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        // Guards borrow the collector, so no reader can be active here.
        let garbage = std::mem::take(&mut *self.garbage.lock().unwrap());
        for bin in garbage {
            (bin.destroy)();
        }
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot {
            slot.active.store(0, Ordering::SeqCst);
        }
    }
}
