// SPDX-License-Identifier: MPL-2.0

//! A bounded counting semaphore used to cap the number of outstanding cell
//! and mapping-job records (spec.md §4.1, §4.8, §5: "Allocation of cell,
//! job, and bio-hook records uses bounded pools ... the calling context may
//! block on pool refill").
//!
//! `aster-block`'s `BioSegmentPool`/`PoolSlotManager` bounds a DMA segment
//! pool with a bitmap and a `min_free` cursor; here the pool merely bounds
//! a *count* (the records themselves are ordinary heap allocations, per
//! spec.md §9's "a reimplementation should use owned containers"), so a
//! plain counting semaphore built on the same wait/notify primitive as
//! [`crate::sync::WaitQueue`] is the idiomatic equivalent.

use crate::sync::WaitQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct SlotPool {
    available: AtomicUsize,
    waiters: WaitQueue,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            available: AtomicUsize::new(capacity),
            waiters: WaitQueue::new(),
        }
    }

    /// Blocks until a slot is available, then takes it.
    pub fn acquire(&self) {
        self.waiters.wait_until(|| {
            self.available
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n > 0).then_some(n - 1)
                })
                .ok()
        });
    }

    /// Takes a slot only if one is immediately available.
    pub fn try_acquire(&self) -> bool {
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n - 1)
            })
            .is_ok()
    }

    /// Returns a slot to the pool, waking one blocked acquirer if any.
    pub fn release(&self) {
        self.available.fetch_add(1, Ordering::AcqRel);
        self.waiters.wake_one();
    }
}
