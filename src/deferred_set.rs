// SPDX-License-Identifier: MPL-2.0

//! The deferred set (spec.md §4.2): a rolling window of `N` generations used
//! to know when every read that started *before* a given point has finished,
//! without tracking a per-block refcount.
//!
//! Grounded on the same "fixed ring, two pointers" shape `aster-block`'s
//! `BioSegmentPool` uses for slot management (a `spin::Mutex`-protected
//! manager struct with a `min_free` cursor), generalized here to two
//! monotonically increasing generation counters (`current`, `sweeper`)
//! rather than a bitmap, since what's being tracked is reference counts per
//! generation rather than occupied/free slots.

use spin::Mutex;

/// Number of generations kept live at once (spec.md §4.2: "size 64
/// suffices").
pub const RING_SIZE: usize = 64;

/// A reference into a single generation slot of a [`DeferredSet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryHandle(u64);

struct Slot<T> {
    refcount: usize,
    work: Vec<T>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            refcount: 0,
            work: Vec::new(),
        }
    }
}

struct Inner<T> {
    slots: Vec<Slot<T>>,
    /// Generation that new `inc()`/`add_work()` calls attach to.
    current: u64,
    /// Oldest generation not yet fully drained.
    sweeper: u64,
}

impl<T> Inner<T> {
    fn index(&self, generation: u64) -> usize {
        (generation as usize) % self.slots.len()
    }
}

/// Tracks in-flight references taken "now" (spec.md §4.2) and releases
/// deferred work items once every reference taken before they were added has
/// drained.
pub struct DeferredSet<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> DeferredSet<T> {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(RING_SIZE);
        slots.resize_with(RING_SIZE, Slot::default);
        Self {
            inner: Mutex::new(Inner {
                slots,
                current: 0,
                sweeper: 0,
            }),
        }
    }

    /// Attaches a reference to the current generation. O(1).
    pub fn inc(&self) -> EntryHandle {
        let mut inner = self.inner.lock();
        let cur = inner.current;
        let idx = inner.index(cur);
        inner.slots[idx].refcount += 1;
        EntryHandle(cur)
    }

    /// Releases a reference taken by [`DeferredSet::inc`]. If this was the
    /// last reference on its generation, and every older generation has also
    /// drained, all of their deferred work items are appended to `released`
    /// in oldest-first order.
    pub fn dec(&self, handle: EntryHandle, released: &mut Vec<T>) {
        let mut inner = self.inner.lock();
        let idx = inner.index(handle.0);
        debug_assert!(inner.slots[idx].refcount > 0);
        inner.slots[idx].refcount -= 1;
        self.sweep(&mut inner, released);
    }

    /// Either reports that `items` may proceed immediately (no outstanding
    /// reads and no older deferred work: `deferred = false`), or attaches
    /// them to the current generation to be released once it (and every
    /// older generation) drains (`deferred = true`).
    pub fn add_work(&self, items: Vec<T>) -> bool {
        let mut inner = self.inner.lock();
        let cur = inner.current;
        let cur_idx = inner.index(cur);
        if inner.slots[cur_idx].refcount == 0 && inner.sweeper == cur {
            return false;
        }
        inner.slots[cur_idx].work.extend(items);
        let next = cur + 1;
        let next_idx = inner.index(next);
        if inner.slots[next_idx].refcount == 0 {
            inner.current = next;
        }
        true
    }

    fn sweep(&self, inner: &mut Inner<T>, released: &mut Vec<T>) {
        loop {
            if inner.sweeper > inner.current {
                break;
            }
            let idx = inner.index(inner.sweeper);
            if inner.slots[idx].refcount != 0 {
                break;
            }
            released.extend(inner.slots[idx].work.drain(..));
            if inner.sweeper == inner.current {
                break;
            }
            inner.sweeper += 1;
        }
    }
}

impl<T> Default for DeferredSet<T> {
    fn default() -> Self {
        Self::new()
    }
}
