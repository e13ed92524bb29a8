// SPDX-License-Identifier: MPL-2.0

//! The bio prison (spec.md §4.1): per-`(scope, device, block)` serialization
//! so that at most one provisioning operation is ever in flight for a given
//! block.
//!
//! Per spec.md §9's design note ("Intrusive hash-chained cells ... in the
//! source are an allocator optimization. A reimplementation should use
//! owned containers"), this keys an ordinary `HashMap` by `CellKey` rather
//! than replicating the original's hand-rolled hash-chained table. Cell
//! allocation is still bounded, via [`crate::slot_pool::SlotPool`], so that
//! the prison can never grow without limit under memory pressure (spec.md
//! §4.1, §5).

use std::collections::HashMap;

use spin::Mutex;

use crate::bio::{Bio, BioStatus};
use crate::id::DeviceId;
use crate::slot_pool::SlotPool;

/// Which address space a cell key's block index names (spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    Virtual,
    Data,
}

/// The key a [`BioPrison`] cell is addressed by: `(scope, device_id,
/// block)` (spec.md §3). At most one cell exists per key at any instant
/// (spec.md §8, invariant 1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CellKey {
    pub scope: Scope,
    pub device: DeviceId,
    pub block: u64,
}

impl CellKey {
    pub fn new(scope: Scope, device: DeviceId, block: u64) -> Self {
        Self {
            scope,
            device,
            block,
        }
    }

    /// A data-scope key for `block`. Data blocks belong to the pool, not to
    /// any one thin device, so every caller must use the same sentinel
    /// device id here regardless of which thin device triggered the
    /// operation — otherwise two devices sharing a block could each break
    /// sharing on it concurrently through disjoint cells, which is exactly
    /// the race the prison exists to prevent (spec.md §3, §8 invariant 1).
    /// spec.md's key tuple names `DeviceId` uniformly across scopes; this is
    /// the pool-wide constant that makes the tuple format work for data
    /// cells too (see DESIGN.md).
    pub fn data(block: u64) -> Self {
        Self::new(Scope::Data, DATA_SCOPE_DEVICE, block)
    }
}

/// Sentinel device id used for every data-scope cell key (see
/// [`CellKey::data`]).
pub const DATA_SCOPE_DEVICE: DeviceId = crate::id::RESERVED_DEVICE_ID;

/// A handle to a detained cell, returned by [`BioPrison::detain`]. Releasing
/// an unknown handle is undefined behavior per spec.md §4.1 ("callers must
/// hold a valid handle returned by `detain`") — this implementation turns
/// that into a panic rather than silent corruption.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellHandle(CellKey);

struct Cell {
    holder: Bio,
    additional: Vec<Bio>,
}

/// Picks a hash-table capacity: "the next power of two at least
/// `max(128, requested/4)`, clamped to 8192" (spec.md §4.1).
pub fn table_capacity(requested_concurrency: usize) -> usize {
    let floor = (requested_concurrency / 4).max(128);
    let clamped = floor.min(8192);
    clamped.next_power_of_two()
}

pub struct BioPrison {
    cells: Mutex<HashMap<CellKey, Cell>>,
    slots: SlotPool,
}

impl BioPrison {
    pub fn new(requested_concurrency: usize) -> Self {
        let capacity = table_capacity(requested_concurrency);
        Self {
            cells: Mutex::new(HashMap::with_capacity(capacity)),
            slots: SlotPool::new(capacity),
        }
    }

    /// If no cell exists for `key`, creates one with `bio` as holder and
    /// returns `(true, handle)`. Otherwise adds `bio` to the existing
    /// cell's additional list and returns `(false, handle)`. Never fails:
    /// the caller may block while a cell record is allocated.
    pub fn detain(&self, key: CellKey, bio: Bio) -> (bool, CellHandle) {
        {
            let mut cells = self.cells.lock();
            if let Some(cell) = cells.get_mut(&key) {
                cell.additional.push(bio);
                return (false, CellHandle(key));
            }
        }
        // The cell doesn't exist yet. Acquire a slot *without* holding the
        // prison lock, so allocation pressure never re-enters it.
        self.slots.acquire();
        let mut cells = self.cells.lock();
        if let Some(cell) = cells.get_mut(&key) {
            // Lost the race: another caller created this cell while we
            // were acquiring a slot.
            cell.additional.push(bio);
            drop(cells);
            self.slots.release();
            return (false, CellHandle(key));
        }
        cells.insert(
            key,
            Cell {
                holder: bio,
                additional: Vec::new(),
            },
        );
        (true, CellHandle(key))
    }

    /// Removes the cell, appending its holder and additional bios to `out`
    /// in that order, and frees the cell record.
    pub fn release(&self, handle: CellHandle, out: &mut Vec<Bio>) {
        let cell = {
            let mut cells = self.cells.lock();
            cells
                .remove(&handle.0)
                .expect("release of a cell the prison does not hold")
        };
        self.slots.release();
        out.push(cell.holder);
        out.extend(cell.additional);
    }

    /// Like [`BioPrison::release`], but excludes the holder — used when the
    /// holder bio was already consumed upstream (e.g. turned into an
    /// overwrite bio, spec.md §4.1).
    pub fn release_no_holder(&self, handle: CellHandle, out: &mut Vec<Bio>) {
        let cell = {
            let mut cells = self.cells.lock();
            cells
                .remove(&handle.0)
                .expect("release of a cell the prison does not hold")
        };
        self.slots.release();
        out.extend(cell.additional);
    }

    /// Releases the cell and fails every bio it held with an I/O error
    /// (spec.md §7).
    pub fn error(&self, handle: CellHandle) {
        let mut bios = Vec::new();
        self.release(handle, &mut bios);
        for bio in bios {
            bio.complete(BioStatus::IoError);
        }
    }

    #[cfg(test)]
    fn is_held(&self, key: CellKey) -> bool {
        self.cells.lock().contains_key(&key)
    }
}
