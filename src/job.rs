// SPDX-License-Identifier: MPL-2.0

//! The mapping job (spec.md §3, §4.2, §4.6): the record tracking one
//! in-progress provisioning (copy, zero-fill, or passthrough overwrite)
//! until it is safe to install the new mapping.
//!
//! Jobs live in a bounded arena indexed by small integers — the
//! "equivalent alternative" spec.md §9 names to intrusive list-splicing.
//! Per spec.md §4.6, a job's `quiesced`/`prepared` flags are flipped "under
//! the pool lock", so `MappingJob` itself holds no lock: it is plain data
//! that lives inside whatever structure already holds the pool's single
//! primary lock (`crate::pool::Pool`).

use crate::bio::Bio;
use crate::id::{DataBlock, DeviceId, VirtualBlock};
use crate::prison::CellHandle;
use crate::slot_pool::SlotPool;

/// Identifies a live entry in a [`JobArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u32);

/// The kind of provisioning a [`MappingJob`] is carrying out, determining
/// what "prepared" means for it (spec.md §4.5, §4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobKind {
    /// Break-of-sharing or first-touch provisioning via an external/
    /// internal copy.
    Copy,
    /// Provisioning via zero-fill (spec.md §4.5 "not found, write,
    /// non-zero size").
    Zero,
    /// The bio itself supplies the new block's full contents; no copy or
    /// zero is scheduled (spec.md §4.6 "the bio fully overwrites the
    /// target block").
    Overwrite,
    /// A discard being passed down or just dropping its mapping (spec.md
    /// §4.7).
    Discard,
}

/// A record describing an in-progress provisioning (spec.md §3).
pub struct MappingJob {
    pub thin_ref: DeviceId,
    pub virt_block: VirtualBlock,
    pub data_block: DataBlock,
    pub kind: JobKind,
    /// The virtual-scope cell this job owns.
    pub primary_cell: CellHandle,
    /// A second, data-scope cell — used by discards (spec.md §3, §4.7).
    pub secondary_cell: Option<CellHandle>,
    /// No outstanding reads against the source block remain.
    pub quiesced: bool,
    /// The destination block has received its data (copy/zero/overwrite
    /// completed).
    pub prepared: bool,
    pub failed: bool,
    /// Set when the bio itself is the job's data source (spec.md §3's
    /// "optional hooked bio").
    pub hooked_bio: Option<Bio>,
    /// Whether the data block was shared at the moment a [`JobKind::Discard`]
    /// job was built — decides passdown eligibility once the job is
    /// prepared (spec.md §4.4 step 2, §4.7). Unused for other kinds.
    pub shared: bool,
}

impl MappingJob {
    /// A job is ready to move onto `prepared_mappings`/`prepared_discards`
    /// exactly when both readiness flags hold (spec.md §3 invariant).
    pub fn is_ready(&self) -> bool {
        self.quiesced && self.prepared
    }
}

struct Slot {
    job: Option<MappingJob>,
}

/// A reservation token proving a slot was pre-allocated (spec.md §4.4,
/// §5's "pre-reservation in the worker to prevent deadlock"). Must be
/// obtained *before* taking the pool lock and consumed while holding it.
#[must_use]
pub struct JobReservation(());

/// A bounded arena of mapping jobs, indexed by small integers (spec.md §9).
pub struct JobArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    permits: SlotPool,
}

impl JobArena {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot { job: None });
        Self {
            slots,
            free: (0..capacity as u32).rev().collect(),
            permits: SlotPool::new(capacity),
        }
    }

    /// Blocks until a job slot is available.
    pub fn reserve(&self) -> JobReservation {
        self.permits.acquire();
        JobReservation(())
    }

    /// Reserves a slot only if one is immediately available. Used by the
    /// worker loop's deferred-bio pass (spec.md §4.4 step 3), which must
    /// not block the single worker thread indefinitely under memory
    /// pressure.
    pub fn try_reserve(&self) -> Option<JobReservation> {
        self.permits.try_acquire().then_some(JobReservation(()))
    }

    /// Returns a reservation's slot to the pool without spending it on a
    /// job. `JobReservation` carries no `Drop` impl (a reservation must
    /// always be explicitly consumed), so any reservation a caller decides
    /// not to use after all — e.g. the worker's end-of-pass spare slot —
    /// must be released through here, not dropped, or its permit leaks for
    /// the lifetime of the pool.
    pub fn release_reservation(&self, reservation: JobReservation) {
        std::mem::forget(reservation);
        self.permits.release();
    }

    /// Consumes a reservation to insert a job, returning its id. Must be
    /// called while holding the pool lock that protects this arena.
    pub fn insert(&mut self, reservation: JobReservation, job: MappingJob) -> JobId {
        std::mem::forget(reservation);
        let idx = self
            .free
            .pop()
            .expect("a reserved slot must be free by construction");
        self.slots[idx as usize].job = Some(job);
        JobId(idx)
    }

    pub fn get(&self, id: JobId) -> &MappingJob {
        self.slots[id.0 as usize]
            .job
            .as_ref()
            .expect("job id does not refer to a live job")
    }

    pub fn get_mut(&mut self, id: JobId) -> &mut MappingJob {
        self.slots[id.0 as usize]
            .job
            .as_mut()
            .expect("job id does not refer to a live job")
    }

    /// Removes and returns a job, freeing its slot back to the pool.
    pub fn remove(&mut self, id: JobId) -> MappingJob {
        let job = self.slots[id.0 as usize]
            .job
            .take()
            .expect("job id does not refer to a live job");
        self.free.push(id.0);
        self.permits.release();
        job
    }
}
