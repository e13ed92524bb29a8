// SPDX-License-Identifier: MPL-2.0

//! The pool: owner of the bio prison, deferred sets, job arena, queues, and
//! mode (spec.md §3 "Pool state"). Shaped after `aster-block`'s
//! `Arc`-wrapped-inner convention (an outer handle type cloned freely,
//! wrapping a struct holding the single primary lock spec.md §5 calls for
//! — "one primary pool-level spinlock protects all pool queues and the
//! pool-mode function slots").

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use spin::Mutex;

use crate::bio::{Bio, BioStatus};
use crate::config::PoolConfig;
use crate::copy_engine::CopyEngine;
use crate::device::DataDevice;
use crate::error::PoolError;
use crate::id::{DataBlock, DeviceId, VirtualBlock};
use crate::job::{JobArena, JobId, JobKind, MappingJob};
use crate::deferred_set::DeferredSet;
use crate::metadata::{LookupResult, MetadataStore, ThinHandle};
use crate::mode::PoolMode;
use crate::prison::BioPrison;
use crate::sync::WaitQueue;

/// Interval between periodic commit ticks (spec.md §4.4: "`COMMIT_PERIOD`
/// ≈ 1 second").
pub const COMMIT_PERIOD: Duration = Duration::from_secs(1);

/// Capacity of the bounded mapping-job arena, sized off the same
/// expected-concurrency knob the prison's table uses (spec.md §5's
/// "bounded pools with pre-reservation").
fn job_pool_capacity(expected_concurrency: usize) -> usize {
    expected_concurrency.max(32)
}

pub(crate) struct PoolState {
    pub mode: PoolMode,
    pub low_water_triggered: bool,
    pub out_of_space: bool,
    pub last_commit: Instant,
    pub deferred_bios: VecDeque<Bio>,
    pub deferred_flush_bios: VecDeque<Bio>,
    pub prepared_mappings: VecDeque<JobId>,
    pub prepared_discards: VecDeque<JobId>,
    /// Bios parked after an out-of-space failure, re-queued on resume
    /// (spec.md §4.8, §7).
    pub retry_on_resume: Vec<Bio>,
    pub jobs: JobArena,
    pub held_metadata_snap: Option<u64>,
    pub suspended: bool,
}

pub(crate) struct PoolInner {
    pub config: PoolConfig,
    pub metadata: Arc<dyn MetadataStore>,
    pub copy_engine: Arc<dyn CopyEngine>,
    pub data_device: Arc<dyn DataDevice>,
    pub prison: BioPrison,
    /// References to in-flight reads against a shared data block about to
    /// be broken (spec.md §4.2, §4.5).
    pub shared_read: DeferredSet<JobId>,
    /// References to in-flight I/O against any block that a discard may
    /// remove the mapping for (spec.md §4.2, §4.7).
    pub all_io: DeferredSet<JobId>,
    pub state: Mutex<PoolState>,
    pub worker_wake: WaitQueue,
}

/// A thin-provisioning pool (spec.md §2, §3). Cheaply `Clone`able; each
/// open thin device and the background worker hold a reference, and the
/// pool's resources are torn down only when the last one drops (spec.md
/// §3 "Ownership").
#[derive(Clone)]
pub struct Pool(pub(crate) Arc<PoolInner>);

impl Pool {
    pub fn new(
        config: PoolConfig,
        metadata: Arc<dyn MetadataStore>,
        copy_engine: Arc<dyn CopyEngine>,
        data_device: Arc<dyn DataDevice>,
    ) -> Result<Self, PoolError> {
        if !config.validate() {
            return Err(PoolError::InvalidBlockSize);
        }
        let capacity = job_pool_capacity(config.expected_concurrency);
        let initial_mode = if config.starts_read_only() {
            PoolMode::ReadOnly
        } else {
            PoolMode::Write
        };
        let prison = BioPrison::new(config.expected_concurrency);
        let state = Mutex::new(PoolState {
            mode: initial_mode,
            low_water_triggered: false,
            out_of_space: false,
            last_commit: Instant::now(),
            deferred_bios: VecDeque::new(),
            deferred_flush_bios: VecDeque::new(),
            prepared_mappings: VecDeque::new(),
            prepared_discards: VecDeque::new(),
            retry_on_resume: Vec::new(),
            jobs: JobArena::new(capacity),
            held_metadata_snap: None,
            suspended: false,
        });
        Ok(Self(Arc::new(PoolInner {
            config,
            metadata,
            copy_engine,
            data_device,
            prison,
            shared_read: DeferredSet::new(),
            all_io: DeferredSet::new(),
            state,
            worker_wake: WaitQueue::new(),
        })))
    }

    pub fn mode(&self) -> PoolMode {
        self.0.state.lock().mode
    }

    pub fn config(&self) -> &PoolConfig {
        &self.0.config
    }

    /// Wakes the worker loop. Safe to call from any context (spec.md §4.4).
    pub fn wake_worker(&self) {
        self.0.worker_wake.wake_all();
    }

    pub(crate) fn block_until_woken_or_tick(&self) {
        self.0
            .worker_wake
            .wait_until_or_timeout(|| None::<()>, COMMIT_PERIOD);
    }

    /// Degrades the pool's mode, never improving it (spec.md §4.9, §8
    /// invariant 7).
    pub(crate) fn degrade_mode(&self, target: PoolMode) {
        let mut state = self.0.state.lock();
        let before = state.mode;
        state.mode = state.mode.degrade_to(target);
        if state.mode != before {
            warn!(
                "pool mode degraded: {:?} -> {:?} (requested {:?})",
                before, state.mode, target
            );
        }
    }

    /// Allocates a data block, applying the low-water and out-of-space
    /// policy (spec.md §4.8).
    pub(crate) fn alloc_data_block(&self) -> Result<DataBlock, PoolError> {
        let free = self
            .0
            .metadata
            .get_free_block_count()
            .map_err(PoolError::Metadata)?;
        {
            let mut state = self.0.state.lock();
            if free <= self.0.config.low_water_blocks && !state.low_water_triggered {
                state.low_water_triggered = true;
                info!("pool low-water mark reached: {} blocks free", free);
            }
        }
        let free = if free == 0 {
            let out_of_space = self.0.state.lock().out_of_space;
            if out_of_space {
                return Err(PoolError::OutOfSpace);
            }
            // A commit may release deferred frees; retry once.
            self.0.metadata.commit().map_err(PoolError::Metadata)?;
            self.0.state.lock().last_commit = Instant::now();
            self.0
                .metadata
                .get_free_block_count()
                .map_err(PoolError::Metadata)?
        } else {
            free
        };
        if free == 0 {
            self.0.state.lock().out_of_space = true;
            return Err(PoolError::OutOfSpace);
        }
        self.0
            .metadata
            .alloc_data_block()
            .map_err(PoolError::Metadata)
    }

    /// Parks a cell's bios for retry once the pool is resumed with more
    /// space (spec.md §4.8, §7).
    pub(crate) fn queue_retry_on_resume(&self, bios: Vec<Bio>) {
        self.0.state.lock().retry_on_resume.extend(bios);
    }

    pub(crate) fn enqueue_deferred(&self, bio: Bio) {
        let mut state = self.0.state.lock();
        if bio.is_flush() || bio.is_fua() {
            state.deferred_flush_bios.push_back(bio);
        } else {
            state.deferred_bios.push_back(bio);
        }
        drop(state);
        self.wake_worker();
    }

    pub(crate) fn schedule_prepared_mapping(&self, job: JobId) {
        self.0.state.lock().prepared_mappings.push_back(job);
        self.wake_worker();
    }

    pub(crate) fn schedule_prepared_discard(&self, job: JobId) {
        self.0.state.lock().prepared_discards.push_back(job);
        self.wake_worker();
    }

    pub(crate) fn pop_prepared_mapping(&self) -> Option<JobId> {
        self.0.state.lock().prepared_mappings.pop_front()
    }

    pub(crate) fn pop_prepared_discard(&self) -> Option<JobId> {
        self.0.state.lock().prepared_discards.pop_front()
    }

    /// Returns a clone of the front deferred bio without dequeuing it, so
    /// the worker can attempt to reserve a job slot before committing to
    /// process it (spec.md §4.4 step 3).
    pub(crate) fn peek_deferred_bio(&self) -> Option<Bio> {
        self.0.state.lock().deferred_bios.front().cloned()
    }

    pub(crate) fn pop_deferred_bio(&self) -> Option<Bio> {
        self.0.state.lock().deferred_bios.pop_front()
    }

    pub(crate) fn drain_all_deferred_bios(&self) -> Vec<Bio> {
        self.0.state.lock().deferred_bios.drain(..).collect()
    }

    pub(crate) fn drain_flush_bios(&self) -> Vec<Bio> {
        self.0.state.lock().deferred_flush_bios.drain(..).collect()
    }

    /// Reserves a job-arena slot only if one is immediately available
    /// (spec.md §4.4 step 3's "ensure a spare Mapping Job is pre-allocated").
    pub(crate) fn try_reserve_job(&self) -> Option<crate::job::JobReservation> {
        self.0.state.lock().jobs.try_reserve()
    }

    /// Returns an unused reservation's slot to the arena. Must be called
    /// for any `JobReservation` that ends up not backing a job (see
    /// `JobArena::release_reservation`).
    pub(crate) fn release_job_reservation(&self, reservation: crate::job::JobReservation) {
        self.0.state.lock().jobs.release_reservation(reservation);
    }

    /// Consumes a reservation to insert a freshly built job, returning its
    /// id.
    pub(crate) fn insert_job(&self, reservation: crate::job::JobReservation, job: MappingJob) -> JobId {
        self.0.state.lock().jobs.insert(reservation, job)
    }

    /// Removes and returns a job, freeing its arena slot.
    pub(crate) fn remove_job(&self, id: JobId) -> MappingJob {
        self.0.state.lock().jobs.remove(id)
    }

    /// Reads a field out of a live job under the pool lock.
    pub(crate) fn job<R>(&self, id: JobId, f: impl FnOnce(&MappingJob) -> R) -> R {
        f(self.0.state.lock().jobs.get(id))
    }

    /// Mutates a live job under the pool lock.
    pub(crate) fn job_mut<R>(&self, id: JobId, f: impl FnOnce(&mut MappingJob) -> R) -> R {
        f(self.0.state.lock().jobs.get_mut(id))
    }

    /// The pool's block size in bytes, used for the "bio covers the full
    /// block" test (spec.md §4.5, §4.6).
    pub(crate) fn block_size_bytes(&self) -> u32 {
        self.0.config.block_size_sectors * crate::id::SECTOR_SIZE_BYTES
    }

    /// Commits pending metadata changes, degrading to `read_only` on
    /// failure (spec.md §4.4 step 4, §7).
    pub(crate) fn commit(&self) -> Result<(), PoolError> {
        match self.0.metadata.commit() {
            Ok(()) => {
                self.0.state.lock().last_commit = Instant::now();
                Ok(())
            }
            Err(e) => {
                error!("metadata commit failed: {e}");
                let _ = self.0.metadata.abort();
                self.degrade_mode(PoolMode::ReadOnly);
                Err(PoolError::Metadata(e))
            }
        }
    }

    /// Whether a periodic commit is due (spec.md §4.4 step 4, §9 open
    /// question). Uses a monotonic `Instant` comparison rather than the
    /// original's unsigned-wrap jiffy arithmetic — see SPEC_FULL.md §12.
    pub(crate) fn commit_due(&self) -> bool {
        let state = self.0.state.lock();
        !state.deferred_flush_bios.is_empty() || state.last_commit.elapsed() >= COMMIT_PERIOD
    }

    pub fn open_thin(&self, id: DeviceId) -> Result<ThinHandle, PoolError> {
        self.0.metadata.open_thin(id).map_err(PoolError::Metadata)
    }

    /// Submits a bio into the pool for mapping (spec.md §4.3). See
    /// [`crate::mapper::submit`].
    pub fn submit(&self, td: ThinHandle, bio: Bio) -> Result<(), PoolError> {
        crate::mapper::submit(self, td, bio)
    }

    /// Runs one worker pass (spec.md §4.4). Exposed so callers without a
    /// background thread (tests, single-shot admin tools) can drive the
    /// worker explicitly.
    pub fn run_worker_pass(&self) {
        crate::worker::run_pass(self)
    }

    /// Drains the worker and commits, parking new bios on
    /// `retry_on_resume` is the caller's job via suspend semantics
    /// (spec.md §5 "Suspend drains the worker and commits").
    pub fn suspend(&self) -> Result<(), PoolError> {
        self.0.state.lock().suspended = true;
        self.run_worker_pass();
        self.commit()
    }

    /// Re-admits bios parked on `retry_on_resume` (spec.md §4.8, §5).
    pub fn resume(&self) {
        let mut state = self.0.state.lock();
        state.suspended = false;
        state.out_of_space = false;
        state.low_water_triggered = false;
        let retry = std::mem::take(&mut state.retry_on_resume);
        state.deferred_bios.extend(retry);
        drop(state);
        self.wake_worker();
    }

    pub(crate) fn fail_bio(&self, bio: Bio, status: BioStatus) {
        bio.complete(status);
    }
}
