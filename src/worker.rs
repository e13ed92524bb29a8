// SPDX-License-Identifier: MPL-2.0

//! The worker loop (spec.md §4.4): the single-threaded consumer of the
//! pool's three queues (prepared mappings, prepared discards, deferred
//! bios), plus the commit/flush pass. Also home to the `write`-mode
//! bio/discard processors (spec.md §4.5-§4.7) and the schedule-copy/
//! schedule-zero machinery (spec.md §4.6) that builds and completes
//! [`MappingJob`]s.
//!
//! Per spec.md §9's design note on concurrent workers, this is never run
//! from more than one thread per pool at a time — callers are expected to
//! either drive [`run_pass`] from a single dedicated thread, or (in tests)
//! call it synchronously between bio submissions.

use log::{error, warn};

use crate::bio::{Bio, BioStatus, BioType};
use crate::copy_engine::{CopyOutcome, DataRegion};
use crate::id::DataBlock;
use crate::job::{JobId, JobKind, MappingJob};
use crate::metadata::{LookupResult, ThinHandle};
use crate::mode::PoolMode;
use crate::pool::Pool;
use crate::prison::{CellHandle, CellKey, Scope};

/// Runs one worker pass (spec.md §4.4): drain prepared mappings, then
/// prepared discards, then deferred bios, then commit/flush if due.
pub fn run_pass(pool: &Pool) {
    drain_prepared_mappings(pool);
    drain_prepared_discards(pool);
    drain_deferred_bios(pool);
    maybe_commit_and_flush(pool);
}

/// Called when the `shared_read` deferred set drains work items (spec.md
/// §4.2, §4.5): each released `JobId`'s source-block reads have all
/// completed, so its job becomes quiesced.
pub(crate) fn on_shared_read_released(pool: &Pool, released: Vec<JobId>) {
    for job_id in released {
        let ready = pool.job_mut(job_id, |j| {
            j.quiesced = true;
            j.is_ready() || j.failed
        });
        if ready {
            pool.schedule_prepared_mapping(job_id);
        }
    }
}

/// Called when the `all_io` deferred set drains work items (spec.md §4.2,
/// §4.7): every in-flight I/O against the block predating a discard has
/// finished, so the discard job may proceed to `prepared_discards`. Only
/// [`process_discard`] ever attaches work items to `all_io`, so every
/// released id here names a [`JobKind::Discard`] job.
pub(crate) fn on_all_io_released(pool: &Pool, released: Vec<JobId>) {
    for job_id in released {
        pool.schedule_prepared_discard(job_id);
    }
}

// --- prepared_mappings / prepared_discards drains (spec.md §4.4 steps 1-2) ---

fn drain_prepared_mappings(pool: &Pool) {
    loop {
        let job_id = match pool.pop_prepared_mapping() {
            Some(id) => id,
            None => break,
        };

        if !pool.mode().accepts_new_mappings() || pool.job(job_id, |j| j.failed) {
            process_prepared_mapping_fail(pool, job_id);
            continue;
        }

        let (td, virt_block, data_block) =
            pool.job(job_id, |j| (ThinHandle(j.thin_ref), j.virt_block, j.data_block));

        match pool.0.metadata.insert_block(td, virt_block, data_block) {
            Ok(()) => {
                let job = pool.remove_job(job_id);
                let mut released = Vec::new();
                if job.hooked_bio.is_some() {
                    pool.0.prison.release_no_holder(job.primary_cell, &mut released);
                } else {
                    pool.0.prison.release(job.primary_cell, &mut released);
                }
                if let Some(secondary) = job.secondary_cell {
                    pool.0.prison.release_no_holder(secondary, &mut released);
                }
                for b in released {
                    pool.enqueue_deferred(b);
                }
                // The holder of `primary_cell` is the hooked bio itself
                // (spec.md §4.6) when one is set; its original caller only
                // learns of completion now, after the mapping is installed
                // (spec.md §4.4 step 1, §9 "Saved end-of-bio callback").
                if let Some(hooked) = job.hooked_bio {
                    hooked.complete(BioStatus::Complete);
                }
            }
            Err(e) => {
                error!("metadata insert_block failed for job {job_id:?}: {e}");
                pool.degrade_mode(PoolMode::ReadOnly);
                process_prepared_mapping_fail(pool, job_id);
            }
        }
    }
}

/// SPEC_FULL.md §12's open-question decision: error the job's cells
/// immediately. A job only ever reaches `prepared_mappings` once `prepared`
/// is set, which (for a hooked bio) only happens after that bio's I/O has
/// already completed — so there is no in-flight hooked I/O to wait for here,
/// unlike the ambiguity spec.md §9 flags in the original driver.
fn process_prepared_mapping_fail(pool: &Pool, job_id: JobId) {
    let job = pool.remove_job(job_id);
    pool.0.prison.error(job.primary_cell);
    if let Some(secondary) = job.secondary_cell {
        pool.0.prison.error(secondary);
    }
}

fn drain_prepared_discards(pool: &Pool) {
    loop {
        let job_id = match pool.pop_prepared_discard() {
            Some(id) => id,
            None => break,
        };
        let job = pool.remove_job(job_id);
        let td = ThinHandle(job.thin_ref);
        if let Err(e) = pool.0.metadata.remove_block(td, job.virt_block) {
            error!("metadata remove_block failed for job {job_id:?}: {e}");
            pool.degrade_mode(PoolMode::ReadOnly);
        }

        let mut released = Vec::new();
        pool.0.prison.release_no_holder(job.primary_cell, &mut released);
        if let Some(secondary) = job.secondary_cell {
            pool.0.prison.release_no_holder(secondary, &mut released);
        }
        for b in released {
            pool.enqueue_deferred(b);
        }

        let bio = job
            .hooked_bio
            .expect("a discard job always hooks the bio that triggered it");
        if !job.shared && pool.config().discard_passdown() {
            if pool.0.data_device.submit_bio(bio.clone(), job.data_block).is_err() {
                bio.complete(BioStatus::IoError);
            }
        } else {
            bio.complete(BioStatus::Complete);
        }
    }
}

// --- deferred_bios drain (spec.md §4.4 step 3) ---

fn drain_deferred_bios(pool: &Pool) {
    if !pool.mode().accepts_bios() {
        for bio in pool.drain_all_deferred_bios() {
            bio.complete(BioStatus::IoError);
        }
        return;
    }

    loop {
        let bio = match pool.peek_deferred_bio() {
            Some(bio) => bio,
            None => break,
        };

        let reservation = match pool.try_reserve_job() {
            Some(r) => r,
            None => {
                // Memory pressure: leave the remaining bios queued and bail;
                // the next wake retries (spec.md §4.4 step 3, §7 "never
                // silently drops").
                warn!("mapping job arena exhausted; deferring remaining bios to next wake");
                return;
            }
        };
        let bio = pool
            .pop_deferred_bio()
            .expect("peeked bio must still be at the front of the queue");

        let td = match pool.0.metadata.open_thin(bio.device()) {
            Ok(td) => td,
            Err(e) => {
                pool.release_job_reservation(reservation);
                error!("failed to open thin device for deferred bio: {e}");
                bio.complete(BioStatus::IoError);
                continue;
            }
        };

        match bio.kind() {
            BioType::Discard => process_discard(pool, td, bio, reservation),
            _ => process_bio(pool, td, bio, reservation),
        }
    }
}

// --- commit & flush (spec.md §4.4 step 4) ---

fn maybe_commit_and_flush(pool: &Pool) {
    if !pool.commit_due() {
        return;
    }
    match pool.commit() {
        Ok(()) => {
            for bio in pool.drain_flush_bios() {
                if pool
                    .0
                    .data_device
                    .submit_bio(bio.clone(), DataBlock::new(0))
                    .is_err()
                {
                    bio.complete(BioStatus::IoError);
                }
            }
        }
        Err(_) => {
            for bio in pool.drain_flush_bios() {
                bio.complete(BioStatus::IoError);
            }
        }
    }
}

// --- process_bio (write mode, spec.md §4.5) ---

fn process_bio(pool: &Pool, td: ThinHandle, bio: Bio, reservation: crate::job::JobReservation) {
    let virt_key = CellKey::new(Scope::Virtual, td.0, bio.virtual_block().to_raw());
    let (is_new, virt_handle) = pool.0.prison.detain(virt_key, bio.clone());
    if !is_new {
        pool.release_job_reservation(reservation);
        return;
    }

    match pool.0.metadata.find_block(td, bio.virtual_block(), true) {
        Ok(LookupResult::Found { data, shared: true }) => {
            handle_shared_found(pool, td, bio, virt_handle, data, reservation);
        }
        Ok(LookupResult::Found { data, shared: false }) => {
            // The mapping stopped being shared (or just appeared) between
            // the fast path's lookup and now; treat it like the fast path's
            // own "found, not shared" case (spec.md §4.3, §4.5).
            pool.release_job_reservation(reservation);
            crate::mapper::remap_locked(pool, virt_handle, bio, data);
        }
        Ok(LookupResult::NotFound) => {
            handle_not_found(pool, td, bio, virt_handle, reservation);
        }
        Ok(LookupResult::WouldBlock) => {
            // The worker always looks up with `may_block = true`; a store
            // that still reports this is asking to be retried next pass.
            pool.release_job_reservation(reservation);
            let mut released = Vec::new();
            pool.0.prison.release(virt_handle, &mut released);
            for b in released {
                pool.enqueue_deferred(b);
            }
        }
        Err(e) => {
            pool.release_job_reservation(reservation);
            error!("metadata lookup failed: {e}");
            pool.0.prison.error(virt_handle);
            pool.degrade_mode(PoolMode::ReadOnly);
        }
    }
}

fn handle_shared_found(
    pool: &Pool,
    td: ThinHandle,
    bio: Bio,
    virt_handle: CellHandle,
    data: DataBlock,
    reservation: crate::job::JobReservation,
) {
    let data_key = CellKey::data(data.to_raw());
    let (data_is_new, data_handle) = pool.0.prison.detain(data_key, bio.clone());
    if !data_is_new {
        // A break-of-sharing (or passdown) against this data block is
        // already in flight; retry once it releases our bio back to us.
        pool.release_job_reservation(reservation);
        let mut released = Vec::new();
        pool.0.prison.release_no_holder(virt_handle, &mut released);
        for b in released {
            pool.enqueue_deferred(b);
        }
        return;
    }

    if bio.kind() == BioType::Write && !bio.is_empty() {
        match pool.alloc_data_block() {
            Ok(new_data) => {
                break_sharing(pool, td, bio, virt_handle, data_handle, data, new_data, reservation);
            }
            Err(crate::error::PoolError::OutOfSpace) => {
                pool.release_job_reservation(reservation);
                let mut released = Vec::new();
                pool.0.prison.release_no_holder(virt_handle, &mut released);
                pool.0.prison.release_no_holder(data_handle, &mut released);
                for b in released {
                    pool.enqueue_deferred(b);
                }
                pool.queue_retry_on_resume(vec![bio]);
            }
            Err(e) => {
                pool.release_job_reservation(reservation);
                error!("data block allocation failed: {e}");
                pool.0.prison.error(virt_handle);
                pool.0.prison.error(data_handle);
                pool.degrade_mode(PoolMode::ReadOnly);
            }
        }
        return;
    }

    // Read, or a zero-length write: serve the existing shared block
    // directly, tracked so a concurrent break-of-sharing knows to wait for
    // this read to finish before installing a new mapping (spec.md §4.5,
    // §8 invariant 4 "shared-read safety").
    pool.release_job_reservation(reservation);
    let entry = pool.0.shared_read.inc();
    bio.with_hook(|h| h.shared_read_entry = Some(entry));

    let mut released = Vec::new();
    pool.0.prison.release_no_holder(virt_handle, &mut released);
    pool.0.prison.release_no_holder(data_handle, &mut released);
    for b in released {
        pool.enqueue_deferred(b);
    }

    let hook_pool = pool.clone();
    let hook_bio = bio.clone();
    bio.set_on_io_done(move |status| {
        let mut released = Vec::new();
        hook_pool.0.shared_read.dec(entry, &mut released);
        on_shared_read_released(&hook_pool, released);
        hook_bio.complete(status);
    });
    if pool.0.data_device.submit_bio(bio.clone(), data).is_err() {
        bio.signal_io_done(BioStatus::IoError);
    }
}

/// Allocates a new data block and copies (or fully overwrites) into it so a
/// write to a shared block never affects the other device(s) sharing it
/// (spec.md §4.5, GLOSSARY "break-of-sharing").
fn break_sharing(
    pool: &Pool,
    td: ThinHandle,
    bio: Bio,
    virt_handle: CellHandle,
    data_handle: CellHandle,
    old_data: DataBlock,
    new_data: DataBlock,
    reservation: crate::job::JobReservation,
) {
    let full_overwrite = bio.covers_full_block(pool.block_size_bytes());
    let kind = if full_overwrite { JobKind::Overwrite } else { JobKind::Copy };
    let job = MappingJob {
        thin_ref: td.0,
        virt_block: bio.virtual_block(),
        data_block: new_data,
        kind,
        primary_cell: virt_handle,
        secondary_cell: Some(data_handle),
        quiesced: false,
        prepared: false,
        failed: false,
        hooked_bio: None,
        shared: false,
    };
    let job_id = pool.insert_job(reservation, job);

    // Quiesced exactly when no reads against the old (shared) block were
    // already in flight at the moment this job was added (spec.md §4.2,
    // §4.6).
    let deferred = pool.0.shared_read.add_work(vec![job_id]);
    if !deferred {
        pool.job_mut(job_id, |j| j.quiesced = true);
    }

    if full_overwrite {
        hook_overwrite(pool, job_id, bio, new_data);
    } else {
        schedule_copy(pool, job_id, old_data, new_data);
    }
}

fn handle_not_found(
    pool: &Pool,
    td: ThinHandle,
    bio: Bio,
    virt_handle: CellHandle,
    reservation: crate::job::JobReservation,
) {
    if bio.is_empty() {
        // Flush/FUA-only or zero-length bio against an unprovisioned
        // block: nothing to allocate, fast-path it like an existing
        // mapping would be (spec.md §4.5 "fast remap to block 0").
        pool.release_job_reservation(reservation);
        crate::mapper::remap_locked(pool, virt_handle, bio, DataBlock::new(0));
        return;
    }

    if bio.kind() != BioType::Write {
        // A read of a never-mapped virtual block returns zeros (spec.md §1,
        // §8 invariant 5), without ever allocating.
        pool.release_job_reservation(reservation);
        let mut released = Vec::new();
        pool.0.prison.release_no_holder(virt_handle, &mut released);
        for b in released {
            pool.enqueue_deferred(b);
        }
        bio.complete(BioStatus::Complete);
        return;
    }

    match pool.alloc_data_block() {
        Ok(new_data) => provision(pool, td, bio, virt_handle, new_data, reservation),
        Err(crate::error::PoolError::OutOfSpace) => {
            pool.release_job_reservation(reservation);
            let mut released = Vec::new();
            pool.0.prison.release_no_holder(virt_handle, &mut released);
            for b in released {
                pool.enqueue_deferred(b);
            }
            pool.queue_retry_on_resume(vec![bio]);
        }
        Err(e) => {
            pool.release_job_reservation(reservation);
            error!("data block allocation failed: {e}");
            pool.0.prison.error(virt_handle);
            pool.degrade_mode(PoolMode::ReadOnly);
        }
    }
}

/// Provisions a fresh data block for a never-mapped virtual block (spec.md
/// §4.5 "not found, write, non-zero size"). This pool never configures a
/// thin device with an external read-only origin (spec.md §6 names the
/// possibility but no such collaborator is modeled here — see DESIGN.md),
/// so the "external copy" branch of spec.md §4.5 never applies and every
/// provision either zero-fills or is satisfied by the write bio itself.
fn provision(
    pool: &Pool,
    td: ThinHandle,
    bio: Bio,
    virt_handle: CellHandle,
    new_data: DataBlock,
    reservation: crate::job::JobReservation,
) {
    let full_overwrite = bio.covers_full_block(pool.block_size_bytes());

    if !full_overwrite && !pool.config().zero_new_blocks() {
        // zero_new_blocks disabled: install the mapping immediately rather
        // than scheduling a zero-fill (spec.md §4.5).
        pool.release_job_reservation(reservation);
        if let Err(e) = pool.0.metadata.insert_block(td, bio.virtual_block(), new_data) {
            error!("metadata insert_block failed: {e}");
            pool.0.prison.error(virt_handle);
            pool.degrade_mode(PoolMode::ReadOnly);
            return;
        }
        let mut released = Vec::new();
        pool.0.prison.release(virt_handle, &mut released);
        for b in released {
            pool.enqueue_deferred(b);
        }
        return;
    }

    let kind = if full_overwrite { JobKind::Overwrite } else { JobKind::Zero };
    let job = MappingJob {
        thin_ref: td.0,
        virt_block: bio.virtual_block(),
        data_block: new_data,
        kind,
        primary_cell: virt_handle,
        secondary_cell: None,
        // No prior mapping means no source block to drain reads from
        // (spec.md §4.6 "a no-op initial quiesce").
        quiesced: true,
        prepared: false,
        failed: false,
        hooked_bio: None,
        shared: false,
    };
    let job_id = pool.insert_job(reservation, job);

    if full_overwrite {
        hook_overwrite(pool, job_id, bio, new_data);
    } else {
        schedule_zero(pool, job_id, new_data);
    }
}

/// Hooks `bio` onto `job_id` and issues it directly to `target`: the bio
/// itself supplies the new block's contents (spec.md §4.6 "the bio covers
/// the entire block").
fn hook_overwrite(pool: &Pool, job_id: JobId, bio: Bio, target: DataBlock) {
    pool.job_mut(job_id, |j| j.hooked_bio = Some(bio.clone()));
    let entry = pool.0.all_io.inc();
    bio.with_hook(|h| {
        h.all_io_entry = Some(entry);
        h.overwrite_mapping = Some(job_id);
    });

    let hook_pool = pool.clone();
    bio.set_on_io_done(move |status| {
        let mut all_io_released = Vec::new();
        hook_pool.0.all_io.dec(entry, &mut all_io_released);
        on_all_io_released(&hook_pool, all_io_released);

        let ready = hook_pool.job_mut(job_id, |j| {
            j.failed = !matches!(status, BioStatus::Complete);
            j.prepared = true;
            j.is_ready() || j.failed
        });
        if ready {
            hook_pool.schedule_prepared_mapping(job_id);
        }
    });

    if pool.0.data_device.submit_bio(bio.clone(), target).is_err() {
        bio.signal_io_done(BioStatus::IoError);
    }
}

/// Dispatches an internal copy from `source` to `target` via the copy
/// engine (spec.md §4.6). The completion callback only flips flags and
/// enqueues — it never blocks (spec.md §5).
fn schedule_copy(pool: &Pool, job_id: JobId, source: DataBlock, target: DataBlock) {
    let hook_pool = pool.clone();
    let from = DataRegion::single_block(source);
    let to = DataRegion::single_block(target);
    pool.0.copy_engine.copy(
        from,
        to,
        Box::new(move |outcome: CopyOutcome| {
            let ready = hook_pool.job_mut(job_id, |j| {
                j.failed = !outcome.is_ok();
                j.prepared = true;
                j.is_ready() || j.failed
            });
            if ready {
                hook_pool.schedule_prepared_mapping(job_id);
            }
        }),
    );
}

fn schedule_zero(pool: &Pool, job_id: JobId, target: DataBlock) {
    let hook_pool = pool.clone();
    let to = DataRegion::single_block(target);
    pool.0.copy_engine.zero(
        to,
        Box::new(move |outcome: CopyOutcome| {
            let ready = hook_pool.job_mut(job_id, |j| {
                j.failed = !outcome.is_ok();
                j.prepared = true;
                j.is_ready() || j.failed
            });
            if ready {
                hook_pool.schedule_prepared_mapping(job_id);
            }
        }),
    );
}

// --- process_discard (spec.md §4.7) ---

fn process_discard(pool: &Pool, td: ThinHandle, bio: Bio, reservation: crate::job::JobReservation) {
    let virt_key = CellKey::new(Scope::Virtual, td.0, bio.virtual_block().to_raw());
    let (is_new, virt_handle) = pool.0.prison.detain(virt_key, bio.clone());
    if !is_new {
        pool.release_job_reservation(reservation);
        return;
    }

    match pool.0.metadata.find_block(td, bio.virtual_block(), true) {
        Ok(LookupResult::Found { data, shared }) => {
            discard_mapped(pool, td, bio, virt_handle, data, shared, reservation);
        }
        Ok(LookupResult::NotFound) => {
            pool.release_job_reservation(reservation);
            let mut released = Vec::new();
            pool.0.prison.release(virt_handle, &mut released);
            for b in released {
                b.complete(BioStatus::Complete);
            }
        }
        Ok(LookupResult::WouldBlock) => {
            pool.release_job_reservation(reservation);
            let mut released = Vec::new();
            pool.0.prison.release(virt_handle, &mut released);
            for b in released {
                pool.enqueue_deferred(b);
            }
        }
        Err(e) => {
            pool.release_job_reservation(reservation);
            error!("metadata lookup failed during discard: {e}");
            pool.0.prison.error(virt_handle);
            pool.degrade_mode(PoolMode::ReadOnly);
        }
    }
}

fn discard_mapped(
    pool: &Pool,
    td: ThinHandle,
    bio: Bio,
    virt_handle: CellHandle,
    data: DataBlock,
    shared: bool,
    reservation: crate::job::JobReservation,
) {
    let data_key = CellKey::data(data.to_raw());
    let (data_is_new, data_handle) = pool.0.prison.detain(data_key, bio.clone());
    if !data_is_new {
        pool.release_job_reservation(reservation);
        let mut released = Vec::new();
        pool.0.prison.release_no_holder(virt_handle, &mut released);
        for b in released {
            pool.enqueue_deferred(b);
        }
        return;
    }

    if !bio.covers_full_block(pool.block_size_bytes()) {
        // A partial-block discard can never safely drop the mapping;
        // passdown it (if safe) or just acknowledge it (spec.md §4.7).
        pool.release_job_reservation(reservation);
        let mut released = Vec::new();
        pool.0.prison.release_no_holder(virt_handle, &mut released);
        pool.0.prison.release_no_holder(data_handle, &mut released);
        for b in released {
            pool.enqueue_deferred(b);
        }
        if !shared && pool.config().discard_passdown() {
            if pool.0.data_device.submit_bio(bio.clone(), data).is_err() {
                bio.complete(BioStatus::IoError);
            }
        } else {
            bio.complete(BioStatus::Complete);
        }
        return;
    }

    let job = MappingJob {
        thin_ref: td.0,
        virt_block: bio.virtual_block(),
        data_block: data,
        kind: JobKind::Discard,
        primary_cell: virt_handle,
        secondary_cell: Some(data_handle),
        quiesced: true,
        prepared: true,
        failed: false,
        hooked_bio: Some(bio),
        shared,
    };
    let job_id = pool.insert_job(reservation, job);
    // Wait for any I/O already in flight against this block to finish
    // before dropping its mapping (spec.md §4.2, §4.7); `on_all_io_released`
    // moves it onto `prepared_discards` once that drains.
    if !pool.0.all_io.add_work(vec![job_id]) {
        pool.schedule_prepared_discard(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeatureFlags, PoolConfig};
    use crate::id::{DeviceId, VirtualBlock};
    use crate::testutil::{FakeCopyEngine, FakeDataDevice, FakeMetadataStore};
    use std::sync::Arc;

    struct Harness {
        pool: Pool,
        td: ThinHandle,
        metadata: Arc<FakeMetadataStore>,
        copy: Arc<FakeCopyEngine>,
    }

    fn harness() -> Harness {
        harness_with_data_blocks(1 << 20)
    }

    fn harness_with_data_blocks(total: u64) -> Harness {
        crate::testutil::init_test_logging();
        let metadata = Arc::new(FakeMetadataStore::with_data_blocks(total));
        let copy = Arc::new(FakeCopyEngine::new());
        let device = Arc::new(FakeDataDevice::new());
        let config = PoolConfig {
            block_size_sectors: 128,
            low_water_blocks: 0,
            features: FeatureFlags::empty(),
            expected_concurrency: 128,
        };
        let pool = Pool::new(config, metadata.clone(), copy.clone(), device).unwrap();
        let id = DeviceId::new(1).unwrap();
        metadata.create_thin_for_test(id);
        let td = pool.open_thin(id).unwrap();
        Harness { pool, td, metadata, copy }
    }

    fn full_block_bio(h: &Harness, virt: u64, kind: BioType) -> Bio {
        Bio::new(h.td.0, VirtualBlock::new(virt), 0, h.pool.block_size_bytes(), kind, false)
    }

    fn partial_bio(h: &Harness, virt: u64, kind: BioType) -> Bio {
        Bio::new(h.td.0, VirtualBlock::new(virt), 0, 512, kind, false)
    }

    #[test]
    fn first_touch_full_write_provisions_via_overwrite() {
        let h = harness();
        let bio = full_block_bio(&h, 5, BioType::Write);
        h.pool.submit(h.td, bio.clone()).unwrap();

        // Pass 1: deferred bio provisions and hooks the overwrite job.
        h.pool.run_worker_pass();
        assert_eq!(bio.status(), BioStatus::Submit);

        // Pass 2: the prepared mapping installs and completes the bio.
        h.pool.run_worker_pass();
        assert_eq!(bio.status(), BioStatus::Complete);
        let found = h.metadata.find_block(h.td, VirtualBlock::new(5), true).unwrap();
        assert!(matches!(found, LookupResult::Found { shared: false, .. }));
    }

    #[test]
    fn first_touch_partial_write_zero_fills_then_remaps() {
        let h = harness();
        let bio = partial_bio(&h, 6, BioType::Write);
        h.pool.submit(h.td, bio.clone()).unwrap();

        h.pool.run_worker_pass(); // provisions, schedules zero-fill (runs inline)
        h.pool.run_worker_pass(); // installs mapping, re-enqueues original bio,
                                   // then remaps it against the new block

        assert_eq!(bio.status(), BioStatus::Complete);
        let found = h.metadata.find_block(h.td, VirtualBlock::new(6), true).unwrap();
        assert!(matches!(found, LookupResult::Found { shared: false, .. }));
    }

    #[test]
    fn break_sharing_full_write_remaps_to_a_new_block() {
        let h = harness();
        let old_data = h.metadata.alloc_data_block().unwrap();
        h.metadata.insert_block(h.td, VirtualBlock::new(7), old_data).unwrap();
        h.metadata.mark_shared_for_test(h.td, VirtualBlock::new(7));

        let bio = full_block_bio(&h, 7, BioType::Write);
        h.pool.submit(h.td, bio.clone()).unwrap();

        h.pool.run_worker_pass();
        h.pool.run_worker_pass();

        assert_eq!(bio.status(), BioStatus::Complete);
        let found = h.metadata.find_block(h.td, VirtualBlock::new(7), true).unwrap();
        match found {
            LookupResult::Found { data, shared } => {
                assert!(!shared);
                assert_ne!(data, old_data);
            }
            other => panic!("expected a mapping, got {other:?}"),
        }
    }

    #[test]
    fn read_of_shared_block_completes_without_breaking_sharing() {
        let h = harness();
        let data = h.metadata.alloc_data_block().unwrap();
        h.metadata.insert_block(h.td, VirtualBlock::new(8), data).unwrap();
        h.metadata.mark_shared_for_test(h.td, VirtualBlock::new(8));

        let bio = full_block_bio(&h, 8, BioType::Read);
        h.pool.submit(h.td, bio.clone()).unwrap();
        h.pool.run_worker_pass();

        assert_eq!(bio.status(), BioStatus::Complete);
        let found = h.metadata.find_block(h.td, VirtualBlock::new(8), true).unwrap();
        assert!(matches!(found, LookupResult::Found { shared: true, data: d } if d == data));
    }

    #[test]
    fn write_waits_for_two_concurrent_shared_reads_before_installing_new_mapping() {
        // spec.md §8 S3: a write that breaks sharing must wait for *every*
        // read against the old block that was already in flight, not just
        // one of them. Two references are taken by hand against
        // `shared_read` here (rather than through `pool.submit`, which the
        // fake data device would complete inline, draining immediately) to
        // hold both reads open across the write's arrival.
        let h = harness();
        let data = h.metadata.alloc_data_block().unwrap();
        h.metadata.insert_block(h.td, VirtualBlock::new(8), data).unwrap();
        h.metadata.mark_shared_for_test(h.td, VirtualBlock::new(8));

        let read1 = h.pool.0.shared_read.inc();
        let read2 = h.pool.0.shared_read.inc();

        let write = full_block_bio(&h, 8, BioType::Write);
        h.pool.submit(h.td, write.clone()).unwrap();
        h.pool.run_worker_pass();

        // The break-of-sharing job is provisioned (the overwrite I/O itself
        // runs inline) but must stay parked: both reads that predate it are
        // still outstanding.
        assert_eq!(write.status(), BioStatus::Submit);
        let found = h.metadata.find_block(h.td, VirtualBlock::new(8), true).unwrap();
        assert!(matches!(found, LookupResult::Found { shared: true, data: d } if d == data));

        // First read drains; the second is still open, so the mapping must
        // still not install.
        let mut released = Vec::new();
        h.pool.0.shared_read.dec(read1, &mut released);
        assert!(released.is_empty());
        h.pool.run_worker_pass();
        assert_eq!(write.status(), BioStatus::Submit);

        // Second (last) read drains: the job quiesces and the worker
        // installs the new mapping, completing the write.
        let mut released = Vec::new();
        h.pool.0.shared_read.dec(read2, &mut released);
        on_shared_read_released(&h.pool, released);
        h.pool.run_worker_pass();

        assert_eq!(write.status(), BioStatus::Complete);
        let found = h.metadata.find_block(h.td, VirtualBlock::new(8), true).unwrap();
        assert!(matches!(found, LookupResult::Found { shared: false, data: d } if d != data));
    }

    #[test]
    fn out_of_space_parks_bio_until_resume() {
        let h = harness_with_data_blocks(0);
        let bio = full_block_bio(&h, 9, BioType::Write);
        h.pool.submit(h.td, bio.clone()).unwrap();

        h.pool.run_worker_pass();
        assert_eq!(bio.status(), BioStatus::Submit);
        assert_eq!(h.pool.0.state.lock().retry_on_resume.len(), 1);
        assert_eq!(h.pool.mode(), PoolMode::Write);

        h.metadata.resize_data_dev(16).unwrap();
        h.pool.resume();
        h.pool.run_worker_pass();
        h.pool.run_worker_pass();

        assert_eq!(bio.status(), BioStatus::Complete);
    }

    #[test]
    fn full_block_discard_passes_down_after_draining_in_flight_io() {
        let h = harness();
        let data = h.metadata.alloc_data_block().unwrap();
        h.metadata.insert_block(h.td, VirtualBlock::new(10), data).unwrap();

        let bio = full_block_bio(&h, 10, BioType::Discard);
        h.pool.submit(h.td, bio.clone()).unwrap();

        h.pool.run_worker_pass(); // builds the discard job, already prepared
        h.pool.run_worker_pass(); // drains it: removes the mapping, passes down

        assert_eq!(bio.status(), BioStatus::Complete);
        let found = h.metadata.find_block(h.td, VirtualBlock::new(10), true).unwrap();
        assert!(matches!(found, LookupResult::NotFound));
    }

    #[test]
    fn partial_discard_never_drops_the_mapping() {
        let h = harness();
        let data = h.metadata.alloc_data_block().unwrap();
        h.metadata.insert_block(h.td, VirtualBlock::new(11), data).unwrap();

        let bio = partial_bio(&h, 11, BioType::Discard);
        h.pool.submit(h.td, bio.clone()).unwrap();
        h.pool.run_worker_pass();

        assert_eq!(bio.status(), BioStatus::Complete);
        let found = h.metadata.find_block(h.td, VirtualBlock::new(11), true).unwrap();
        assert!(matches!(found, LookupResult::Found { .. }));
    }

    #[test]
    fn metadata_insert_failure_degrades_mode_and_fails_the_bio() {
        let h = harness();
        let bio = full_block_bio(&h, 12, BioType::Write);
        h.pool.submit(h.td, bio.clone()).unwrap();

        h.pool.run_worker_pass();
        h.metadata.fail_next_insert();
        h.pool.run_worker_pass();

        assert_eq!(bio.status(), BioStatus::IoError);
        assert_eq!(h.pool.mode(), PoolMode::ReadOnly);
    }

    #[test]
    fn copy_engine_failure_fails_the_job_without_installing_a_mapping() {
        let h = harness();
        let old_data = h.metadata.alloc_data_block().unwrap();
        h.metadata.insert_block(h.td, VirtualBlock::new(13), old_data).unwrap();
        h.metadata.mark_shared_for_test(h.td, VirtualBlock::new(13));

        let bio = partial_bio(&h, 13, BioType::Write);
        h.copy.fail_next_operation();
        h.pool.submit(h.td, bio.clone()).unwrap();

        h.pool.run_worker_pass();
        h.pool.run_worker_pass();

        assert_eq!(bio.status(), BioStatus::IoError);
        let found = h.metadata.find_block(h.td, VirtualBlock::new(13), true).unwrap();
        assert!(matches!(found, LookupResult::Found { data, .. } if data == old_data));
    }

    #[test]
    fn flush_bio_completes_after_a_successful_commit() {
        let h = harness();
        let bio = Bio::new(h.td.0, VirtualBlock::new(0), 0, 0, BioType::Flush, false);
        h.pool.submit(h.td, bio.clone()).unwrap();
        h.pool.run_worker_pass();
        assert_eq!(bio.status(), BioStatus::Complete);
    }

    #[test]
    fn flush_bio_fails_and_degrades_mode_on_commit_failure() {
        let h = harness();
        h.metadata.fail_next_commit();
        let bio = Bio::new(h.td.0, VirtualBlock::new(0), 0, 0, BioType::Flush, false);
        h.pool.submit(h.td, bio.clone()).unwrap();
        h.pool.run_worker_pass();
        assert_eq!(bio.status(), BioStatus::IoError);
        assert_eq!(h.pool.mode(), PoolMode::ReadOnly);
    }
}
