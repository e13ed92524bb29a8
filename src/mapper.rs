// SPDX-License-Identifier: MPL-2.0

//! The request mapper (spec.md §4.3): the non-blocking fast path every
//! incoming bio passes through once. Either remaps and forwards it
//! immediately, or hands it to the worker via `deferred_bios`.

use crate::bio::{Bio, BioStatus};
use crate::metadata::{LookupResult, ThinHandle};
use crate::mode::PoolMode;
use crate::pool::Pool;
use crate::prison::{CellKey, Scope};

/// Runs the fast-path classification for one bio (spec.md §4.3). Never
/// blocks: it either completes the bio synchronously (mode failed /
/// read-only-unprovisioned), forwards it down remapped, or enqueues it for
/// the worker.
pub fn submit(pool: &Pool, td: ThinHandle, bio: Bio) -> Result<(), crate::error::PoolError> {
    bio.mark_submitted();

    if !pool.mode().accepts_bios() {
        pool.fail_bio(bio, BioStatus::IoError);
        return Ok(());
    }

    if bio.is_flush() || bio.is_fua() || matches!(bio.kind(), crate::bio::BioType::Discard) {
        pool.enqueue_deferred(bio);
        return Ok(());
    }

    let lookup = match pool.0.metadata.find_block(td, bio.virtual_block(), false) {
        Ok(lookup) => lookup,
        Err(_) => {
            // The bio was already handed off at `mark_submitted` above; it
            // must be completed on every path from here, not left parked at
            // `Submit` forever (spec.md §7), matching the `PoolMode::Fail`
            // branch above and `dm-thin.c`'s `thin_bio_map()` `default:`
            // case, which calls `bio_io_error(bio)` on a lookup failure.
            pool.fail_bio(bio, BioStatus::IoError);
            return Ok(());
        }
    };

    match lookup {
        LookupResult::Found { data, shared: false } => {
            remap_unshared(pool, td, bio, data);
        }
        LookupResult::Found { shared: true, .. } => {
            pool.enqueue_deferred(bio);
        }
        LookupResult::NotFound if pool.mode() == PoolMode::ReadOnly => {
            pool.fail_bio(bio, BioStatus::IoError);
        }
        LookupResult::NotFound | LookupResult::WouldBlock => {
            pool.enqueue_deferred(bio);
        }
    }
    Ok(())
}

fn remap_unshared(pool: &Pool, td: ThinHandle, bio: Bio, data: crate::id::DataBlock) {
    let virt_key = CellKey::new(Scope::Virtual, td.0, bio.virtual_block().to_raw());
    let (virt_is_new, virt_handle) = pool.0.prison.detain(virt_key, bio.clone());
    if !virt_is_new {
        // Another operation already owns this virtual block; our bio was
        // queued as an additional inmate and will be released when it
        // finishes.
        return;
    }
    remap_locked(pool, virt_handle, bio, data);
}

/// Remaps a bio whose virtual-scope cell is already detained down to
/// `data`: detains the data-scope cell too (so a concurrent break-of-sharing
/// can't start while this I/O is in flight), tracks it on `all_io` for
/// discard safety, and submits it (spec.md §4.2, §4.3, §4.7). Used both by
/// the fast path above and by the worker's symmetric "found, not shared"
/// race case (spec.md §4.5).
pub(crate) fn remap_locked(pool: &Pool, virt_handle: crate::prison::CellHandle, bio: Bio, data: crate::id::DataBlock) {
    // Data-scope keys are pool-wide (spec.md §3's key tuple still names a
    // `DeviceId`, but data blocks aren't owned by any one thin device — see
    // `CellKey::data`), so a break-of-sharing in flight against this block
    // from *any* device is visible here.
    let data_key = CellKey::data(data.to_raw());
    let (data_is_new, data_handle) = pool.0.prison.detain(data_key, bio.clone());
    if !data_is_new {
        // A break-of-sharing for this data block is already in flight.
        // Release our virtual-cell ownership (excluding our own bio, which
        // we hand to the deferred queue ourselves) and let the worker
        // retry once that operation completes.
        let mut released = Vec::new();
        pool.0.prison.release_no_holder(virt_handle, &mut released);
        for b in released {
            pool.enqueue_deferred(b);
        }
        pool.enqueue_deferred(bio);
        return;
    }

    let entry = pool.0.all_io.inc();
    bio.with_hook(|hook| hook.all_io_entry = Some(entry));

    let mut released = Vec::new();
    pool.0.prison.release_no_holder(virt_handle, &mut released);
    pool.0.prison.release_no_holder(data_handle, &mut released);
    for b in released {
        pool.enqueue_deferred(b);
    }

    // Hook the bio's I/O completion so the `all_io` reference is released
    // (and any discard jobs waiting on it requeued) before the caller ever
    // sees the bio complete (spec.md §4.2, §4.7).
    let hook_pool = pool.clone();
    let hook_bio = bio.clone();
    bio.set_on_io_done(move |status| {
        let mut released = Vec::new();
        hook_pool.0.all_io.dec(entry, &mut released);
        crate::worker::on_all_io_released(&hook_pool, released);
        hook_bio.complete(status);
    });

    if pool.0.data_device.submit_bio(bio.clone(), data).is_err() {
        bio.signal_io_done(BioStatus::IoError);
    }
}
