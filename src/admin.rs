// SPDX-License-Identifier: MPL-2.0

//! Administrative surface (spec.md §6, SPEC_FULL.md §11): pool construction
//! is `Pool::new` (see `crate::pool`); this module covers the rest — the
//! textual user messages (`create_thin`, `create_snap`, `delete`,
//! `set_transaction_id`, `reserve_metadata_snap`, `release_metadata_snap`,
//! `resize_data_dev`) and the two-line status format.
//!
//! Grounded on `dm-thin.c`'s `pool_message`/`pool_status` (see
//! `original_source/`): each message is a thin guarded pass-through to the
//! metadata store, not core mapping logic, so none of it touches the bio
//! prison, deferred sets, or mapping jobs.

use crate::error::PoolError;
use crate::id::DeviceId;
use crate::pool::Pool;

/// The fixed two-line status format spec.md §6 specifies:
/// ```text
/// <trans_id> <metadata_used>/<metadata_total> <data_used>/<data_total>
/// <held_metadata_snap_or_dash> <rw|ro> <ignore_discard|discard_passdown|no_discard_passdown>
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub transaction_id: u64,
    pub metadata_used_blocks: u64,
    pub metadata_total_blocks: u64,
    pub data_used_blocks: u64,
    pub data_total_blocks: u64,
    pub held_metadata_snap: Option<u64>,
    pub mode_token: &'static str,
    pub discard_token: &'static str,
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let held = match self.held_metadata_snap {
            Some(id) => id.to_string(),
            None => "-".to_string(),
        };
        writeln!(
            f,
            "{} {}/{} {}/{}",
            self.transaction_id,
            self.metadata_used_blocks,
            self.metadata_total_blocks,
            self.data_used_blocks,
            self.data_total_blocks
        )?;
        write!(f, "{held} {} {}", self.mode_token, self.discard_token)
    }
}

fn discard_token(config: &crate::config::PoolConfig) -> &'static str {
    if !config.discard_enabled() {
        "ignore_discard"
    } else if config.discard_passdown() {
        "discard_passdown"
    } else {
        "no_discard_passdown"
    }
}

impl Pool {
    /// Renders the pool's status line (spec.md §6).
    pub fn status(&self) -> Result<PoolStatus, PoolError> {
        let transaction_id = self.0.metadata.get_transaction_id().map_err(PoolError::Metadata)?;
        let (metadata_used, metadata_total) =
            self.0.metadata.metadata_usage().map_err(PoolError::Metadata)?;
        let data_total = self.0.metadata.get_data_dev_size().map_err(PoolError::Metadata)?;
        let data_free = self.0.metadata.get_free_block_count().map_err(PoolError::Metadata)?;
        let held_metadata_snap = self.0.state.lock().held_metadata_snap;
        Ok(PoolStatus {
            transaction_id,
            metadata_used_blocks: metadata_used,
            metadata_total_blocks: metadata_total,
            data_used_blocks: data_total.saturating_sub(data_free),
            data_total_blocks: data_total,
            held_metadata_snap,
            mode_token: self.mode().status_token(),
            discard_token: discard_token(self.config()),
        })
    }

    /// `create_thin <id>` (spec.md §6).
    pub fn create_thin(&self, id: DeviceId) -> Result<(), PoolError> {
        self.0.metadata.create_thin(id).map_err(PoolError::Metadata)
    }

    /// `create_snap <id> <origin>` (spec.md §6). Snapshotting marks the
    /// origin's existing mappings `shared` so the next write to either
    /// device breaks sharing through the ordinary worker path (spec.md
    /// §4.5) — no separate snapshot machinery exists in the mapping core.
    pub fn create_snap(&self, id: DeviceId, origin: DeviceId) -> Result<(), PoolError> {
        self.0
            .metadata
            .create_snap(id, origin)
            .map_err(PoolError::Metadata)
    }

    /// `delete <id>` (spec.md §6).
    pub fn delete_thin(&self, id: DeviceId) -> Result<(), PoolError> {
        self.0.metadata.delete_thin(id).map_err(PoolError::Metadata)
    }

    /// `set_transaction_id <old> <new>` (spec.md §6, SPEC_FULL.md §11):
    /// guarded compare-and-set, grounded on `dm-thin.c`'s `pool_message`
    /// handler for the same message, which fails outright if `old` does not
    /// match the metadata store's current transaction id.
    pub fn set_transaction_id(&self, old: u64, new: u64) -> Result<(), PoolError> {
        let current = self.0.metadata.get_transaction_id().map_err(PoolError::Metadata)?;
        if current != old {
            return Err(PoolError::TransactionIdMismatch);
        }
        self.0
            .metadata
            .set_transaction_id(old, new)
            .map_err(PoolError::Metadata)
    }

    /// `reserve_metadata_snap` (spec.md §6, SPEC_FULL.md §11): pins the
    /// current metadata snapshot for an external reader, recording the id
    /// on the pool so `status()` can surface it.
    pub fn reserve_metadata_snap(&self) -> Result<u64, PoolError> {
        let id = self.0.metadata.reserve_metadata_snap().map_err(PoolError::Metadata)?;
        self.0.state.lock().held_metadata_snap = Some(id);
        Ok(id)
    }

    /// `release_metadata_snap` (spec.md §6, SPEC_FULL.md §11).
    pub fn release_metadata_snap(&self) -> Result<(), PoolError> {
        self.0
            .metadata
            .release_metadata_snap()
            .map_err(PoolError::Metadata)?;
        self.0.state.lock().held_metadata_snap = None;
        Ok(())
    }

    /// Grows the data device (SPEC_FULL.md §11, grounded on `dm-thin.c`'s
    /// `maybe_resize_data_dev`): refuses to shrink, and reopens allocation
    /// that a prior out-of-space failure had latched closed, mirroring the
    /// "resume re-inserts retry-on-resume bios" path spec.md §5 describes
    /// for the same underlying event (more space having become available).
    pub fn resize_data_dev(&self, new_size_blocks: u64) -> Result<(), PoolError> {
        self.0
            .metadata
            .resize_data_dev(new_size_blocks)
            .map_err(PoolError::Metadata)?;
        let mut state = self.0.state.lock();
        state.out_of_space = false;
        state.low_water_triggered = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeatureFlags, PoolConfig};
    use crate::testutil::{FakeCopyEngine, FakeDataDevice, FakeMetadataStore};
    use std::sync::Arc;

    fn pool() -> Pool {
        let metadata = Arc::new(FakeMetadataStore::new());
        let copy = Arc::new(FakeCopyEngine::new());
        let device = Arc::new(FakeDataDevice::new());
        let config = PoolConfig {
            block_size_sectors: 128,
            low_water_blocks: 0,
            features: FeatureFlags::empty(),
            expected_concurrency: 128,
        };
        Pool::new(config, metadata, copy, device).unwrap()
    }

    #[test]
    fn create_then_delete_thin_roundtrips() {
        let pool = pool();
        let id = DeviceId::new(9).unwrap();
        pool.create_thin(id).unwrap();
        assert!(pool.open_thin(id).is_ok());
        pool.delete_thin(id).unwrap();
        assert!(pool.open_thin(id).is_err());
    }

    #[test]
    fn create_snap_shares_origin_mappings() {
        let pool = pool();
        let origin = DeviceId::new(1).unwrap();
        let snap = DeviceId::new(2).unwrap();
        pool.create_thin(origin).unwrap();
        let td = pool.open_thin(origin).unwrap();
        let data = pool.0.metadata.alloc_data_block().unwrap();
        pool.0
            .metadata
            .insert_block(td, crate::id::VirtualBlock::new(0), data)
            .unwrap();

        pool.create_snap(snap, origin).unwrap();

        let origin_lookup = pool
            .0
            .metadata
            .find_block(td, crate::id::VirtualBlock::new(0), true)
            .unwrap();
        assert!(matches!(
            origin_lookup,
            crate::metadata::LookupResult::Found { shared: true, .. }
        ));
    }

    #[test]
    fn set_transaction_id_rejects_stale_old_value() {
        let pool = pool();
        assert!(pool.set_transaction_id(1, 2).is_err());
        pool.set_transaction_id(0, 1).unwrap();
        assert_eq!(pool.0.metadata.get_transaction_id().unwrap(), 1);
    }

    #[test]
    fn metadata_snap_reservation_appears_in_status() {
        let pool = pool();
        let id = pool.reserve_metadata_snap().unwrap();
        assert_eq!(pool.status().unwrap().held_metadata_snap, Some(id));
        pool.release_metadata_snap().unwrap();
        assert_eq!(pool.status().unwrap().held_metadata_snap, None);
    }

    #[test]
    fn resize_refuses_to_shrink() {
        let pool = pool();
        let total = pool.0.metadata.get_data_dev_size().unwrap();
        assert!(pool.resize_data_dev(total.saturating_sub(1)).is_err());
        assert!(pool.resize_data_dev(total + 1024).is_ok());
    }

    #[test]
    fn status_line_renders_expected_shape() {
        let pool = pool();
        let rendered = pool.status().unwrap().to_string();
        let mut lines = rendered.lines();
        let first = lines.next().unwrap();
        let second = lines.next().unwrap();
        assert_eq!(first.split_whitespace().count(), 3);
        assert_eq!(second.split_whitespace().count(), 3);
        assert!(second.contains("rw"));
        assert!(second.contains("discard_passdown"));
    }
}
