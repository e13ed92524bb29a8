// SPDX-License-Identifier: MPL-2.0

//! In-memory fakes for the pool's external collaborators (SPEC_FULL.md
//! §10.4): a `MetadataStore`, `CopyEngine`, and `DataDevice` good enough to
//! drive the mapping core's tests without any real storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;

use spin::Mutex;

use crate::bio::{Bio, BioEnqueueError, BioStatus};
use crate::copy_engine::{CopyEngine, CopyOutcome, DataRegion};
use crate::device::DataDevice;
use crate::error::MetadataError;
use crate::id::{DataBlock, DeviceId, VirtualBlock};
use crate::metadata::{LookupResult, MetaResult, MetadataStore, ThinHandle};

static INIT_LOGGING: Once = Once::new();

/// Initializes `env_logger` once per test process, so `RUST_LOG=thinp_core=debug
/// cargo test -- --nocapture` surfaces the `log` calls `pool.rs`/`worker.rs`
/// make on mode degradation and commit failure while a test runs.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

#[derive(Default)]
struct ThinMappings {
    entries: HashMap<u64, (DataBlock, bool)>,
}

struct MetadataInner {
    thins: HashMap<DeviceId, ThinMappings>,
    next_data_block: u64,
    total_data_blocks: u64,
    transaction_id: u64,
    fail_next_commit: bool,
    fail_next_insert: bool,
}

/// A fake metadata store backed by plain hash maps, with test-only hooks
/// (`mark_shared_for_test`, `fail_next_commit`) to force scenarios spec.md
/// §8 names (S2, S6).
pub struct FakeMetadataStore {
    inner: Mutex<MetadataInner>,
}

impl FakeMetadataStore {
    pub fn new() -> Self {
        Self::with_data_blocks(1 << 20)
    }

    pub fn with_data_blocks(total: u64) -> Self {
        Self {
            inner: Mutex::new(MetadataInner {
                thins: HashMap::new(),
                next_data_block: 0,
                total_data_blocks: total,
                transaction_id: 0,
                fail_next_commit: false,
                fail_next_insert: false,
            }),
        }
    }

    pub fn create_thin_for_test(&self, id: DeviceId) {
        self.inner.lock().thins.insert(id, ThinMappings::default());
    }

    pub fn mark_shared_for_test(&self, td: ThinHandle, virt: VirtualBlock) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner
            .thins
            .get_mut(&td.0)
            .and_then(|t| t.entries.get_mut(&virt.to_raw()))
        {
            entry.1 = true;
        }
    }

    pub fn fail_next_commit(&self) {
        self.inner.lock().fail_next_commit = true;
    }

    pub fn fail_next_insert(&self) {
        self.inner.lock().fail_next_insert = true;
    }
}

impl Default for FakeMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataStore for FakeMetadataStore {
    fn find_block(
        &self,
        td: ThinHandle,
        virt: VirtualBlock,
        _may_block: bool,
    ) -> MetaResult<LookupResult> {
        let inner = self.inner.lock();
        let thin = inner.thins.get(&td.0).ok_or(MetadataError::NoSuchDevice)?;
        Ok(match thin.entries.get(&virt.to_raw()) {
            Some((data, shared)) => LookupResult::Found {
                data: *data,
                shared: *shared,
            },
            None => LookupResult::NotFound,
        })
    }

    fn insert_block(&self, td: ThinHandle, virt: VirtualBlock, data: DataBlock) -> MetaResult<()> {
        let mut inner = self.inner.lock();
        if inner.fail_next_insert {
            inner.fail_next_insert = false;
            return Err(MetadataError::IoError);
        }
        let thin = inner
            .thins
            .get_mut(&td.0)
            .ok_or(MetadataError::NoSuchDevice)?;
        thin.entries.insert(virt.to_raw(), (data, false));
        Ok(())
    }

    fn remove_block(&self, td: ThinHandle, virt: VirtualBlock) -> MetaResult<()> {
        let mut inner = self.inner.lock();
        let thin = inner
            .thins
            .get_mut(&td.0)
            .ok_or(MetadataError::NoSuchDevice)?;
        thin.entries.remove(&virt.to_raw());
        Ok(())
    }

    fn alloc_data_block(&self) -> MetaResult<DataBlock> {
        let mut inner = self.inner.lock();
        if inner.next_data_block >= inner.total_data_blocks {
            return Err(MetadataError::NoSpace);
        }
        let block = DataBlock::new(inner.next_data_block);
        inner.next_data_block += 1;
        Ok(block)
    }

    fn get_free_block_count(&self) -> MetaResult<u64> {
        let inner = self.inner.lock();
        Ok(inner.total_data_blocks - inner.next_data_block)
    }

    fn get_data_dev_size(&self) -> MetaResult<u64> {
        Ok(self.inner.lock().total_data_blocks)
    }

    fn resize_data_dev(&self, new_size_blocks: u64) -> MetaResult<()> {
        let mut inner = self.inner.lock();
        if new_size_blocks < inner.total_data_blocks {
            return Err(MetadataError::IoError);
        }
        inner.total_data_blocks = new_size_blocks;
        Ok(())
    }

    fn commit(&self) -> MetaResult<()> {
        let mut inner = self.inner.lock();
        if inner.fail_next_commit {
            inner.fail_next_commit = false;
            return Err(MetadataError::IoError);
        }
        Ok(())
    }

    fn abort(&self) -> MetaResult<()> {
        Ok(())
    }

    fn set_read_only(&self) -> MetaResult<()> {
        Ok(())
    }

    fn create_thin(&self, id: DeviceId) -> MetaResult<()> {
        let mut inner = self.inner.lock();
        if inner.thins.contains_key(&id) {
            return Err(MetadataError::DeviceExists);
        }
        inner.thins.insert(id, ThinMappings::default());
        Ok(())
    }

    fn create_snap(&self, id: DeviceId, origin: DeviceId) -> MetaResult<()> {
        let mut inner = self.inner.lock();
        if inner.thins.contains_key(&id) {
            return Err(MetadataError::DeviceExists);
        }
        let origin_entries = inner
            .thins
            .get(&origin)
            .ok_or(MetadataError::NoSuchDevice)?
            .entries
            .clone();
        let shared_entries = origin_entries
            .into_iter()
            .map(|(virt, (data, _))| (virt, (data, true)))
            .collect();
        for (_, (_, shared)) in inner
            .thins
            .get_mut(&origin)
            .unwrap()
            .entries
            .iter_mut()
        {
            *shared = true;
        }
        inner.thins.insert(
            id,
            ThinMappings {
                entries: shared_entries,
            },
        );
        Ok(())
    }

    fn delete_thin(&self, id: DeviceId) -> MetaResult<()> {
        self.inner
            .lock()
            .thins
            .remove(&id)
            .map(|_| ())
            .ok_or(MetadataError::NoSuchDevice)
    }

    fn open_thin(&self, id: DeviceId) -> MetaResult<ThinHandle> {
        if self.inner.lock().thins.contains_key(&id) {
            Ok(ThinHandle(id))
        } else {
            Err(MetadataError::NoSuchDevice)
        }
    }

    fn close_thin(&self, _td: ThinHandle) -> MetaResult<()> {
        Ok(())
    }

    fn get_transaction_id(&self) -> MetaResult<u64> {
        Ok(self.inner.lock().transaction_id)
    }

    fn set_transaction_id(&self, old: u64, new: u64) -> MetaResult<()> {
        let mut inner = self.inner.lock();
        if inner.transaction_id != old {
            return Err(MetadataError::IoError);
        }
        inner.transaction_id = new;
        Ok(())
    }

    fn reserve_metadata_snap(&self) -> MetaResult<u64> {
        Ok(self.inner.lock().transaction_id)
    }

    fn release_metadata_snap(&self) -> MetaResult<()> {
        Ok(())
    }

    fn metadata_usage(&self) -> MetaResult<(u64, u64)> {
        Ok((0, 1))
    }
}

impl Clone for ThinMappings {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

/// A copy engine that runs completions inline on the calling thread —
/// fine for deterministic tests, unlike a real engine's own thread pool.
pub struct FakeCopyEngine {
    fail_next: std::sync::atomic::AtomicBool,
}

impl FakeCopyEngine {
    pub fn new() -> Self {
        Self {
            fail_next: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn fail_next_operation(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    fn outcome(&self) -> CopyOutcome {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            CopyOutcome {
                read_err: Some(crate::error::CopyEngineError::ReadFailed),
                write_err: None,
            }
        } else {
            CopyOutcome::ok()
        }
    }
}

impl Default for FakeCopyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CopyEngine for FakeCopyEngine {
    fn copy(&self, _from: DataRegion, _to: DataRegion, on_complete: Box<dyn FnOnce(CopyOutcome) + Send>) {
        on_complete(self.outcome());
    }

    fn zero(&self, _to: DataRegion, on_complete: Box<dyn FnOnce(CopyOutcome) + Send>) {
        on_complete(self.outcome());
    }
}

/// A data device that completes every bio immediately with success.
pub struct FakeDataDevice {
    size_blocks: AtomicU64,
}

impl FakeDataDevice {
    pub fn new() -> Self {
        Self {
            size_blocks: AtomicU64::new(1 << 20),
        }
    }
}

impl Default for FakeDataDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DataDevice for FakeDataDevice {
    fn submit_bio(&self, bio: Bio, _target: DataBlock) -> Result<(), BioEnqueueError> {
        // Completes through `signal_io_done`, not `complete`, so that a bio
        // hooked onto a `MappingJob` (spec.md §4.6, §9 "Saved end-of-bio
        // callback") is routed to its job's completion logic rather than
        // finishing early and skipping the mapping install.
        bio.signal_io_done(BioStatus::Complete);
        Ok(())
    }

    fn size_blocks(&self) -> u64 {
        self.size_blocks.load(Ordering::SeqCst)
    }
}
