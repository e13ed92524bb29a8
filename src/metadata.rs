// SPDX-License-Identifier: MPL-2.0

//! The metadata store collaborator (spec.md §6): an opaque transactional
//! key-value service mapping `(thin_id, virtual_block) -> (data_block,
//! shared)`. The core only ever calls through this trait — recovery,
//! on-disk layout, and space-map bookkeeping are out of scope (spec.md §1).

use crate::error::MetadataError;
use crate::id::{DataBlock, DeviceId, VirtualBlock};

/// The outcome of a non-blocking mapping lookup (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    Found { data: DataBlock, shared: bool },
    NotFound,
    /// The lookup needed I/O and the caller asked not to block (spec.md
    /// §4.3's "without blocking").
    WouldBlock,
}

/// A thin device handle opened against the metadata store (spec.md §6
/// `open_thin`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThinHandle(pub DeviceId);

pub type MetaResult<T> = Result<T, MetadataError>;

/// The metadata store's interface, consumed opaquely by the mapping core
/// (spec.md §6). Implementations own their own locking; the worker never
/// holds the pool lock across a call through this trait (spec.md §5).
pub trait MetadataStore: Send + Sync {
    fn find_block(
        &self,
        td: ThinHandle,
        virt: VirtualBlock,
        may_block: bool,
    ) -> MetaResult<LookupResult>;

    fn insert_block(&self, td: ThinHandle, virt: VirtualBlock, data: DataBlock) -> MetaResult<()>;

    fn remove_block(&self, td: ThinHandle, virt: VirtualBlock) -> MetaResult<()>;

    fn alloc_data_block(&self) -> MetaResult<DataBlock>;

    fn get_free_block_count(&self) -> MetaResult<u64>;

    fn get_data_dev_size(&self) -> MetaResult<u64>;

    /// Grows the data device. Refuses to shrink it (spec.md §11, grounded
    /// on `dm-thin.c`'s `resize_data_dev`'s one-directional check).
    fn resize_data_dev(&self, new_size_blocks: u64) -> MetaResult<()>;

    fn commit(&self) -> MetaResult<()>;

    fn abort(&self) -> MetaResult<()>;

    /// Switches the store itself into a read-only posture (spec.md §4.9).
    fn set_read_only(&self) -> MetaResult<()>;

    fn create_thin(&self, id: DeviceId) -> MetaResult<()>;

    fn create_snap(&self, id: DeviceId, origin: DeviceId) -> MetaResult<()>;

    fn delete_thin(&self, id: DeviceId) -> MetaResult<()>;

    fn open_thin(&self, id: DeviceId) -> MetaResult<ThinHandle>;

    fn close_thin(&self, td: ThinHandle) -> MetaResult<()>;

    fn get_transaction_id(&self) -> MetaResult<u64>;

    fn set_transaction_id(&self, old: u64, new: u64) -> MetaResult<()>;

    /// Pins the current metadata snapshot for external readers (spec.md
    /// §11).
    fn reserve_metadata_snap(&self) -> MetaResult<u64>;

    fn release_metadata_snap(&self) -> MetaResult<()>;

    /// For status-line rendering (spec.md §6): `(used, total)` blocks.
    fn metadata_usage(&self) -> MetaResult<(u64, u64)>;
}
