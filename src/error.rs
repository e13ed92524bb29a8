// SPDX-License-Identifier: MPL-2.0

//! Error taxonomy for the pool (spec.md §7).
//!
//! These are kinds, not exceptions: most of them are produced by the
//! external collaborators (metadata store, copy engine) and are handled by
//! the worker loop as data rather than unwound. `PoolError` is the surface
//! returned from the handful of operations that can fail synchronously to
//! the caller (administrative operations, bio submission).

use thiserror::Error;

/// Errors surfaced by the metadata store collaborator (spec.md §6).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MetadataError {
    #[error("metadata I/O failed")]
    IoError,
    #[error("metadata transaction aborted")]
    Aborted,
    #[error("requested thin device does not exist")]
    NoSuchDevice,
    #[error("thin device already exists")]
    DeviceExists,
    #[error("data device has no free blocks")]
    NoSpace,
}

/// Errors surfaced by the copy engine collaborator (spec.md §6).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CopyEngineError {
    #[error("read from source region failed")]
    ReadFailed,
    #[error("write to destination region failed")]
    WriteFailed,
}

/// Errors surfaced by the underlying (consumed) block device layer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    #[error("I/O error reported by the underlying block device")]
    IoError,
}

/// Top-level error type for fallible public `Pool`/administrative
/// operations (spec.md §7, §10.1).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool is out of data space")]
    OutOfSpace,
    #[error("pool is in read-only mode")]
    ReadOnly,
    #[error("pool has permanently failed")]
    ModeFailed,
    #[error("underlying I/O failed")]
    IoFailed,
    #[error("metadata operation failed: {0}")]
    Metadata(#[from] MetadataError),
    #[error("unknown thin device id")]
    UnknownThinDevice,
    #[error("block index is out of range for this device")]
    BlockOutOfRange,
    #[error("invalid block size: must be 128..=2097152 sectors, a multiple of 128")]
    InvalidBlockSize,
    #[error("transaction id does not match the expected value")]
    TransactionIdMismatch,
}
