// SPDX-License-Identifier: MPL-2.0

//! `thinp-core`: the mapping and I/O orchestration core of a thin-provisioning
//! block-I/O engine.
//!
//! This crate presents many logical thin devices backed by a shared pool of
//! data blocks, remapping bios on demand and breaking sharing between
//! snapshots as writes arrive. It owns the serialization and orchestration
//! machinery only — the metadata store (virtual→data mapping persistence),
//! the copy engine (async block copy/zero), and the underlying data device
//! are external collaborators, consumed here only through the traits in
//! [`metadata`], [`copy_engine`], and [`device`].
//!
//! The moving parts, roughly in the order a bio passes through them:
//!
//! - [`bio`]: the unit of I/O the engine routes, and its per-bio hook state.
//! - [`mapper`]: the non-blocking fast path every incoming bio is classified
//!   through first.
//! - [`prison`]: per-`(scope, device, block)` serialization so at most one
//!   provisioning operation is ever in flight for a given block.
//! - [`deferred_set`]: the rolling-window barrier that lets a write wait for
//!   in-flight reads against a block it is about to stop sharing.
//! - [`job`]: the bounded arena of in-progress provisioning jobs.
//! - [`worker`]: the single-threaded loop that drains prepared mappings,
//!   prepared discards, and deferred bios, and drives periodic commit.
//! - [`mode`]: the pool's write/read-only/fail degradation ladder.
//! - [`pool`]: ties the above together into a cloneable, `Arc`-backed handle.
//! - [`admin`]: the administrative surface (status line, thin device
//!   lifecycle messages).
//! - [`registry`]: the process-wide, refcounted pool table.
//!
//! ```no_run
//! use std::sync::Arc;
//! use thinp_core::config::{FeatureFlags, PoolConfig};
//! use thinp_core::pool::Pool;
//!
//! # fn build() -> Result<(), thinp_core::error::PoolError> {
//! # let metadata: Arc<dyn thinp_core::metadata::MetadataStore> = unimplemented!();
//! # let copy_engine: Arc<dyn thinp_core::copy_engine::CopyEngine> = unimplemented!();
//! # let data_device: Arc<dyn thinp_core::device::DataDevice> = unimplemented!();
//! let config = PoolConfig {
//!     block_size_sectors: 128,
//!     low_water_blocks: 1024,
//!     features: FeatureFlags::empty(),
//!     expected_concurrency: 1024,
//! };
//! let pool = Pool::new(config, metadata, copy_engine, data_device)?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod admin;
pub mod bio;
pub mod config;
pub mod copy_engine;
pub mod deferred_set;
pub mod device;
pub mod error;
pub mod id;
pub mod job;
pub mod mapper;
pub mod metadata;
pub mod mode;
mod prelude;
pub mod pool;
pub mod prison;
pub mod registry;
mod slot_pool;
mod sync;
#[cfg(test)]
pub(crate) mod testutil;
pub mod worker;

pub use config::PoolConfig;
pub use error::PoolError;
pub use pool::Pool;
