// SPDX-License-Identifier: MPL-2.0

//! Pool configuration (spec.md §6 "table load parameters", SPEC_FULL.md
//! §10.3): the administrative record a pool is constructed from.

use bitflags::bitflags;

use crate::id::validate_block_size_sectors;

bitflags! {
    /// Feature flags named verbatim in spec.md §6's table-load parameters.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FeatureFlags: u32 {
        /// Skip zero-filling newly provisioned blocks (spec.md §4.5's
        /// "skipped if zero_new_blocks is disabled").
        const SKIP_BLOCK_ZEROING = 1 << 0;
        const IGNORE_DISCARD = 1 << 1;
        const NO_DISCARD_PASSDOWN = 1 << 2;
        const READ_ONLY = 1 << 3;
    }
}

impl Default for FeatureFlags {
    fn default() -> Self {
        FeatureFlags::empty()
    }
}

/// Table-load configuration for a pool (spec.md §6).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool block size, in 512-byte sectors (spec.md §3).
    pub block_size_sectors: u32,
    /// Free-block threshold at which the low-water administrative event
    /// fires (spec.md §4.8).
    pub low_water_blocks: u64,
    pub features: FeatureFlags,
    /// An upper bound on concurrent in-flight bios, used to size the bio
    /// prison's hash table and bounded pools (spec.md §4.1).
    pub expected_concurrency: usize,
}

impl PoolConfig {
    pub fn validate(&self) -> bool {
        validate_block_size_sectors(self.block_size_sectors)
    }

    pub fn zero_new_blocks(&self) -> bool {
        !self.features.contains(FeatureFlags::SKIP_BLOCK_ZEROING)
    }

    pub fn discard_enabled(&self) -> bool {
        !self.features.contains(FeatureFlags::IGNORE_DISCARD)
    }

    pub fn discard_passdown(&self) -> bool {
        self.discard_enabled() && !self.features.contains(FeatureFlags::NO_DISCARD_PASSDOWN)
    }

    pub fn starts_read_only(&self) -> bool {
        self.features.contains(FeatureFlags::READ_ONLY)
    }
}
