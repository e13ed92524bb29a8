// SPDX-License-Identifier: MPL-2.0

//! The underlying block device layer (spec.md §6): consumed only to submit
//! and complete bios against the data device. Shaped after
//! `aster-block::BlockDevice`, trimmed to the two operations spec.md §6
//! names ("submit_bio", "complete_bio") since actual queueing, segment
//! merging, and hardware submission are out of scope (spec.md §1).

use crate::bio::{Bio, BioEnqueueError};
use crate::id::DataBlock;

/// The data device the pool allocates blocks from and passes bios down to.
/// Mirrors `aster-block::BlockDevice::enqueue`'s contract: accept-or-reject
/// synchronously, complete asynchronously through the bio's own completion
/// path.
pub trait DataDevice: Send + Sync {
    /// Submits `bio`, remapped to `target` (spec.md §4.3 "remap bio to the
    /// data block"). The device layer is responsible for translating
    /// `(target, bio.offset(), bio.len())` into the physical I/O.
    ///
    /// Implementations must finish the bio through [`Bio::signal_io_done`],
    /// not [`Bio::complete`], so that a bio hooked onto a `MappingJob`
    /// (spec.md §4.6) is routed to the job's completion logic rather than
    /// reaching its original caller before its mapping is installed.
    fn submit_bio(&self, bio: Bio, target: DataBlock) -> Result<(), BioEnqueueError>;

    /// Total size of the data device, in pool blocks.
    fn size_blocks(&self) -> u64;
}
