// SPDX-License-Identifier: MPL-2.0

//! The bio: the unit of I/O the mapping core routes (spec.md §3, §6).
//!
//! Shaped after `aster-block::bio::Bio`: an `Arc`-wrapped inner record with
//! an atomic status the submitter polls/waits on, and a completion path the
//! engine can invoke once. Two differences from the teacher: (1) a bio here
//! carries no payload buffer — actual byte movement is the underlying block
//! device layer's job (spec.md §1 lists it as an out-of-scope collaborator,
//! only consumed through `submit_bio`/`complete_bio`); (2) the completion
//! callback is a boxed closure rather than a bare `fn` pointer, because
//! hooking a bio onto a `MappingJob` (spec.md §4.6) needs to capture job
//! state.

use std::sync::Mutex;

use crate::id::{DeviceId, VirtualBlock};
use crate::job::JobId;
use crate::prelude::*;
use crate::sync::WaitQueue;

/// The type of a bio, mirroring `aster-block::bio::BioType`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BioType {
    Read,
    Write,
    Flush,
    Discard,
}

impl BioType {
    pub fn is_write_like(self) -> bool {
        matches!(self, BioType::Write | BioType::Discard)
    }
}

/// The outcome of a bio, mirroring `aster-block::bio::BioStatus`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BioStatus {
    Init = 0,
    Submit = 1,
    Complete = 2,
    NotSupported = 3,
    NoSpace = 4,
    IoError = 5,
}

impl From<u32> for BioStatus {
    fn from(v: u32) -> Self {
        match v {
            0 => BioStatus::Init,
            1 => BioStatus::Submit,
            2 => BioStatus::Complete,
            3 => BioStatus::NotSupported,
            4 => BioStatus::NoSpace,
            _ => BioStatus::IoError,
        }
    }
}

/// The error returned when a bio cannot be accepted into the pool's
/// submission path (spec.md §4.3's fast-path outcomes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BioEnqueueError {
    /// The pool has permanently failed (spec.md §4.9's `fail` mode).
    PoolFailed,
    /// The pool is read-only and the block is unprovisioned.
    ReadOnlyUnprovisioned,
}

/// Per-bio hook state (spec.md §3 "Bio hook"): a back-pointer to the thin
/// device plus the deferred-set references and mapping-job link that the
/// engine attaches while routing the bio.
#[derive(Default)]
pub(crate) struct BioHook {
    /// Deferred-set reference taken for a shared read (§4.5's "attach to
    /// `shared_read`").
    pub shared_read_entry: Option<crate::deferred_set::EntryHandle>,
    /// Deferred-set reference taken for any in-flight I/O to a block that
    /// may be discarded (§4.2, §4.7).
    pub all_io_entry: Option<crate::deferred_set::EntryHandle>,
    /// Set when this bio itself carries the new block's data and will
    /// complete the mapping job that hooked it (§4.6).
    pub overwrite_mapping: Option<JobId>,
}

struct BioInner {
    device: DeviceId,
    virtual_block: VirtualBlock,
    /// Byte offset within the virtual block.
    offset: u32,
    /// Length in bytes.
    len: u32,
    kind: BioType,
    fua: bool,
    status: AtomicU32,
    wait_queue: WaitQueue,
    hook: Mutex<BioHook>,
    /// The caller-visible completion callback, invoked by [`Bio::complete`].
    on_complete: Mutex<Option<Box<dyn FnOnce(BioStatus) + Send>>>,
    /// The saved completion callback, installed while the bio is hooked
    /// onto a `MappingJob` (spec.md §9 "Saved end-of-bio callback"). When
    /// set, the underlying device I/O's completion runs this instead of
    /// immediately finishing the bio — the job's worker-side processing
    /// decides when (and whether) to call [`Bio::complete`] (spec.md §4.6,
    /// §4.4 step 1: a hooked bio only becomes visible to its original
    /// caller after its mapping is installed, not merely after its I/O
    /// finishes).
    io_done: Mutex<Option<Box<dyn FnOnce(BioStatus) + Send>>>,
}

/// A bio: one I/O request addressed at `(device_id, virtual_block,
/// byte_offset_within_block)` (spec.md §1).
#[derive(Clone)]
pub struct Bio(Arc<BioInner>);

impl Bio {
    pub fn new(
        device: DeviceId,
        virtual_block: VirtualBlock,
        offset: u32,
        len: u32,
        kind: BioType,
        fua: bool,
    ) -> Self {
        Self(Arc::new(BioInner {
            device,
            virtual_block,
            offset,
            len,
            kind,
            fua,
            status: AtomicU32::new(BioStatus::Init as u32),
            wait_queue: WaitQueue::new(),
            hook: Mutex::new(BioHook::default()),
            on_complete: Mutex::new(None),
            io_done: Mutex::new(None),
        }))
    }

    pub fn device(&self) -> DeviceId {
        self.0.device
    }

    pub fn virtual_block(&self) -> VirtualBlock {
        self.0.virtual_block
    }

    pub fn kind(&self) -> BioType {
        self.0.kind
    }

    pub fn is_fua(&self) -> bool {
        self.0.fua
    }

    pub fn is_flush(&self) -> bool {
        matches!(self.0.kind, BioType::Flush)
    }

    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    pub fn offset(&self) -> u32 {
        self.0.offset
    }

    pub fn len(&self) -> u32 {
        self.0.len
    }

    /// Returns `true` if this bio's range spans an entire pool block
    /// (spec.md §4.5/§4.6's "the bio covers the entire block").
    pub fn covers_full_block(&self, block_size_bytes: u32) -> bool {
        self.0.offset == 0 && self.0.len == block_size_bytes
    }

    pub fn status(&self) -> BioStatus {
        BioStatus::from(self.0.status.load(Ordering::Relaxed))
    }

    pub(crate) fn with_hook<R>(&self, f: impl FnOnce(&mut BioHook) -> R) -> R {
        let mut hook = self.0.hook.lock().unwrap();
        f(&mut hook)
    }

    /// Marks the bio submitted. Idempotent only once; panics on reuse, the
    /// same contract `aster-block::bio::Bio::submit` enforces.
    pub(crate) fn mark_submitted(&self) {
        let prev = self.0.status.swap(BioStatus::Submit as u32, Ordering::AcqRel);
        assert_eq!(prev, BioStatus::Init as u32, "bio submitted more than once");
    }

    /// Installs a completion callback, saving over (and discarding) any
    /// previous one. Used to hook a bio onto a `MappingJob` (§4.6) or to
    /// give it a normal caller-supplied callback.
    pub fn set_on_complete(&self, f: impl FnOnce(BioStatus) + Send + 'static) {
        *self.0.on_complete.lock().unwrap() = Some(Box::new(f));
    }

    /// Hooks the bio onto a `MappingJob`: device-level I/O completion will
    /// run `f` instead of finishing the bio (spec.md §4.6). `f` is
    /// responsible for eventually calling [`Bio::complete`] itself once the
    /// job's mapping is installed.
    pub fn set_on_io_done(&self, f: impl FnOnce(BioStatus) + Send + 'static) {
        *self.0.io_done.lock().unwrap() = Some(Box::new(f));
    }

    /// Reports that the underlying device I/O for this bio has finished.
    /// If the bio is hooked (`set_on_io_done` was called), runs the hook
    /// instead of completing the bio. Otherwise behaves exactly like
    /// [`Bio::complete`].
    pub fn signal_io_done(&self, status: BioStatus) {
        if let Some(cb) = self.0.io_done.lock().unwrap().take() {
            cb(status);
        } else {
            self.complete(status);
        }
    }

    /// Completes the bio: sets its status, wakes any waiter, and invokes
    /// the saved completion callback exactly once.
    pub fn complete(&self, status: BioStatus) {
        assert!(!matches!(status, BioStatus::Init | BioStatus::Submit));
        self.0.status.store(status as u32, Ordering::Release);
        self.0.wait_queue.wake_all();
        if let Some(cb) = self.0.on_complete.lock().unwrap().take() {
            cb(status);
        }
    }

    /// Blocks the calling thread until the bio completes.
    pub fn wait(&self) -> BioStatus {
        self.0.wait_queue.wait_until(|| {
            let status = self.status();
            (!matches!(status, BioStatus::Init | BioStatus::Submit)).then_some(status)
        })
    }
}

impl Debug for Bio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bio")
            .field("device", &self.0.device)
            .field("virtual_block", &self.0.virtual_block)
            .field("kind", &self.0.kind)
            .field("status", &self.status())
            .finish()
    }
}
