//! Liveness and finalization decisions for extra-object records, plus the
//! allocation primitive the page layer is built on.

use std::{
    alloc::{self, Layout},
    ptr::NonNull,
};

use object::ObjHeader;

use crate::{ExtraObjectData, ExtraObjectFlags, FinalizerQueue};

/// Alignment of every block handed out by [`safe_alloc`].
pub const SAFE_ALLOC_ALIGN: usize = 16;

/// Result of [`try_finalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The record is done and its cell can be reused.
    Reclaim,
    /// The owner is not heap-resident; the record stays.
    KeepNotOwned,
    /// The record is (now) waiting for the finalizer thread. Its owner was
    /// kept alive for this cycle.
    KeepPending,
}

impl FinalizeOutcome {
    #[inline]
    pub fn is_reclaimable(self) -> bool {
        self == Self::Reclaim
    }
}

/// Clears the object's mark bit, returning whether it had been marked.
/// Objects that come back `false` are dead for this cycle.
#[inline]
pub fn try_reset_mark(object: &ObjHeader) -> bool {
    object.try_reset_mark()
}

#[inline]
fn keep_alive(object: &ObjHeader) {
    object.try_mark();
}

/// Decides what happens to a record during sweep.
///
/// In order:
/// 1. already `FINALIZED` records are reclaimed without touching the owner;
/// 2. records of non-heap objects are kept;
/// 3. records already queued keep their owner alive and stay;
/// 4. weak references are cleared, then a record with an associated object
///    or a type-declared finalizer is flagged, queued, counted in
///    `scheduled` and its owner kept alive;
/// 5. anything else is uninstalled on the spot and reclaimed.
///
/// Must only be called for records whose owner did not survive marking.
pub fn try_finalize(
    record: &ExtraObjectData,
    queue: &FinalizerQueue,
    scheduled: &mut usize,
) -> FinalizeOutcome {
    if record.has_flag(ExtraObjectFlags::FINALIZED) {
        return FinalizeOutcome::Reclaim;
    }

    let Some(owner) = record.base_object() else {
        // never installed, nothing refers to it
        log::debug!("reclaiming orphan extra object {:p}", record);
        return FinalizeOutcome::Reclaim;
    };
    // SAFETY: the owner outlives its record until the record is FINALIZED
    let owner = unsafe { owner.as_ref() };

    if !owner.is_heap() {
        return FinalizeOutcome::KeepNotOwned;
    }

    if record.has_flag(ExtraObjectFlags::IN_FINALIZER_QUEUE) {
        keep_alive(owner);
        return FinalizeOutcome::KeepPending;
    }

    record.clear_weak_reference_counter();

    if record.detach_associated_object() || owner.has_finalizer() {
        schedule(record, owner, queue, scheduled);
        return FinalizeOutcome::KeepPending;
    }

    record.uninstall();
    FinalizeOutcome::Reclaim
}

fn schedule(
    record: &ExtraObjectData,
    owner: &ObjHeader,
    queue: &FinalizerQueue,
    scheduled: &mut usize,
) {
    record.set_flag(ExtraObjectFlags::IN_FINALIZER_QUEUE);
    // SAFETY: the record stays in its page cell until the finalizer thread
    // flags it FINALIZED and a later sweep reclaims it
    unsafe { queue.push(NonNull::from(record)) };
    *scheduled += 1;
    keep_alive(owner);
    log::trace!(
        "scheduled {:p} ({}) for finalization",
        record,
        owner.type_info().name()
    );
}

/// Sweep decision for one occupied cell: `true` if the cell can be reused.
///
/// A record whose owner is still marked is live and left alone; everything
/// else goes through [`try_finalize`].
pub fn sweep_record(
    record: &ExtraObjectData,
    queue: &FinalizerQueue,
    scheduled: &mut usize,
) -> bool {
    if !record.has_flag(ExtraObjectFlags::FINALIZED) {
        if let Some(owner) = record.base_object() {
            // SAFETY: not FINALIZED, so the owner is still alive
            let owner = unsafe { owner.as_ref() };
            if owner.is_heap() && owner.is_marked() {
                return false;
            }
        }
    }
    try_finalize(record, queue, scheduled).is_reclaimable()
}

/// Allocates `size` bytes aligned to [`SAFE_ALLOC_ALIGN`].
///
/// Never returns on failure: a size that cannot be represented or an
/// exhausted allocator terminates the process after logging.
pub fn safe_alloc(size: u64) -> NonNull<u8> {
    let Some(layout) = layout_for(size) else {
        out_of_memory(size)
    };
    // SAFETY: layout has non-zero size
    let ptr = unsafe { alloc::alloc(layout) };
    NonNull::new(ptr).unwrap_or_else(|| out_of_memory(size))
}

/// Releases a block from [`safe_alloc`].
///
/// # Safety
///
/// `ptr` must come from `safe_alloc(size)` with the same `size` and must not
/// be used afterwards.
pub unsafe fn safe_free(ptr: NonNull<u8>, size: u64) {
    let Some(layout) = layout_for(size) else {
        unreachable!("freeing a block of {size} bytes that was never allocatable");
    };
    // SAFETY: caller guarantees ptr/layout came from safe_alloc
    unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
}

fn layout_for(size: u64) -> Option<Layout> {
    let size = usize::try_from(size).ok()?.max(1);
    Layout::from_size_align(size, SAFE_ALLOC_ALIGN).ok()
}

#[cold]
fn out_of_memory(size: u64) -> ! {
    log::error!("Out of memory trying to allocate {size} bytes. Aborting.");
    eprintln!("Out of memory trying to allocate {size} bytes. Aborting.");
    std::process::abort()
}
