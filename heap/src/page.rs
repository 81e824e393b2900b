use std::{
    cell::UnsafeCell,
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use crate::{
    ExtraObjectData, FinalizerQueue, Linked,
    gc_api::{SAFE_ALLOC_ALIGN, safe_alloc, safe_free, sweep_record},
};

/// Cells per page.
pub const EXTRA_OBJECT_COUNT: usize = 128;

/// Free-list terminator.
const NO_CELL: usize = usize::MAX;

enum Slot {
    Free { next: usize },
    Occupied(ExtraObjectData),
}

/// One slot of a page: either a free-list link or a live record.
pub struct ExtraObjectCell(UnsafeCell<Slot>);

/// Fixed-capacity slab of [`ExtraObjectData`] records.
///
/// ```text
/// +------------------+
/// | next (page list) |
/// | next_free        | --> index of first free cell, NO_CELL when full
/// +------------------+
/// | cell 0           |
/// | cell 1           |
/// | ...              |
/// | cell N-1         |
/// +------------------+
/// ```
///
/// The page is one contiguous block and never moves, so record addresses
/// stay valid for as long as the page lives. Allocation and sweep are not
/// synchronized; at any time exactly one thread (the owning proxy, or the
/// sweeper that popped the page) works on a given page.
#[repr(C)]
pub struct ExtraObjectPage {
    next: AtomicPtr<ExtraObjectPage>,
    next_free: AtomicUsize,
    cells: [ExtraObjectCell; EXTRA_OBJECT_COUNT],
}

const _: () = assert!(mem::align_of::<ExtraObjectPage>() <= SAFE_ALLOC_ALIGN);

// SAFETY: `next` is the page-list link and nothing else
unsafe impl Linked for ExtraObjectPage {
    fn link(&self) -> &AtomicPtr<Self> {
        &self.next
    }
}

// SAFETY: cells are only touched by the page's current owner, ownership is
// handed over through the page stacks
unsafe impl Send for ExtraObjectPage {}
// SAFETY: see above
unsafe impl Sync for ExtraObjectPage {}

impl ExtraObjectPage {
    pub const SIZE: usize = mem::size_of::<Self>();

    /// Allocates a page with every cell free, linked in ascending order.
    pub fn create() -> NonNull<Self> {
        let page = safe_alloc(Self::SIZE as u64).cast::<Self>();
        let raw = page.as_ptr();
        // SAFETY: fresh, suitably aligned block of SIZE bytes; every field
        // is written before the page is handed out
        unsafe {
            ptr::addr_of_mut!((*raw).next).write(AtomicPtr::new(ptr::null_mut()));
            ptr::addr_of_mut!((*raw).next_free).write(AtomicUsize::new(0));
            let cells = ptr::addr_of_mut!((*raw).cells).cast::<ExtraObjectCell>();
            for idx in 0..EXTRA_OBJECT_COUNT {
                let next = if idx + 1 < EXTRA_OBJECT_COUNT {
                    idx + 1
                } else {
                    NO_CELL
                };
                cells
                    .add(idx)
                    .write(ExtraObjectCell(UnsafeCell::new(Slot::Free { next })));
            }
        }
        log::trace!("created extra object page {:p}", raw);
        page
    }

    /// Drops any records still in the page and releases its memory.
    ///
    /// # Safety
    ///
    /// `page` must come from [`create`](Self::create), must not be linked into
    /// any stack, and none of its records may be referenced elsewhere (in
    /// particular none may sit in a finalizer queue).
    pub unsafe fn destroy(page: NonNull<Self>) {
        log::trace!("destroying extra object page {:p}", page);
        // SAFETY: caller guarantees exclusive ownership
        unsafe {
            ptr::drop_in_place(page.as_ptr());
            safe_free(page.cast(), Self::SIZE as u64);
        }
    }

    #[inline]
    fn slot(&self, idx: usize) -> *mut Slot {
        self.cells[idx].0.get()
    }

    /// Takes the first free cell and turns it into a fresh record.
    pub fn try_allocate(&self) -> Option<NonNull<ExtraObjectData>> {
        let idx = self.next_free.load(Ordering::Relaxed);
        if idx == NO_CELL {
            return None;
        }
        let slot = self.slot(idx);
        // SAFETY: the caller owns this page, nobody else touches its cells
        unsafe {
            let next = match &*slot {
                Slot::Free { next } => *next,
                Slot::Occupied(_) => {
                    unreachable!("free list points at occupied cell {idx}")
                }
            };
            *slot = Slot::Occupied(ExtraObjectData::new());
            self.next_free.store(next, Ordering::Relaxed);
            match &*slot {
                Slot::Occupied(data) => Some(NonNull::from(data)),
                Slot::Free { .. } => unreachable!(),
            }
        }
    }

    /// Sweeps every occupied cell and rebuilds the free list.
    ///
    /// Returns whether any cell is still occupied. Records handed to the
    /// finalizer are counted in `scheduled`.
    pub fn sweep(&self, queue: &FinalizerQueue, scheduled: &mut usize) -> bool {
        let mut alive = false;
        let mut free_head = NO_CELL;

        // reverse so the rebuilt list hands out low cells first
        for idx in (0..EXTRA_OBJECT_COUNT).rev() {
            let slot = self.slot(idx);
            // SAFETY: the sweeper owns the page; queued records are only
            // read through shared references by the finalizer thread
            let reclaim = match unsafe { &*slot } {
                Slot::Free { .. } => true,
                Slot::Occupied(data) => sweep_record(data, queue, scheduled),
            };
            if reclaim {
                // SAFETY: reclaimable records are referenced by nobody
                unsafe { *slot = Slot::Free { next: free_head } };
                free_head = idx;
            } else {
                alive = true;
            }
        }

        self.next_free.store(free_head, Ordering::Relaxed);
        alive
    }

    /// Length of the free list.
    pub fn free_count(&self) -> usize {
        let mut count = 0;
        let mut idx = self.next_free.load(Ordering::Relaxed);
        while idx != NO_CELL {
            count += 1;
            // SAFETY: the caller owns the page
            idx = match unsafe { &*self.slot(idx) } {
                Slot::Free { next } => *next,
                Slot::Occupied(_) => {
                    unreachable!("free list points at occupied cell {idx}")
                }
            };
        }
        count
    }

    pub fn occupied_count(&self) -> usize {
        EXTRA_OBJECT_COUNT - self.free_count()
    }
}
