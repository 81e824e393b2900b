//! Extra-object heap: page registry, per-thread allocators and sweep.

use std::{
    fmt,
    ops::{AddAssign, Deref},
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use object::ObjHeader;
use parking_lot::Mutex;

use crate::{
    AtomicStack, Disposer, Epoch, ExtraObjectData, ExtraObjectFlags,
    ExtraObjectPage, FinalizerProcessor, HeapSettings,
};

// ── Page store ────────────────────────────────────────────────────────

/// Pages by phase.
///
/// `ready` pages may have free cells and are handed to allocators, `used`
/// pages were retired full by an allocator, `unswept` pages wait for the
/// collector. Pushes are lock-free; consumers are serialized so every stack
/// has a single consumer at a time.
struct PageStore {
    ready: AtomicStack<ExtraObjectPage>,
    used: AtomicStack<ExtraObjectPage>,
    unswept: AtomicStack<ExtraObjectPage>,
    consumers: Mutex<()>,
    pages: AtomicUsize,
}

impl PageStore {
    fn new() -> Self {
        Self {
            ready: AtomicStack::new(),
            used: AtomicStack::new(),
            unswept: AtomicStack::new(),
            consumers: Mutex::new(()),
            pages: AtomicUsize::new(0),
        }
    }

    fn acquire(&self) -> NonNull<ExtraObjectPage> {
        let popped = {
            let _guard = self.consumers.lock();
            self.ready.pop()
        };
        popped.unwrap_or_else(|| {
            let page = ExtraObjectPage::create();
            let pages = self.pages.fetch_add(1, Ordering::Relaxed) + 1;
            log::debug!("allocated extra object page {:p} ({pages} total)", page);
            page
        })
    }

    fn push_ready(&self, page: NonNull<ExtraObjectPage>) {
        // SAFETY: the caller gives up ownership of an unlinked page
        unsafe { self.ready.push(page) };
    }

    fn push_used(&self, page: NonNull<ExtraObjectPage>) {
        // SAFETY: see push_ready
        unsafe { self.used.push(page) };
    }

    fn pop_unswept(&self) -> Option<NonNull<ExtraObjectPage>> {
        let _guard = self.consumers.lock();
        self.unswept.pop()
    }

    /// Moves every page owned by the store into `unswept`.
    fn prepare_for_gc(&self) -> usize {
        let _guard = self.consumers.lock();
        let mut moved = 0;
        for page in self.ready.take_all().chain(self.used.take_all()) {
            // SAFETY: take_all unlinked the page
            unsafe { self.unswept.push(page) };
            moved += 1;
        }
        moved
    }

    /// # Safety
    ///
    /// `page` must be empty and unlinked.
    unsafe fn release(&self, page: NonNull<ExtraObjectPage>) {
        // SAFETY: forwarded from the caller
        unsafe { ExtraObjectPage::destroy(page) };
        self.pages.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Drop for PageStore {
    fn drop(&mut self) {
        let pages: Vec<_> = self
            .ready
            .take_all()
            .chain(self.used.take_all())
            .chain(self.unswept.take_all())
            .collect();
        for page in pages {
            // SAFETY: the heap is going away; the finalizer thread is
            // stopped and no allocator is left
            unsafe { self.release(page) };
        }
    }
}

// ── Sweep statistics ──────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub pages_swept: usize,
    pub pages_released: usize,
    /// Records newly queued for the finalizer thread.
    pub finalizers_scheduled: usize,
}

impl AddAssign for SweepStats {
    fn add_assign(&mut self, rhs: Self) {
        self.pages_swept += rhs.pages_swept;
        self.pages_released += rhs.pages_released;
        self.finalizers_scheduled += rhs.finalizers_scheduled;
    }
}

// ── ExtraObjectHeapInner ──────────────────────────────────────────────

pub struct ExtraObjectHeapInner {
    settings: HeapSettings,
    processor: FinalizerProcessor,
    pages: PageStore,
}

impl ExtraObjectHeapInner {
    pub fn new<F>(
        settings: HeapSettings,
        disposer: Arc<dyn Disposer>,
        epoch_done: F,
    ) -> Self
    where
        F: Fn(Epoch) + Send + Sync + 'static,
    {
        settings.validate().expect("Invalid Heap Settings");
        let processor = FinalizerProcessor::new(
            settings.finalizer.clone(),
            disposer,
            epoch_done,
        );
        Self {
            settings,
            processor,
            pages: PageStore::new(),
        }
    }

    #[inline]
    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    #[inline]
    pub fn processor(&self) -> &FinalizerProcessor {
        &self.processor
    }

    /// Pages currently allocated.
    pub fn page_count(&self) -> usize {
        self.pages.pages.load(Ordering::Relaxed)
    }

    /// Moves all pages into the unswept set. Allocators must have handed
    /// their current page back first.
    pub fn prepare_for_gc(&self) {
        let moved = self.pages.prepare_for_gc();
        log::debug!("{moved} extra object pages ready for sweep");
    }

    /// Sweeps unswept pages until none are left. May run on several
    /// collector threads at once; each page is swept by exactly one.
    pub fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        while let Some(page) = self.pages.pop_unswept() {
            let mut scheduled = 0;
            // SAFETY: popping the page made this thread its owner
            let alive = unsafe { page.as_ref() }
                .sweep(self.processor.queue(), &mut scheduled);
            stats.pages_swept += 1;
            stats.finalizers_scheduled += scheduled;

            if alive || !self.settings.release_empty_pages {
                self.pages.push_ready(page);
            } else {
                // SAFETY: no occupied cell, no queued record points here
                unsafe { self.pages.release(page) };
                stats.pages_released += 1;
            }
        }
        log::debug!("extra object sweep: {stats:?}");
        stats
    }

    /// Hands the finished cycle to the finalizer thread. Call once per cycle
    /// after every sweeper is done.
    pub fn finish_epoch(&self, epoch: Epoch) {
        self.processor.set_epoch(epoch);
    }

    pub fn stop_finalizers(&self) {
        self.processor.stop_finalizer_thread();
    }
}

impl Drop for ExtraObjectHeapInner {
    fn drop(&mut self) {
        // queued records live in our pages
        self.processor.stop_finalizer_thread();
    }
}

impl fmt::Debug for ExtraObjectHeapInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtraObjectHeapInner")
            .field("settings", &self.settings)
            .field("processor", &self.processor)
            .field("pages", &self.page_count())
            .finish()
    }
}

// ── ExtraObjectHeap (Arc wrapper) ─────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExtraObjectHeap(Arc<ExtraObjectHeapInner>);

impl ExtraObjectHeap {
    #[must_use]
    pub fn new<F>(
        settings: HeapSettings,
        disposer: Arc<dyn Disposer>,
        epoch_done: F,
    ) -> Self
    where
        F: Fn(Epoch) + Send + Sync + 'static,
    {
        Self(Arc::new(ExtraObjectHeapInner::new(
            settings, disposer, epoch_done,
        )))
    }

    #[must_use]
    pub fn proxy(&self) -> ExtraObjectAllocator {
        ExtraObjectAllocator::new(self.clone())
    }
}

impl Deref for ExtraObjectHeap {
    type Target = ExtraObjectHeapInner;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ── ExtraObjectAllocator (thread-local allocator) ─────────────────────

/// Thread-local allocator. Owns at most one page at a time and allocates
/// from it without synchronization.
#[derive(Debug)]
pub struct ExtraObjectAllocator {
    heap: ExtraObjectHeap,
    page: Option<NonNull<ExtraObjectPage>>,
}

// SAFETY: the current page is owned exclusively by this allocator
unsafe impl Send for ExtraObjectAllocator {}

impl ExtraObjectAllocator {
    #[must_use]
    pub fn new(heap: ExtraObjectHeap) -> Self {
        Self { heap, page: None }
    }

    #[inline]
    pub fn heap(&self) -> &ExtraObjectHeap {
        &self.heap
    }

    /// Returns the record installed on `object`, allocating and installing
    /// one first if there is none.
    pub fn allocate(&mut self, object: &ObjHeader) -> NonNull<ExtraObjectData> {
        if let Some(existing) = ExtraObjectData::of(object) {
            return existing;
        }

        let record = self.allocate_record();
        // SAFETY: fresh record in our current page
        let data = unsafe { record.as_ref() };
        let installed = data.install(object);
        if installed != record {
            // another thread installed first, the next sweep reclaims ours
            data.set_flag(ExtraObjectFlags::FINALIZED);
        }
        installed
    }

    fn allocate_record(&mut self) -> NonNull<ExtraObjectData> {
        loop {
            if let Some(page) = self.page {
                // SAFETY: we own the current page
                if let Some(record) = unsafe { page.as_ref() }.try_allocate() {
                    return record;
                }
                self.heap.pages.push_used(page);
                self.page = None;
            }
            self.page = Some(self.heap.pages.acquire());
        }
    }

    /// Hands the current page back before a collection.
    pub fn prepare_for_gc(&mut self) {
        if let Some(page) = self.page.take() {
            self.heap.pages.push_used(page);
        }
    }
}

impl Drop for ExtraObjectAllocator {
    fn drop(&mut self) {
        self.prepare_for_gc();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
