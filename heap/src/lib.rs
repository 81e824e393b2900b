mod atomic_stack;
mod extra_object;
mod finalizer;
pub mod gc_api;
mod heap;
mod page;
mod settings;

pub use atomic_stack::{AtomicStack, Drain, Linked};
pub use extra_object::{ExtraObjectData, ExtraObjectFlags, FinalizerQueue};
pub use finalizer::{
    Disposer, Epoch, EpochDoneCallback, FinalizerProcessor, NoopDisposer,
    ProcessorState,
};
pub use gc_api::{
    FinalizeOutcome, SAFE_ALLOC_ALIGN, safe_alloc, safe_free, try_finalize,
    try_reset_mark,
};
pub use heap::{
    ExtraObjectAllocator, ExtraObjectHeap, ExtraObjectHeapInner, SweepStats,
};
pub use page::{EXTRA_OBJECT_COUNT, ExtraObjectCell, ExtraObjectPage};
pub use settings::{
    FinalizerSettings, HeapSettings, MIN_FINALIZER_STACK_SIZE, SettingsError,
};
