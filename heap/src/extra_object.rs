use std::{
    fmt,
    ptr::{self, NonNull},
    sync::{
        Arc,
        atomic::{AtomicPtr, AtomicU32, Ordering},
    },
};

use bitflags::bitflags;
use object::{AssociatedObject, ObjHeader, WeakReferenceCounter};
use parking_lot::Mutex;

use crate::{AtomicStack, Linked};

/// Cross-thread queue of records waiting for the finalizer thread.
pub type FinalizerQueue = AtomicStack<ExtraObjectData>;

bitflags! {
    /// Record state shared by sweep and the finalizer thread. The bit
    /// positions are part of the contract between both sides.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExtraObjectFlags: u32 {
        const FINALIZED = 1 << 0;
        const IN_FINALIZER_QUEUE = 1 << 1;
    }
}

#[derive(Default)]
struct Attachments {
    weak: Option<Arc<WeakReferenceCounter>>,
    associated: Option<Box<dyn AssociatedObject>>,
}

/// Side-table record for one managed object.
///
/// Lives in an [`ExtraObjectPage`](crate::ExtraObjectPage) cell. Written by
/// the owning mutator, read by sweep, retired by the finalizer thread; every
/// field is atomic or locked so those hand-offs only need the protocol, not
/// exclusive access.
pub struct ExtraObjectData {
    base_object: AtomicPtr<ObjHeader>,
    flags: AtomicU32,
    attachments: Mutex<Attachments>,
    /// Finalizer queue link.
    next: AtomicPtr<ExtraObjectData>,
}

// SAFETY: `next` is the dedicated queue link
unsafe impl Linked for ExtraObjectData {
    fn link(&self) -> &AtomicPtr<Self> {
        &self.next
    }
}

// SAFETY: the base object pointer is only published atomically; the object
// itself is shared runtime state
unsafe impl Send for ExtraObjectData {}
// SAFETY: see above, attachments are behind a mutex
unsafe impl Sync for ExtraObjectData {}

impl ExtraObjectData {
    pub fn new() -> Self {
        Self {
            base_object: AtomicPtr::new(ptr::null_mut()),
            flags: AtomicU32::new(0),
            attachments: Mutex::new(Attachments::default()),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The record currently installed on `object`, if any.
    pub fn of(object: &ObjHeader) -> Option<NonNull<ExtraObjectData>> {
        object.extra_object().map(NonNull::cast)
    }

    /// Binds this record to `object`. Returns the record that is installed
    /// afterwards; if another thread won the race the result differs from
    /// `self` and this record should be discarded.
    pub fn install(&self, object: &ObjHeader) -> NonNull<ExtraObjectData> {
        self.base_object
            .store(ptr::from_ref(object).cast_mut(), Ordering::Release);
        let me = NonNull::from(self).cast::<()>();
        object.install_extra_object(me).cast()
    }

    /// Detaches the record from its owner and releases attachments.
    ///
    /// The owner must still be alive. Called either by sweep for records
    /// that need no finalizer, or by the finalizer thread after dispatch.
    pub fn uninstall(&self) {
        let (weak, associated) = {
            let mut attachments = self.attachments.lock();
            (attachments.weak.take(), attachments.associated.take())
        };
        if let Some(weak) = weak {
            weak.clear();
        }
        // releasing happens on drop
        drop(associated);

        if let Some(object) = self.base_object() {
            // SAFETY: the owner outlives its installed record
            let object = unsafe { object.as_ref() };
            object.uninstall_extra_object(NonNull::from(self).cast());
        }
        log::trace!("uninstalled extra object {:p}", self);
    }

    #[inline]
    pub fn base_object(&self) -> Option<NonNull<ObjHeader>> {
        NonNull::new(self.base_object.load(Ordering::Acquire))
    }

    // ── flags ──────────────────────────────────────────────────────

    #[inline]
    pub fn flags(&self) -> ExtraObjectFlags {
        ExtraObjectFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn has_flag(&self, flag: ExtraObjectFlags) -> bool {
        self.flags().contains(flag)
    }

    #[inline]
    pub fn set_flag(&self, flag: ExtraObjectFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub fn clear_flag(&self, flag: ExtraObjectFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    // ── weak references ────────────────────────────────────────────

    /// Returns the counter for this object, creating it on first use.
    pub fn weak_reference_counter(&self) -> Arc<WeakReferenceCounter> {
        let mut attachments = self.attachments.lock();
        if let Some(weak) = &attachments.weak {
            return weak.clone();
        }
        let referent = self
            .base_object()
            .expect("weak reference to an uninstalled extra object");
        let weak = Arc::new(WeakReferenceCounter::new(referent));
        attachments.weak = Some(weak.clone());
        weak
    }

    pub fn has_weak_reference_counter(&self) -> bool {
        self.attachments.lock().weak.is_some()
    }

    /// Clears the referent seen by outstanding weak references and drops
    /// this record's handle on the counter.
    pub fn clear_weak_reference_counter(&self) {
        let weak = self.attachments.lock().weak.take();
        if let Some(weak) = weak {
            weak.clear();
        }
    }

    // ── associated objects ─────────────────────────────────────────

    pub fn set_associated_object(&self, associated: Box<dyn AssociatedObject>) {
        let previous = self.attachments.lock().associated.replace(associated);
        debug_assert!(previous.is_none(), "associated object set twice");
    }

    pub fn has_associated_object(&self) -> bool {
        self.attachments.lock().associated.is_some()
    }

    /// Runs the foreign side's detach hook. The object itself stays attached
    /// until [`uninstall`](Self::uninstall) releases it. Returns whether an
    /// object was attached.
    pub fn detach_associated_object(&self) -> bool {
        let mut attachments = self.attachments.lock();
        match attachments.associated.as_mut() {
            Some(associated) => {
                associated.detach();
                true
            }
            None => false,
        }
    }
}

impl Default for ExtraObjectData {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExtraObjectData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtraObjectData")
            .field("base_object", &self.base_object.load(Ordering::Relaxed))
            .field("flags", &self.flags())
            .finish_non_exhaustive()
    }
}
