//! Side-table attachments owned by other runtime subsystems.
//!
//! Only the hooks the extra-object allocator needs are modeled: clearing a
//! weak reference counter when its referent dies, and detaching / releasing
//! a foreign object associated with a managed one.

use std::{
    fmt,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

use crate::ObjHeader;

/// Shared referent slot read by every weak reference to one object.
#[derive(Debug)]
pub struct WeakReferenceCounter {
    referent: AtomicPtr<ObjHeader>,
}

// SAFETY: the referent is only published and cleared atomically
unsafe impl Send for WeakReferenceCounter {}
// SAFETY: the referent is only published and cleared atomically
unsafe impl Sync for WeakReferenceCounter {}

impl WeakReferenceCounter {
    pub fn new(referent: NonNull<ObjHeader>) -> Self {
        Self {
            referent: AtomicPtr::new(referent.as_ptr()),
        }
    }

    /// The referent, or `None` once the counter was cleared.
    pub fn get(&self) -> Option<NonNull<ObjHeader>> {
        NonNull::new(self.referent.load(Ordering::Acquire))
    }

    pub fn clear(&self) {
        self.referent.store(ptr::null_mut(), Ordering::Release);
    }
}

/// A foreign object tied to the lifetime of a managed one.
///
/// `detach` severs the foreign side's back-reference when the managed object
/// becomes unreachable. Dropping the box releases the foreign object.
pub trait AssociatedObject: Send {
    fn detach(&mut self);
}

impl fmt::Debug for dyn AssociatedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AssociatedObject")
    }
}
