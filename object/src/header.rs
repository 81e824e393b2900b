use std::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicU8, Ordering},
};

use crate::TypeInfo;

/// GC / bookkeeping flags stored atomically in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct HeaderFlags(pub u8);

impl HeaderFlags {
    pub const NONE: Self = Self(0);
    /// Reached by the collector during the current trace.
    pub const MARKED: Self = Self(1 << 0);
    /// Owned by the object heap. Stack-local proxies never carry it.
    pub const HEAP: Self = Self(1 << 1);

    #[inline(always)]
    pub const fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }
}

/// The header at the start of every managed object.
///
/// ```text
/// type_info: &'static TypeInfo   - declared type, finalizer capability
/// flags:     AtomicU8            - Marked | Heap
/// extra:     AtomicPtr<()>       - installed side-table record, or null
/// ```
///
/// The mark bit belongs to the collector. The extra pointer is opaque here;
/// the heap crate installs and uninstalls its metadata records through it.
#[repr(C)]
pub struct ObjHeader {
    type_info: &'static TypeInfo,
    flags: AtomicU8,
    extra: AtomicPtr<()>,
}

impl ObjHeader {
    /// A heap-resident object, unmarked.
    pub fn new_heap(type_info: &'static TypeInfo) -> Self {
        Self::with_flags(type_info, HeaderFlags::HEAP)
    }

    /// A stack-local object. The extra-object allocator never reclaims
    /// metadata belonging to one of these.
    pub fn new_stack(type_info: &'static TypeInfo) -> Self {
        Self::with_flags(type_info, HeaderFlags::NONE)
    }

    fn with_flags(type_info: &'static TypeInfo, flags: HeaderFlags) -> Self {
        Self {
            type_info,
            flags: AtomicU8::new(flags.0),
            extra: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[inline(always)]
    pub fn type_info(&self) -> &'static TypeInfo {
        self.type_info
    }

    #[inline(always)]
    pub fn has_finalizer(&self) -> bool {
        self.type_info.has_finalizer()
    }

    // ── flags ──────────────────────────────────────────────────────

    #[inline(always)]
    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags(self.flags.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn is_heap(&self) -> bool {
        self.flags().contains(HeaderFlags::HEAP)
    }

    #[inline(always)]
    pub fn is_marked(&self) -> bool {
        self.flags().contains(HeaderFlags::MARKED)
    }

    /// Sets the mark bit. Returns `true` if this call marked the object,
    /// `false` if it was already marked.
    #[inline(always)]
    pub fn try_mark(&self) -> bool {
        let prev = HeaderFlags(
            self.flags.fetch_or(HeaderFlags::MARKED.0, Ordering::AcqRel),
        );
        !prev.contains(HeaderFlags::MARKED)
    }

    /// Clears the mark bit. Returns `true` if the object had been marked.
    #[inline(always)]
    pub fn try_reset_mark(&self) -> bool {
        let prev = HeaderFlags(
            self.flags.fetch_and(!HeaderFlags::MARKED.0, Ordering::AcqRel),
        );
        prev.contains(HeaderFlags::MARKED)
    }

    // ── extra object ───────────────────────────────────────────────

    #[inline(always)]
    pub fn extra_object(&self) -> Option<NonNull<()>> {
        NonNull::new(self.extra.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn has_extra_object(&self) -> bool {
        self.extra_object().is_some()
    }

    /// Publishes `extra` unless another record is already installed.
    /// Returns the record that ends up installed.
    pub fn install_extra_object(&self, extra: NonNull<()>) -> NonNull<()> {
        match self.extra.compare_exchange(
            ptr::null_mut(),
            extra.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => extra,
            // SAFETY: only non-null pointers are ever stored
            Err(current) => unsafe { NonNull::new_unchecked(current) },
        }
    }

    /// Clears the installed record if it is still `extra`.
    pub fn uninstall_extra_object(&self, extra: NonNull<()>) -> bool {
        self.extra
            .compare_exchange(
                extra.as_ptr(),
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl core::fmt::Debug for ObjHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObjHeader")
            .field("type", &self.type_info.name())
            .field("flags", &self.flags())
            .field("extra", &self.extra.load(Ordering::Relaxed))
            .finish()
    }
}
