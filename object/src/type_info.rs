/// Built-in finalizer routines a type can declare.
///
/// A type only names *which* routine applies; the routine itself lives
/// behind the runtime's disposer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinalizerKind {
    /// Runs a registered cleanup action.
    Cleaner,
    /// Drops a reference bound to a foreign worker.
    WorkerBoundReference,
}

/// Static type descriptor every object header points at.
#[derive(Debug)]
pub struct TypeInfo {
    name: &'static str,
    finalizer: Option<FinalizerKind>,
}

impl TypeInfo {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            finalizer: None,
        }
    }

    pub const fn with_finalizer(
        name: &'static str,
        finalizer: FinalizerKind,
    ) -> Self {
        Self {
            name,
            finalizer: Some(finalizer),
        }
    }

    #[inline(always)]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[inline(always)]
    pub const fn finalizer(&self) -> Option<FinalizerKind> {
        self.finalizer
    }

    #[inline(always)]
    pub const fn has_finalizer(&self) -> bool {
        self.finalizer.is_some()
    }
}

pub static PLAIN_TYPE: TypeInfo = TypeInfo::new("Any");
pub static CLEANER_TYPE: TypeInfo =
    TypeInfo::with_finalizer("CleanerImpl", FinalizerKind::Cleaner);
pub static WORKER_BOUND_REFERENCE_TYPE: TypeInfo = TypeInfo::with_finalizer(
    "WorkerBoundReference",
    FinalizerKind::WorkerBoundReference,
);
