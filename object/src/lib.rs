mod attachments;
mod header;
mod type_info;

pub use attachments::{AssociatedObject, WeakReferenceCounter};
pub use header::{HeaderFlags, ObjHeader};
pub use type_info::{
    CLEANER_TYPE, FinalizerKind, PLAIN_TYPE, TypeInfo,
    WORKER_BOUND_REFERENCE_TYPE,
};
