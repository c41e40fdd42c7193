//! Backend contract shared by the frontend and every execution backend.
//!
//! The frontend never touches storage directly: tensors are uploaded through
//! [`spec::PortableBackend::materialize`] and every primitive runs through
//! [`spec::PortableBackend::execute`] with a fully resolved output spec.

pub mod spec;

pub use spec::{BackendError, BackendResult, Operation, PortableBackend, TensorSpec};
