//! Neural network building blocks layered on top of the portable tensor API.
//!
//! Layers are thin wrappers that compose the functional primitives defined under
//! `ops::functional` and own their parameters as device tensors.

pub mod init;
pub mod layers;

pub use layers::*;
