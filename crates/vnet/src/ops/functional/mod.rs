//! Backend-agnostic functional operators built on top of device tensors.
//!
//! Every function validates shapes on the frontend, derives the output spec, and issues exactly
//! one [`Operation`](crate::backend::spec::Operation) to the backend. Layers in [`crate::nn`] are
//! thin wrappers around these routines.
//!
//! ## Backend Parameter Convention
//!
//! Functions accept a `backend: &B` first argument for symmetry with layer code, which always
//! holds an `Arc<B>`. Operands carry their own backend reference as well; validation ensures all
//! of them point at the same backend instance.

pub mod activation;
pub(crate) mod common;
pub mod conv;
pub mod normalization;
pub mod shape;
pub mod stochastic;

pub use activation::*;
pub use common::{add, DeviceTensorOps};
pub use conv::*;
pub use normalization::*;
pub use shape::*;
pub use stochastic::*;
