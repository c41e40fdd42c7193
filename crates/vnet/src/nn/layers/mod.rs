//! Segmentation layers built from reusable functional primitives.
//!
//! Each layer wraps lower-level functional ops and exposes a `forward` helper.

pub mod activation;
pub mod conv;
pub mod dropout;
pub mod group_norm;

pub use activation::{Activation, ActivationKind};
pub use conv::{Conv2d, ConvTranspose2d};
pub use dropout::Dropout2d;
pub use group_norm::GroupNorm;
