//! Core tensor abstractions shared across backends.
//!
//! The tensor module defines portable shapes, the host-side [`Tensor`] used for literals,
//! initialisation and checkpoints, and the backend-resident [`DeviceTensor`] consumed by the
//! functional kernels. It re-exports [`DeviceTensorOps`] so helper traits live next to the
//! tensor types consumers manipulate in forward passes.

mod device_tensor;
mod host_tensor;
pub mod shape;

pub use crate::ops::functional::DeviceTensorOps;
pub use device_tensor::{DeviceTensor, IntoDeviceTensor, IntoDeviceTensorOption};
pub use host_tensor::Tensor;
pub use shape::Shape;
