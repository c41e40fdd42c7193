//! Two-dimensional V-Net segmentation network over a portable tensor backend.

pub mod backend;
pub mod checkpoint;
mod env;
pub mod logging;
pub mod model;
pub mod module;
pub mod nn;
pub mod ops;
pub mod profiling;
pub mod tensor;

pub use backend::spec::PortableBackend;
pub use model::{VNet2d, VNet2dConfig, VNet2dOutput};
pub use tensor::{DeviceTensor, Shape, Tensor};
