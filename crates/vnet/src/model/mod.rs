pub mod config;
pub mod registry;
pub mod vnet2d;

use anyhow::Result;

use crate::backend::spec::PortableBackend;
use crate::module::Module;
use crate::tensor::{DeviceTensor, Shape};

pub use config::{ModelConfig, VNet2dConfig};
pub use registry::{model_factory, ModelFactory};
pub use vnet2d::{
    DownTransition2d, DropoutMode, InputTransition2d, LuConv2d, OutputTransition2d, ParamInit,
    ParamRequest, UpTransition2d, VNet2d, VNet2dOutput,
};

/// Type-erased view of a segmentation network rebuilt from a checkpoint.
pub trait SegmentationModel<B: PortableBackend + 'static>: Module<B> + Send + Sync {
    fn kind(&self) -> &str;

    fn model_config(&self) -> Result<ModelConfig>;

    /// Channel count the first layer expects on axis 1.
    fn image_channels(&self) -> usize;

    fn validate_input(&self, shape: &Shape) -> Result<()>;

    fn forward(&self, x: &DeviceTensor<B>) -> Result<VNet2dOutput<B>>;

    fn forward_trace(&self, x: &DeviceTensor<B>) -> Result<Vec<(String, DeviceTensor<B>)>>;
}
