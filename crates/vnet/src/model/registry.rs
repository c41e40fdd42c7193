use std::sync::Arc;

use anyhow::Result;

use crate::backend::spec::PortableBackend;
use crate::tensor::DeviceTensor;

use super::{ModelConfig, SegmentationModel};

/// Signature for model builders used by the checkpoint loader.
pub type BuildFn<B> = fn(
    Arc<B>,
    &ModelConfig,
    &mut dyn FnMut(&str) -> Result<DeviceTensor<B>>,
) -> Result<Box<dyn SegmentationModel<B>>>;

#[derive(Clone, Copy)]
pub struct ModelFactory<B: PortableBackend + 'static> {
    pub kind: &'static str,
    pub build: BuildFn<B>,
}

/// Returns the list of built-in model factories.
pub fn model_factories<B: PortableBackend + 'static>() -> Vec<ModelFactory<B>> {
    vec![ModelFactory {
        kind: super::vnet2d::KIND,
        build: super::vnet2d::build_from_model_config::<B>,
    }]
}

pub fn model_factory<B: PortableBackend + 'static>(kind: &str) -> Option<BuildFn<B>> {
    model_factories::<B>()
        .into_iter()
        .find(|entry| entry.kind == kind)
        .map(|entry| entry.build)
}
