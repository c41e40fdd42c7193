//! Nonlinearities used between convolutions.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::backend::spec::PortableBackend;
use crate::module::{Module, ParamVisitor, ParamVisitorMut, TensorRole};
use crate::ops::functional;
use crate::tensor::{DeviceTensor, IntoDeviceTensor, Shape, Tensor};

/// Initial slope of freshly constructed PReLU units.
pub const PRELU_INIT: f32 = 0.25;

/// Nonlinearity family selected by model configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationKind {
    /// ELU with `alpha = 1`.
    Elu,
    /// PReLU with one learnable slope per channel.
    PRelu,
}

impl ActivationKind {
    pub fn from_elu_flag(elu: bool) -> Self {
        if elu {
            ActivationKind::Elu
        } else {
            ActivationKind::PRelu
        }
    }
}

pub enum Activation<B: PortableBackend + 'static> {
    Elu {
        backend: Arc<B>,
        alpha: f32,
    },
    PRelu {
        backend: Arc<B>,
        weight: DeviceTensor<B>,
    },
}

impl<B: PortableBackend + 'static> Activation<B> {
    /// Fresh activation for `channels` feature maps.
    pub fn new(backend: Arc<B>, kind: ActivationKind, channels: usize) -> Result<Self> {
        match kind {
            ActivationKind::Elu => Ok(Activation::Elu {
                backend,
                alpha: 1.0,
            }),
            ActivationKind::PRelu => {
                let slopes = Tensor::full(Shape::new(vec![channels]), PRELU_INIT);
                Self::prelu(backend, slopes)
            }
        }
    }

    /// PReLU from an existing slope tensor (`[C]` or `[1]`).
    pub fn prelu<W: IntoDeviceTensor<B>>(backend: Arc<B>, weight: W) -> Result<Self> {
        let weight = weight.into_device_tensor(&backend)?;
        anyhow::ensure!(
            weight.shape().rank() == 1,
            "PReLU weight must be rank 1, got {:?}",
            weight.shape().dims()
        );
        Ok(Activation::PRelu { backend, weight })
    }

    pub fn kind(&self) -> ActivationKind {
        match self {
            Activation::Elu { .. } => ActivationKind::Elu,
            Activation::PRelu { .. } => ActivationKind::PRelu,
        }
    }

    pub fn forward(&self, x: &DeviceTensor<B>) -> Result<DeviceTensor<B>> {
        let _scope = crate::profiling::layer_scope("Activation::forward");
        match self {
            Activation::Elu { backend, alpha } => functional::elu(backend.as_ref(), x, *alpha),
            Activation::PRelu { backend, weight } => {
                functional::prelu(backend.as_ref(), x, weight)
            }
        }
    }
}

impl<B: PortableBackend + 'static> Module<B> for Activation<B> {
    fn visit_params(&self, v: &mut ParamVisitor<'_, B>) -> Result<()> {
        match self {
            Activation::Elu { .. } => Ok(()),
            Activation::PRelu { weight, .. } => v.param("weight", TensorRole::Parameter, weight),
        }
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_, B>) -> Result<()> {
        match self {
            Activation::Elu { .. } => Ok(()),
            Activation::PRelu { weight, .. } => v.param("weight", TensorRole::Parameter, weight),
        }
    }
}
