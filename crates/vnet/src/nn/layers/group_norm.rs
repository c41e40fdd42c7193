//! Group normalization wrapper backed by the functional implementation.

use std::fmt;
use std::sync::Arc;

use anyhow::{ensure, Result};

use crate::backend::spec::PortableBackend;
use crate::module::{Module, ParamVisitor, ParamVisitorMut, TensorRole};
use crate::ops::functional;
use crate::tensor::{DeviceTensor, IntoDeviceTensor, Shape, Tensor};

/// Group normalization with learnable per-channel `gamma` (`weight`) and `beta` (`bias`).
pub struct GroupNorm<B: PortableBackend + 'static> {
    backend: Arc<B>,
    pub gamma: DeviceTensor<B>,
    pub beta: DeviceTensor<B>,
    pub groups: usize,
    pub eps: f32,
}

impl<B: PortableBackend + 'static> GroupNorm<B> {
    /// Uploads the affine parameters and checks they agree on the channel count.
    pub fn new<G, T>(backend: Arc<B>, gamma: G, beta: T, groups: usize, eps: f32) -> Result<Self>
    where
        G: IntoDeviceTensor<B>,
        T: IntoDeviceTensor<B>,
    {
        let gamma = gamma.into_device_tensor(&backend)?;
        let beta = beta.into_device_tensor(&backend)?;
        ensure!(
            gamma.shape().rank() == 1 && gamma.shape() == beta.shape(),
            "GroupNorm gamma {:?} and beta {:?} must both be [C]",
            gamma.shape().dims(),
            beta.shape().dims()
        );
        let channels = gamma.shape().dims()[0];
        ensure!(
            groups > 0 && channels % groups == 0,
            "GroupNorm channels {} must be divisible by groups {}",
            channels,
            groups
        );
        Ok(Self {
            backend,
            gamma,
            beta,
            groups,
            eps,
        })
    }

    /// Identity affine transform: `gamma = 1`, `beta = 0`.
    pub fn identity(backend: Arc<B>, channels: usize, groups: usize, eps: f32) -> Result<Self> {
        let shape = Shape::new(vec![channels]);
        Self::new(
            backend,
            Tensor::ones(shape.clone()),
            Tensor::zeros(shape),
            groups,
            eps,
        )
    }

    pub fn channels(&self) -> usize {
        self.gamma.shape().dims()[0]
    }

    pub fn forward(&self, x: &DeviceTensor<B>) -> Result<DeviceTensor<B>> {
        let _prof_guard = crate::profiling::layer_scope("GroupNorm::forward");
        functional::group_norm(
            self.backend.as_ref(),
            x,
            &self.gamma,
            &self.beta,
            self.groups,
            self.eps,
        )
    }
}

impl<B: PortableBackend + 'static> Module<B> for GroupNorm<B> {
    fn visit_params(&self, v: &mut ParamVisitor<'_, B>) -> Result<()> {
        v.param("weight", TensorRole::Parameter, &self.gamma)?;
        v.param("bias", TensorRole::Parameter, &self.beta)
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_, B>) -> Result<()> {
        v.param("weight", TensorRole::Parameter, &mut self.gamma)?;
        v.param("bias", TensorRole::Parameter, &mut self.beta)
    }
}

impl<B: PortableBackend + 'static> fmt::Debug for GroupNorm<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupNorm")
            .field("channels", &self.channels())
            .field("groups", &self.groups)
            .field("eps", &self.eps)
            .finish()
    }
}
