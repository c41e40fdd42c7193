//! Convolution layers over NCHW activations.

use std::sync::Arc;

use anyhow::{ensure, Result};
use rand::Rng;

use crate::backend::spec::PortableBackend;
use crate::module::{Module, ParamVisitor, ParamVisitorMut, TensorRole};
use crate::nn::init::{conv_fan_in, conv_transpose_fan_in, uniform_fan_in};
use crate::ops::functional::{
    conv2d, conv_transpose2d, Conv2dParams2d, ConvTranspose2dParams2d,
};
use crate::tensor::{DeviceTensor, IntoDeviceTensor, IntoDeviceTensorOption, Shape};

fn check_weight<B: PortableBackend + 'static>(
    layer: &str,
    weight: &DeviceTensor<B>,
    kernel: [usize; 2],
    bias: Option<&DeviceTensor<B>>,
    out_axis: usize,
) -> Result<()> {
    let dims = weight.shape().dims();
    ensure!(
        dims.len() == 4,
        "{layer} weight must be rank 4, got {:?}",
        dims
    );
    ensure!(
        dims[2] == kernel[0] && dims[3] == kernel[1],
        "{layer} weight {:?} does not match kernel {:?}",
        dims,
        kernel
    );
    if let Some(bias) = bias {
        ensure!(
            bias.shape().dims() == [dims[out_axis]],
            "{layer} bias {:?} must be [{}]",
            bias.shape().dims(),
            dims[out_axis]
        );
    }
    Ok(())
}

#[derive(Clone)]
pub struct Conv2d<B: PortableBackend + 'static> {
    backend: Arc<B>,
    pub weight: DeviceTensor<B>,
    pub bias: Option<DeviceTensor<B>>,
    params: Conv2dParams2d,
}

impl<B: PortableBackend + 'static> Conv2d<B> {
    pub fn new<W, T>(
        backend: Arc<B>,
        weight: W,
        bias: Option<T>,
        params: Conv2dParams2d,
    ) -> Result<Self>
    where
        W: IntoDeviceTensor<B>,
        T: IntoDeviceTensor<B>,
    {
        ensure!(params.groups > 0, "conv2d groups must be > 0");
        let weight = weight.into_device_tensor(&backend)?;
        let bias = bias.into_device_tensor_option(&backend)?;
        check_weight("Conv2d", &weight, params.kernel, bias.as_ref(), 0)?;
        ensure!(
            weight.shape().dims()[0] % params.groups == 0,
            "Conv2d output channels {} must be divisible by groups {}",
            weight.shape().dims()[0],
            params.groups
        );
        Ok(Self {
            backend,
            weight,
            bias,
            params,
        })
    }

    /// Fresh biased layer with framework-default uniform initialisation.
    pub fn random(
        backend: Arc<B>,
        in_channels: usize,
        out_channels: usize,
        params: Conv2dParams2d,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        ensure!(
            in_channels % params.groups == 0,
            "Conv2d input channels {} must be divisible by groups {}",
            in_channels,
            params.groups
        );
        let dims = vec![
            out_channels,
            in_channels / params.groups,
            params.kernel[0],
            params.kernel[1],
        ];
        let fan_in = conv_fan_in(&dims);
        let weight = uniform_fan_in(Shape::new(dims), fan_in, rng)?;
        let bias = uniform_fan_in(Shape::new(vec![out_channels]), fan_in, rng)?;
        Self::new(backend, weight, Some(bias), params)
    }

    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    pub fn params(&self) -> Conv2dParams2d {
        self.params
    }

    pub fn out_channels(&self) -> usize {
        self.weight.shape().dims()[0]
    }

    pub fn forward(&self, x: &DeviceTensor<B>) -> Result<DeviceTensor<B>> {
        let _scope = crate::profiling::layer_scope("Conv2d::forward");
        conv2d(
            self.backend.as_ref(),
            x,
            &self.weight,
            self.bias.as_ref(),
            self.params,
        )
    }
}

impl<B: PortableBackend + 'static> Module<B> for Conv2d<B> {
    fn visit_params(&self, v: &mut ParamVisitor<'_, B>) -> Result<()> {
        v.param("weight", TensorRole::Parameter, &self.weight)?;
        if let Some(bias) = &self.bias {
            v.param("bias", TensorRole::Parameter, bias)?;
        }
        Ok(())
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_, B>) -> Result<()> {
        v.param("weight", TensorRole::Parameter, &mut self.weight)?;
        if let Some(bias) = &mut self.bias {
            v.param("bias", TensorRole::Parameter, bias)?;
        }
        Ok(())
    }
}

/// Transposed convolution with IOHW weights `[C_in, C_out, KH, KW]`.
#[derive(Clone)]
pub struct ConvTranspose2d<B: PortableBackend + 'static> {
    backend: Arc<B>,
    pub weight: DeviceTensor<B>,
    pub bias: Option<DeviceTensor<B>>,
    params: ConvTranspose2dParams2d,
}

impl<B: PortableBackend + 'static> ConvTranspose2d<B> {
    pub fn new<W, T>(
        backend: Arc<B>,
        weight: W,
        bias: Option<T>,
        params: ConvTranspose2dParams2d,
    ) -> Result<Self>
    where
        W: IntoDeviceTensor<B>,
        T: IntoDeviceTensor<B>,
    {
        let weight = weight.into_device_tensor(&backend)?;
        let bias = bias.into_device_tensor_option(&backend)?;
        check_weight("ConvTranspose2d", &weight, params.kernel, bias.as_ref(), 1)?;
        Ok(Self {
            backend,
            weight,
            bias,
            params,
        })
    }

    pub fn random(
        backend: Arc<B>,
        in_channels: usize,
        out_channels: usize,
        params: ConvTranspose2dParams2d,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let dims = vec![in_channels, out_channels, params.kernel[0], params.kernel[1]];
        let fan_in = conv_transpose_fan_in(&dims);
        let weight = uniform_fan_in(Shape::new(dims), fan_in, rng)?;
        let bias = uniform_fan_in(Shape::new(vec![out_channels]), fan_in, rng)?;
        Self::new(backend, weight, Some(bias), params)
    }

    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    pub fn params(&self) -> ConvTranspose2dParams2d {
        self.params
    }

    pub fn forward(&self, x: &DeviceTensor<B>) -> Result<DeviceTensor<B>> {
        let _scope = crate::profiling::layer_scope("ConvTranspose2d::forward");
        conv_transpose2d(
            self.backend.as_ref(),
            x,
            &self.weight,
            self.bias.as_ref(),
            self.params,
        )
    }
}

impl<B: PortableBackend + 'static> Module<B> for ConvTranspose2d<B> {
    fn visit_params(&self, v: &mut ParamVisitor<'_, B>) -> Result<()> {
        v.param("weight", TensorRole::Parameter, &self.weight)?;
        if let Some(bias) = &self.bias {
            v.param("bias", TensorRole::Parameter, bias)?;
        }
        Ok(())
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_, B>) -> Result<()> {
        v.param("weight", TensorRole::Parameter, &mut self.weight)?;
        if let Some(bias) = &mut self.bias {
            v.param("bias", TensorRole::Parameter, bias)?;
        }
        Ok(())
    }
}
