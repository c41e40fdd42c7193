//! Two-dimensional V-Net: a residual encoder/decoder for dense segmentation.
//!
//! Four stride-2 down transitions (16 → 256 channels) are mirrored by four transposed-conv up
//! transitions that concatenate the matching encoder output before refining. Every residual
//! unit is `act(group_norm(conv))`; the head emits logits and per-pixel class probabilities.
//!
//! Parameter names follow the state-dict layout of the reference network definition, e.g.
//! `down_tr64.ops.2.conv1.weight` or `up_tr256.up_conv.bias`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Result};
use rand::{Rng, RngCore};

use super::config::{ModelConfig, VNet2dConfig, BASE_CHANNELS};
use super::SegmentationModel;
use crate::backend::spec::PortableBackend;
use crate::module::{Module, ParamVisitor, ParamVisitorMut};
use crate::nn::init::{conv_fan_in, conv_transpose_fan_in, uniform_fan_in};
use crate::nn::layers::activation::PRELU_INIT;
use crate::nn::{Activation, ActivationKind, Conv2d, ConvTranspose2d, Dropout2d, GroupNorm};
use crate::ops::functional::{self, Conv2dParams2d, ConvTranspose2dParams2d};
use crate::tensor::{DeviceTensor, DeviceTensorOps, IntoDeviceTensor, Shape, Tensor};

pub const KIND: &str = "vnet2d";

/// Spatial extents must be divisible by this (four stride-2 stages).
pub const MIN_SPATIAL_MULTIPLE: usize = 16;

struct Stage {
    name: &'static str,
    in_channels: usize,
    out_channels: usize,
    n_convs: usize,
    deep_dropout: bool,
}

const DOWN_STAGES: [Stage; 4] = [
    Stage {
        name: "down_tr32",
        in_channels: 16,
        out_channels: 32,
        n_convs: 2,
        deep_dropout: false,
    },
    Stage {
        name: "down_tr64",
        in_channels: 32,
        out_channels: 64,
        n_convs: 3,
        deep_dropout: false,
    },
    Stage {
        name: "down_tr128",
        in_channels: 64,
        out_channels: 128,
        n_convs: 3,
        deep_dropout: true,
    },
    Stage {
        name: "down_tr256",
        in_channels: 128,
        out_channels: 256,
        n_convs: 3,
        deep_dropout: true,
    },
];

const UP_STAGES: [Stage; 4] = [
    Stage {
        name: "up_tr256",
        in_channels: 256,
        out_channels: 128,
        n_convs: 3,
        deep_dropout: true,
    },
    Stage {
        name: "up_tr128",
        in_channels: 128,
        out_channels: 64,
        n_convs: 3,
        deep_dropout: true,
    },
    Stage {
        name: "up_tr64",
        in_channels: 64,
        out_channels: 32,
        n_convs: 2,
        deep_dropout: false,
    },
    Stage {
        name: "up_tr32",
        in_channels: 32,
        out_channels: 16,
        n_convs: 1,
        deep_dropout: false,
    },
];

/// Logits and their normalised counterpart, both `[N, num_classes, H, W]`.
pub struct VNet2dOutput<B: PortableBackend + 'static> {
    pub logits: DeviceTensor<B>,
    /// Sigmoid of the logits for a single class, channel softmax otherwise.
    pub probabilities: DeviceTensor<B>,
}

/// Whether dropout layers sample masks during a forward pass.
pub enum DropoutMode<'a> {
    Eval,
    Train(&'a mut dyn RngCore),
}

impl DropoutMode<'_> {
    fn apply<B: PortableBackend + 'static>(
        &mut self,
        layer: &Dropout2d,
        x: &DeviceTensor<B>,
    ) -> Result<DeviceTensor<B>> {
        match self {
            DropoutMode::Eval => Ok(x.clone()),
            DropoutMode::Train(rng) => layer.forward(x, true, rng),
        }
    }
}

fn visit_ops<B: PortableBackend + 'static>(
    ops: &[LuConv2d<B>],
    v: &mut ParamVisitor<'_, B>,
) -> Result<()> {
    v.scoped("ops", |v| {
        for (idx, op) in ops.iter().enumerate() {
            v.scoped(&idx.to_string(), |v| op.visit_params(v))?;
        }
        Ok(())
    })
}

fn visit_ops_mut<B: PortableBackend + 'static>(
    ops: &mut [LuConv2d<B>],
    v: &mut ParamVisitorMut<'_, B>,
) -> Result<()> {
    v.scoped("ops", |v| {
        for (idx, op) in ops.iter_mut().enumerate() {
            v.scoped(&idx.to_string(), |v| op.visit_params_mut(v))?;
        }
        Ok(())
    })
}

/// `act(group_norm(conv3x3(x)))`, channel count preserved.
pub struct LuConv2d<B: PortableBackend + 'static> {
    relu1: Activation<B>,
    conv1: Conv2d<B>,
    bn1: GroupNorm<B>,
}

impl<B: PortableBackend + 'static> LuConv2d<B> {
    pub fn forward(&self, x: &DeviceTensor<B>) -> Result<DeviceTensor<B>> {
        let _scope = crate::profiling::layer_scope("VNet2d::LuConv2d::forward");
        let out = self.conv1.forward(x)?;
        let out = self.bn1.forward(&out)?;
        self.relu1.forward(&out)
    }
}

impl<B: PortableBackend + 'static> Module<B> for LuConv2d<B> {
    fn visit_params(&self, v: &mut ParamVisitor<'_, B>) -> Result<()> {
        v.scoped("relu1", |v| self.relu1.visit_params(v))?;
        v.scoped("conv1", |v| self.conv1.visit_params(v))?;
        v.scoped("bn1", |v| self.bn1.visit_params(v))
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_, B>) -> Result<()> {
        v.scoped("relu1", |v| self.relu1.visit_params_mut(v))?;
        v.scoped("conv1", |v| self.conv1.visit_params_mut(v))?;
        v.scoped("bn1", |v| self.bn1.visit_params_mut(v))
    }
}

/// Lifts the image to 16 channels: `act(gn(conv3x3(x)) + conv1x1(x))`.
pub struct InputTransition2d<B: PortableBackend + 'static> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    bn1: GroupNorm<B>,
    relu1: Activation<B>,
}

impl<B: PortableBackend + 'static> InputTransition2d<B> {
    pub fn forward(&self, x: &DeviceTensor<B>) -> Result<DeviceTensor<B>> {
        let _scope = crate::profiling::layer_scope("VNet2d::InputTransition2d::forward");
        let out = self.conv1.forward(x)?;
        let out = self.bn1.forward(&out)?;
        let projected = self.conv2.forward(x)?;
        self.relu1.forward(&out.add(&projected)?)
    }
}

impl<B: PortableBackend + 'static> Module<B> for InputTransition2d<B> {
    fn visit_params(&self, v: &mut ParamVisitor<'_, B>) -> Result<()> {
        v.scoped("conv1", |v| self.conv1.visit_params(v))?;
        v.scoped("conv2", |v| self.conv2.visit_params(v))?;
        v.scoped("bn1", |v| self.bn1.visit_params(v))?;
        v.scoped("relu1", |v| self.relu1.visit_params(v))
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_, B>) -> Result<()> {
        v.scoped("conv1", |v| self.conv1.visit_params_mut(v))?;
        v.scoped("conv2", |v| self.conv2.visit_params_mut(v))?;
        v.scoped("bn1", |v| self.bn1.visit_params_mut(v))?;
        v.scoped("relu1", |v| self.relu1.visit_params_mut(v))
    }
}

/// Halves resolution with a strided 2x2 conv, then applies a residual stack of [`LuConv2d`].
pub struct DownTransition2d<B: PortableBackend + 'static> {
    name: &'static str,
    down_conv: Conv2d<B>,
    bn1: GroupNorm<B>,
    do1: Option<Dropout2d>,
    relu1: Activation<B>,
    relu2: Activation<B>,
    ops: Vec<LuConv2d<B>>,
}

impl<B: PortableBackend + 'static> DownTransition2d<B> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Channel dropout applied to the downsampled activations before the residual stack.
    pub fn dropout(&self) -> Option<&Dropout2d> {
        self.do1.as_ref()
    }

    pub fn forward(
        &self,
        x: &DeviceTensor<B>,
        mode: &mut DropoutMode<'_>,
    ) -> Result<DeviceTensor<B>> {
        let _scope = crate::profiling::layer_scope("VNet2d::DownTransition2d::forward");
        let down = self.down_conv.forward(x)?;
        let down = self.bn1.forward(&down)?;
        let down = self.relu1.forward(&down)?;
        let mut out = match &self.do1 {
            Some(do1) => mode.apply(do1, &down)?,
            None => down.clone(),
        };
        for op in &self.ops {
            out = op.forward(&out)?;
        }
        self.relu2.forward(&out.add(&down)?)
    }
}

impl<B: PortableBackend + 'static> Module<B> for DownTransition2d<B> {
    fn visit_params(&self, v: &mut ParamVisitor<'_, B>) -> Result<()> {
        v.scoped("down_conv", |v| self.down_conv.visit_params(v))?;
        v.scoped("bn1", |v| self.bn1.visit_params(v))?;
        v.scoped("relu1", |v| self.relu1.visit_params(v))?;
        v.scoped("relu2", |v| self.relu2.visit_params(v))?;
        visit_ops(&self.ops, v)
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_, B>) -> Result<()> {
        v.scoped("down_conv", |v| self.down_conv.visit_params_mut(v))?;
        v.scoped("bn1", |v| self.bn1.visit_params_mut(v))?;
        v.scoped("relu1", |v| self.relu1.visit_params_mut(v))?;
        v.scoped("relu2", |v| self.relu2.visit_params_mut(v))?;
        visit_ops_mut(&mut self.ops, v)
    }
}

/// Doubles resolution with a 2x2 transposed conv, fuses the skip connection, then refines.
///
/// `bn` and `relu` are applied after the upsampling, after the 1x1 fusion conv, and after the
/// residual sum, sharing their parameters across all three uses.
pub struct UpTransition2d<B: PortableBackend + 'static> {
    name: &'static str,
    up_conv: ConvTranspose2d<B>,
    bn: GroupNorm<B>,
    do1: Option<Dropout2d>,
    do2: Dropout2d,
    relu: Activation<B>,
    ops: Vec<LuConv2d<B>>,
    conv: Conv2d<B>,
}

impl<B: PortableBackend + 'static> UpTransition2d<B> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Optional dropout on the decoder input.
    pub fn dropout(&self) -> Option<&Dropout2d> {
        self.do1.as_ref()
    }

    /// Dropout on the skip connection; present on every up transition.
    pub fn skip_dropout(&self) -> &Dropout2d {
        &self.do2
    }

    pub fn forward(
        &self,
        x: &DeviceTensor<B>,
        skip: &DeviceTensor<B>,
        mode: &mut DropoutMode<'_>,
    ) -> Result<DeviceTensor<B>> {
        let _scope = crate::profiling::layer_scope("VNet2d::UpTransition2d::forward");
        let out = match &self.do1 {
            Some(do1) => mode.apply(do1, x)?,
            None => x.clone(),
        };
        let skip = mode.apply(&self.do2, skip)?;
        let out = self.up_conv.forward(&out)?;
        let out = self.relu.forward(&self.bn.forward(&out)?)?;
        ensure!(
            out.shape().dims()[2..] == skip.shape().dims()[2..],
            "{}: upsampled extent {:?} does not match skip connection {:?}",
            self.name,
            out.shape().dims(),
            skip.shape().dims()
        );
        let backend = out.backend();
        let xcat = functional::concat(backend.as_ref(), &[&out, &skip], 1)?;
        let xcat = self.conv.forward(&xcat)?;
        let xcat = self.relu.forward(&self.bn.forward(&xcat)?)?;
        let mut out = xcat.clone();
        for op in &self.ops {
            out = op.forward(&out)?;
        }
        self.relu.forward(&out.add(&xcat)?)
    }
}

impl<B: PortableBackend + 'static> Module<B> for UpTransition2d<B> {
    fn visit_params(&self, v: &mut ParamVisitor<'_, B>) -> Result<()> {
        v.scoped("up_conv", |v| self.up_conv.visit_params(v))?;
        v.scoped("bn", |v| self.bn.visit_params(v))?;
        v.scoped("relu", |v| self.relu.visit_params(v))?;
        visit_ops(&self.ops, v)?;
        v.scoped("conv", |v| self.conv.visit_params(v))
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_, B>) -> Result<()> {
        v.scoped("up_conv", |v| self.up_conv.visit_params_mut(v))?;
        v.scoped("bn", |v| self.bn.visit_params_mut(v))?;
        v.scoped("relu", |v| self.relu.visit_params_mut(v))?;
        visit_ops_mut(&mut self.ops, v)?;
        v.scoped("conv", |v| self.conv.visit_params_mut(v))
    }
}

/// 1x1 projection to class logits followed by sigmoid (one class) or channel softmax.
pub struct OutputTransition2d<B: PortableBackend + 'static> {
    conv: Conv2d<B>,
}

impl<B: PortableBackend + 'static> OutputTransition2d<B> {
    pub fn num_classes(&self) -> usize {
        self.conv.out_channels()
    }

    pub fn forward(&self, x: &DeviceTensor<B>) -> Result<VNet2dOutput<B>> {
        let _scope = crate::profiling::layer_scope("VNet2d::OutputTransition2d::forward");
        let logits = self.conv.forward(x)?;
        let backend = logits.backend();
        let probabilities = if self.num_classes() == 1 {
            functional::sigmoid(backend.as_ref(), &logits)?
        } else {
            functional::softmax(backend.as_ref(), &logits, 1)?
        };
        Ok(VNet2dOutput {
            logits,
            probabilities,
        })
    }
}

impl<B: PortableBackend + 'static> Module<B> for OutputTransition2d<B> {
    fn visit_params(&self, v: &mut ParamVisitor<'_, B>) -> Result<()> {
        v.scoped("conv", |v| self.conv.visit_params(v))
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_, B>) -> Result<()> {
        v.scoped("conv", |v| self.conv.visit_params_mut(v))
    }
}

/// How a freshly initialised parameter is filled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamInit {
    /// `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
    FanInUniform(usize),
    Fill(f32),
}

/// A named parameter the model needs while it is being assembled.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamRequest {
    pub name: String,
    pub dims: Vec<usize>,
    pub init: ParamInit,
}

struct Assembler<'a, B: PortableBackend + 'static> {
    backend: Arc<B>,
    config: &'a VNet2dConfig,
    source: &'a mut dyn FnMut(&ParamRequest) -> Result<DeviceTensor<B>>,
}

impl<B: PortableBackend + 'static> Assembler<'_, B> {
    fn tensor(
        &mut self,
        name: String,
        dims: Vec<usize>,
        init: ParamInit,
    ) -> Result<DeviceTensor<B>> {
        let request = ParamRequest { name, dims, init };
        let tensor = (self.source)(&request)?;
        ensure!(
            tensor.shape().dims() == request.dims.as_slice(),
            "parameter '{}' has shape {:?}, expected {:?}",
            request.name,
            tensor.shape().dims(),
            request.dims
        );
        Ok(tensor)
    }

    fn conv(
        &mut self,
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        params: Conv2dParams2d,
    ) -> Result<Conv2d<B>> {
        let dims = vec![
            out_channels,
            in_channels / params.groups,
            params.kernel[0],
            params.kernel[1],
        ];
        let fan_in = conv_fan_in(&dims);
        let init = ParamInit::FanInUniform(fan_in);
        let weight = self.tensor(format!("{prefix}.weight"), dims, init)?;
        let bias = self.tensor(format!("{prefix}.bias"), vec![out_channels], init)?;
        Conv2d::new(Arc::clone(&self.backend), weight, Some(bias), params)
    }

    fn conv_transpose(
        &mut self,
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        params: ConvTranspose2dParams2d,
    ) -> Result<ConvTranspose2d<B>> {
        let dims = vec![in_channels, out_channels, params.kernel[0], params.kernel[1]];
        let fan_in = conv_transpose_fan_in(&dims);
        let init = ParamInit::FanInUniform(fan_in);
        let weight = self.tensor(format!("{prefix}.weight"), dims, init)?;
        let bias = self.tensor(format!("{prefix}.bias"), vec![out_channels], init)?;
        ConvTranspose2d::new(Arc::clone(&self.backend), weight, Some(bias), params)
    }

    fn group_norm(&mut self, prefix: &str, channels: usize) -> Result<GroupNorm<B>> {
        let gamma = self.tensor(format!("{prefix}.weight"), vec![channels], ParamInit::Fill(1.0))?;
        let beta = self.tensor(format!("{prefix}.bias"), vec![channels], ParamInit::Fill(0.0))?;
        GroupNorm::new(
            Arc::clone(&self.backend),
            gamma,
            beta,
            self.config.norm_groups,
            self.config.norm_eps,
        )
    }

    fn activation(&mut self, prefix: &str, channels: usize) -> Result<Activation<B>> {
        match self.config.activation() {
            ActivationKind::Elu => {
                Activation::new(Arc::clone(&self.backend), ActivationKind::Elu, channels)
            }
            ActivationKind::PRelu => {
                let weight = self.tensor(
                    format!("{prefix}.weight"),
                    vec![channels],
                    ParamInit::Fill(PRELU_INIT),
                )?;
                Activation::prelu(Arc::clone(&self.backend), weight)
            }
        }
    }

    fn dropout(&self, enabled: bool) -> Result<Option<Dropout2d>> {
        if enabled {
            Ok(Some(Dropout2d::new(self.config.dropout_p)?))
        } else {
            Ok(None)
        }
    }

    fn lu_conv(&mut self, prefix: &str, channels: usize) -> Result<LuConv2d<B>> {
        let relu1 = self.activation(&format!("{prefix}.relu1"), channels)?;
        let conv1 = self.conv(
            &format!("{prefix}.conv1"),
            channels,
            channels,
            Conv2dParams2d::square(3, 1, 1),
        )?;
        let bn1 = self.group_norm(&format!("{prefix}.bn1"), channels)?;
        Ok(LuConv2d { relu1, conv1, bn1 })
    }

    fn ops(&mut self, prefix: &str, channels: usize, depth: usize) -> Result<Vec<LuConv2d<B>>> {
        (0..depth)
            .map(|idx| self.lu_conv(&format!("{prefix}.ops.{idx}"), channels))
            .collect()
    }

    fn input_transition(&mut self, in_channels: usize) -> Result<InputTransition2d<B>> {
        let out_channels = BASE_CHANNELS;
        let conv1 = self.conv(
            "in_tr.conv1",
            in_channels,
            out_channels,
            Conv2dParams2d::square(3, 1, 1),
        )?;
        let conv2 = self.conv(
            "in_tr.conv2",
            in_channels,
            out_channels,
            Conv2dParams2d::square(1, 1, 0),
        )?;
        let bn1 = self.group_norm("in_tr.bn1", out_channels)?;
        let relu1 = self.activation("in_tr.relu1", out_channels)?;
        Ok(InputTransition2d {
            conv1,
            conv2,
            bn1,
            relu1,
        })
    }

    fn down_transition(&mut self, stage: &Stage) -> Result<DownTransition2d<B>> {
        let name = stage.name;
        let out = stage.out_channels;
        let down_conv = self.conv(
            &format!("{name}.down_conv"),
            stage.in_channels,
            out,
            Conv2dParams2d::square(2, 2, 0),
        )?;
        let bn1 = self.group_norm(&format!("{name}.bn1"), out)?;
        let relu1 = self.activation(&format!("{name}.relu1"), out)?;
        let relu2 = self.activation(&format!("{name}.relu2"), out)?;
        let ops = self.ops(name, out, stage.n_convs)?;
        let do1 = self.dropout(self.config.deep_dropout && stage.deep_dropout)?;
        Ok(DownTransition2d {
            name,
            down_conv,
            bn1,
            do1,
            relu1,
            relu2,
            ops,
        })
    }

    fn up_transition(&mut self, stage: &Stage) -> Result<UpTransition2d<B>> {
        let name = stage.name;
        let out = stage.out_channels;
        let up_conv = self.conv_transpose(
            &format!("{name}.up_conv"),
            stage.in_channels,
            out,
            ConvTranspose2dParams2d::square(2, 2),
        )?;
        let bn = self.group_norm(&format!("{name}.bn"), out)?;
        let relu = self.activation(&format!("{name}.relu"), out)?;
        let ops = self.ops(name, out, stage.n_convs)?;
        let conv = self.conv(
            &format!("{name}.conv"),
            stage.in_channels,
            out,
            Conv2dParams2d::square(1, 1, 0),
        )?;
        let do1 = self.dropout(self.config.deep_dropout && stage.deep_dropout)?;
        let do2 = Dropout2d::new(self.config.dropout_p)?;
        Ok(UpTransition2d {
            name,
            up_conv,
            bn,
            do1,
            do2,
            relu,
            ops,
            conv,
        })
    }

    fn output_transition(&mut self, num_classes: usize) -> Result<OutputTransition2d<B>> {
        let conv = self.conv(
            "out_tr.conv",
            BASE_CHANNELS,
            num_classes,
            Conv2dParams2d::square(1, 1, 0),
        )?;
        Ok(OutputTransition2d { conv })
    }
}

pub(crate) fn build_from_model_config<B: PortableBackend + 'static>(
    backend: Arc<B>,
    cfg: &ModelConfig,
    get: &mut dyn FnMut(&str) -> Result<DeviceTensor<B>>,
) -> Result<Box<dyn SegmentationModel<B>>> {
    ensure!(
        cfg.kind == KIND,
        "model kind '{}' cannot be built as {KIND}",
        cfg.kind
    );
    let config: VNet2dConfig = serde_json::from_value(cfg.config.clone())
        .map_err(|err| anyhow!("invalid vnet2d config: {err}"))?;
    Ok(Box::new(VNet2d::build_from_params(config, backend, get)?))
}

pub struct VNet2d<B: PortableBackend + 'static> {
    pub config: VNet2dConfig,
    backend: Arc<B>,
    in_tr: InputTransition2d<B>,
    down: Vec<DownTransition2d<B>>,
    up: Vec<UpTransition2d<B>>,
    out_tr: OutputTransition2d<B>,
}

impl<B: PortableBackend + 'static> VNet2d<B> {
    fn assemble(
        config: VNet2dConfig,
        backend: Arc<B>,
        source: &mut dyn FnMut(&ParamRequest) -> Result<DeviceTensor<B>>,
    ) -> Result<Self> {
        config.validate()?;
        let mut asm = Assembler {
            backend: Arc::clone(&backend),
            config: &config,
            source,
        };
        let in_tr = asm.input_transition(config.image_channels)?;
        let down = DOWN_STAGES
            .iter()
            .map(|stage| asm.down_transition(stage))
            .collect::<Result<Vec<_>>>()?;
        let up = UP_STAGES
            .iter()
            .map(|stage| asm.up_transition(stage))
            .collect::<Result<Vec<_>>>()?;
        let out_tr = asm.output_transition(config.num_classes)?;
        tracing::debug!(
            image_channels = config.image_channels,
            num_classes = config.num_classes,
            activation = ?config.activation(),
            deep_dropout = config.deep_dropout,
            "assembled vnet2d"
        );
        Ok(Self {
            config,
            backend,
            in_tr,
            down,
            up,
            out_tr,
        })
    }

    /// Fresh model with framework-default initialisation: conv weights and biases uniform in
    /// `±1/sqrt(fan_in)`, group-norm affine at identity, PReLU slopes at 0.25.
    pub fn random(config: VNet2dConfig, backend: Arc<B>, rng: &mut impl Rng) -> Result<Self> {
        let upload = Arc::clone(&backend);
        let mut sample = |request: &ParamRequest| -> Result<DeviceTensor<B>> {
            let shape = Shape::new(request.dims.clone());
            let host = match request.init {
                ParamInit::FanInUniform(fan_in) => uniform_fan_in(shape, fan_in, &mut *rng)?,
                ParamInit::Fill(value) => Tensor::full(shape, value),
            };
            DeviceTensor::from_host(Arc::clone(&upload), host)
        };
        Self::assemble(config, backend, &mut sample)
    }

    /// Builds the model from host tensors keyed by parameter name.
    ///
    /// Every expected name must be present with the expected shape, and no extra names may
    /// remain.
    pub fn from_named_tensors(
        config: VNet2dConfig,
        backend: Arc<B>,
        mut tensors: HashMap<String, Tensor>,
    ) -> Result<Self> {
        let upload = Arc::clone(&backend);
        let mut take = |request: &ParamRequest| -> Result<DeviceTensor<B>> {
            tensors
                .remove(&request.name)
                .ok_or_else(|| anyhow!("missing tensor '{}' for VNet2d", request.name))?
                .into_device_tensor(&upload)
        };
        let model = Self::assemble(config, backend, &mut take)?;
        if !tensors.is_empty() {
            let mut unknown: Vec<String> = tensors.into_keys().collect();
            unknown.sort();
            bail!("unexpected tensors for VNet2d: {}", unknown.join(", "));
        }
        Ok(model)
    }

    /// Builds the model by pulling each parameter from `get`; shapes are still checked.
    pub fn build_from_params(
        config: VNet2dConfig,
        backend: Arc<B>,
        mut get: impl FnMut(&str) -> Result<DeviceTensor<B>>,
    ) -> Result<Self> {
        let mut lookup = |request: &ParamRequest| get(&request.name);
        Self::assemble(config, backend, &mut lookup)
    }

    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    /// Encoder stages, shallowest first.
    pub fn down_transitions(&self) -> &[DownTransition2d<B>] {
        &self.down
    }

    /// Decoder stages, deepest first.
    pub fn up_transitions(&self) -> &[UpTransition2d<B>] {
        &self.up
    }

    pub fn model_config(&self) -> Result<ModelConfig> {
        Ok(ModelConfig::new(KIND, serde_json::to_value(&self.config)?))
    }

    /// Checks that `shape` is an `[N, image_channels, H, W]` batch the network can process.
    pub fn validate_input(&self, shape: &Shape) -> Result<()> {
        let dims = shape.dims();
        ensure!(
            dims.len() == 4,
            "VNet2d expects NCHW input, got {:?}",
            dims
        );
        ensure!(dims[0] > 0, "VNet2d batch must be non-empty");
        ensure!(
            dims[1] == self.config.image_channels,
            "VNet2d expects {} input channels, got {}",
            self.config.image_channels,
            dims[1]
        );
        for (axis, &extent) in ["height", "width"].iter().zip(&dims[2..]) {
            ensure!(
                extent > 0 && extent % MIN_SPATIAL_MULTIPLE == 0,
                "VNet2d input {axis} {extent} must be a positive multiple of {MIN_SPATIAL_MULTIPLE}"
            );
        }
        Ok(())
    }

    /// Inference pass; dropout layers are inactive.
    pub fn forward(&self, x: &DeviceTensor<B>) -> Result<VNet2dOutput<B>> {
        let _scope = crate::profiling::layer_scope("VNet2d::forward");
        self.run(x, &mut DropoutMode::Eval, None)
    }

    /// Same graph with every dropout layer sampling masks from `rng`.
    pub fn forward_train(
        &self,
        x: &DeviceTensor<B>,
        rng: &mut impl Rng,
    ) -> Result<VNet2dOutput<B>> {
        let _scope = crate::profiling::layer_scope("VNet2d::forward_train");
        self.run(x, &mut DropoutMode::Train(rng), None)
    }

    /// Inference pass that also returns the output of every stage in execution order.
    pub fn forward_trace(&self, x: &DeviceTensor<B>) -> Result<Vec<(String, DeviceTensor<B>)>> {
        let mut trace = Vec::new();
        let output = self.run(x, &mut DropoutMode::Eval, Some(&mut trace))?;
        trace.push(("out_tr.logits".to_string(), output.logits));
        trace.push(("out_tr.probabilities".to_string(), output.probabilities));
        Ok(trace)
    }

    fn run(
        &self,
        x: &DeviceTensor<B>,
        mode: &mut DropoutMode<'_>,
        mut trace: Option<&mut Vec<(String, DeviceTensor<B>)>>,
    ) -> Result<VNet2dOutput<B>> {
        self.validate_input(x.shape())?;
        ensure!(
            x.lives_on(&self.backend),
            "VNet2d input lives on a different backend instance"
        );
        let mut record = |name: &str, tensor: &DeviceTensor<B>| {
            tracing::debug!(stage = name, shape = ?tensor.shape().dims(), "vnet2d stage");
            if let Some(trace) = trace.as_deref_mut() {
                trace.push((name.to_string(), tensor.clone()));
            }
        };

        let mut out = self.in_tr.forward(x)?;
        record("in_tr", &out);

        let mut skips = Vec::with_capacity(self.down.len());
        for stage in &self.down {
            skips.push(out.clone());
            out = stage.forward(&out, mode)?;
            record(stage.name(), &out);
        }

        for stage in &self.up {
            let skip = skips
                .pop()
                .ok_or_else(|| anyhow!("{} has no matching encoder output", stage.name()))?;
            out = stage.forward(&out, &skip, mode)?;
            record(stage.name(), &out);
        }

        self.out_tr.forward(&out)
    }
}

impl<B: PortableBackend + 'static> Module<B> for VNet2d<B> {
    fn visit_params(&self, v: &mut ParamVisitor<'_, B>) -> Result<()> {
        v.scoped("in_tr", |v| self.in_tr.visit_params(v))?;
        for stage in &self.down {
            v.scoped(stage.name(), |v| stage.visit_params(v))?;
        }
        for stage in &self.up {
            v.scoped(stage.name(), |v| stage.visit_params(v))?;
        }
        v.scoped("out_tr", |v| self.out_tr.visit_params(v))
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_, B>) -> Result<()> {
        v.scoped("in_tr", |v| self.in_tr.visit_params_mut(v))?;
        for stage in &mut self.down {
            v.scoped(stage.name(), |v| stage.visit_params_mut(v))?;
        }
        for stage in &mut self.up {
            v.scoped(stage.name(), |v| stage.visit_params_mut(v))?;
        }
        v.scoped("out_tr", |v| self.out_tr.visit_params_mut(v))
    }
}

impl<B: PortableBackend + 'static> SegmentationModel<B> for VNet2d<B> {
    fn kind(&self) -> &str {
        KIND
    }

    fn model_config(&self) -> Result<ModelConfig> {
        VNet2d::model_config(self)
    }

    fn image_channels(&self) -> usize {
        self.config.image_channels
    }

    fn validate_input(&self, shape: &Shape) -> Result<()> {
        VNet2d::validate_input(self, shape)
    }

    fn forward(&self, x: &DeviceTensor<B>) -> Result<VNet2dOutput<B>> {
        VNet2d::forward(self, x)
    }

    fn forward_trace(&self, x: &DeviceTensor<B>) -> Result<Vec<(String, DeviceTensor<B>)>> {
        VNet2d::forward_trace(self, x)
    }
}
