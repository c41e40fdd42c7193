use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::nn::ActivationKind;

/// Channel width of the first encoder stage; every later width is a multiple of it.
pub const BASE_CHANNELS: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VNet2dConfig {
    pub image_channels: usize,
    pub num_classes: usize,
    /// ELU activations when true, per-channel PReLU otherwise.
    pub elu: bool,
    /// Enables the first dropout of `down_tr128`, `down_tr256`, `up_tr256` and `up_tr128`.
    #[serde(default)]
    pub deep_dropout: bool,
    #[serde(default = "default_dropout_p")]
    pub dropout_p: f32,
    #[serde(default = "default_norm_groups")]
    pub norm_groups: usize,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f32,
}

fn default_dropout_p() -> f32 {
    0.5
}

fn default_norm_groups() -> usize {
    8
}

fn default_norm_eps() -> f32 {
    1e-5
}

impl Default for VNet2dConfig {
    fn default() -> Self {
        Self {
            image_channels: 1,
            num_classes: 2,
            elu: true,
            deep_dropout: false,
            dropout_p: default_dropout_p(),
            norm_groups: default_norm_groups(),
            norm_eps: default_norm_eps(),
        }
    }
}

impl VNet2dConfig {
    pub fn new(image_channels: usize, num_classes: usize, elu: bool) -> Self {
        Self {
            image_channels,
            num_classes,
            elu,
            ..Self::default()
        }
    }

    pub fn activation(&self) -> ActivationKind {
        ActivationKind::from_elu_flag(self.elu)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.image_channels > 0, "image_channels must be > 0");
        ensure!(self.num_classes > 0, "num_classes must be > 0");
        ensure!(
            self.norm_groups > 0 && BASE_CHANNELS % self.norm_groups == 0,
            "norm_groups {} must divide {}",
            self.norm_groups,
            BASE_CHANNELS
        );
        ensure!(
            (0.0..1.0).contains(&self.dropout_p),
            "dropout_p must be in [0, 1), got {}",
            self.dropout_p
        );
        ensure!(
            self.norm_eps.is_finite() && self.norm_eps > 0.0,
            "norm_eps must be a positive finite value, got {}",
            self.norm_eps
        );
        Ok(())
    }
}

/// Kind-tagged model configuration stored in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ModelConfig {
    pub fn new(kind: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            config,
        }
    }
}
