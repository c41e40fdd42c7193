//! Channel dropout layer.

use anyhow::{ensure, Result};
use rand::Rng;

use crate::backend::spec::PortableBackend;
use crate::ops::functional;
use crate::tensor::DeviceTensor;

/// Zeroes whole channels during training. Holds no parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout2d {
    p: f32,
}

impl Dropout2d {
    pub fn new(p: f32) -> Result<Self> {
        ensure!(
            (0.0..1.0).contains(&p),
            "dropout probability must be in [0, 1), got {p}"
        );
        Ok(Self { p })
    }

    pub fn p(&self) -> f32 {
        self.p
    }

    pub fn forward<B: PortableBackend + 'static>(
        &self,
        x: &DeviceTensor<B>,
        training: bool,
        rng: &mut impl Rng,
    ) -> Result<DeviceTensor<B>> {
        let _scope = crate::profiling::layer_scope("Dropout2d::forward");
        let backend = x.backend();
        functional::dropout2d(backend.as_ref(), x, self.p, training, rng)
    }
}
