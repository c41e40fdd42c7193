//! Host-backed tensor used for literals, initialisation, checkpoints, and tests.

use super::shape::Shape;
use anyhow::{bail, ensure, Result};
use rand::Rng;
use std::sync::Arc;

use crate::backend::spec::{TensorLiteral, TensorSpec};

/// Contiguous, row-major `f32` tensor stored on the host.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Shape,
    data: Vec<f32>,
}

impl Tensor {
    /// Constructs a tensor from raw values, validating the length against the shape.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            );
        }
        Ok(Tensor { shape, data })
    }

    /// Returns a zero-initialized tensor of the requested shape.
    pub fn zeros(shape: Shape) -> Self {
        Self::full(shape, 0.0)
    }

    /// Returns a one-initialized tensor of the requested shape.
    pub fn ones(shape: Shape) -> Self {
        Self::full(shape, 1.0)
    }

    /// Returns a tensor with every element set to `value`.
    pub fn full(shape: Shape, value: f32) -> Self {
        let len = shape.num_elements();
        Tensor {
            shape,
            data: vec![value; len],
        }
    }

    /// Samples from a normal distribution (`N(0, std^2)`) using the Box-Muller transform.
    pub fn randn(shape: Shape, std: f32, rng: &mut impl Rng) -> Self {
        let len = shape.num_elements();
        let mut values = Vec::with_capacity(len);
        while values.len() < len {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            values.push(r * theta.cos() * std);
            if values.len() < len {
                values.push(r * theta.sin() * std);
            }
        }
        Tensor {
            shape,
            data: values,
        }
    }

    /// Samples uniformly from `[low, high)`.
    pub fn uniform(shape: Shape, low: f32, high: f32, rng: &mut impl Rng) -> Self {
        let len = shape.num_elements();
        let span = high - low;
        let data = (0..len).map(|_| low + span * rng.gen::<f32>()).collect();
        Tensor { shape, data }
    }

    /// Returns the total number of elements stored in the tensor.
    pub fn len(&self) -> usize {
        self.shape.num_elements()
    }

    /// Reports whether the tensor contains zero elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Provides access to the tensor shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Borrows the underlying data slice.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Consumes the tensor and returns its payload.
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Wraps the tensor in a backend-neutral literal.
    pub fn to_literal(&self) -> TensorLiteral {
        TensorLiteral::new(
            TensorSpec::new(self.shape.dims().to_vec()),
            Arc::from(self.data.clone().into_boxed_slice()),
        )
    }

    /// Reconstructs a host tensor from a backend literal.
    pub fn from_literal(literal: &TensorLiteral) -> Result<Self> {
        let shape = Shape::try_new(literal.spec.shape.clone())?;
        ensure!(
            literal.data.len() == shape.num_elements(),
            "literal length {} does not match expected {}",
            literal.data.len(),
            shape.num_elements()
        );
        Ok(Tensor {
            shape,
            data: literal.data.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn from_vec_rejects_length_mismatch() {
        let err = Tensor::from_vec(Shape::new([2, 2]), vec![1.0; 3]).unwrap_err();
        assert!(err.to_string().contains("does not match shape"));
    }

    #[test]
    fn uniform_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(3);
        let t = Tensor::uniform(Shape::new([64]), -0.5, 0.5, &mut rng);
        assert!(t.data().iter().all(|v| (-0.5..0.5).contains(v)));
    }

    #[test]
    fn literal_roundtrip_keeps_values() {
        let t = Tensor::from_vec(Shape::new([1, 3]), vec![1.0, -2.0, 3.5]).unwrap();
        let back = Tensor::from_literal(&t.to_literal()).unwrap();
        assert_eq!(back, t);
    }
}
