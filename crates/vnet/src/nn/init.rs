//! Default parameter initialisation.
//!
//! Convolution weights and biases are drawn from `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`, the
//! default used by common deep learning frameworks for freshly constructed conv layers.

use anyhow::{ensure, Result};
use rand::Rng;

use crate::tensor::{Shape, Tensor};

/// Bound of the default uniform initialiser for a layer with `fan_in` inputs per output.
pub fn fan_in_bound(fan_in: usize) -> Result<f32> {
    ensure!(fan_in > 0, "fan_in must be > 0");
    Ok(1.0 / (fan_in as f32).sqrt())
}

/// Samples `shape` uniformly in `±1/sqrt(fan_in)`.
pub fn uniform_fan_in(shape: Shape, fan_in: usize, rng: &mut impl Rng) -> Result<Tensor> {
    let bound = fan_in_bound(fan_in)?;
    Ok(Tensor::uniform(shape, -bound, bound, rng))
}

/// Fan-in of an OIHW conv weight `[C_out, C_in/groups, KH, KW]`.
pub fn conv_fan_in(weight: &[usize]) -> usize {
    weight.iter().skip(1).product()
}

/// Fan-in of an IOHW transposed-conv weight `[C_in, C_out, KH, KW]`, which is computed from
/// dim 1 exactly as for a regular conv weight.
pub fn conv_transpose_fan_in(weight: &[usize]) -> usize {
    weight.iter().skip(1).product()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn samples_stay_within_bound() {
        let mut rng = StdRng::seed_from_u64(3);
        let t = uniform_fan_in(Shape::new(vec![16, 1, 3, 3]), 9, &mut rng).unwrap();
        let bound = 1.0 / 3.0;
        assert!(t.data().iter().all(|v| v.abs() <= bound));
        assert!(t.data().iter().any(|&v| v != 0.0));
    }

    #[test]
    fn fan_in_uses_trailing_dims() {
        assert_eq!(conv_fan_in(&[32, 16, 2, 2]), 64);
        assert_eq!(conv_transpose_fan_in(&[256, 64, 2, 2]), 256);
        assert!(fan_in_bound(0).is_err());
    }
}
