//! Stochastic operators such as channel dropout.
//!
//! Masks are sampled on the host from the caller's RNG so a seeded generator reproduces the same
//! channels across backends.

use anyhow::{ensure, Result};
use rand::Rng;

use crate::backend::spec::{Operation, PortableBackend};
use crate::ops::functional::common::{dispatch, ensure_rank_at_least};
use crate::tensor::{DeviceTensor, Shape, Tensor};

enum DropoutPlan {
    NoOp,
    Apply { batch: usize, channels: usize, keep_prob: f32 },
}

/// Validates dropout inputs and decides whether a mask is needed at all.
fn validate_dropout2d<B: PortableBackend + 'static>(
    x: &DeviceTensor<B>,
    p: f32,
    training: bool,
) -> Result<DropoutPlan> {
    ensure!(
        (0.0..1.0).contains(&p),
        "dropout probability must be in [0, 1), got {p}"
    );
    ensure_rank_at_least("dropout2d input", x, 2)?;
    if p == 0.0 || !training {
        return Ok(DropoutPlan::NoOp);
    }
    let dims = x.shape().dims();
    Ok(DropoutPlan::Apply {
        batch: dims[0],
        channels: dims[1],
        keep_prob: 1.0 - p,
    })
}

/// Samples an `[N, C]` inverted-dropout scale: `0` with probability `p`, `1 / (1 - p)` otherwise.
pub fn dropout2d_mask(
    batch: usize,
    channels: usize,
    p: f32,
    rng: &mut impl Rng,
) -> Result<Tensor> {
    let keep_prob = 1.0 - p;
    let scale = 1.0 / keep_prob;
    let data = (0..batch * channels)
        .map(|_| if rng.gen::<f32>() < p { 0.0 } else { scale })
        .collect();
    Tensor::from_vec(Shape::new(vec![batch, channels]), data)
}

/// Zeroes whole feature maps with probability `p` during training and rescales the survivors.
///
/// Outside training, or when `p == 0`, the input is returned unchanged.
pub fn dropout2d<B: PortableBackend + 'static>(
    backend: &B,
    x: &DeviceTensor<B>,
    p: f32,
    training: bool,
    rng: &mut impl Rng,
) -> Result<DeviceTensor<B>> {
    let _scope = crate::profiling::functional_scope(
        "vnet::ops::functional::stochastic::dropout2d",
        "host_mask",
    );
    match validate_dropout2d(x, p, training)? {
        DropoutPlan::NoOp => Ok(x.clone()),
        DropoutPlan::Apply {
            batch,
            channels,
            keep_prob,
        } => {
            tracing::trace!(batch, channels, keep_prob, "dropout2d mask");
            let mask = dropout2d_mask(batch, channels, p, rng)?;
            let mask = DeviceTensor::from_host(x.backend(), mask)?;
            dispatch(
                backend,
                Operation::ScaleChannels,
                &[x, &mask],
                x.shape().clone(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn mask_entries_are_zero_or_rescaled() {
        let mut rng = StdRng::seed_from_u64(7);
        let mask = dropout2d_mask(4, 32, 0.5, &mut rng).unwrap();
        assert_eq!(mask.shape().dims(), &[4, 32]);
        let zeros = mask.data().iter().filter(|&&v| v == 0.0).count();
        assert!(mask.data().iter().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
        assert!(zeros > 0 && zeros < 128);
    }

    #[test]
    fn mask_is_reproducible_for_a_seed() {
        let a = dropout2d_mask(2, 8, 0.3, &mut StdRng::seed_from_u64(11)).unwrap();
        let b = dropout2d_mask(2, 8, 0.3, &mut StdRng::seed_from_u64(11)).unwrap();
        assert_eq!(a, b);
    }
}
