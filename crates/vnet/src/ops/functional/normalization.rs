//! Group normalization over NCHW activations.

use anyhow::{ensure, Result};

use crate::backend::spec::{GroupNormSpec, Operation, PortableBackend};
use crate::ops::functional::common::{
    dispatch, ensure_rank_at_least, ensure_same_backend, ensure_vector_len,
};
use crate::tensor::DeviceTensor;

struct GroupNormPlan {
    channels: usize,
    group_size: usize,
}

/// Validates group-norm operands.
///
/// The input must carry at least `[N, C]`, `C` must divide evenly into `groups`, and the affine
/// parameters must both be `[C]`.
fn validate_group_norm<B: PortableBackend + 'static>(
    x: &DeviceTensor<B>,
    gamma: &DeviceTensor<B>,
    beta: &DeviceTensor<B>,
    groups: usize,
    eps: f32,
) -> Result<GroupNormPlan> {
    ensure_rank_at_least("group_norm input", x, 2)?;
    ensure_same_backend("group_norm", x, gamma)?;
    ensure_same_backend("group_norm", x, beta)?;

    let channels = x.shape().dims()[1];
    ensure!(groups > 0, "group_norm groups must be > 0");
    ensure!(
        channels % groups == 0,
        "group_norm channels {} must be divisible by groups {}",
        channels,
        groups
    );
    ensure!(
        eps.is_finite() && eps > 0.0,
        "group_norm eps must be a positive finite value, got {eps}"
    );
    ensure_vector_len("group_norm gamma", gamma, channels)?;
    ensure_vector_len("group_norm beta", beta, channels)?;

    Ok(GroupNormPlan {
        channels,
        group_size: channels / groups,
    })
}

/// Normalizes each `(sample, group)` slice to zero mean and unit (biased) variance, then applies
/// the per-channel affine transform `gamma * x_hat + beta`.
pub fn group_norm<B: PortableBackend + 'static>(
    backend: &B,
    x: &DeviceTensor<B>,
    gamma: &DeviceTensor<B>,
    beta: &DeviceTensor<B>,
    groups: usize,
    eps: f32,
) -> Result<DeviceTensor<B>> {
    let _scope = crate::profiling::functional_scope(
        "vnet::ops::functional::normalization::group_norm",
        "two_pass",
    );
    let plan = validate_group_norm(x, gamma, beta, groups, eps)?;
    tracing::trace!(
        channels = plan.channels,
        groups,
        group_size = plan.group_size,
        "group_norm"
    );
    dispatch(
        backend,
        Operation::GroupNorm(GroupNormSpec { groups, eps }),
        &[x, gamma, beta],
        x.shape().clone(),
    )
}
