//! Pointwise activations and channel softmax.

use anyhow::{ensure, Result};

use crate::backend::spec::{Operation, PortableBackend, SoftmaxSpec, UnaryOp};
use crate::ops::functional::common::{
    dispatch, ensure_axis_in_bounds, ensure_rank, ensure_rank_at_least, ensure_same_backend,
};
use crate::tensor::DeviceTensor;

fn unary<B: PortableBackend + 'static>(
    backend: &B,
    x: &DeviceTensor<B>,
    op: UnaryOp,
) -> Result<DeviceTensor<B>> {
    dispatch(
        backend,
        Operation::ElementwiseUnary(op),
        &[x],
        x.shape().clone(),
    )
}

pub fn relu<B: PortableBackend + 'static>(
    backend: &B,
    x: &DeviceTensor<B>,
) -> Result<DeviceTensor<B>> {
    let _scope =
        crate::profiling::functional_scope("vnet::ops::functional::activation::relu", "pointwise");
    unary(backend, x, UnaryOp::Relu)
}

/// Exponential linear unit: `x` for `x > 0`, `alpha * (exp(x) - 1)` otherwise.
pub fn elu<B: PortableBackend + 'static>(
    backend: &B,
    x: &DeviceTensor<B>,
    alpha: f32,
) -> Result<DeviceTensor<B>> {
    let _scope =
        crate::profiling::functional_scope("vnet::ops::functional::activation::elu", "pointwise");
    ensure!(alpha.is_finite(), "elu alpha must be finite, got {alpha}");
    unary(backend, x, UnaryOp::Elu { alpha })
}

pub fn sigmoid<B: PortableBackend + 'static>(
    backend: &B,
    x: &DeviceTensor<B>,
) -> Result<DeviceTensor<B>> {
    let _scope = crate::profiling::functional_scope(
        "vnet::ops::functional::activation::sigmoid",
        "pointwise",
    );
    unary(backend, x, UnaryOp::Sigmoid)
}

/// Parametric ReLU with a learned slope per channel (axis 1).
///
/// `weight` is either `[C]` or a single shared slope `[1]`.
pub fn prelu<B: PortableBackend + 'static>(
    backend: &B,
    x: &DeviceTensor<B>,
    weight: &DeviceTensor<B>,
) -> Result<DeviceTensor<B>> {
    let _scope =
        crate::profiling::functional_scope("vnet::ops::functional::activation::prelu", "pointwise");
    ensure_rank_at_least("prelu input", x, 2)?;
    ensure_rank("prelu weight", weight, 1)?;
    ensure_same_backend("prelu", x, weight)?;
    let channels = x.shape().dims()[1];
    let slopes = weight.shape().dims()[0];
    ensure!(
        slopes == channels || slopes == 1,
        "prelu weight length {} must be 1 or match channels {}",
        slopes,
        channels
    );
    dispatch(backend, Operation::PRelu, &[x, weight], x.shape().clone())
}

/// Numerically stable softmax along `axis`.
pub fn softmax<B: PortableBackend + 'static>(
    backend: &B,
    x: &DeviceTensor<B>,
    axis: usize,
) -> Result<DeviceTensor<B>> {
    let _scope = crate::profiling::functional_scope(
        "vnet::ops::functional::activation::softmax",
        "max_subtract",
    );
    ensure_axis_in_bounds("softmax", x, axis)?;
    dispatch(
        backend,
        Operation::Softmax(SoftmaxSpec { axis }),
        &[x],
        x.shape().clone(),
    )
}
