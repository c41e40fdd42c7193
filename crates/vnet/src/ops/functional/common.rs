//! Shared helpers backing the functional tensor API.
//!
//! These utilities provide trait adapters so `DeviceTensor` instances can call math helpers like
//! `tensor.add(&other)` as well as the validation and dispatch routines reused across functional
//! kernels.

use anyhow::{ensure, Result};

use crate::backend::spec::{BinaryOp, Operation, PortableBackend, TensorSpec};
use crate::tensor::{DeviceTensor, Shape};

/// Executes `op` on the backend owning `inputs[0]` and wraps the result.
pub(crate) fn dispatch<B: PortableBackend + 'static>(
    backend: &B,
    op: Operation,
    inputs: &[&DeviceTensor<B>],
    output_shape: Shape,
) -> Result<DeviceTensor<B>> {
    ensure!(!inputs.is_empty(), "{} expects at least one operand", op);
    let owner = inputs[0].backend();
    for input in &inputs[1..] {
        ensure_same_backend(op.name(), inputs[0], input)?;
    }
    ensure!(
        std::ptr::eq(owner.as_ref(), backend),
        "{} operands live on a different backend instance than the caller's",
        op
    );
    tracing::trace!(
        op = op.name(),
        inputs = ?inputs.iter().map(|t| t.shape().dims().to_vec()).collect::<Vec<_>>(),
        output = ?output_shape.dims(),
        "dispatch"
    );
    let handles: Vec<B::TensorHandle> = inputs.iter().map(|t| t.handle().clone()).collect();
    let spec = TensorSpec::new(output_shape.dims().to_vec());
    let handle = backend.execute(&op, &handles, &spec)?;
    Ok(DeviceTensor::from_handle(owner, output_shape, handle))
}

/// Extension trait exposing ergonomic math helpers on device tensors.
pub trait DeviceTensorOps<B: PortableBackend + 'static>: Sized {
    /// Elementwise addition of two tensors of identical shape.
    fn add(&self, rhs: &Self) -> Result<Self>;
    /// Elementwise multiplication of two tensors of identical shape.
    fn mul(&self, rhs: &Self) -> Result<Self>;
}

impl<B: PortableBackend + 'static> DeviceTensorOps<B> for DeviceTensor<B> {
    fn add(&self, rhs: &Self) -> Result<Self> {
        elementwise_binary(self, rhs, BinaryOp::Add)
    }

    fn mul(&self, rhs: &Self) -> Result<Self> {
        elementwise_binary(self, rhs, BinaryOp::Mul)
    }
}

/// Elementwise sum of two tensors with identical shapes.
pub fn add<B: PortableBackend + 'static>(
    backend: &B,
    lhs: &DeviceTensor<B>,
    rhs: &DeviceTensor<B>,
) -> Result<DeviceTensor<B>> {
    let _scope =
        crate::profiling::functional_scope("vnet::ops::functional::common::add", "pointwise");
    ensure_shape_matches("add lhs", lhs, "rhs", rhs)?;
    dispatch(
        backend,
        Operation::ElementwiseBinary(BinaryOp::Add),
        &[lhs, rhs],
        lhs.shape().clone(),
    )
}

pub(crate) fn elementwise_binary<B: PortableBackend + 'static>(
    lhs: &DeviceTensor<B>,
    rhs: &DeviceTensor<B>,
    op: BinaryOp,
) -> Result<DeviceTensor<B>> {
    let label = match op {
        BinaryOp::Add => "add lhs",
        BinaryOp::Mul => "mul lhs",
    };
    ensure_shape_matches(label, lhs, "rhs", rhs)?;
    let backend = lhs.backend();
    dispatch(
        backend.as_ref(),
        Operation::ElementwiseBinary(op),
        &[lhs, rhs],
        lhs.shape().clone(),
    )
}

pub(crate) fn ensure_same_backend<B: PortableBackend + 'static>(
    op: &str,
    lhs: &DeviceTensor<B>,
    rhs: &DeviceTensor<B>,
) -> Result<()> {
    ensure!(
        lhs.lives_on(&rhs.backend()),
        "{op} operands must share the same backend instance"
    );
    Ok(())
}

pub(crate) fn ensure_rank<B: PortableBackend + 'static>(
    label: &str,
    tensor: &DeviceTensor<B>,
    rank: usize,
) -> Result<()> {
    ensure!(
        tensor.shape().rank() == rank,
        "{label} expects rank {rank}, got {:?}",
        tensor.shape().dims()
    );
    Ok(())
}

pub(crate) fn ensure_rank_at_least<B: PortableBackend + 'static>(
    label: &str,
    tensor: &DeviceTensor<B>,
    rank: usize,
) -> Result<()> {
    ensure!(
        tensor.shape().rank() >= rank,
        "{label} expects rank >= {rank}, got {:?}",
        tensor.shape().dims()
    );
    Ok(())
}

pub(crate) fn ensure_shape_matches<B: PortableBackend + 'static>(
    lhs_label: &str,
    lhs: &DeviceTensor<B>,
    rhs_label: &str,
    rhs: &DeviceTensor<B>,
) -> Result<()> {
    ensure!(
        lhs.shape() == rhs.shape(),
        "{lhs_label} shape {:?} does not match {rhs_label} shape {:?}",
        lhs.shape().dims(),
        rhs.shape().dims()
    );
    Ok(())
}

pub(crate) fn ensure_axis_in_bounds<B: PortableBackend + 'static>(
    label: &str,
    tensor: &DeviceTensor<B>,
    axis: usize,
) -> Result<()> {
    ensure!(
        axis < tensor.shape().rank(),
        "{label} axis {axis} out of bounds for shape {:?}",
        tensor.shape().dims()
    );
    Ok(())
}

pub(crate) fn ensure_vector_len<B: PortableBackend + 'static>(
    label: &str,
    tensor: &DeviceTensor<B>,
    len: usize,
) -> Result<()> {
    ensure!(
        tensor.shape().rank() == 1 && tensor.shape().dims()[0] == len,
        "{label} expects shape [{len}], got {:?}",
        tensor.shape().dims()
    );
    Ok(())
}
