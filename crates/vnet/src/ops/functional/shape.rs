//! Shape-manipulating operators.

use anyhow::{ensure, Result};

use crate::backend::spec::{ConcatSpec, Operation, PortableBackend};
use crate::ops::functional::common::{dispatch, ensure_axis_in_bounds, ensure_same_backend};
use crate::tensor::DeviceTensor;

/// Validates concat operands and returns the concatenated shape.
fn validate_concat<B: PortableBackend + 'static>(
    inputs: &[&DeviceTensor<B>],
    axis: usize,
) -> Result<Vec<usize>> {
    ensure!(!inputs.is_empty(), "concat expects at least one input");
    let first = inputs[0];
    ensure_axis_in_bounds("concat", first, axis)?;
    let mut dims = first.shape().dims().to_vec();
    for (idx, input) in inputs.iter().enumerate().skip(1) {
        ensure_same_backend("concat", first, input)?;
        let other = input.shape().dims();
        ensure!(
            other.len() == dims.len(),
            "concat input {} has rank {}, expected {}",
            idx,
            other.len(),
            dims.len()
        );
        for (d, (&a, &b)) in first.shape().dims().iter().zip(other).enumerate() {
            if d != axis {
                ensure!(
                    a == b,
                    "concat input {} shape {:?} disagrees with {:?} outside axis {}",
                    idx,
                    other,
                    first.shape().dims(),
                    axis
                );
            }
        }
        dims[axis] += other[axis];
    }
    Ok(dims)
}

/// Concatenates tensors along `axis`, preserving operand order.
pub fn concat<B: PortableBackend + 'static>(
    backend: &B,
    inputs: &[&DeviceTensor<B>],
    axis: usize,
) -> Result<DeviceTensor<B>> {
    let _scope = crate::profiling::functional_scope("vnet::ops::functional::shape::concat", "copy");
    let dims = validate_concat(inputs, axis)?;
    dispatch(
        backend,
        Operation::Concat(ConcatSpec { axis }),
        inputs,
        crate::tensor::Shape::new(dims),
    )
}
