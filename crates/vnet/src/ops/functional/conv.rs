//! Convolution front-ends: shape validation plus a single backend dispatch each.
//!
//! Activations are NCHW (`[N, C, H, W]`). Conv weights use the canonical OIHW layout
//! (`[C_out, C_in/groups, KH, KW]`); transposed-conv weights use IOHW (`[C_in, C_out, KH, KW]`).

use anyhow::{anyhow, bail, ensure, Result};

use crate::backend::spec::{Conv2dSpec, ConvTranspose2dSpec, Operation, PortableBackend};
use crate::ops::functional::common::{dispatch, ensure_rank};
use crate::tensor::{DeviceTensor, Shape};

/// Semantic 2D convolution over NCHW activations.
pub fn conv2d<B: PortableBackend + 'static>(
    backend: &B,
    x: &DeviceTensor<B>,
    weight: &DeviceTensor<B>,
    bias: Option<&DeviceTensor<B>>,
    params: Conv2dParams2d,
) -> Result<DeviceTensor<B>> {
    let _scope =
        crate::profiling::functional_scope("vnet::ops::functional::conv::conv2d", "direct");

    let plan = validate_conv2d_inputs(x, weight, bias, params)?;
    let op = Operation::Conv2d(Conv2dSpec {
        stride: params.stride,
        padding: params.padding.as_hw_pairs(),
        dilation: params.dilation,
        groups: params.groups,
    });
    let output = Shape::new(vec![plan.n, plan.c_out, plan.out_h, plan.out_w]);
    match bias {
        Some(bias) => dispatch(backend, op, &[x, weight, bias], output),
        None => dispatch(backend, op, &[x, weight], output),
    }
}

/// Transposed 2D convolution (a.k.a. fractionally strided convolution) over NCHW activations.
pub fn conv_transpose2d<B: PortableBackend + 'static>(
    backend: &B,
    x: &DeviceTensor<B>,
    weight: &DeviceTensor<B>,
    bias: Option<&DeviceTensor<B>>,
    params: ConvTranspose2dParams2d,
) -> Result<DeviceTensor<B>> {
    let _scope = crate::profiling::functional_scope(
        "vnet::ops::functional::conv::conv_transpose2d",
        "scatter",
    );

    let plan = validate_conv_transpose2d_inputs(x, weight, bias, params)?;
    let op = Operation::ConvTranspose2d(ConvTranspose2dSpec {
        stride: params.stride,
        padding: params.padding.as_hw_pairs(),
        output_padding: params.output_padding,
    });
    let output = Shape::new(vec![plan.n, plan.c_out, plan.out_h, plan.out_w]);
    match bias {
        Some(bias) => dispatch(backend, op, &[x, weight, bias], output),
        None => dispatch(backend, op, &[x, weight], output),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Padding2d {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

impl Padding2d {
    pub fn zero() -> Self {
        Self::same(0)
    }

    /// Symmetric padding of `p` on every spatial edge.
    pub fn same(p: usize) -> Self {
        Self {
            top: p,
            bottom: p,
            left: p,
            right: p,
        }
    }

    pub fn as_hw_pairs(self) -> [(usize, usize); 2] {
        [(self.top, self.bottom), (self.left, self.right)]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dParams2d {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub dilation: [usize; 2],
    pub padding: Padding2d,
    pub groups: usize,
}

impl Conv2dParams2d {
    /// Square kernel, unit dilation, single group.
    pub fn square(kernel: usize, stride: usize, padding: usize) -> Self {
        Self {
            kernel: [kernel, kernel],
            stride: [stride, stride],
            dilation: [1, 1],
            padding: Padding2d::same(padding),
            groups: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvTranspose2dParams2d {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub padding: Padding2d,
    pub output_padding: [usize; 2],
}

impl ConvTranspose2dParams2d {
    pub fn square(kernel: usize, stride: usize) -> Self {
        Self {
            kernel: [kernel, kernel],
            stride: [stride, stride],
            padding: Padding2d::zero(),
            output_padding: [0, 0],
        }
    }
}

pub fn conv2d_out_dim(
    input: usize,
    window: usize,
    stride: usize,
    dilation: usize,
    pad_before: usize,
    pad_after: usize,
) -> Result<usize> {
    ensure!(window > 0, "conv2d window must be > 0");
    ensure!(stride > 0, "conv2d stride must be > 0");
    ensure!(dilation > 0, "conv2d dilation must be > 0");
    let effective = (window - 1)
        .checked_mul(dilation)
        .and_then(|v| v.checked_add(1))
        .ok_or_else(|| anyhow!("conv2d effective window overflow"))?;
    let padded = input
        .checked_add(pad_before)
        .and_then(|v| v.checked_add(pad_after))
        .ok_or_else(|| anyhow!("conv2d padded dimension overflow"))?;
    ensure!(
        padded >= effective,
        "conv2d window ({}) exceeds padded input ({})",
        effective,
        padded
    );
    Ok((padded - effective) / stride + 1)
}

/// `(input - 1) * stride - pad_before - pad_after + window + output_padding`.
pub fn conv_transpose2d_out_dim(
    input: usize,
    window: usize,
    stride: usize,
    pad_before: usize,
    pad_after: usize,
    output_padding: usize,
) -> Result<usize> {
    ensure!(window > 0, "conv_transpose2d window must be > 0");
    ensure!(stride > 0, "conv_transpose2d stride must be > 0");
    ensure!(input > 0, "conv_transpose2d input extent must be > 0");
    ensure!(
        output_padding < stride,
        "conv_transpose2d output_padding {} must be smaller than stride {}",
        output_padding,
        stride
    );
    let full = (input - 1)
        .checked_mul(stride)
        .and_then(|v| v.checked_add(window))
        .and_then(|v| v.checked_add(output_padding))
        .ok_or_else(|| anyhow!("conv_transpose2d output dimension overflow"))?;
    let trimmed = pad_before + pad_after;
    ensure!(
        full > trimmed,
        "conv_transpose2d padding ({}) consumes the whole output ({})",
        trimmed,
        full
    );
    Ok(full - trimmed)
}

#[derive(Debug, Clone, Copy)]
struct ValidatedConv {
    n: usize,
    out_h: usize,
    out_w: usize,
    c_out: usize,
}

fn validate_bias<B: PortableBackend + 'static>(
    op: &str,
    bias: Option<&DeviceTensor<B>>,
    c_out: usize,
) -> Result<()> {
    if let Some(bias) = bias {
        ensure!(
            bias.shape().rank() == 1,
            "{op} expects rank-1 bias [C_out], got {:?}",
            bias.shape().dims()
        );
        ensure!(
            bias.shape().dims()[0] == c_out,
            "{op} bias length {} must match weight output channels {}",
            bias.shape().dims()[0],
            c_out
        );
    }
    Ok(())
}

fn validate_conv2d_inputs<B: PortableBackend + 'static>(
    x: &DeviceTensor<B>,
    weight: &DeviceTensor<B>,
    bias: Option<&DeviceTensor<B>>,
    params: Conv2dParams2d,
) -> Result<ValidatedConv> {
    ensure_rank("conv2d input (NCHW)", x, 4)?;
    let dims = x.shape().dims();
    let (n, c_in, h, w) = (dims[0], dims[1], dims[2], dims[3]);

    let groups = params.groups;
    ensure!(groups > 0, "conv2d groups must be > 0");
    ensure!(
        c_in % groups == 0,
        "conv2d input channels {} must be divisible by groups {}",
        c_in,
        groups
    );
    let c_in_per_group = c_in / groups;

    let weight_dims = weight.shape().dims();
    if weight.shape().rank() != 4 {
        bail!(
            "conv2d weight must be OIHW [C_out, C_in/groups, KH, KW], got rank {} ({:?})",
            weight.shape().rank(),
            weight_dims
        );
    }
    ensure!(
        weight_dims[1] == c_in_per_group,
        "conv2d weight expects C_in/groups={}, got {:?}",
        c_in_per_group,
        weight_dims
    );
    ensure!(
        weight_dims[2] == params.kernel[0] && weight_dims[3] == params.kernel[1],
        "conv2d weight kernel [{}, {}] must match params [{}, {}]",
        weight_dims[2],
        weight_dims[3],
        params.kernel[0],
        params.kernel[1]
    );
    let c_out = weight_dims[0];
    ensure!(
        c_out % groups == 0,
        "conv2d weight expects C_out divisible by groups={}, got {:?}",
        groups,
        weight_dims
    );
    validate_bias("conv2d", bias, c_out)?;

    let out_h = conv2d_out_dim(
        h,
        params.kernel[0],
        params.stride[0],
        params.dilation[0],
        params.padding.top,
        params.padding.bottom,
    )?;
    let out_w = conv2d_out_dim(
        w,
        params.kernel[1],
        params.stride[1],
        params.dilation[1],
        params.padding.left,
        params.padding.right,
    )?;

    Ok(ValidatedConv {
        n,
        out_h,
        out_w,
        c_out,
    })
}

fn validate_conv_transpose2d_inputs<B: PortableBackend + 'static>(
    x: &DeviceTensor<B>,
    weight: &DeviceTensor<B>,
    bias: Option<&DeviceTensor<B>>,
    params: ConvTranspose2dParams2d,
) -> Result<ValidatedConv> {
    ensure_rank("conv_transpose2d input (NCHW)", x, 4)?;
    let dims = x.shape().dims();
    let (n, c_in, h, w) = (dims[0], dims[1], dims[2], dims[3]);

    let weight_dims = weight.shape().dims();
    if weight.shape().rank() != 4 {
        bail!(
            "conv_transpose2d weight must be IOHW [C_in, C_out, KH, KW], got rank {} ({:?})",
            weight.shape().rank(),
            weight_dims
        );
    }
    ensure!(
        weight_dims[0] == c_in,
        "conv_transpose2d weight expects C_in={}, got {:?}",
        c_in,
        weight_dims
    );
    ensure!(
        weight_dims[2] == params.kernel[0] && weight_dims[3] == params.kernel[1],
        "conv_transpose2d weight kernel [{}, {}] must match params [{}, {}]",
        weight_dims[2],
        weight_dims[3],
        params.kernel[0],
        params.kernel[1]
    );
    let c_out = weight_dims[1];
    validate_bias("conv_transpose2d", bias, c_out)?;

    let out_h = conv_transpose2d_out_dim(
        h,
        params.kernel[0],
        params.stride[0],
        params.padding.top,
        params.padding.bottom,
        params.output_padding[0],
    )?;
    let out_w = conv_transpose2d_out_dim(
        w,
        params.kernel[1],
        params.stride[1],
        params.padding.left,
        params.padding.right,
        params.output_padding[1],
    )?;

    Ok(ValidatedConv {
        n,
        out_h,
        out_w,
        c_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_out_dim_matches_reference_formula() {
        assert_eq!(conv2d_out_dim(16, 3, 1, 1, 1, 1).unwrap(), 16);
        assert_eq!(conv2d_out_dim(16, 2, 2, 1, 0, 0).unwrap(), 8);
        assert_eq!(conv2d_out_dim(5, 3, 2, 2, 0, 0).unwrap(), 1);
        assert!(conv2d_out_dim(2, 3, 1, 1, 0, 0).is_err());
    }

    #[test]
    fn transpose_out_dim_inverts_strided_downsample() {
        assert_eq!(conv_transpose2d_out_dim(8, 2, 2, 0, 0, 0).unwrap(), 16);
        assert_eq!(conv_transpose2d_out_dim(1, 2, 2, 0, 0, 0).unwrap(), 2);
        assert_eq!(conv_transpose2d_out_dim(4, 3, 2, 1, 1, 1).unwrap(), 8);
        assert!(conv_transpose2d_out_dim(4, 2, 2, 0, 0, 2).is_err());
    }
}
