//! Straightforward NCHW `f32` kernels for every portable operation.
//!
//! Kernels favour clarity over speed: loops run in logical index order and every operand is
//! checked against the output spec supplied by the frontend before any work happens.

use std::sync::Arc;

use vnet::backend::spec::{
    BackendError, BackendResult, BinaryOp, ConcatSpec, Conv2dSpec, ConvTranspose2dSpec,
    GroupNormSpec, Operation, PortableBackend, SoftmaxSpec, TensorInit, TensorLiteral,
    TensorSpec, UnaryOp,
};

#[derive(Clone, Debug)]
pub struct CpuTensor {
    pub spec: TensorSpec,
    pub data: Arc<[f32]>,
}

impl CpuTensor {
    fn new(spec: TensorSpec, data: Vec<f32>) -> Self {
        Self {
            spec,
            data: Arc::from(data),
        }
    }

    fn dims(&self) -> &[usize] {
        &self.spec.shape
    }
}

#[derive(Clone, Debug, Default)]
pub struct CpuPortableBackend;

impl CpuPortableBackend {
    pub fn new() -> Self {
        Self
    }
}

impl PortableBackend for CpuPortableBackend {
    type TensorHandle = CpuTensor;

    fn backend_name(&self) -> &str {
        "cpu-portable"
    }

    fn materialize(&self, init: TensorInit) -> BackendResult<Self::TensorHandle> {
        match init {
            TensorInit::Literal(lit) => literal_to_tensor(&lit),
            TensorInit::Zeroed(spec) => {
                let len = spec.num_elements();
                Ok(CpuTensor::new(spec, vec![0.0; len]))
            }
        }
    }

    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral> {
        Ok(TensorLiteral::new(tensor.spec.clone(), Arc::clone(&tensor.data)))
    }

    fn execute(
        &self,
        op: &Operation,
        inputs: &[Self::TensorHandle],
        output: &TensorSpec,
    ) -> BackendResult<Self::TensorHandle> {
        let _span = tracing::trace_span!("cpu_execute", op = op.name()).entered();
        execute_operation(op, inputs, output)
    }
}

fn literal_to_tensor(literal: &TensorLiteral) -> BackendResult<CpuTensor> {
    if literal.data.len() != literal.spec.num_elements() {
        return Err(BackendError::execution(format!(
            "literal holds {} values for shape {:?}",
            literal.data.len(),
            literal.spec.shape
        )));
    }
    Ok(CpuTensor {
        spec: literal.spec.clone(),
        data: Arc::clone(&literal.data),
    })
}

fn execute_operation(
    op: &Operation,
    inputs: &[CpuTensor],
    output: &TensorSpec,
) -> BackendResult<CpuTensor> {
    for input in inputs {
        if input.data.len() != input.spec.num_elements() {
            return Err(BackendError::execution(format!(
                "{} operand storage does not match its spec {:?}",
                op.name(),
                input.spec.shape
            )));
        }
    }
    match op {
        Operation::Conv2d(spec) => op_conv2d(inputs, output, spec),
        Operation::ConvTranspose2d(spec) => op_conv_transpose2d(inputs, output, spec),
        Operation::GroupNorm(spec) => op_group_norm(inputs, output, spec),
        Operation::ElementwiseUnary(unary) => op_elementwise_unary(inputs, output, *unary),
        Operation::ElementwiseBinary(binary) => op_elementwise_binary(inputs, output, *binary),
        Operation::PRelu => op_prelu(inputs, output),
        Operation::Concat(spec) => op_concat(inputs, output, spec),
        Operation::Softmax(spec) => op_softmax(inputs, output, spec),
        Operation::ScaleChannels => op_scale_channels(inputs, output),
    }
}

fn expect_single<'a>(
    op: &'static str,
    inputs: &'a [CpuTensor],
) -> BackendResult<&'a CpuTensor> {
    if inputs.len() != 1 {
        Err(BackendError::spec(op, "operation expects single input"))
    } else {
        Ok(&inputs[0])
    }
}

fn expect_output(op: &'static str, output: &TensorSpec, expected: &[usize]) -> BackendResult<()> {
    if output.shape != expected {
        return Err(BackendError::spec(
            op,
            format!(
                "output spec {:?} does not match derived shape {:?}",
                output.shape, expected
            ),
        ));
    }
    Ok(())
}

fn expect_rank(op: &'static str, what: &str, tensor: &CpuTensor, rank: usize) -> BackendResult<()> {
    if tensor.spec.rank() != rank {
        return Err(BackendError::spec(
            op,
            format!("{what} must be rank {rank}, got {:?}", tensor.dims()),
        ));
    }
    Ok(())
}

/// Splits conv operands into `(x, weight, bias)`.
fn conv_operands<'a>(
    op: &'static str,
    inputs: &'a [CpuTensor],
) -> BackendResult<(&'a CpuTensor, &'a CpuTensor, Option<&'a CpuTensor>)> {
    match inputs {
        [x, w] => Ok((x, w, None)),
        [x, w, b] => Ok((x, w, Some(b))),
        _ => Err(BackendError::spec(
            op,
            format!("expects 2 or 3 operands, got {}", inputs.len()),
        )),
    }
}

fn bias_values(
    op: &'static str,
    bias: Option<&CpuTensor>,
    channels: usize,
) -> BackendResult<Vec<f32>> {
    match bias {
        Some(bias) => {
            if bias.dims() != [channels] {
                return Err(BackendError::spec(
                    op,
                    format!("bias {:?} must be [{channels}]", bias.dims()),
                ));
            }
            Ok(bias.data.to_vec())
        }
        None => Ok(vec![0.0; channels]),
    }
}

fn op_conv2d(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &Conv2dSpec,
) -> BackendResult<CpuTensor> {
    const OP: &str = "conv2d";
    let (x, w, bias) = conv_operands(OP, inputs)?;
    expect_rank(OP, "input", x, 4)?;
    expect_rank(OP, "weight", w, 4)?;
    let (n, c_in, h, wd) = (x.dims()[0], x.dims()[1], x.dims()[2], x.dims()[3]);
    let (c_out, c_in_g, kh, kw) = (w.dims()[0], w.dims()[1], w.dims()[2], w.dims()[3]);
    let groups = spec.groups;
    if groups == 0 || c_in != c_in_g * groups || c_out % groups != 0 {
        return Err(BackendError::spec(
            OP,
            format!(
                "input {:?} and weight {:?} disagree for groups={groups}",
                x.dims(),
                w.dims()
            ),
        ));
    }
    if spec.stride.contains(&0) || spec.dilation.contains(&0) {
        return Err(BackendError::spec(OP, "stride and dilation must be > 0"));
    }
    let bias = bias_values(OP, bias, c_out)?;

    let out_extent = |input: usize, k: usize, axis: usize| -> BackendResult<usize> {
        let (before, after) = spec.padding[axis];
        let effective = (k - 1) * spec.dilation[axis] + 1;
        let padded = input + before + after;
        if padded < effective {
            return Err(BackendError::spec(OP, "kernel exceeds padded input"));
        }
        Ok((padded - effective) / spec.stride[axis] + 1)
    };
    let oh = out_extent(h, kh, 0)?;
    let ow = out_extent(wd, kw, 1)?;
    expect_output(OP, output, &[n, c_out, oh, ow])?;

    let c_out_g = c_out / groups;
    let (pad_top, pad_left) = (spec.padding[0].0 as isize, spec.padding[1].0 as isize);
    let mut out = vec![0.0f32; n * c_out * oh * ow];
    for b in 0..n {
        for oc in 0..c_out {
            let g = oc / c_out_g;
            let plane = &mut out[(b * c_out + oc) * oh * ow..][..oh * ow];
            plane.fill(bias[oc]);
            for icg in 0..c_in_g {
                let ic = g * c_in_g + icg;
                let x_plane = &x.data[(b * c_in + ic) * h * wd..][..h * wd];
                for ky in 0..kh {
                    for kx in 0..kw {
                        let weight = w.data[((oc * c_in_g + icg) * kh + ky) * kw + kx];
                        for oy in 0..oh {
                            let iy =
                                (oy * spec.stride[0] + ky * spec.dilation[0]) as isize - pad_top;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            let row = &x_plane[iy as usize * wd..][..wd];
                            let dst = &mut plane[oy * ow..][..ow];
                            for (ox, acc) in dst.iter_mut().enumerate() {
                                let ix = (ox * spec.stride[1] + kx * spec.dilation[1]) as isize
                                    - pad_left;
                                if ix >= 0 && ix < wd as isize {
                                    *acc += weight * row[ix as usize];
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(CpuTensor::new(output.clone(), out))
}

fn op_conv_transpose2d(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &ConvTranspose2dSpec,
) -> BackendResult<CpuTensor> {
    const OP: &str = "conv_transpose2d";
    let (x, w, bias) = conv_operands(OP, inputs)?;
    expect_rank(OP, "input", x, 4)?;
    expect_rank(OP, "weight", w, 4)?;
    let (n, c_in, h, wd) = (x.dims()[0], x.dims()[1], x.dims()[2], x.dims()[3]);
    let (w_in, c_out, kh, kw) = (w.dims()[0], w.dims()[1], w.dims()[2], w.dims()[3]);
    if w_in != c_in {
        return Err(BackendError::spec(
            OP,
            format!("weight {:?} expects {w_in} input channels, got {c_in}", w.dims()),
        ));
    }
    if spec.stride.contains(&0) {
        return Err(BackendError::spec(OP, "stride must be > 0"));
    }
    let bias = bias_values(OP, bias, c_out)?;

    let out_extent = |input: usize, k: usize, axis: usize| -> BackendResult<usize> {
        let (before, after) = spec.padding[axis];
        let full = (input - 1) * spec.stride[axis] + k + spec.output_padding[axis];
        if full <= before + after {
            return Err(BackendError::spec(OP, "padding consumes the whole output"));
        }
        Ok(full - before - after)
    };
    if h == 0 || wd == 0 {
        return Err(BackendError::spec(OP, "input spatial extent must be > 0"));
    }
    let oh = out_extent(h, kh, 0)?;
    let ow = out_extent(wd, kw, 1)?;
    expect_output(OP, output, &[n, c_out, oh, ow])?;

    let (pad_top, pad_left) = (spec.padding[0].0 as isize, spec.padding[1].0 as isize);
    let mut out = vec![0.0f32; n * c_out * oh * ow];
    for b in 0..n {
        for oc in 0..c_out {
            out[(b * c_out + oc) * oh * ow..][..oh * ow].fill(bias[oc]);
        }
        for ic in 0..c_in {
            let x_plane = &x.data[(b * c_in + ic) * h * wd..][..h * wd];
            for oc in 0..c_out {
                let plane = &mut out[(b * c_out + oc) * oh * ow..][..oh * ow];
                for ky in 0..kh {
                    for kx in 0..kw {
                        let weight = w.data[((ic * c_out + oc) * kh + ky) * kw + kx];
                        for iy in 0..h {
                            let oy = (iy * spec.stride[0] + ky) as isize - pad_top;
                            if oy < 0 || oy >= oh as isize {
                                continue;
                            }
                            let row = &x_plane[iy * wd..][..wd];
                            for (ix, &value) in row.iter().enumerate() {
                                let ox = (ix * spec.stride[1] + kx) as isize - pad_left;
                                if ox >= 0 && ox < ow as isize {
                                    plane[oy as usize * ow + ox as usize] += weight * value;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(CpuTensor::new(output.clone(), out))
}

fn op_group_norm(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &GroupNormSpec,
) -> BackendResult<CpuTensor> {
    const OP: &str = "group_norm";
    let [x, gamma, beta] = inputs else {
        return Err(BackendError::spec(OP, "expects x, gamma, beta"));
    };
    if x.spec.rank() < 2 {
        return Err(BackendError::spec(OP, "input must be at least rank 2"));
    }
    let dims = x.dims();
    let (n, c) = (dims[0], dims[1]);
    if spec.groups == 0 || c % spec.groups != 0 {
        return Err(BackendError::spec(
            OP,
            format!("channels {c} not divisible by groups {}", spec.groups),
        ));
    }
    if gamma.dims() != [c] || beta.dims() != [c] {
        return Err(BackendError::spec(OP, "gamma and beta must be [C]"));
    }
    expect_output(OP, output, dims)?;

    let spatial: usize = dims[2..].iter().product();
    let group_size = c / spec.groups;
    let group_len = group_size * spatial;
    let mut out = vec![0.0f32; x.data.len()];
    for b in 0..n {
        for g in 0..spec.groups {
            let start = (b * c + g * group_size) * spatial;
            let values = &x.data[start..start + group_len];
            let mean = values.iter().map(|&v| v as f64).sum::<f64>() / group_len as f64;
            let var = values
                .iter()
                .map(|&v| {
                    let d = v as f64 - mean;
                    d * d
                })
                .sum::<f64>()
                / group_len as f64;
            let inv_std = 1.0 / (var + spec.eps as f64).sqrt();
            for local in 0..group_size {
                let ch = g * group_size + local;
                let (scale, shift) = (gamma.data[ch], beta.data[ch]);
                let offset = local * spatial;
                for i in 0..spatial {
                    let normalized = ((values[offset + i] as f64 - mean) * inv_std) as f32;
                    out[start + offset + i] = normalized * scale + shift;
                }
            }
        }
    }
    Ok(CpuTensor::new(output.clone(), out))
}

fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

fn op_elementwise_unary(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    op: UnaryOp,
) -> BackendResult<CpuTensor> {
    let input = expect_single("elementwise_unary", inputs)?;
    expect_output("elementwise_unary", output, input.dims())?;
    let values = input.data.as_ref();
    let result: Vec<f32> = match op {
        UnaryOp::Relu => values.iter().map(|&x| x.max(0.0)).collect(),
        UnaryOp::Elu { alpha } => values
            .iter()
            .map(|&x| if x > 0.0 { x } else { alpha * x.exp_m1() })
            .collect(),
        UnaryOp::Sigmoid => values.iter().map(|&x| sigmoid(x)).collect(),
    };
    Ok(CpuTensor::new(output.clone(), result))
}

fn op_elementwise_binary(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    op: BinaryOp,
) -> BackendResult<CpuTensor> {
    const OP: &str = "elementwise_binary";
    let [lhs, rhs] = inputs else {
        return Err(BackendError::spec(OP, "expects two operands"));
    };
    if lhs.dims() != rhs.dims() {
        return Err(BackendError::spec(
            OP,
            format!("shape mismatch {:?} vs {:?}", lhs.dims(), rhs.dims()),
        ));
    }
    expect_output(OP, output, lhs.dims())?;
    let pairs = lhs.data.iter().zip(rhs.data.iter());
    let result: Vec<f32> = match op {
        BinaryOp::Add => pairs.map(|(&a, &b)| a + b).collect(),
        BinaryOp::Mul => pairs.map(|(&a, &b)| a * b).collect(),
    };
    Ok(CpuTensor::new(output.clone(), result))
}

fn op_prelu(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    const OP: &str = "prelu";
    let [x, weight] = inputs else {
        return Err(BackendError::spec(OP, "expects x and weight"));
    };
    if x.spec.rank() < 2 {
        return Err(BackendError::spec(OP, "input must be at least rank 2"));
    }
    let c = x.dims()[1];
    let slopes = weight.data.len();
    if weight.spec.rank() != 1 || (slopes != c && slopes != 1) {
        return Err(BackendError::spec(
            OP,
            format!("weight {:?} must be [{c}] or [1]", weight.dims()),
        ));
    }
    expect_output(OP, output, x.dims())?;
    let spatial: usize = x.dims()[2..].iter().product();
    let result: Vec<f32> = x
        .data
        .iter()
        .enumerate()
        .map(|(idx, &v)| {
            if v >= 0.0 {
                v
            } else {
                let ch = if slopes == 1 { 0 } else { (idx / spatial) % c };
                v * weight.data[ch]
            }
        })
        .collect();
    Ok(CpuTensor::new(output.clone(), result))
}

fn op_concat(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &ConcatSpec,
) -> BackendResult<CpuTensor> {
    const OP: &str = "concat";
    let first = inputs
        .first()
        .ok_or_else(|| BackendError::spec(OP, "expects at least one input"))?;
    let rank = first.spec.rank();
    let axis = spec.axis;
    if axis >= rank {
        return Err(BackendError::spec(OP, "axis out of range"));
    }
    let mut out_dims = first.dims().to_vec();
    out_dims[axis] = 0;
    for tensor in inputs {
        let dims = tensor.dims();
        if dims.len() != rank {
            return Err(BackendError::spec(OP, "rank mismatch"));
        }
        for (idx, (&dim, &first_dim)) in dims.iter().zip(first.dims()).enumerate() {
            if idx != axis && dim != first_dim {
                return Err(BackendError::spec(OP, "dimension mismatch"));
            }
        }
        out_dims[axis] += dims[axis];
    }
    expect_output(OP, output, &out_dims)?;

    let inner: usize = out_dims[axis + 1..].iter().product();
    let outer: usize = out_dims[..axis].iter().product();
    let mut result = Vec::with_capacity(output.num_elements());
    for outer_idx in 0..outer {
        for tensor in inputs {
            let chunk = tensor.dims()[axis] * inner;
            result.extend_from_slice(&tensor.data[outer_idx * chunk..][..chunk]);
        }
    }
    Ok(CpuTensor::new(output.clone(), result))
}

fn op_softmax(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &SoftmaxSpec,
) -> BackendResult<CpuTensor> {
    const OP: &str = "softmax";
    let input = expect_single(OP, inputs)?;
    let dims = input.dims();
    if spec.axis >= dims.len() {
        return Err(BackendError::spec(OP, "axis out of range"));
    }
    expect_output(OP, output, dims)?;
    let len = dims[spec.axis];
    let inner: usize = dims[spec.axis + 1..].iter().product();
    let outer: usize = dims[..spec.axis].iter().product();
    let mut out = vec![0.0f32; input.data.len()];
    for o in 0..outer {
        for i in 0..inner {
            let base = o * len * inner + i;
            let max = (0..len)
                .map(|k| input.data[base + k * inner])
                .fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            for k in 0..len {
                let e = (input.data[base + k * inner] - max).exp();
                out[base + k * inner] = e;
                sum += e;
            }
            for k in 0..len {
                out[base + k * inner] /= sum;
            }
        }
    }
    Ok(CpuTensor::new(output.clone(), out))
}

fn op_scale_channels(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    const OP: &str = "scale_channels";
    let [x, scale] = inputs else {
        return Err(BackendError::spec(OP, "expects x and scale"));
    };
    if x.spec.rank() < 2 {
        return Err(BackendError::spec(OP, "input must be at least rank 2"));
    }
    let (n, c) = (x.dims()[0], x.dims()[1]);
    if scale.dims() != [n, c] {
        return Err(BackendError::spec(
            OP,
            format!("scale {:?} must be [{n}, {c}]", scale.dims()),
        ));
    }
    expect_output(OP, output, x.dims())?;
    let spatial: usize = x.dims()[2..].iter().product();
    let result: Vec<f32> = x
        .data
        .iter()
        .enumerate()
        .map(|(idx, &v)| v * scale.data[idx / spatial.max(1)])
        .collect();
    Ok(CpuTensor::new(output.clone(), result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(shape: &[usize], data: Vec<f32>) -> CpuTensor {
        CpuTensor::new(TensorSpec::new(shape.to_vec()), data)
    }

    fn run(op: Operation, inputs: &[CpuTensor], out: &[usize]) -> BackendResult<CpuTensor> {
        CpuPortableBackend::new().execute(&op, inputs, &TensorSpec::new(out.to_vec()))
    }

    #[test]
    fn rejects_mismatched_output_spec() {
        let x = tensor(&[1, 2], vec![1.0, 2.0]);
        let err = run(Operation::ElementwiseUnary(UnaryOp::Relu), &[x], &[2, 1]).unwrap_err();
        assert!(matches!(err, BackendError::SpecViolation { op: "elementwise_unary", .. }));
    }

    #[test]
    fn unary_ops_take_exactly_one_operand() {
        let x = tensor(&[1, 2], vec![-1.0, 2.0]);
        let err = run(
            Operation::ElementwiseUnary(UnaryOp::Relu),
            &[x.clone(), x.clone()],
            &[1, 2],
        )
        .unwrap_err();
        assert!(matches!(err, BackendError::SpecViolation { op: "elementwise_unary", .. }));

        let out = run(Operation::ElementwiseUnary(UnaryOp::Relu), &[x], &[1, 2]).unwrap();
        assert_eq!(out.data.as_ref(), &[0.0, 2.0]);
    }

    #[test]
    fn concat_interleaves_along_inner_axis() {
        let a = tensor(&[2, 1], vec![1.0, 2.0]);
        let b = tensor(&[2, 2], vec![3.0, 4.0, 5.0, 6.0]);
        let out = run(Operation::Concat(ConcatSpec { axis: 1 }), &[a, b], &[2, 3]).unwrap();
        assert_eq!(out.data.as_ref(), &[1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);
    }

    #[test]
    fn strided_conv_then_transpose_restores_extent() {
        let x = tensor(&[1, 1, 4, 4], (0..16).map(|v| v as f32).collect());
        let w = tensor(&[1, 1, 2, 2], vec![0.25; 4]);
        let down = run(
            Operation::Conv2d(Conv2dSpec {
                stride: [2, 2],
                padding: [(0, 0), (0, 0)],
                dilation: [1, 1],
                groups: 1,
            }),
            &[x, w.clone()],
            &[1, 1, 2, 2],
        )
        .unwrap();
        assert_eq!(down.data.as_ref(), &[2.5, 4.5, 10.5, 12.5]);

        let up = run(
            Operation::ConvTranspose2d(ConvTranspose2dSpec {
                stride: [2, 2],
                padding: [(0, 0), (0, 0)],
                output_padding: [0, 0],
            }),
            &[down, w],
            &[1, 1, 4, 4],
        )
        .unwrap();
        assert_eq!(&up.data[0..4], &[0.625, 0.625, 1.125, 1.125]);
    }
}
