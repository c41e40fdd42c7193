//! Portable operation set and the backend trait that executes it.
//!
//! Operations describe NCHW `f32` primitives with every attribute resolved by the frontend, so a
//! backend only has to check operand arity and compute values. Output specs are always supplied by
//! the caller; backends may re-derive and cross-check them but must not guess.

use std::fmt;
use std::sync::Arc;

/// Logical layout of a tensor as seen by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorSpec {
    pub shape: Vec<usize>,
}

impl TensorSpec {
    pub fn new(shape: Vec<usize>) -> Self {
        Self { shape }
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

/// Dense host payload paired with its spec.
#[derive(Debug, Clone)]
pub struct TensorLiteral {
    pub spec: TensorSpec,
    pub data: Arc<[f32]>,
}

impl TensorLiteral {
    pub fn new(spec: TensorSpec, data: Arc<[f32]>) -> Self {
        Self { spec, data }
    }
}

/// Initial contents for a freshly materialized tensor.
#[derive(Debug, Clone)]
pub enum TensorInit {
    Literal(TensorLiteral),
    Zeroed(TensorSpec),
}

/// Per-axis `(before, after)` padding for the two spatial axes.
pub type SpatialPadding = [(usize, usize); 2];

/// Direct 2D convolution. Operands: `x [N, Cin, H, W]`, `weight [Cout, Cin/groups, KH, KW]`,
/// optional `bias [Cout]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dSpec {
    pub stride: [usize; 2],
    pub padding: SpatialPadding,
    pub dilation: [usize; 2],
    pub groups: usize,
}

/// Transposed 2D convolution (gradient of conv2d w.r.t. its input). Operands:
/// `x [N, Cin, H, W]`, `weight [Cin, Cout, KH, KW]`, optional `bias [Cout]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvTranspose2dSpec {
    pub stride: [usize; 2],
    pub padding: SpatialPadding,
    pub output_padding: [usize; 2],
}

/// Group normalization over `(C / groups, spatial...)`. Operands: `x [N, C, ...]`,
/// `gamma [C]`, `beta [C]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupNormSpec {
    pub groups: usize,
    pub eps: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Relu,
    Elu { alpha: f32 },
    Sigmoid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Mul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcatSpec {
    pub axis: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftmaxSpec {
    pub axis: usize,
}

/// Primitive operations understood by every portable backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Conv2d(Conv2dSpec),
    ConvTranspose2d(ConvTranspose2dSpec),
    GroupNorm(GroupNormSpec),
    ElementwiseUnary(UnaryOp),
    ElementwiseBinary(BinaryOp),
    /// Channel-wise parametric ReLU. Operands: `x [N, C, ...]`, `weight [C]` or `[1]`.
    PRelu,
    Concat(ConcatSpec),
    Softmax(SoftmaxSpec),
    /// Multiplies each `(n, c)` plane by a scalar. Operands: `x [N, C, ...]`, `scale [N, C]`.
    ScaleChannels,
}

impl Operation {
    /// Stable label used in logs, profiling keys, and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Conv2d(_) => "conv2d",
            Operation::ConvTranspose2d(_) => "conv_transpose2d",
            Operation::GroupNorm(_) => "group_norm",
            Operation::ElementwiseUnary(UnaryOp::Relu) => "relu",
            Operation::ElementwiseUnary(UnaryOp::Elu { .. }) => "elu",
            Operation::ElementwiseUnary(UnaryOp::Sigmoid) => "sigmoid",
            Operation::ElementwiseBinary(BinaryOp::Add) => "add",
            Operation::ElementwiseBinary(BinaryOp::Mul) => "mul",
            Operation::PRelu => "prelu",
            Operation::Concat(_) => "concat",
            Operation::Softmax(_) => "softmax",
            Operation::ScaleChannels => "scale_channels",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{op} violates the operation contract: {detail}")]
    SpecViolation { op: &'static str, detail: String },
    #[error("backend execution failure: {message}")]
    Execution { message: String },
}

impl BackendError {
    pub fn spec(op: &'static str, detail: impl Into<String>) -> Self {
        BackendError::SpecViolation {
            op,
            detail: detail.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Portable backend trait that stores tensors and evaluates primitive operations.
pub trait PortableBackend: Send + Sync {
    type TensorHandle: Clone + Send + Sync + 'static;

    /// Returns a human-readable backend identifier (e.g., `"cpu"`).
    fn backend_name(&self) -> &str;

    /// Materialises a tensor handle from host initialisation data.
    fn materialize(&self, init: TensorInit) -> BackendResult<Self::TensorHandle>;

    /// Reads back a tensor handle into a dense literal.
    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral>;

    /// Executes a single operation over already materialised operands.
    fn execute(
        &self,
        op: &Operation,
        inputs: &[Self::TensorHandle],
        output: &TensorSpec,
    ) -> BackendResult<Self::TensorHandle>;
}
