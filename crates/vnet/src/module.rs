//! Parameter traversal shared by layers and models.
//!
//! Modules expose their tensors through visitors that build dotted names
//! (`down_tr32.ops.0.conv1.weight`). Checkpointing, inspection, and parameter counting all go
//! through this single path so names stay consistent everywhere.

use anyhow::{ensure, Result};

use crate::backend::spec::PortableBackend;
use crate::tensor::DeviceTensor;

pub type VisitParamsFn<'a, B> = dyn FnMut(&str, TensorRole, &DeviceTensor<B>) -> Result<()> + 'a;
pub type VisitParamsMutFn<'a, B> =
    dyn FnMut(&str, TensorRole, &mut DeviceTensor<B>) -> Result<()> + 'a;

/// What a visited tensor is. Every tensor in this crate is learnable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TensorRole {
    Parameter,
}

#[derive(Default)]
struct ParamPath {
    segments: Vec<String>,
    scratch: String,
}

fn check_segment(kind: &str, segment: &str) -> Result<()> {
    ensure!(!segment.is_empty(), "parameter {kind} must be non-empty");
    ensure!(
        !segment.contains('.'),
        "parameter {kind} must not contain '.', got '{segment}'"
    );
    ensure!(
        segment.is_ascii(),
        "parameter {kind} must be ASCII, got '{segment}'"
    );
    Ok(())
}

impl ParamPath {
    fn push(&mut self, segment: &str) -> Result<()> {
        check_segment("path segments", segment)?;
        self.segments.push(segment.to_string());
        Ok(())
    }

    fn pop(&mut self) {
        let _ = self.segments.pop();
    }

    fn join(&mut self, leaf: &str) -> Result<&str> {
        check_segment("leaf names", leaf)?;
        self.scratch.clear();
        for seg in &self.segments {
            self.scratch.push_str(seg);
            self.scratch.push('.');
        }
        self.scratch.push_str(leaf);
        Ok(self.scratch.as_str())
    }
}

pub struct ParamVisitor<'a, B: PortableBackend + 'static> {
    path: ParamPath,
    f: &'a mut VisitParamsFn<'a, B>,
}

impl<'a, B: PortableBackend + 'static> ParamVisitor<'a, B> {
    pub fn new(f: &'a mut VisitParamsFn<'a, B>) -> Self {
        Self {
            path: ParamPath::default(),
            f,
        }
    }

    pub fn scoped(
        &mut self,
        segment: &str,
        inner: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.path.push(segment)?;
        let out = inner(self);
        self.path.pop();
        out
    }

    pub fn param(&mut self, leaf: &str, role: TensorRole, tensor: &DeviceTensor<B>) -> Result<()> {
        let name = self.path.join(leaf)?;
        (self.f)(name, role, tensor)
    }
}

pub struct ParamVisitorMut<'a, B: PortableBackend + 'static> {
    path: ParamPath,
    f: &'a mut VisitParamsMutFn<'a, B>,
}

impl<'a, B: PortableBackend + 'static> ParamVisitorMut<'a, B> {
    pub fn new(f: &'a mut VisitParamsMutFn<'a, B>) -> Self {
        Self {
            path: ParamPath::default(),
            f,
        }
    }

    pub fn scoped(
        &mut self,
        segment: &str,
        inner: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.path.push(segment)?;
        let out = inner(self);
        self.path.pop();
        out
    }

    pub fn param(
        &mut self,
        leaf: &str,
        role: TensorRole,
        tensor: &mut DeviceTensor<B>,
    ) -> Result<()> {
        let name = self.path.join(leaf)?;
        (self.f)(name, role, tensor)
    }
}

pub trait Module<B: PortableBackend + 'static> {
    fn visit_params(&self, v: &mut ParamVisitor<'_, B>) -> Result<()>;
    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_, B>) -> Result<()>;
}

/// Calls `f` with the dotted name of every tensor reachable from `module`, in visit order.
pub fn for_each_parameter<B, M, F>(module: &M, mut f: F) -> Result<()>
where
    B: PortableBackend + 'static,
    M: Module<B> + ?Sized,
    F: FnMut(&str, TensorRole, &DeviceTensor<B>) -> Result<()>,
{
    let mut visitor = ParamVisitor::new(&mut f);
    module.visit_params(&mut visitor)
}

/// Mutable counterpart of [`for_each_parameter`].
pub fn for_each_parameter_mut<B, M, F>(module: &mut M, mut f: F) -> Result<()>
where
    B: PortableBackend + 'static,
    M: Module<B> + ?Sized,
    F: FnMut(&str, TensorRole, &mut DeviceTensor<B>) -> Result<()>,
{
    let mut visitor = ParamVisitorMut::new(&mut f);
    module.visit_params_mut(&mut visitor)
}

/// Total number of scalar values held in the tensors of `module`.
pub fn parameter_count<B, M>(module: &M) -> Result<usize>
where
    B: PortableBackend + 'static,
    M: Module<B> + ?Sized,
{
    let mut total = 0usize;
    for_each_parameter(module, |_, _, tensor| {
        total += tensor.shape().num_elements();
        Ok(())
    })?;
    Ok(total)
}
