//! Backend-resident tensors.
//!
//! A [`DeviceTensor`] pairs an opaque backend handle with its logical shape and keeps the owning
//! backend alive through an `Arc`. Two tensors may only meet in one operation when they share
//! the same backend *instance*, which [`DeviceTensor::lives_on`] checks by pointer identity.

use std::fmt;
use std::sync::Arc;

use anyhow::{ensure, Result};

use super::{shape::Shape, Tensor};
use crate::backend::spec::{PortableBackend, TensorInit, TensorSpec};

pub struct DeviceTensor<B: PortableBackend + 'static> {
    backend: Arc<B>,
    shape: Shape,
    handle: B::TensorHandle,
}

impl<B: PortableBackend + 'static> Clone for DeviceTensor<B> {
    fn clone(&self) -> Self {
        Self::from_handle(Arc::clone(&self.backend), self.shape.clone(), self.handle.clone())
    }
}

impl<B: PortableBackend + 'static> AsRef<DeviceTensor<B>> for DeviceTensor<B> {
    fn as_ref(&self) -> &DeviceTensor<B> {
        self
    }
}

impl<B: PortableBackend + 'static> DeviceTensor<B> {
    /// Uploads a host tensor.
    pub fn from_host(backend: Arc<B>, tensor: Tensor) -> Result<Self> {
        let handle = backend.materialize(TensorInit::Literal(tensor.to_literal()))?;
        Ok(Self::from_handle(backend, tensor.shape().clone(), handle))
    }

    pub fn from_handle(backend: Arc<B>, shape: Shape, handle: B::TensorHandle) -> Self {
        DeviceTensor {
            backend,
            shape,
            handle,
        }
    }

    /// Asks the backend for zero-filled storage of `shape`.
    pub fn zeros(backend: Arc<B>, shape: Shape) -> Result<Self> {
        let spec = TensorSpec::new(shape.dims().to_vec());
        let handle = backend.materialize(TensorInit::Zeroed(spec))?;
        Ok(Self::from_handle(backend, shape, handle))
    }

    /// Downloads the values; fails if the backend reports a different shape than recorded.
    pub fn to_host(&self) -> Result<Tensor> {
        let tensor = Tensor::from_literal(&self.backend.to_literal(&self.handle)?)?;
        ensure!(
            tensor.shape() == &self.shape,
            "{} returned {:?} for a tensor recorded as {:?}",
            self.backend.backend_name(),
            tensor.shape().dims(),
            self.shape.dims()
        );
        Ok(tensor)
    }

    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    /// True when `backend` is the exact instance owning this tensor.
    pub fn lives_on(&self, backend: &Arc<B>) -> bool {
        Arc::ptr_eq(&self.backend, backend)
    }

    pub fn handle(&self) -> &B::TensorHandle {
        &self.handle
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }
}

impl<B: PortableBackend> fmt::Debug for DeviceTensor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("backend", &self.backend.backend_name())
            .field("shape", &self.shape.dims())
            .finish()
    }
}

/// Accepts either host tensors (uploaded) or device tensors (checked for backend identity)
/// wherever a layer takes its parameters.
pub trait IntoDeviceTensor<B: PortableBackend + 'static> {
    fn into_device_tensor(self, backend: &Arc<B>) -> Result<DeviceTensor<B>>;
}

/// [`IntoDeviceTensor`] for optional parameters such as conv biases.
pub trait IntoDeviceTensorOption<B: PortableBackend + 'static> {
    fn into_device_tensor_option(self, backend: &Arc<B>) -> Result<Option<DeviceTensor<B>>>;
}

impl<B, T> IntoDeviceTensorOption<B> for Option<T>
where
    B: PortableBackend + 'static,
    T: IntoDeviceTensor<B>,
{
    fn into_device_tensor_option(self, backend: &Arc<B>) -> Result<Option<DeviceTensor<B>>> {
        self.map(|value| value.into_device_tensor(backend)).transpose()
    }
}

impl<B: PortableBackend + 'static> IntoDeviceTensor<B> for Tensor {
    fn into_device_tensor(self, backend: &Arc<B>) -> Result<DeviceTensor<B>> {
        DeviceTensor::from_host(Arc::clone(backend), self)
    }
}

impl<B, T> IntoDeviceTensor<B> for T
where
    B: PortableBackend + 'static,
    T: AsRef<DeviceTensor<B>>,
{
    fn into_device_tensor(self, backend: &Arc<B>) -> Result<DeviceTensor<B>> {
        let tensor = self.as_ref();
        ensure!(
            tensor.lives_on(backend),
            "parameter of shape {:?} was materialised on another backend instance",
            tensor.shape().dims()
        );
        Ok(tensor.clone())
    }
}
