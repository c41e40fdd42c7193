use std::sync::Arc;

use rand::distributions::{Distribution, Uniform};
use rand::{rngs::StdRng, SeedableRng};
use tch::Tensor as TchTensor;
use vnet::backend::spec::PortableBackend;
use vnet::tensor::{DeviceTensor, Shape, Tensor};

/// Absolute and relative slack for float32 kernels that accumulate in a different order.
pub const ATOL: f64 = 5e-4;
pub const RTOL: f64 = 1e-4;

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Uniform samples in `[-1, 1)`.
pub fn random_vec(rng: &mut StdRng, len: usize) -> Vec<f32> {
    random_vec_range(rng, len, -1.0, 1.0)
}

pub fn random_vec_range(rng: &mut StdRng, len: usize, lo: f32, hi: f32) -> Vec<f32> {
    let dist = Uniform::new(lo, hi);
    dist.sample_iter(rng).take(len).collect()
}

pub fn upload<B: PortableBackend + 'static>(
    backend: &Arc<B>,
    dims: &[usize],
    data: &[f32],
) -> DeviceTensor<B> {
    let host = Tensor::from_vec(Shape::new(dims.to_vec()), data.to_vec()).unwrap();
    DeviceTensor::from_host(Arc::clone(backend), host).unwrap()
}

pub fn download<B: PortableBackend + 'static>(tensor: &DeviceTensor<B>) -> Vec<f32> {
    tensor.to_host().unwrap().into_data()
}

pub fn torch_tensor(dims: &[usize], data: &[f32]) -> TchTensor {
    let dims: Vec<i64> = dims.iter().map(|&d| d as i64).collect();
    TchTensor::from_slice(data).reshape(dims.as_slice())
}

pub fn torch_values(tensor: &TchTensor) -> Vec<f32> {
    let flat = tensor.contiguous().flatten(0, -1);
    Vec::<f32>::try_from(&flat).unwrap()
}

pub fn assert_close(expected: &[f32], actual: &[f32]) {
    assert_close_within(expected, actual, ATOL, RTOL);
}

/// [`assert_close`] with explicit slack, for results that went through many layers.
pub fn assert_close_within(expected: &[f32], actual: &[f32], atol: f64, rtol: f64) {
    assert_eq!(expected.len(), actual.len(), "element count differs");
    let worst = expected
        .iter()
        .zip(actual)
        .enumerate()
        .map(|(idx, (&e, &a))| {
            let diff = (e as f64 - a as f64).abs();
            let slack = atol + rtol * (e.abs().max(a.abs()) as f64);
            (idx, e, a, diff - slack)
        })
        .max_by(|lhs, rhs| lhs.3.total_cmp(&rhs.3));
    if let Some((idx, e, a, excess)) = worst {
        assert!(
            excess <= 0.0,
            "index {idx}: torch {e}, backend {a} (beyond tolerance by {excess:e})"
        );
    }
}
