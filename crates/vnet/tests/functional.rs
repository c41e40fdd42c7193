use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use vnet::ops::functional::{self, Conv2dParams2d, ConvTranspose2dParams2d, DeviceTensorOps};
use vnet::tensor::{DeviceTensor, Shape, Tensor};
use vnet_backend_ref_cpu::CpuPortableBackend;

fn cpu_backend() -> Arc<CpuPortableBackend> {
    Arc::new(CpuPortableBackend::new())
}

fn filled(
    backend: &Arc<CpuPortableBackend>,
    dims: &[usize],
    value: f32,
) -> DeviceTensor<CpuPortableBackend> {
    DeviceTensor::from_host(Arc::clone(backend), Tensor::full(Shape::new(dims.to_vec()), value))
        .unwrap()
}

#[test]
fn conv2d_rejects_channel_mismatch() {
    let backend = cpu_backend();
    let x = filled(&backend, &[1, 3, 8, 8], 1.0);
    let w = filled(&backend, &[4, 2, 3, 3], 1.0);
    let err = functional::conv2d(backend.as_ref(), &x, &w, None, Conv2dParams2d::square(3, 1, 1))
        .unwrap_err()
        .to_string();
    assert!(err.contains("C_in/groups=3"), "{err}");
}

#[test]
fn conv2d_rejects_kernel_larger_than_input() {
    let backend = cpu_backend();
    let x = filled(&backend, &[1, 1, 2, 2], 1.0);
    let w = filled(&backend, &[1, 1, 3, 3], 1.0);
    assert!(
        functional::conv2d(backend.as_ref(), &x, &w, None, Conv2dParams2d::square(3, 1, 0))
            .is_err()
    );
}

#[test]
fn conv_transpose2d_doubles_extent() {
    let backend = cpu_backend();
    let x = filled(&backend, &[2, 4, 3, 5], 1.0);
    let w = filled(&backend, &[4, 6, 2, 2], 0.5);
    let b = filled(&backend, &[6], 1.0);
    let y = functional::conv_transpose2d(
        backend.as_ref(),
        &x,
        &w,
        Some(&b),
        ConvTranspose2dParams2d::square(2, 2),
    )
    .unwrap();
    assert_eq!(y.shape().dims(), &[2, 6, 6, 10]);
    assert!(y.to_host().unwrap().data().iter().all(|&v| v == 3.0));
}

#[test]
fn group_norm_requires_divisible_channels() {
    let backend = cpu_backend();
    let x = filled(&backend, &[1, 12, 2, 2], 1.0);
    let gamma = filled(&backend, &[12], 1.0);
    let beta = filled(&backend, &[12], 0.0);
    assert!(functional::group_norm(backend.as_ref(), &x, &gamma, &beta, 8, 1e-5).is_err());
    assert!(functional::group_norm(backend.as_ref(), &x, &gamma, &beta, 4, 0.0).is_err());

    let y = functional::group_norm(backend.as_ref(), &x, &gamma, &beta, 4, 1e-5).unwrap();
    assert!(y.to_host().unwrap().data().iter().all(|&v| v == 0.0));
}

#[test]
fn prelu_rejects_wrong_slope_count() {
    let backend = cpu_backend();
    let x = filled(&backend, &[1, 4, 2, 2], -1.0);
    let slopes = filled(&backend, &[3], 0.25);
    assert!(functional::prelu(backend.as_ref(), &x, &slopes).is_err());

    let shared = filled(&backend, &[1], 0.1);
    let y = functional::prelu(backend.as_ref(), &x, &shared).unwrap();
    assert!(y
        .to_host()
        .unwrap()
        .data()
        .iter()
        .all(|&v| (v + 0.1).abs() < 1e-6));
}

#[test]
fn concat_and_softmax_validate_axes() {
    let backend = cpu_backend();
    let a = filled(&backend, &[1, 2, 4, 4], 1.0);
    let b = filled(&backend, &[1, 2, 2, 4], 1.0);
    assert!(functional::concat(backend.as_ref(), &[&a, &b], 1).is_err());
    assert!(functional::concat(backend.as_ref(), &[], 1).is_err());
    assert!(functional::softmax(backend.as_ref(), &a, 4).is_err());

    let y = functional::concat(backend.as_ref(), &[&a, &b], 2).unwrap();
    assert_eq!(y.shape().dims(), &[1, 2, 6, 4]);
}

#[test]
fn elementwise_ops_require_matching_shapes() {
    let backend = cpu_backend();
    let a = filled(&backend, &[1, 2, 4, 4], 2.0);
    let b = filled(&backend, &[1, 2, 4, 4], 3.0);
    let c = filled(&backend, &[1, 1, 4, 4], 3.0);

    assert!(a.add(&c).is_err());
    assert!(a.add(&b).unwrap().to_host().unwrap().data().iter().all(|&v| v == 5.0));
    assert!(a.mul(&b).unwrap().to_host().unwrap().data().iter().all(|&v| v == 6.0));

    let zeros = DeviceTensor::zeros(Arc::clone(&backend), Shape::new([1, 2, 4, 4])).unwrap();
    let sum = a.add(&zeros).unwrap().to_host().unwrap();
    assert_eq!(sum.data(), a.to_host().unwrap().data());
}

#[test]
fn dropout2d_validates_probability() {
    let backend = cpu_backend();
    let x = filled(&backend, &[1, 4, 2, 2], 1.0);
    let mut rng = StdRng::seed_from_u64(0);
    assert!(functional::dropout2d(backend.as_ref(), &x, 1.0, true, &mut rng).is_err());
    assert!(functional::dropout2d(backend.as_ref(), &x, -0.1, false, &mut rng).is_err());

    let y = functional::dropout2d(backend.as_ref(), &x, 0.0, true, &mut rng).unwrap();
    assert!(y.to_host().unwrap().data().iter().all(|&v| v == 1.0));
}

#[test]
fn ops_reject_mixed_backends() {
    let backend = cpu_backend();
    let other = cpu_backend();
    let a = filled(&backend, &[1, 2, 2, 2], 1.0);
    let b = filled(&other, &[1, 2, 2, 2], 1.0);
    assert!(functional::add(backend.as_ref(), &a, &b).is_err());
    assert!(functional::relu(other.as_ref(), &a).is_err());
}
