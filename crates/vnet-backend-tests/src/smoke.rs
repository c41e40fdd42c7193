use std::fs;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::SeedableRng;
use vnet::backend::spec::PortableBackend;
use vnet::checkpoint::{CheckpointLoader, CheckpointSaver};
use vnet::module::for_each_parameter;
use vnet::ops::functional::{self, Conv2dParams2d, ConvTranspose2dParams2d};
use vnet::tensor::{DeviceTensor, Shape, Tensor};
use vnet::{VNet2d, VNet2dConfig};

const TOL: f32 = 1e-4;

fn upload<B: PortableBackend + 'static>(
    backend: &Arc<B>,
    dims: &[usize],
    data: Vec<f32>,
) -> DeviceTensor<B> {
    let host = Tensor::from_vec(Shape::new(dims.to_vec()), data).unwrap();
    DeviceTensor::from_host(Arc::clone(backend), host).unwrap()
}

fn assert_approx(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (idx, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= TOL,
            "value mismatch at index {idx}: expected {e}, actual {a}"
        );
    }
}

pub fn conv2d_matches_expected<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let x = upload(backend, &[1, 1, 3, 3], (1..=9).map(|v| v as f32).collect());
    let w = upload(backend, &[1, 1, 3, 3], vec![1.0; 9]);
    let b = upload(backend, &[1], vec![0.5]);

    let y = functional::conv2d(
        backend.as_ref(),
        &x,
        &w,
        Some(&b),
        Conv2dParams2d::square(3, 1, 1),
    )
    .unwrap();
    assert_eq!(y.shape().dims(), &[1, 1, 3, 3]);

    let expected: Vec<f32> = [12.0, 21.0, 16.0, 27.0, 45.0, 33.0, 24.0, 39.0, 28.0]
        .iter()
        .map(|v| v + 0.5)
        .collect();
    assert_approx(y.to_host().unwrap().data(), &expected);
}

pub fn conv_transpose2d_matches_expected<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let x = upload(backend, &[1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]);
    let w = upload(backend, &[1, 1, 2, 2], vec![1.0, 10.0, 100.0, 1000.0]);

    let y = functional::conv_transpose2d(
        backend.as_ref(),
        &x,
        &w,
        None,
        ConvTranspose2dParams2d::square(2, 2),
    )
    .unwrap();
    assert_eq!(y.shape().dims(), &[1, 1, 4, 4]);

    #[rustfmt::skip]
    let expected = [
        1.0, 10.0, 2.0, 20.0,
        100.0, 1000.0, 200.0, 2000.0,
        3.0, 30.0, 4.0, 40.0,
        300.0, 3000.0, 400.0, 4000.0,
    ];
    assert_approx(y.to_host().unwrap().data(), &expected);
}

pub fn group_norm_matches_expected<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let x = upload(backend, &[1, 2, 1, 2], vec![1.0, 3.0, 10.0, 30.0]);
    let gamma = upload(backend, &[2], vec![1.0, 2.0]);
    let beta = upload(backend, &[2], vec![0.0, 1.0]);

    let y = functional::group_norm(backend.as_ref(), &x, &gamma, &beta, 2, 1e-5).unwrap();
    assert_approx(y.to_host().unwrap().data(), &[-1.0, 1.0, -1.0, 3.0]);
}

pub fn activations_match_expected<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let x = upload(backend, &[1, 3], vec![-1.0, 0.0, 2.0]);
    let elu = functional::elu(backend.as_ref(), &x, 1.0).unwrap();
    assert_approx(elu.to_host().unwrap().data(), &[-0.632_120_6, 0.0, 2.0]);

    let sigmoid = functional::sigmoid(backend.as_ref(), &x).unwrap();
    assert_approx(
        sigmoid.to_host().unwrap().data(),
        &[0.268_941_43, 0.5, 0.880_797_1],
    );

    let relu = functional::relu(backend.as_ref(), &x).unwrap();
    assert_approx(relu.to_host().unwrap().data(), &[0.0, 0.0, 2.0]);

    let x = upload(backend, &[1, 2, 2], vec![-1.0, 2.0, -4.0, 4.0]);
    let slopes = upload(backend, &[2], vec![0.25, 0.5]);
    let prelu = functional::prelu(backend.as_ref(), &x, &slopes).unwrap();
    assert_approx(prelu.to_host().unwrap().data(), &[-0.25, 2.0, -2.0, 4.0]);
}

pub fn softmax_over_channels_matches_expected<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let x = upload(backend, &[1, 2, 1, 2], vec![0.0, 0.0, 3.0f32.ln(), 0.0]);
    let y = functional::softmax(backend.as_ref(), &x, 1).unwrap();
    assert_approx(y.to_host().unwrap().data(), &[0.25, 0.5, 0.75, 0.5]);
}

pub fn concat_preserves_operand_order<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let a = upload(backend, &[1, 1, 1, 2], vec![1.0, 2.0]);
    let b = upload(backend, &[1, 2, 1, 2], vec![3.0, 4.0, 5.0, 6.0]);
    let channels = functional::concat(backend.as_ref(), &[&a, &b], 1).unwrap();
    assert_eq!(channels.shape().dims(), &[1, 3, 1, 2]);
    assert_eq!(
        channels.to_host().unwrap().data(),
        &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
    );

    let c = upload(backend, &[1, 1, 1, 1], vec![9.0]);
    let width = functional::concat(backend.as_ref(), &[&a, &c], 3).unwrap();
    assert_eq!(width.to_host().unwrap().data(), &[1.0, 2.0, 9.0]);
}

pub fn dropout2d_zeroes_whole_channels<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let (n, c, spatial) = (2, 8, 16);
    let x = upload(backend, &[n, c, 4, 4], vec![1.0; n * c * spatial]);
    let mut rng = StdRng::seed_from_u64(3);

    let eval = functional::dropout2d(backend.as_ref(), &x, 0.5, false, &mut rng).unwrap();
    assert!(eval.to_host().unwrap().data().iter().all(|&v| v == 1.0));

    let y = functional::dropout2d(backend.as_ref(), &x, 0.5, true, &mut rng).unwrap();
    let host = y.to_host().unwrap();
    let mut dropped = 0;
    for plane in host.data().chunks(spatial) {
        let first = plane[0];
        assert!(first == 0.0 || (first - 2.0).abs() < TOL, "unexpected scale {first}");
        assert!(plane.iter().all(|&v| v == first));
        if first == 0.0 {
            dropped += 1;
        }
    }
    assert!(dropped > 0 && dropped < n * c);
}

pub fn vnet2d_forward_shape<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let mut rng = StdRng::seed_from_u64(42);
    let config = VNet2dConfig::new(1, 3, true);
    let model = VNet2d::random(config, Arc::clone(backend), &mut rng).unwrap();

    let x = upload(
        backend,
        &[1, 1, 16, 16],
        (0..256).map(|i| (i as f32 * 0.37).sin()).collect(),
    );
    let output = model.forward(&x).unwrap();
    assert_eq!(output.logits.shape().dims(), &[1, 3, 16, 16]);
    assert_eq!(output.probabilities.shape().dims(), &[1, 3, 16, 16]);

    let probs = output.probabilities.to_host().unwrap();
    let plane = 16 * 16;
    for pixel in 0..plane {
        let sum: f32 = (0..3).map(|k| probs.data()[k * plane + pixel]).sum();
        assert!((sum - 1.0).abs() < 1e-4, "pixel {pixel} sums to {sum}");
    }
}

pub fn vnet2d_single_class_uses_sigmoid<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let mut rng = StdRng::seed_from_u64(5);
    let config = VNet2dConfig::new(2, 1, false);
    let model = VNet2d::random(config, Arc::clone(backend), &mut rng).unwrap();

    let x = upload(
        backend,
        &[2, 2, 16, 32],
        (0..2 * 2 * 16 * 32).map(|i| ((i % 17) as f32 - 8.0) / 8.0).collect(),
    );
    let output = model.forward(&x).unwrap();
    assert_eq!(output.probabilities.shape().dims(), &[2, 1, 16, 32]);

    let logits = output.logits.to_host().unwrap();
    let probs = output.probabilities.to_host().unwrap();
    for (&logit, &p) in logits.data().iter().zip(probs.data()) {
        let expected = 1.0 / (1.0 + (-logit).exp());
        assert!((p - expected).abs() < 1e-5);
    }
}

pub fn checkpoint_roundtrip<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let mut rng = StdRng::seed_from_u64(11);
    let config = VNet2dConfig::new(1, 2, false);
    let model = VNet2d::random(config.clone(), Arc::clone(backend), &mut rng).unwrap();

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let path = std::env::temp_dir().join(format!("vnet_checkpoint_{timestamp}.bin"));
    CheckpointSaver::save(&path, &model).unwrap();
    let loaded = CheckpointLoader::load(&path).unwrap();
    let loaded_model = loaded.into_model(Arc::clone(backend)).unwrap();
    fs::remove_file(&path).unwrap();
    assert_eq!(loaded_model.config, config);

    let mut original = Vec::new();
    for_each_parameter(&model, |name, _, tensor| {
        original.push((name.to_string(), tensor.to_host()?.into_data()));
        Ok(())
    })
    .unwrap();
    let mut restored = Vec::new();
    for_each_parameter(&loaded_model, |name, _, tensor| {
        restored.push((name.to_string(), tensor.to_host()?.into_data()));
        Ok(())
    })
    .unwrap();
    assert_eq!(original, restored);

    let x = upload(backend, &[1, 1, 16, 16], vec![0.25; 256]);
    let before = model.forward(&x).unwrap().logits.to_host().unwrap();
    let after = loaded_model.forward(&x).unwrap().logits.to_host().unwrap();
    assert_eq!(before.data(), after.data());
}
