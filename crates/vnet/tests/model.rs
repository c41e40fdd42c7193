use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use vnet::model::{model_factory, DropoutMode, SegmentationModel, VNet2d, VNet2dConfig};
use vnet::module::{for_each_parameter, parameter_count};
use vnet::tensor::{DeviceTensor, Shape, Tensor};
use vnet_backend_ref_cpu::CpuPortableBackend;

fn cpu_backend() -> Arc<CpuPortableBackend> {
    Arc::new(CpuPortableBackend::new())
}

fn input(backend: &Arc<CpuPortableBackend>, dims: &[usize]) -> DeviceTensor<CpuPortableBackend> {
    let len = dims.iter().product::<usize>();
    let data = (0..len).map(|i| ((i * 7919) % 97) as f32 / 48.5 - 1.0).collect();
    let host = Tensor::from_vec(Shape::new(dims.to_vec()), data).unwrap();
    DeviceTensor::from_host(Arc::clone(backend), host).unwrap()
}

fn parameter_names(model: &VNet2d<CpuPortableBackend>) -> Vec<String> {
    let mut names = Vec::new();
    for_each_parameter(model, |name, _, _| {
        names.push(name.to_string());
        Ok(())
    })
    .unwrap();
    names
}

fn host_parameters(model: &VNet2d<CpuPortableBackend>) -> HashMap<String, Tensor> {
    let mut tensors = HashMap::new();
    for_each_parameter(model, |name, _, tensor| {
        tensors.insert(name.to_string(), tensor.to_host()?);
        Ok(())
    })
    .unwrap();
    tensors
}

#[test]
fn parameter_names_follow_state_dict_layout() {
    let backend = cpu_backend();
    let mut rng = StdRng::seed_from_u64(1);
    let model = VNet2d::random(VNet2dConfig::new(1, 2, true), backend, &mut rng).unwrap();
    let names = parameter_names(&model);

    assert_eq!(
        &names[..8],
        &[
            "in_tr.conv1.weight",
            "in_tr.conv1.bias",
            "in_tr.conv2.weight",
            "in_tr.conv2.bias",
            "in_tr.bn1.weight",
            "in_tr.bn1.bias",
            "down_tr32.down_conv.weight",
            "down_tr32.down_conv.bias",
        ]
    );
    assert_eq!(names.last().map(String::as_str), Some("out_tr.conv.bias"));
    for expected in [
        "down_tr64.ops.2.conv1.weight",
        "down_tr256.ops.0.bn1.bias",
        "up_tr256.up_conv.weight",
        "up_tr256.bn.weight",
        "up_tr128.conv.bias",
        "up_tr32.ops.0.conv1.bias",
    ] {
        assert!(names.iter().any(|n| n == expected), "missing {expected}");
    }
    assert!(!names.iter().any(|n| n.contains("relu")));
    assert!(!names.iter().any(|n| n.starts_with("up_tr32.ops.1")));
}

#[test]
fn prelu_models_expose_slopes() {
    let backend = cpu_backend();
    let mut rng = StdRng::seed_from_u64(2);
    let model = VNet2d::random(VNet2dConfig::new(1, 2, false), backend, &mut rng).unwrap();
    let tensors = host_parameters(&model);

    for name in [
        "in_tr.relu1.weight",
        "down_tr32.relu1.weight",
        "down_tr32.relu2.weight",
        "down_tr256.ops.2.relu1.weight",
        "up_tr64.relu.weight",
        "up_tr32.ops.0.relu1.weight",
    ] {
        let slopes = tensors.get(name).unwrap_or_else(|| panic!("missing {name}"));
        assert!(slopes.data().iter().all(|&v| v == 0.25), "{name}");
    }
    assert_eq!(tensors["up_tr256.relu.weight"].shape().dims(), &[128]);
}

#[test]
fn parameter_count_matches_reference_network() {
    let backend = cpu_backend();
    let mut rng = StdRng::seed_from_u64(3);
    let elu =
        VNet2d::random(VNet2dConfig::new(1, 2, true), Arc::clone(&backend), &mut rng).unwrap();
    assert_eq!(parameter_count(&elu).unwrap(), 3_315_090);

    let prelu = VNet2d::random(VNet2dConfig::new(1, 2, false), backend, &mut rng).unwrap();
    assert_eq!(parameter_count(&prelu).unwrap(), 3_318_370);
}

#[test]
fn random_init_uses_fan_in_bounds_and_identity_norms() {
    let backend = cpu_backend();
    let mut rng = StdRng::seed_from_u64(4);
    let model = VNet2d::random(VNet2dConfig::new(3, 2, true), backend, &mut rng).unwrap();
    let tensors = host_parameters(&model);

    let bound = 1.0 / ((3 * 3 * 3) as f32).sqrt();
    let weight = &tensors["in_tr.conv1.weight"];
    assert_eq!(weight.shape().dims(), &[16, 3, 3, 3]);
    assert!(weight.data().iter().all(|v| v.abs() <= bound));
    assert!(weight.data().iter().any(|&v| v != weight.data()[0]));

    let up_bound = 1.0 / ((128 * 2 * 2) as f32).sqrt();
    let up = &tensors["up_tr256.up_conv.weight"];
    assert_eq!(up.shape().dims(), &[256, 128, 2, 2]);
    assert!(up.data().iter().all(|v| v.abs() <= up_bound));

    assert!(tensors["down_tr64.bn1.weight"].data().iter().all(|&v| v == 1.0));
    assert!(tensors["down_tr64.bn1.bias"].data().iter().all(|&v| v == 0.0));
}

#[test]
fn forward_trace_records_every_stage() {
    let backend = cpu_backend();
    let mut rng = StdRng::seed_from_u64(5);
    let model = VNet2d::random(VNet2dConfig::new(1, 2, true), Arc::clone(&backend), &mut rng)
        .unwrap();
    let x = input(&backend, &[1, 1, 32, 32]);

    let trace = model.forward_trace(&x).unwrap();
    let shapes: Vec<(&str, Vec<usize>)> = trace
        .iter()
        .map(|(name, t)| (name.as_str(), t.shape().dims().to_vec()))
        .collect();
    assert_eq!(
        shapes,
        vec![
            ("in_tr", vec![1, 16, 32, 32]),
            ("down_tr32", vec![1, 32, 16, 16]),
            ("down_tr64", vec![1, 64, 8, 8]),
            ("down_tr128", vec![1, 128, 4, 4]),
            ("down_tr256", vec![1, 256, 2, 2]),
            ("up_tr256", vec![1, 128, 4, 4]),
            ("up_tr128", vec![1, 64, 8, 8]),
            ("up_tr64", vec![1, 32, 16, 16]),
            ("up_tr32", vec![1, 16, 32, 32]),
            ("out_tr.logits", vec![1, 2, 32, 32]),
            ("out_tr.probabilities", vec![1, 2, 32, 32]),
        ]
    );

    let forward = model.forward(&x).unwrap();
    assert_eq!(
        forward.logits.to_host().unwrap().data(),
        trace[9].1.to_host().unwrap().data()
    );
}

#[test]
fn eval_forward_is_deterministic_and_train_forward_is_not() {
    let backend = cpu_backend();
    let mut rng = StdRng::seed_from_u64(6);
    let mut config = VNet2dConfig::new(1, 2, true);
    config.deep_dropout = true;
    let model = VNet2d::random(config, Arc::clone(&backend), &mut rng).unwrap();
    let x = input(&backend, &[2, 1, 16, 16]);

    let a = model.forward(&x).unwrap().probabilities.to_host().unwrap();
    let b = model.forward(&x).unwrap().probabilities.to_host().unwrap();
    assert_eq!(a.data(), b.data());

    let mut train_rng = StdRng::seed_from_u64(99);
    let trained = model.forward_train(&x, &mut train_rng).unwrap();
    assert_eq!(trained.logits.shape().dims(), &[2, 2, 16, 16]);
    let trained = trained.probabilities.to_host().unwrap();
    assert_ne!(a.data(), trained.data());
}

#[test]
fn deep_dropout_enables_input_dropout_on_the_four_deepest_stages_only() {
    let backend = cpu_backend();
    let mut rng = StdRng::seed_from_u64(11);
    let mut config = VNet2dConfig::new(1, 2, true);
    config.deep_dropout = true;
    config.dropout_p = 0.3;
    let model = VNet2d::random(config, Arc::clone(&backend), &mut rng).unwrap();

    let down: Vec<&str> = model
        .down_transitions()
        .iter()
        .filter(|stage| stage.dropout().is_some())
        .map(|stage| stage.name())
        .collect();
    assert_eq!(down, ["down_tr128", "down_tr256"]);
    let up: Vec<&str> = model
        .up_transitions()
        .iter()
        .filter(|stage| stage.dropout().is_some())
        .map(|stage| stage.name())
        .collect();
    assert_eq!(up, ["up_tr256", "up_tr128"]);
    for stage in model.down_transitions() {
        if let Some(do1) = stage.dropout() {
            assert_eq!(do1.p(), 0.3);
        }
    }
    for stage in model.up_transitions() {
        assert_eq!(stage.skip_dropout().p(), 0.3, "{}", stage.name());
    }

    let shallow = VNet2d::random(VNet2dConfig::new(1, 2, true), backend, &mut rng).unwrap();
    assert!(shallow.down_transitions().iter().all(|s| s.dropout().is_none()));
    assert!(shallow.up_transitions().iter().all(|s| s.dropout().is_none()));
}

#[test]
fn skip_dropout_only_touches_the_skip_branch() {
    let backend = cpu_backend();
    let mut rng = StdRng::seed_from_u64(12);
    let mut config = VNet2dConfig::new(1, 2, true);
    config.deep_dropout = true;
    let model = VNet2d::random(config, Arc::clone(&backend), &mut rng).unwrap();

    // up_tr32 has no input dropout, so with an all-zero skip the masks have nothing to drop.
    let up_tr32 = &model.up_transitions()[3];
    assert_eq!(up_tr32.name(), "up_tr32");
    let x = input(&backend, &[1, 32, 8, 8]);
    let zero_skip = DeviceTensor::zeros(Arc::clone(&backend), Shape::new([1, 16, 16, 16])).unwrap();
    let eval = up_tr32.forward(&x, &zero_skip, &mut DropoutMode::Eval).unwrap();
    let mut mask_rng = StdRng::seed_from_u64(13);
    let train = up_tr32
        .forward(&x, &zero_skip, &mut DropoutMode::Train(&mut mask_rng))
        .unwrap();
    assert_eq!(eval.to_host().unwrap().data(), train.to_host().unwrap().data());

    let skip = input(&backend, &[1, 16, 16, 16]);
    let eval = up_tr32.forward(&x, &skip, &mut DropoutMode::Eval).unwrap();
    let train = up_tr32
        .forward(&x, &skip, &mut DropoutMode::Train(&mut mask_rng))
        .unwrap();
    assert_ne!(eval.to_host().unwrap().data(), train.to_host().unwrap().data());

    // up_tr128 also drops its input, so a zero skip no longer pins the output.
    let up_tr128 = &model.up_transitions()[1];
    assert_eq!(up_tr128.name(), "up_tr128");
    let x = input(&backend, &[1, 128, 2, 2]);
    let zero_skip = DeviceTensor::zeros(Arc::clone(&backend), Shape::new([1, 64, 4, 4])).unwrap();
    let eval = up_tr128.forward(&x, &zero_skip, &mut DropoutMode::Eval).unwrap();
    let train = up_tr128
        .forward(&x, &zero_skip, &mut DropoutMode::Train(&mut mask_rng))
        .unwrap();
    assert_ne!(eval.to_host().unwrap().data(), train.to_host().unwrap().data());

    // Stages without input dropout ignore the mode entirely.
    let down_tr64 = &model.down_transitions()[1];
    assert_eq!(down_tr64.name(), "down_tr64");
    let x = input(&backend, &[1, 32, 8, 8]);
    let eval = down_tr64.forward(&x, &mut DropoutMode::Eval).unwrap();
    let train = down_tr64
        .forward(&x, &mut DropoutMode::Train(&mut mask_rng))
        .unwrap();
    assert_eq!(eval.to_host().unwrap().data(), train.to_host().unwrap().data());
}

#[test]
fn validate_input_rejects_unusable_shapes() {
    let backend = cpu_backend();
    let mut rng = StdRng::seed_from_u64(7);
    let model = VNet2d::random(VNet2dConfig::new(2, 2, true), Arc::clone(&backend), &mut rng)
        .unwrap();

    assert!(model.validate_input(&Shape::new([1, 2, 16, 48])).is_ok());
    assert!(model.validate_input(&Shape::new([2, 16, 16])).is_err());
    assert!(model.validate_input(&Shape::new([1, 3, 16, 16])).is_err());
    let err = model
        .validate_input(&Shape::new([1, 2, 24, 16]))
        .unwrap_err()
        .to_string();
    assert!(err.contains("multiple of 16"), "{err}");

    let x = input(&backend, &[1, 2, 8, 8]);
    assert!(model.forward(&x).is_err());
}

#[test]
fn forward_rejects_input_from_another_backend() {
    let backend = cpu_backend();
    let mut rng = StdRng::seed_from_u64(8);
    let model = VNet2d::random(VNet2dConfig::new(1, 1, true), backend, &mut rng).unwrap();
    let other = cpu_backend();
    let x = input(&other, &[1, 1, 16, 16]);
    assert!(model.forward(&x).is_err());
}

#[test]
fn from_named_tensors_validates_the_parameter_set() {
    let backend = cpu_backend();
    let mut rng = StdRng::seed_from_u64(9);
    let config = VNet2dConfig::new(1, 2, false);
    let model = VNet2d::random(config.clone(), Arc::clone(&backend), &mut rng).unwrap();
    let tensors = host_parameters(&model);

    let rebuilt =
        VNet2d::from_named_tensors(config.clone(), Arc::clone(&backend), tensors.clone()).unwrap();
    assert_eq!(parameter_names(&rebuilt), parameter_names(&model));

    let mut missing = tensors.clone();
    missing.remove("up_tr64.ops.1.bn1.weight");
    let err = VNet2d::from_named_tensors(config.clone(), Arc::clone(&backend), missing)
        .err()
        .unwrap()
        .to_string();
    assert!(err.contains("up_tr64.ops.1.bn1.weight"), "{err}");

    let mut extra = tensors.clone();
    extra.insert(
        "up_tr32.ops.1.conv1.weight".to_string(),
        Tensor::zeros(Shape::new([16, 16, 3, 3])),
    );
    let err = VNet2d::from_named_tensors(config.clone(), Arc::clone(&backend), extra)
        .err()
        .unwrap()
        .to_string();
    assert!(err.contains("unexpected"), "{err}");

    let mut reshaped = tensors;
    reshaped.insert(
        "out_tr.conv.weight".to_string(),
        Tensor::zeros(Shape::new([3, 16, 1, 1])),
    );
    assert!(VNet2d::from_named_tensors(config, backend, reshaped).is_err());
}

#[test]
fn registry_builds_models_by_kind() {
    let backend = cpu_backend();
    let mut rng = StdRng::seed_from_u64(10);
    let model = VNet2d::random(VNet2dConfig::new(1, 2, true), Arc::clone(&backend), &mut rng)
        .unwrap();
    let model_config = model.model_config().unwrap();
    assert_eq!(model_config.kind, "vnet2d");
    assert!(model_factory::<CpuPortableBackend>("unet3d").is_none());

    let build = model_factory::<CpuPortableBackend>(&model_config.kind).unwrap();
    let mut tensors = HashMap::new();
    for_each_parameter(&model, |name, _, tensor| {
        tensors.insert(name.to_string(), tensor.clone());
        Ok(())
    })
    .unwrap();
    let mut get = |name: &str| {
        tensors
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("missing {name}"))
    };
    let rebuilt: Box<dyn SegmentationModel<CpuPortableBackend>> =
        build(Arc::clone(&backend), &model_config, &mut get).unwrap();
    assert_eq!(rebuilt.kind(), "vnet2d");

    let x = input(&backend, &[1, 1, 16, 16]);
    let expected = model.forward(&x).unwrap().logits.to_host().unwrap();
    let actual = rebuilt.forward(&x).unwrap().logits.to_host().unwrap();
    assert_eq!(expected.data(), actual.data());
}
