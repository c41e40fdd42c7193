use std::fs;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::SeedableRng;
use vnet::checkpoint::{CheckpointLoader, CheckpointSaver};
use vnet::model::{VNet2d, VNet2dConfig};
use vnet::module::for_each_parameter;
use vnet::tensor::{DeviceTensor, Shape, Tensor};
use vnet_backend_ref_cpu::CpuPortableBackend;

fn cpu_backend() -> Arc<CpuPortableBackend> {
    Arc::new(CpuPortableBackend::new())
}

fn encode(model: &VNet2d<CpuPortableBackend>) -> Vec<u8> {
    let mut bytes = Vec::new();
    CheckpointSaver::write(&mut bytes, model).unwrap();
    bytes
}

#[test]
fn checkpoint_roundtrip() {
    let backend = cpu_backend();
    let mut rng = StdRng::seed_from_u64(11);
    let mut config = VNet2dConfig::new(2, 3, false);
    config.deep_dropout = true;
    let model = VNet2d::random(config.clone(), Arc::clone(&backend), &mut rng).unwrap();

    let base = std::env::temp_dir();
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let path = base.join(format!("vnet_checkpoint_{}.bin", timestamp));
    CheckpointSaver::save(&path, &model).unwrap();
    let loaded = CheckpointLoader::load(&path).unwrap();
    fs::remove_file(&path).unwrap();

    let mut original = Vec::new();
    for_each_parameter(&model, |name, _, tensor| {
        original.push((name.to_string(), tensor.to_host()?.into_data()));
        Ok(())
    })
    .unwrap();
    let entry_names: Vec<&str> = loaded.entries.iter().map(|e| e.name.as_str()).collect();
    let original_names: Vec<&str> = original.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(entry_names, original_names);

    let loaded_model = loaded.into_model(Arc::clone(&backend)).unwrap();
    assert_eq!(loaded_model.config, config);
    let mut restored = Vec::new();
    for_each_parameter(&loaded_model, |name, _, tensor| {
        restored.push((name.to_string(), tensor.to_host()?.into_data()));
        Ok(())
    })
    .unwrap();
    assert_eq!(original, restored);
}

#[test]
fn dyn_model_matches_concrete_model() {
    let backend = cpu_backend();
    let mut rng = StdRng::seed_from_u64(12);
    let model = VNet2d::random(VNet2dConfig::new(1, 1, true), Arc::clone(&backend), &mut rng)
        .unwrap();
    let bytes = encode(&model);

    let loaded = CheckpointLoader::read(&mut Cursor::new(bytes)).unwrap();
    assert_eq!(loaded.config.kind, "vnet2d");
    let restored = loaded.into_dyn_model(Arc::clone(&backend)).unwrap();

    let host = Tensor::from_vec(
        Shape::new([1, 1, 16, 16]),
        (0..256).map(|i| (i as f32 / 64.0).cos()).collect(),
    )
    .unwrap();
    let x = DeviceTensor::from_host(Arc::clone(&backend), host).unwrap();
    let expected = model.forward(&x).unwrap().probabilities.to_host().unwrap();
    let actual = restored.forward(&x).unwrap().probabilities.to_host().unwrap();
    assert_eq!(expected.data(), actual.data());
}

#[test]
fn rejects_bad_magic() {
    let backend = cpu_backend();
    let mut rng = StdRng::seed_from_u64(13);
    let model = VNet2d::random(VNet2dConfig::new(1, 2, true), backend, &mut rng).unwrap();
    let mut bytes = encode(&model);
    bytes[0] = b'X';

    let err = CheckpointLoader::read(&mut Cursor::new(bytes))
        .err()
        .unwrap()
        .to_string();
    assert!(err.contains("magic"), "{err}");
}

#[test]
fn rejects_truncated_payload() {
    let backend = cpu_backend();
    let mut rng = StdRng::seed_from_u64(14);
    let model = VNet2d::random(VNet2dConfig::new(1, 2, true), backend, &mut rng).unwrap();
    let mut bytes = encode(&model);
    bytes.truncate(bytes.len() - 3);

    assert!(CheckpointLoader::read(&mut Cursor::new(bytes)).is_err());
}

#[test]
fn rejects_unknown_model_kind() {
    let backend = cpu_backend();
    let mut rng = StdRng::seed_from_u64(15);
    let model = VNet2d::random(VNet2dConfig::new(1, 2, true), Arc::clone(&backend), &mut rng)
        .unwrap();

    let mut loaded = CheckpointLoader::read(&mut Cursor::new(encode(&model))).unwrap();
    loaded.config.kind = "unet3d".to_string();
    assert!(loaded.into_dyn_model(Arc::clone(&backend)).is_err());

    let mut loaded = CheckpointLoader::read(&mut Cursor::new(encode(&model))).unwrap();
    loaded.config.kind = "unet3d".to_string();
    assert!(loaded.into_model(backend).is_err());
}

fn header_with_tensor_count(count: u32) -> Vec<u8> {
    let config = br#"{"kind":"vnet2d","config":{"image_channels":1,"num_classes":2,"elu":true}}"#;
    let mut bytes = b"VNETRCHK".to_vec();
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&(config.len() as u32).to_le_bytes());
    bytes.extend_from_slice(config);
    bytes.extend_from_slice(&count.to_le_bytes());
    bytes
}

#[test]
fn huge_tensor_count_without_data_is_an_error() {
    let bytes = header_with_tensor_count(u32::MAX);
    assert!(CheckpointLoader::read(&mut Cursor::new(bytes)).is_err());
}

#[test]
fn overflowing_dims_are_an_error() {
    let mut bytes = header_with_tensor_count(1);
    let name = b"in_tr.conv1.weight";
    bytes.extend_from_slice(&(name.len() as u32).to_le_bytes());
    bytes.extend_from_slice(name);
    bytes.extend_from_slice(&2u32.to_le_bytes());
    bytes.extend_from_slice(&(1u64 << 40).to_le_bytes());
    bytes.extend_from_slice(&(1u64 << 40).to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&u64::MAX.to_le_bytes());

    let err = CheckpointLoader::read(&mut Cursor::new(bytes))
        .err()
        .unwrap()
        .to_string();
    assert!(err.contains("overflow"), "{err}");
}

#[test]
fn payload_shorter_than_declared_is_an_error() {
    let mut bytes = header_with_tensor_count(1);
    let name = b"out_tr.conv.bias";
    bytes.extend_from_slice(&(name.len() as u32).to_le_bytes());
    bytes.extend_from_slice(name);
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&(1u64 << 28).to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&(4u64 << 28).to_le_bytes());
    bytes.extend_from_slice(&[0u8; 16]);

    let err = format!(
        "{:#}",
        CheckpointLoader::read(&mut Cursor::new(bytes)).err().unwrap()
    );
    assert!(err.contains("truncated"), "{err}");
}
