use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use super::{DType, MAGIC, VERSION};
use crate::backend::spec::PortableBackend;
use crate::model::SegmentationModel;
use crate::module::for_each_parameter;
use crate::Tensor;

pub struct CheckpointSaver;

impl CheckpointSaver {
    pub fn save<B, M>(path: impl AsRef<Path>, model: &M) -> Result<()>
    where
        B: PortableBackend + 'static,
        M: SegmentationModel<B> + ?Sized,
    {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("failed to create checkpoint {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        Self::write(&mut writer, model)?;
        writer.flush()?;
        Ok(())
    }

    /// Serialises `model` into any writer using the checkpoint layout.
    pub fn write<B, M>(writer: &mut impl Write, model: &M) -> Result<()>
    where
        B: PortableBackend + 'static,
        M: SegmentationModel<B> + ?Sized,
    {
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;

        let config_bytes = serde_json::to_vec(&model.model_config()?)?;
        writer.write_all(&(config_bytes.len() as u32).to_le_bytes())?;
        writer.write_all(&config_bytes)?;

        let mut params: Vec<(String, Tensor)> = Vec::new();
        for_each_parameter(model, |name, _role, tensor| {
            params.push((name.to_string(), tensor.to_host()?));
            Ok(())
        })?;
        writer.write_all(&(params.len() as u32).to_le_bytes())?;

        let dtype = DType::F32;
        let mut total_bytes = 0u64;
        for (name, tensor) in &params {
            let name_bytes = name.as_bytes();
            writer.write_all(&(name_bytes.len() as u32).to_le_bytes())?;
            writer.write_all(name_bytes)?;

            let dims = tensor.shape().dims();
            writer.write_all(&(dims.len() as u32).to_le_bytes())?;
            for &dim in dims {
                writer.write_all(&(dim as u64).to_le_bytes())?;
            }

            writer.write_all(&dtype.tag().to_le_bytes())?;
            let data = tensor.data();
            let byte_len = (data.len() * dtype.size_in_bytes()) as u64;
            writer.write_all(&byte_len.to_le_bytes())?;
            for &value in data {
                writer.write_all(&value.to_le_bytes())?;
            }
            total_bytes += byte_len;
        }
        tracing::info!(
            kind = model.kind(),
            tensors = params.len(),
            bytes = total_bytes,
            "saved checkpoint"
        );
        Ok(())
    }
}
