use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Context, Result};

use super::{DType, MAGIC, VERSION};
use crate::backend::spec::PortableBackend;
use crate::model::vnet2d::KIND as VNET2D_KIND;
use crate::model::{model_factory, ModelConfig, SegmentationModel, VNet2d, VNet2dConfig};
use crate::tensor::{IntoDeviceTensor, Shape, Tensor};

/// Header metadata for one stored tensor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointTensorEntry {
    pub name: String,
    pub dims: Vec<usize>,
    pub dtype: DType,
}

pub struct LoadedCheckpoint {
    pub config: ModelConfig,
    /// Tensor headers in file order.
    pub entries: Vec<CheckpointTensorEntry>,
    pub tensors: HashMap<String, Tensor>,
}

impl LoadedCheckpoint {
    /// Rebuilds the concrete V-Net stored in this checkpoint.
    pub fn into_model<B: PortableBackend + 'static>(self, backend: Arc<B>) -> Result<VNet2d<B>> {
        if self.config.kind != VNET2D_KIND {
            bail!(
                "LoadedCheckpoint::into_model only supports kind='{}', got '{}'",
                VNET2D_KIND,
                self.config.kind
            );
        }
        let config: VNet2dConfig = serde_json::from_value(self.config.config)
            .map_err(|err| anyhow!("invalid vnet2d config: {err}"))?;
        VNet2d::from_named_tensors(config, backend, self.tensors)
    }

    /// Rebuilds whatever model kind the checkpoint declares via the model registry.
    pub fn into_dyn_model<B: PortableBackend + 'static>(
        self,
        backend: Arc<B>,
    ) -> Result<Box<dyn SegmentationModel<B>>> {
        let build = model_factory::<B>(&self.config.kind)
            .ok_or_else(|| anyhow!("unsupported model kind '{}'", self.config.kind))?;
        let mut tensors = self.tensors;
        let upload = Arc::clone(&backend);
        let mut get = |name: &str| {
            tensors
                .remove(name)
                .ok_or_else(|| anyhow!("tensor '{}' not found in checkpoint", name))?
                .into_device_tensor(&upload)
        };
        let model = build(backend, &self.config, &mut get)?;
        if !tensors.is_empty() {
            let mut unknown: Vec<String> = tensors.into_keys().collect();
            unknown.sort();
            bail!("checkpoint holds unused tensors: {}", unknown.join(", "));
        }
        Ok(model)
    }
}

/// Upper bound on capacity reserved from a header count before any data is read.
const MAX_PREALLOC: usize = 1024;

pub struct CheckpointLoader;

impl CheckpointLoader {
    pub fn load(path: impl AsRef<Path>) -> Result<LoadedCheckpoint> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open checkpoint {}", path.display()))?;
        let loaded = Self::read(&mut BufReader::new(file))
            .with_context(|| format!("failed to read checkpoint {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            kind = %loaded.config.kind,
            tensors = loaded.entries.len(),
            "loaded checkpoint"
        );
        Ok(loaded)
    }

    /// Parses a checkpoint from any reader.
    pub fn read(reader: &mut impl Read) -> Result<LoadedCheckpoint> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            bail!("invalid checkpoint magic header");
        }

        let version = read_u32(reader)?;
        if version != VERSION {
            bail!("unsupported checkpoint version {}", version);
        }

        let config_len = read_u32(reader)?;
        let config_bytes = read_bytes(reader, u64::from(config_len), "model config")?;
        let config: ModelConfig = serde_json::from_slice(&config_bytes)?;

        // Header counts are untrusted: reserve at most a bounded amount up front.
        let tensor_count = read_u32(reader)? as usize;
        let mut entries = Vec::with_capacity(tensor_count.min(MAX_PREALLOC));
        let mut tensors = HashMap::with_capacity(tensor_count.min(MAX_PREALLOC));

        for _ in 0..tensor_count {
            let name_len = read_u32(reader)?;
            let name_bytes = read_bytes(reader, u64::from(name_len), "tensor name")?;
            let name = String::from_utf8(name_bytes)?;

            let rank = read_u32(reader)? as usize;
            let mut dims = Vec::with_capacity(rank.min(MAX_PREALLOC));
            for _ in 0..rank {
                let dim = read_u64(reader)?;
                dims.push(
                    usize::try_from(dim).map_err(|_| anyhow!("tensor {} dim overflow", name))?,
                );
            }

            let dtype_tag = read_u32(reader)?;
            let dtype = DType::from_tag(dtype_tag)
                .ok_or_else(|| anyhow!("unknown dtype tag {} in checkpoint", dtype_tag))?;

            let byte_len = read_u64(reader)?;
            let expected = dims
                .iter()
                .try_fold(dtype.size_in_bytes(), |acc, &dim| acc.checked_mul(dim))
                .ok_or_else(|| anyhow!("tensor {} dims {:?} overflow usize", name, dims))?;
            ensure!(
                byte_len == expected as u64,
                "tensor {} payload is {} bytes, expected {} for dims {:?}",
                name,
                byte_len,
                expected,
                dims
            );
            let raw = read_bytes(reader, byte_len, "tensor payload")
                .with_context(|| format!("truncated payload for tensor {}", name))?;
            let tensor = match dtype {
                DType::F32 => {
                    let data = raw
                        .chunks_exact(4)
                        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                        .collect();
                    Tensor::from_vec(Shape::try_new(dims.clone())?, data)?
                }
            };

            ensure!(
                !tensors.contains_key(&name),
                "duplicate tensor '{}' in checkpoint",
                name
            );
            tensors.insert(name.clone(), tensor);
            entries.push(CheckpointTensorEntry { name, dims, dtype });
        }

        Ok(LoadedCheckpoint {
            config,
            entries,
            tensors,
        })
    }
}

/// Reads exactly `len` bytes, growing the buffer only as data actually arrives.
fn read_bytes(reader: &mut impl Read, len: u64, what: &str) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity((len as usize).min(MAX_PREALLOC));
    reader.take(len).read_to_end(&mut buf)?;
    ensure!(
        buf.len() as u64 == len,
        "{what} truncated: header promises {len} bytes, found {}",
        buf.len()
    );
    Ok(buf)
}

fn read_u32(reader: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}
