//! Binary parameter checkpoints.
//!
//! Layout (little endian): magic `VNETRCHK`, `u32` version, `u32` length + JSON
//! [`ModelConfig`](crate::model::ModelConfig), `u32` tensor count, then per tensor a `u32`
//! length-prefixed UTF-8 name, `u32` rank, `u64` dims, `u32` dtype tag, `u64` byte length, and the
//! raw payload.

pub mod loader;
pub mod saver;

pub use loader::{CheckpointLoader, LoadedCheckpoint};
pub use saver::CheckpointSaver;

pub(crate) const MAGIC: &[u8; 8] = b"VNETRCHK";
pub(crate) const VERSION: u32 = 1;

/// Element types a checkpoint payload may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
}

impl DType {
    pub fn tag(self) -> u32 {
        match self {
            DType::F32 => 0,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(DType::F32),
            _ => None,
        }
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
        }
    }
}
