pub mod cpu;

pub use cpu::{CpuPortableBackend, CpuTensor};
