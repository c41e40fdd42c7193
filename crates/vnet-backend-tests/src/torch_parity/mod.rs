pub mod activations;
pub mod common;
pub mod vision_ops;
pub mod vnet2d;
