//! ONNX interchange for the digit classifier: writing a trained network,
//! checking a model structurally and reading one back.

pub mod checker;
pub mod export;
pub mod import;
mod protos;

pub use protos::*;

pub const OPSET_VERSION: i64 = 11;
pub const IR_VERSION: i64 = 6;
pub const INPUT_NAME: &str = "input";
pub const OUTPUT_NAME: &str = "output";
/// Symbolic name of the dynamic leading axis of `input` and `output`.
pub const BATCH_DIM: &str = "batch_size";
