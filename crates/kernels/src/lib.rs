//! Kernel primitives for InferForge: dtypes, block quantization, matmul,
//! normalization, rotary embeddings and attention.

pub mod attention;
pub mod config;
pub mod error;
pub mod kernel;
pub mod layernorm;
pub mod matmul;
pub mod quant;
pub mod registry;
pub mod rope;
pub mod utils;

pub use attention::*;
pub use config::*;
pub use error::*;
pub use kernel::*;
pub use layernorm::*;
pub use matmul::*;
pub use registry::*;
pub use rope::*;
pub use utils::*;
