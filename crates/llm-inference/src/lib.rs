//! Inference execution core for small decoder-only LLMs.
//!
//! A [`Graph`] is built per architecture from modules of ops, loads weights
//! from a model file and runs prefill/decode steps over a per-layer KV cache.
//! Activations live in pooled device buffers and are recalled as soon as
//! their last consumer has run; scratch space comes from one shared
//! [`Workspace`].

pub mod config;
pub mod device;
pub mod error;
pub mod fixtures;
pub mod generate;
pub mod graph;
pub mod kv_cache;
pub mod loader;
pub mod models;
pub mod module;
pub mod ops;
pub mod tensor;
pub mod vocab;
pub mod workspace;

pub use config::{LlmParams, UserConfig};
pub use device::Device;
pub use error::{LlmError, Result};
pub use generate::{GenerationMetrics, Generator, Sampler, SamplerConfig};
pub use graph::{make_graph, Architecture, Graph, GraphBuilder};
pub use loader::{ModelReader, ModelWriter, TensorRecord};
pub use vocab::Vocab;
pub use workspace::Workspace;
