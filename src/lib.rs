//! InferForge: graph-based inference for small quantized decoder-only LLMs.
//!
//! Re-exports the kernel layer and the graph/runtime layer.

pub use inferforge_kernels as kernels;
pub use inferforge_llm as llm;

pub use inferforge_llm::{
    make_graph, Device, GenerationMetrics, Generator, Graph, LlmError, LlmParams, ModelReader,
    ModelWriter, Result, Sampler, SamplerConfig, UserConfig,
};
