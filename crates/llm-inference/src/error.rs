//! Error types for graph construction, loading and execution.

use inferforge_kernels::KernelError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Error, Debug)]
pub enum LlmError {
    /// Bad parameters or caller input: unknown dtype code, `embd % head != 0`,
    /// context length exceeded.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Model file problems: bad magic, truncation, unknown or missing weights.
    #[error("load error: {0}")]
    Load(String),

    #[error("shape error: {0}")]
    Shape(String),

    #[error("kernel `{kernel}` does not support {what}")]
    KernelUnsupported { kernel: String, what: String },

    /// Broken internal invariant. The graph must not be executed again.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<KernelError> for LlmError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Unsupported { kernel, what } => LlmError::KernelUnsupported {
                kernel: kernel.to_string(),
                what,
            },
            KernelError::ShapeMismatch(msg) => LlmError::Shape(msg),
        }
    }
}

impl From<ndarray::ShapeError> for LlmError {
    fn from(err: ndarray::ShapeError) -> Self {
        LlmError::Shape(err.to_string())
    }
}
