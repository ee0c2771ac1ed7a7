//! Error types for kernel dispatch.

use thiserror::Error;

use crate::config::MatmulProblem;

pub type KernelResult<T> = Result<T, KernelError>;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("kernel `{kernel}` does not support {what}")]
    Unsupported { kernel: &'static str, what: String },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
}

impl KernelError {
    pub fn unsupported_matmul(kernel: &'static str, problem: &MatmulProblem) -> Self {
        KernelError::Unsupported {
            kernel,
            what: format!(
                "matmul with {:?} weights ({}x{}x{})",
                problem.weight, problem.m, problem.n, problem.k
            ),
        }
    }
}

impl From<ndarray::ShapeError> for KernelError {
    fn from(err: ndarray::ShapeError) -> Self {
        KernelError::ShapeMismatch(err.to_string())
    }
}
