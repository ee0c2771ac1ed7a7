//! Operators: the unit of execution inside a module.
//!
//! Every op follows the same cycle per graph run: `pre_execute` materializes
//! outputs, `execute` runs the kernel with a borrowed workspace, and
//! `end_execute` releases the inputs it consumed.

use inferforge_kernels::{DType, KernelOptMethod, PACK_SIZE};
use std::rc::Rc;

use crate::device::Device;
use crate::error::{LlmError, Result};
use crate::tensor::{Tensor, TensorRef};
use crate::workspace::Workspace;

mod attention;
mod elemwise;
mod embedding;
mod matmul;
mod norm;
mod reshape;
mod softmax;

pub use attention::{Attention, AttentionConfig, AttentionVariant, QkvLayout};
pub use elemwise::{Elemwise, SplitHalfActiveMul};
pub use embedding::Embedding;
pub use matmul::{MatMul, MatMulLast, SparseMatMul};
pub use norm::{LayerNorm, NormConfig};
pub use reshape::Reshape;
pub use softmax::{DiagMask, SoftMax};

/// Replacement storage for a weight produced at load time.
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub bytes: Vec<u8>,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

/// Shape summary of a matmul weight after load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatmulInfo {
    pub weight_packed: bool,
    pub n: usize,
    pub k: usize,
}

/// Name, device and tensor wiring shared by every op.
pub struct OpCore {
    name: String,
    device: Rc<Device>,
    inputs: Vec<TensorRef>,
    outputs: Vec<TensorRef>,
    weights: Vec<TensorRef>,
}

impl OpCore {
    /// Connect `inputs` and create `n_outputs` activation tensors of `dtype`.
    pub fn new(
        device: &Rc<Device>,
        name: impl Into<String>,
        inputs: Vec<TensorRef>,
        n_outputs: usize,
        dtype: DType,
    ) -> Self {
        let name = name.into();
        for input in &inputs {
            input.add_user();
        }
        let outputs = (0..n_outputs)
            .map(|idx| Tensor::activation(device, format!("{}.out{}", name, idx), dtype))
            .collect();
        Self {
            name,
            device: Rc::clone(device),
            inputs,
            outputs,
            weights: Vec::new(),
        }
    }

    pub fn add_weight(&mut self, suffix: &str, shape: Vec<usize>, float_only: bool) -> TensorRef {
        let weight = Tensor::weight(
            &self.device,
            format!("{}.{}", self.name, suffix),
            shape,
            float_only,
        );
        self.weights.push(Rc::clone(&weight));
        weight
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Rc<Device> {
        &self.device
    }

    pub fn input(&self, idx: usize) -> &TensorRef {
        &self.inputs[idx]
    }

    pub fn output(&self) -> &TensorRef {
        &self.outputs[0]
    }
}

pub trait Op {
    fn core(&self) -> &OpCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn inputs(&self) -> &[TensorRef] {
        &self.core().inputs
    }

    fn outputs(&self) -> &[TensorRef] {
        &self.core().outputs
    }

    fn weights(&self) -> &[TensorRef] {
        &self.core().weights
    }

    /// Check weights are bound and materialize outputs for this run.
    fn pre_execute(&mut self) -> Result<()> {
        for weight in self.weights() {
            if !weight.is_materialized() {
                return Err(LlmError::Fatal(format!(
                    "weight `{}` used before it was loaded",
                    weight.name()
                )));
            }
        }
        for output in self.outputs() {
            if output.is_shared() {
                output.prepare_data()?;
            } else if output.curr_users() == 0 {
                output.resume_user_count();
                output.prepare_data()?;
            }
        }
        Ok(())
    }

    fn execute(&mut self, workspace: &mut Workspace, nr_past: usize) -> Result<()>;

    fn end_execute(&mut self) -> Result<()> {
        for input in self.inputs() {
            input.decrease_curr_user_count()?;
        }
        Ok(())
    }

    fn deduce_output_shape(&mut self) -> Result<()>;

    fn workspace_in_bytes(&self) -> usize {
        0
    }

    fn need_preprocess_weight(&self, _weight: &Tensor) -> bool {
        false
    }

    fn preprocess_weight(&mut self, weight: &Tensor, _src: &[u8]) -> Result<Preprocessed> {
        Err(LlmError::Fatal(format!(
            "op `{}` has no transform for weight `{}`",
            self.name(),
            weight.name()
        )))
    }

    fn reset_ctx(&mut self) {}

    /// Current KV length for attention ops.
    fn kv_length(&self) -> Option<usize> {
        None
    }

    fn kv_bytes_per_token(&self) -> usize {
        0
    }

    /// Shape summary for one of this op's matmul weights.
    fn matmul_info(&self, _weight: &Tensor) -> Option<MatmulInfo> {
        None
    }
}

/// The INT4 reorder applies to an int4 `{N, K}` weight when the device
/// kernel advertises it and `N` fills whole tiles.
pub(crate) fn int4_reorder_applies(device: &Device, weight: &Tensor) -> bool {
    device.supported_optimization(KernelOptMethod::MatmulInt4Reorder)
        && weight.dtype() == DType::Int4
        && weight.dim(0) % PACK_SIZE == 0
}

pub(crate) fn pack_weight(weight: &Tensor, src: &[u8]) -> Result<Preprocessed> {
    let (n, k) = (weight.dim(0), weight.dim(1));
    let bytes = inferforge_kernels::quant::pack_int4(src, n, k)?;
    Ok(Preprocessed {
        bytes,
        shape: vec![n / PACK_SIZE, k],
        dtype: DType::Int4Packed,
    })
}

/// Rows and feature width of a `{.., M, K}` activation.
pub(crate) fn rows_and_width(tensor: &Tensor) -> Result<(usize, usize)> {
    let shape = tensor.shape();
    match shape.split_last() {
        Some((&width, lead)) if !lead.is_empty() => Ok((lead.iter().product(), width)),
        _ => Err(LlmError::Shape(format!(
            "tensor `{}` needs at least 2 dims, has {:?}",
            tensor.name(),
            shape
        ))),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use inferforge_kernels::DType;

    /// An input activation already filled with `data`.
    pub fn filled(device: &Rc<Device>, name: &str, shape: Vec<usize>, data: &[f32]) -> TensorRef {
        let t = Tensor::activation(device, name, DType::F32);
        t.set_shape(shape);
        t.mark_shared();
        t.prepare_data().expect("prepare");
        t.f32_mut().expect("f32").copy_from_slice(data);
        t
    }

    pub fn bind_f32(weight: &TensorRef, data: &[f32]) {
        weight
            .bind(DType::F32, weight.shape(), bytemuck::cast_slice(data))
            .expect("bind");
    }

    /// Run one full op cycle with a workspace sized by the op.
    pub fn run(op: &mut dyn Op, nr_past: usize) -> Result<Vec<f32>> {
        op.deduce_output_shape()?;
        let mut ws = Workspace::new();
        ws.reserve_bytes(op.workspace_in_bytes());
        op.pre_execute()?;
        op.execute(&mut ws, nr_past)?;
        let out = op.outputs()[0].read_f32()?.to_vec();
        op.end_execute()?;
        Ok(out)
    }
}
