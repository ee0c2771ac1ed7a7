//! The kernel capability set used by operators.
//!
//! A `Kernel` must provide matmul; everything else has a portable default
//! implementation built on the free functions of this crate.

use crate::attention::{cached_attention, HeadLayout, MaskKind};
use crate::config::{DType, ElemMode, KernelOptMethod, MatmulProblem, RotMode};
use crate::error::{KernelError, KernelResult};
use crate::layernorm::{layer_norm_inplace, rms_norm_inplace};
use crate::matmul::{self, MatmulInputs, WeightView};
use crate::rope::RopeCache;
use crate::utils;
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut2};
use std::sync::Arc;

pub trait Kernel: Send + Sync {
    fn name(&self) -> &'static str;

    fn supported_optimization(&self, _method: KernelOptMethod) -> bool {
        false
    }

    fn supports(&self, problem: &MatmulProblem) -> bool;

    fn matmul(
        &self,
        problem: &MatmulProblem,
        inputs: &MatmulInputs<'_>,
        out: ArrayViewMut2<'_, f32>,
    ) -> KernelResult<()>;

    fn sparse_matmul(
        &self,
        problem: &MatmulProblem,
        inputs: &MatmulInputs<'_>,
        scores: ArrayView2<'_, f32>,
        out: ArrayViewMut2<'_, f32>,
    ) -> KernelResult<()> {
        if !self.supports(problem) {
            return Err(KernelError::unsupported_matmul(self.name(), problem));
        }
        matmul::reference_sparse_matmul(problem, inputs, scores, out)
    }

    fn layer_norm(
        &self,
        data: ArrayViewMut2<'_, f32>,
        gamma: Option<ArrayView1<'_, f32>>,
        beta: Option<ArrayView1<'_, f32>>,
        eps: f32,
    ) -> KernelResult<()> {
        layer_norm_inplace(data, gamma, beta, eps)
    }

    fn rms_norm(
        &self,
        data: ArrayViewMut2<'_, f32>,
        gamma: Option<ArrayView1<'_, f32>>,
        beta: Option<ArrayView1<'_, f32>>,
        eps: f32,
    ) -> KernelResult<()> {
        rms_norm_inplace(data, gamma, beta, eps)
    }

    fn softmax(&self, data: ArrayViewMut2<'_, f32>) {
        utils::softmax_inplace(data)
    }

    fn diag_mask(&self, data: ArrayViewMut2<'_, f32>, nr_past: usize) {
        utils::diag_mask_inplace(data, nr_past)
    }

    fn elemwise(
        &self,
        mode: ElemMode,
        a: &[f32],
        b: Option<&[f32]>,
        scale: Option<f32>,
        dst: &mut [f32],
    ) -> KernelResult<()> {
        match b {
            Some(b) => utils::elemwise_binary(mode, a, b, scale, dst),
            None => utils::elemwise_unary(mode, a, dst),
        }
    }

    fn split_half_active_mul(
        &self,
        mode: ElemMode,
        src: &[f32],
        width: usize,
        dst: &mut [f32],
    ) -> KernelResult<()> {
        utils::split_half_active_mul(mode, src, width, dst)
    }

    fn embedding(
        &self,
        table: &WeightView<'_>,
        ids: &[usize],
        out: ArrayViewMut2<'_, f32>,
    ) -> KernelResult<()> {
        if table.dtype() == DType::Int4Packed {
            return Err(KernelError::Unsupported {
                kernel: self.name(),
                what: "embedding gather from packed weights".to_string(),
            });
        }
        utils::embedding_lookup(table, ids, out)
    }

    fn rope(
        &self,
        cache: &RopeCache,
        data: ArrayViewMut2<'_, f32>,
        head_dim: usize,
        offset: usize,
        mode: RotMode,
        position: &dyn Fn(usize) -> usize,
    ) -> KernelResult<()> {
        cache.apply(data, head_dim, offset, mode, position)
    }

    #[allow(clippy::too_many_arguments)]
    fn attention(
        &self,
        query: ArrayView2<'_, f32>,
        keys: ArrayView2<'_, f32>,
        values: ArrayView2<'_, f32>,
        layout: HeadLayout,
        mask: MaskKind,
        scale: f32,
        scores: &mut [f32],
        out: ArrayViewMut2<'_, f32>,
    ) -> KernelResult<()> {
        cached_attention(query, keys, values, layout, mask, scale, scores, out)
    }
}

pub type DynKernel = Arc<dyn Kernel>;

/// Straightforward sequential kernel. Handles every unpacked weight dtype.
#[derive(Default)]
pub struct ReferenceKernel;

impl ReferenceKernel {
    pub fn new() -> Self {
        Self
    }
}

impl Kernel for ReferenceKernel {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn supports(&self, problem: &MatmulProblem) -> bool {
        !matches!(problem.weight, DType::Int4Packed | DType::Int32)
    }

    fn matmul(
        &self,
        problem: &MatmulProblem,
        inputs: &MatmulInputs<'_>,
        out: ArrayViewMut2<'_, f32>,
    ) -> KernelResult<()> {
        if !self.supports(problem) {
            return Err(KernelError::unsupported_matmul(self.name(), problem));
        }
        matmul::reference_matmul(problem, inputs, out)
    }
}

/// Rayon-parallel kernel. Advertises the INT4 reorder and consumes
/// `Int4Packed` weights.
#[derive(Default)]
pub struct ParallelKernel;

impl ParallelKernel {
    pub fn new() -> Self {
        Self
    }
}

impl Kernel for ParallelKernel {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn supported_optimization(&self, method: KernelOptMethod) -> bool {
        matches!(method, KernelOptMethod::MatmulInt4Reorder)
    }

    fn supports(&self, problem: &MatmulProblem) -> bool {
        problem.weight != DType::Int32
    }

    fn matmul(
        &self,
        problem: &MatmulProblem,
        inputs: &MatmulInputs<'_>,
        out: ArrayViewMut2<'_, f32>,
    ) -> KernelResult<()> {
        if !self.supports(problem) {
            return Err(KernelError::unsupported_matmul(self.name(), problem));
        }
        matmul::parallel_matmul(problem, inputs, out)
    }

    fn sparse_matmul(
        &self,
        problem: &MatmulProblem,
        inputs: &MatmulInputs<'_>,
        scores: ArrayView2<'_, f32>,
        out: ArrayViewMut2<'_, f32>,
    ) -> KernelResult<()> {
        if !self.supports(problem) {
            return Err(KernelError::unsupported_matmul(self.name(), problem));
        }
        matmul::parallel_sparse_matmul(problem, inputs, scores, out)
    }
}
