use inferforge_kernels::{DType, MatmulInputs, MatmulProblem, WeightView};
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut2};
use std::rc::Rc;

use super::{int4_reorder_applies, pack_weight, rows_and_width, MatmulInfo, Op, OpCore, Preprocessed};
use crate::device::Device;
use crate::error::{LlmError, Result};
use crate::tensor::{Tensor, TensorRef};
use crate::workspace::Workspace;

/// `y = x · Wᵀ (+ bias)` with `W: {N, K}`. Inputs may be `{M, K}` or `{B, M, K}`.
pub struct MatMul {
    core: OpCore,
    n: usize,
    k: usize,
    bias: bool,
    weight_packed: bool,
    last_row_only: bool,
}

impl MatMul {
    pub fn new(
        device: &Rc<Device>,
        name: impl Into<String>,
        input: TensorRef,
        n: usize,
        k: usize,
        bias: bool,
        compt: DType,
    ) -> Self {
        let mut core = OpCore::new(device, name, vec![input], 1, compt);
        core.add_weight("weight", vec![n, k], false);
        if bias {
            core.add_weight("bias", vec![n], true);
        }
        Self {
            core,
            n,
            k,
            bias,
            weight_packed: false,
            last_row_only: false,
        }
    }

    pub fn weight_packed(&self) -> bool {
        self.weight_packed
    }

    /// Output features, accounting for the packed layout.
    pub fn effective_n(&self) -> usize {
        let stored = self.core.weights[0].dim(0);
        if self.weight_packed {
            stored * inferforge_kernels::PACK_SIZE
        } else {
            stored
        }
    }

    fn compute_rows(&self) -> Result<(usize, usize)> {
        let (rows, width) = rows_and_width(self.core.input(0))?;
        if width != self.k {
            return Err(LlmError::Shape(format!(
                "matmul `{}` expects K = {}, input has {}",
                self.core.name(),
                self.k,
                width
            )));
        }
        Ok((rows, if self.last_row_only { 1 } else { rows }))
    }
}

/// Run `lhs · Wᵀ (+ bias)` on the device kernel for a bound weight tensor.
pub(crate) fn run_matmul(
    device: &Device,
    lhs: ArrayView2<'_, f32>,
    weight: &Tensor,
    bias: Option<&Tensor>,
    out: &mut [f32],
) -> Result<()> {
    let bytes = weight.bytes()?;
    let view = WeightView::from_bytes(weight.dtype(), weight.dim(0), weight.dim(1), &bytes)?;
    let bias = bias.map(Tensor::read_f32).transpose()?;
    let inputs = MatmulInputs::new(lhs.view(), view, bias.as_deref().map(|b| ArrayView1::from(b)));
    let problem = inputs.problem();
    let out = ArrayViewMut2::from_shape((problem.m, problem.n), out)?;
    device.kernel().matmul(&problem, &inputs, out)?;
    Ok(())
}

impl Op for MatMul {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn deduce_output_shape(&mut self) -> Result<()> {
        let (_, m) = self.compute_rows()?;
        let mut shape = self.core.input(0).shape();
        if self.last_row_only {
            shape = vec![m, self.n];
        } else if let Some(last) = shape.last_mut() {
            *last = self.n;
        }
        self.core.output().set_shape(shape);
        Ok(())
    }

    fn execute(&mut self, _workspace: &mut Workspace, _nr_past: usize) -> Result<()> {
        let (rows, m) = self.compute_rows()?;
        let input = self.core.input(0).read_f32()?;
        let lhs = ArrayView2::from_shape((m, self.k), &input[(rows - m) * self.k..])?;
        let mut out = self.core.output().write_f32()?;
        let bias = self.bias.then(|| self.core.weights[1].as_ref());
        run_matmul(self.core.device(), lhs, &self.core.weights[0], bias, &mut out)?;
        out.commit()
    }

    fn need_preprocess_weight(&self, weight: &Tensor) -> bool {
        !self.last_row_only
            && std::ptr::eq(weight, self.core.weights[0].as_ref())
            && int4_reorder_applies(self.core.device(), weight)
    }

    fn preprocess_weight(&mut self, weight: &Tensor, src: &[u8]) -> Result<Preprocessed> {
        if !self.need_preprocess_weight(weight) {
            return Err(LlmError::Fatal(format!(
                "weight `{}` does not qualify for the int4 reorder",
                weight.name()
            )));
        }
        let packed = pack_weight(weight, src)?;
        self.weight_packed = true;
        Ok(packed)
    }

    fn matmul_info(&self, weight: &Tensor) -> Option<MatmulInfo> {
        std::ptr::eq(weight, self.core.weights[0].as_ref()).then(|| MatmulInfo {
            weight_packed: self.weight_packed,
            n: self.effective_n(),
            k: self.k,
        })
    }
}

/// MatMul restricted to the last input row. Used by the output head so
/// both prefill and decode only project the final token.
pub struct MatMulLast(MatMul);

impl MatMulLast {
    pub fn new(
        device: &Rc<Device>,
        name: impl Into<String>,
        input: TensorRef,
        n: usize,
        k: usize,
        bias: bool,
        compt: DType,
    ) -> Self {
        let mut inner = MatMul::new(device, name, input, n, k, bias, compt);
        inner.last_row_only = true;
        Self(inner)
    }
}

impl Op for MatMulLast {
    fn core(&self) -> &OpCore {
        &self.0.core
    }

    fn deduce_output_shape(&mut self) -> Result<()> {
        self.0.deduce_output_shape()
    }

    fn execute(&mut self, workspace: &mut Workspace, nr_past: usize) -> Result<()> {
        self.0.execute(workspace, nr_past)
    }

    fn matmul_info(&self, weight: &Tensor) -> Option<MatmulInfo> {
        self.0.matmul_info(weight)
    }
}

/// MatMul whose output features are gated by a predictor score tensor
/// `{M, N}`: only features with a positive score are computed.
pub struct SparseMatMul {
    core: OpCore,
    n: usize,
    k: usize,
}

impl SparseMatMul {
    pub fn new(
        device: &Rc<Device>,
        name: impl Into<String>,
        input: TensorRef,
        scores: TensorRef,
        n: usize,
        k: usize,
        compt: DType,
    ) -> Self {
        let mut core = OpCore::new(device, name, vec![input, scores], 1, compt);
        core.add_weight("weight", vec![n, k], false);
        Self { core, n, k }
    }
}

impl Op for SparseMatMul {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn deduce_output_shape(&mut self) -> Result<()> {
        let (rows, width) = rows_and_width(self.core.input(0))?;
        let (score_rows, score_width) = rows_and_width(self.core.input(1))?;
        if width != self.k || score_rows != rows || score_width != self.n {
            return Err(LlmError::Shape(format!(
                "sparse matmul `{}`: input {:?} and scores {:?} do not fit weight {}x{}",
                self.core.name(),
                self.core.input(0).shape(),
                self.core.input(1).shape(),
                self.n,
                self.k
            )));
        }
        self.core.output().set_shape(vec![rows, self.n]);
        Ok(())
    }

    fn execute(&mut self, _workspace: &mut Workspace, _nr_past: usize) -> Result<()> {
        let (m, _) = rows_and_width(self.core.input(0))?;
        let input = self.core.input(0).read_f32()?;
        let scores = self.core.input(1).read_f32()?;
        let weight = &self.core.weights[0];
        let bytes = weight.bytes()?;
        let view = WeightView::from_bytes(weight.dtype(), self.n, self.k, &bytes)?;

        let inputs = MatmulInputs::new(ArrayView2::from_shape((m, self.k), &input[..])?, view, None);
        let problem = MatmulProblem::new(m, self.n, self.k, weight.dtype());
        let mut out = self.core.output().write_f32()?;
        self.core.device().kernel().sparse_matmul(
            &problem,
            &inputs,
            ArrayView2::from_shape((m, self.n), &scores[..])?,
            ArrayViewMut2::from_shape((m, self.n), &mut out[..])?,
        )?;
        out.commit()
    }

    fn matmul_info(&self, weight: &Tensor) -> Option<MatmulInfo> {
        std::ptr::eq(weight, self.core.weights[0].as_ref()).then(|| MatmulInfo {
            weight_packed: false,
            n: self.n,
            k: self.k,
        })
    }
}
