//! Matrix multiplication kernels.
//!
//! Every matmul computes `y = x · Wᵀ (+ bias)` with `x: {M, K}` activations and a
//! weight of logical shape `{N, K}` stored in any [`DType`] the kernel supports.

use crate::config::{DType, MatmulProblem, INT4_BLOCK_BYTES, INT4_PACKED_TILE_BYTES, INT8_BLOCK_BYTES, PACK_SIZE, QK};
use crate::error::{KernelError, KernelResult};
use crate::quant;
use half::f16;
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis};
use rayon::prelude::*;

#[derive(Debug, Clone, Copy)]
enum WeightData<'a> {
    F32(&'a [f32]),
    F16(&'a [f16]),
    Blocks(&'a [u8]),
}

/// Borrowed view of a weight matrix in its storage dtype.
///
/// `rows` is the stored row count; for `Int4Packed` that is `N / PACK_SIZE`.
#[derive(Debug, Clone, Copy)]
pub struct WeightView<'a> {
    dtype: DType,
    rows: usize,
    cols: usize,
    data: WeightData<'a>,
}

impl<'a> WeightView<'a> {
    pub fn from_f32(rows: usize, cols: usize, data: &'a [f32]) -> KernelResult<Self> {
        check_len(DType::F32, rows, cols, data.len() * 4)?;
        Ok(Self { dtype: DType::F32, rows, cols, data: WeightData::F32(data) })
    }

    pub fn from_f16(rows: usize, cols: usize, data: &'a [f16]) -> KernelResult<Self> {
        check_len(DType::F16, rows, cols, data.len() * 2)?;
        Ok(Self { dtype: DType::F16, rows, cols, data: WeightData::F16(data) })
    }

    /// Interpret raw storage bytes. Float payloads must be suitably aligned.
    pub fn from_bytes(dtype: DType, rows: usize, cols: usize, bytes: &'a [u8]) -> KernelResult<Self> {
        check_len(dtype, rows, cols, bytes.len())?;
        let data = match dtype {
            DType::F32 => WeightData::F32(cast(bytes)?),
            DType::F16 => WeightData::F16(cast(bytes)?),
            DType::Int8 | DType::Int4 | DType::Int4Packed => WeightData::Blocks(bytes),
            DType::Int32 => {
                return Err(KernelError::Unsupported {
                    kernel: "weight",
                    what: "int32 weights".to_string(),
                })
            }
        };
        Ok(Self { dtype, rows, cols, data })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Logical output features `N`.
    pub fn out_features(&self) -> usize {
        match self.dtype {
            DType::Int4Packed => self.rows * PACK_SIZE,
            _ => self.rows,
        }
    }

    /// Dot product of logical row `n` with `x`.
    pub fn row_dot(&self, n: usize, x: &[f32]) -> f32 {
        let k = self.cols;
        match (self.dtype, self.data) {
            (_, WeightData::F32(w)) => dot_f32(&w[n * k..(n + 1) * k], x),
            (_, WeightData::F16(w)) => w[n * k..(n + 1) * k]
                .iter()
                .zip(x)
                .map(|(a, b)| a.to_f32() * b)
                .sum(),
            (DType::Int8, WeightData::Blocks(raw)) => {
                let row_bytes = k / QK * INT8_BLOCK_BYTES;
                raw[n * row_bytes..(n + 1) * row_bytes]
                    .chunks_exact(INT8_BLOCK_BYTES)
                    .zip(x.chunks_exact(QK))
                    .map(|(block, xs)| quant::dot_int8_block(block, xs))
                    .sum()
            }
            (DType::Int4, WeightData::Blocks(raw)) => {
                let row_bytes = k / QK * INT4_BLOCK_BYTES;
                raw[n * row_bytes..(n + 1) * row_bytes]
                    .chunks_exact(INT4_BLOCK_BYTES)
                    .zip(x.chunks_exact(QK))
                    .map(|(block, xs)| quant::dot_int4_block(block, xs))
                    .sum()
            }
            (DType::Int4Packed, WeightData::Blocks(_)) => {
                let mut acc = [0.0f32; PACK_SIZE];
                self.group_dot(n / PACK_SIZE, x, &mut acc);
                acc[n % PACK_SIZE]
            }
            _ => 0.0,
        }
    }

    /// Dot products of the `PACK_SIZE` rows of packed group `g` with `x`.
    pub fn group_dot(&self, g: usize, x: &[f32], acc: &mut [f32; PACK_SIZE]) {
        *acc = [0.0; PACK_SIZE];
        if let WeightData::Blocks(raw) = self.data {
            let group_bytes = self.cols / QK * INT4_PACKED_TILE_BYTES;
            raw[g * group_bytes..(g + 1) * group_bytes]
                .chunks_exact(INT4_PACKED_TILE_BYTES)
                .zip(x.chunks_exact(QK))
                .for_each(|(tile, xs)| quant::dot_int4_tile(tile, xs, acc));
        }
    }

    /// Decode stored row `n` to f32. Not available for packed weights.
    pub fn dequantize_row(&self, n: usize, out: &mut [f32]) -> KernelResult<()> {
        let k = self.cols;
        match self.data {
            WeightData::F32(w) => out.copy_from_slice(&w[n * k..(n + 1) * k]),
            WeightData::F16(w) => {
                for (o, v) in out.iter_mut().zip(&w[n * k..(n + 1) * k]) {
                    *o = v.to_f32();
                }
            }
            WeightData::Blocks(raw) => {
                let row_bytes = self.dtype.storage_bytes(&[k])?;
                quant::dequantize(self.dtype, &raw[n * row_bytes..(n + 1) * row_bytes], out)?;
            }
        }
        Ok(())
    }
}

fn check_len(dtype: DType, rows: usize, cols: usize, len: usize) -> KernelResult<()> {
    let expected = dtype.storage_bytes(&[rows, cols])?;
    if expected != len {
        return Err(KernelError::ShapeMismatch(format!(
            "{:?} weight {}x{} needs {} bytes, got {}",
            dtype, rows, cols, expected, len
        )));
    }
    Ok(())
}

fn cast<T: bytemuck::Pod>(bytes: &[u8]) -> KernelResult<&[T]> {
    bytemuck::try_cast_slice(bytes)
        .map_err(|err| KernelError::ShapeMismatch(format!("weight storage: {}", err)))
}

#[inline]
fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub struct MatmulInputs<'a> {
    pub lhs: ArrayView2<'a, f32>,
    pub weight: WeightView<'a>,
    pub bias: Option<ArrayView1<'a, f32>>,
}

impl<'a> MatmulInputs<'a> {
    pub fn new(
        lhs: ArrayView2<'a, f32>,
        weight: WeightView<'a>,
        bias: Option<ArrayView1<'a, f32>>,
    ) -> Self {
        Self { lhs, weight, bias }
    }

    pub fn problem(&self) -> MatmulProblem {
        MatmulProblem::new(
            self.lhs.nrows(),
            self.weight.out_features(),
            self.weight.cols(),
            self.weight.dtype(),
        )
    }
}

pub fn validate_matmul_inputs(
    problem: &MatmulProblem,
    inputs: &MatmulInputs<'_>,
    out: &ArrayViewMut2<'_, f32>,
) -> KernelResult<()> {
    if inputs.lhs.dim() != (problem.m, problem.k) || inputs.weight.cols() != problem.k {
        return Err(KernelError::ShapeMismatch(format!(
            "matmul lhs {:?} x weight {}x{} vs problem {}x{}x{}",
            inputs.lhs.dim(),
            inputs.weight.out_features(),
            inputs.weight.cols(),
            problem.m,
            problem.n,
            problem.k
        )));
    }
    if inputs.weight.out_features() != problem.n || out.dim() != (problem.m, problem.n) {
        return Err(KernelError::ShapeMismatch(format!(
            "matmul output {:?} does not match {}x{}",
            out.dim(),
            problem.m,
            problem.n
        )));
    }
    if let Some(bias) = &inputs.bias {
        if bias.len() != problem.n {
            return Err(KernelError::ShapeMismatch(format!(
                "bias length {} must equal N = {}",
                bias.len(),
                problem.n
            )));
        }
    }
    if !inputs.lhs.is_standard_layout() || !out.is_standard_layout() {
        return Err(KernelError::ShapeMismatch(
            "matmul operands must be row-major contiguous".to_string(),
        ));
    }
    Ok(())
}

fn add_bias(mut out: ArrayViewMut2<'_, f32>, bias: Option<&ArrayView1<'_, f32>>) {
    if let Some(bias) = bias {
        out += bias;
    }
}

/// Sequential row-by-row matmul.
pub fn reference_matmul(
    problem: &MatmulProblem,
    inputs: &MatmulInputs<'_>,
    mut out: ArrayViewMut2<'_, f32>,
) -> KernelResult<()> {
    validate_matmul_inputs(problem, inputs, &out)?;
    let weight = inputs.weight;

    for (x, mut y) in inputs.lhs.outer_iter().zip(out.outer_iter_mut()) {
        let x = x.to_slice().unwrap_or_default();
        for (n, value) in y.iter_mut().enumerate() {
            *value = weight.row_dot(n, x);
        }
    }

    add_bias(out, inputs.bias.as_ref());
    Ok(())
}

/// Matmul parallelised across output features. Packed INT4 weights are
/// processed one `PACK_SIZE`-row group per task.
pub fn parallel_matmul(
    problem: &MatmulProblem,
    inputs: &MatmulInputs<'_>,
    mut out: ArrayViewMut2<'_, f32>,
) -> KernelResult<()> {
    validate_matmul_inputs(problem, inputs, &out)?;
    let weight = inputs.weight;
    let packed = weight.dtype() == DType::Int4Packed;

    for (x, mut y) in inputs.lhs.outer_iter().zip(out.outer_iter_mut()) {
        let x = x.to_slice().unwrap_or_default();
        let y = y.as_slice_mut().unwrap_or_default();
        if packed {
            y.par_chunks_mut(PACK_SIZE)
                .enumerate()
                .for_each(|(g, chunk)| {
                    let mut acc = [0.0f32; PACK_SIZE];
                    weight.group_dot(g, x, &mut acc);
                    chunk.copy_from_slice(&acc[..chunk.len()]);
                });
        } else {
            y.par_iter_mut()
                .enumerate()
                .for_each(|(n, value)| *value = weight.row_dot(n, x));
        }
    }

    add_bias(out, inputs.bias.as_ref());
    Ok(())
}

fn check_scores(scores: &ArrayView2<'_, f32>, out: &ArrayViewMut2<'_, f32>) -> KernelResult<()> {
    if scores.dim() != out.dim() {
        return Err(KernelError::ShapeMismatch(format!(
            "predictor scores {:?} do not match output {:?}",
            scores.dim(),
            out.dim()
        )));
    }
    Ok(())
}

fn sparse_row(
    weight: &WeightView<'_>,
    bias: Option<&ArrayView1<'_, f32>>,
    x: ArrayView1<'_, f32>,
    score: ArrayView1<'_, f32>,
    mut y: ArrayViewMut1<'_, f32>,
) {
    let x = x.to_slice().unwrap_or_default();
    for (n, (value, s)) in y.iter_mut().zip(score.iter()).enumerate() {
        *value = if *s > 0.0 {
            weight.row_dot(n, x) + bias.map_or(0.0, |b| b[n])
        } else {
            0.0
        };
    }
}

/// Sequential matmul that only computes the outputs whose predictor score
/// is positive. Inactive outputs are zero, bias included.
pub fn reference_sparse_matmul(
    problem: &MatmulProblem,
    inputs: &MatmulInputs<'_>,
    scores: ArrayView2<'_, f32>,
    mut out: ArrayViewMut2<'_, f32>,
) -> KernelResult<()> {
    validate_matmul_inputs(problem, inputs, &out)?;
    check_scores(&scores, &out)?;
    for ((y, x), score) in out
        .outer_iter_mut()
        .zip(inputs.lhs.outer_iter())
        .zip(scores.outer_iter())
    {
        sparse_row(&inputs.weight, inputs.bias.as_ref(), x, score, y);
    }
    Ok(())
}

/// [`reference_sparse_matmul`] with rows split across rayon tasks.
pub fn parallel_sparse_matmul(
    problem: &MatmulProblem,
    inputs: &MatmulInputs<'_>,
    scores: ArrayView2<'_, f32>,
    mut out: ArrayViewMut2<'_, f32>,
) -> KernelResult<()> {
    validate_matmul_inputs(problem, inputs, &out)?;
    check_scores(&scores, &out)?;
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(inputs.lhs.axis_iter(Axis(0)))
        .zip(scores.axis_iter(Axis(0)))
        .for_each(|((y, x), score)| sparse_row(&inputs.weight, inputs.bias.as_ref(), x, score, y));
    Ok(())
}
