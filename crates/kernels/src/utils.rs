//! Shared helpers for kernel implementations: activations, softmax, masks,
//! embedding gathers.

use crate::config::ElemMode;
use crate::error::{KernelError, KernelResult};
use crate::matmul::WeightView;
use ndarray::{ArrayViewMut2, Axis};
use rayon::prelude::*;

#[inline]
pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// Approximate GELU (tanh formulation).
#[inline]
pub fn gelu(x: f32) -> f32 {
    let c = (2.0 / std::f32::consts::PI).sqrt();
    0.5 * x * (1.0 + (c * (x + 0.044715 * x.powi(3))).tanh())
}

#[inline]
pub fn relu(x: f32) -> f32 {
    x.max(0.0)
}

pub fn activate(mode: ElemMode, x: f32) -> f32 {
    match mode {
        ElemMode::Silu => silu(x),
        ElemMode::Gelu => gelu(x),
        ElemMode::Relu => relu(x),
        ElemMode::Add | ElemMode::Mul => x,
    }
}

pub fn elemwise_unary(mode: ElemMode, src: &[f32], dst: &mut [f32]) -> KernelResult<()> {
    if mode.is_binary() {
        return Err(KernelError::Unsupported {
            kernel: "elemwise",
            what: format!("{:?} with one operand", mode),
        });
    }
    check_same("elemwise", src.len(), dst.len())?;
    dst.par_iter_mut()
        .zip(src.par_iter())
        .for_each(|(d, &s)| *d = activate(mode, s));
    Ok(())
}

/// `Add`: `a * scale + b` (scale defaults to 1). `Mul`: `a * b`.
pub fn elemwise_binary(
    mode: ElemMode,
    a: &[f32],
    b: &[f32],
    scale: Option<f32>,
    dst: &mut [f32],
) -> KernelResult<()> {
    check_same("elemwise", a.len(), b.len())?;
    check_same("elemwise", a.len(), dst.len())?;
    match mode {
        ElemMode::Add => {
            let scale = scale.unwrap_or(1.0);
            dst.par_iter_mut()
                .zip(a.par_iter().zip(b.par_iter()))
                .for_each(|(d, (&x, &y))| *d = x * scale + y);
        }
        ElemMode::Mul => {
            dst.par_iter_mut()
                .zip(a.par_iter().zip(b.par_iter()))
                .for_each(|(d, (&x, &y))| *d = x * y);
        }
        _ => {
            return Err(KernelError::Unsupported {
                kernel: "elemwise",
                what: format!("{:?} with two operands", mode),
            })
        }
    }
    Ok(())
}

/// `dst[r] = act(src[r, :h]) * src[r, h:]` for rows of width `2h`.
pub fn split_half_active_mul(
    mode: ElemMode,
    src: &[f32],
    width: usize,
    dst: &mut [f32],
) -> KernelResult<()> {
    if width % 2 != 0 || src.len() % width.max(1) != 0 {
        return Err(KernelError::ShapeMismatch(format!(
            "split-half input of {} elements cannot be cut into rows of {}",
            src.len(),
            width
        )));
    }
    let half = width / 2;
    check_same("split-half", src.len() / 2, dst.len())?;
    dst.par_chunks_mut(half)
        .zip(src.par_chunks(width))
        .for_each(|(out, row)| {
            let (gate, up) = row.split_at(half);
            for ((o, &g), &u) in out.iter_mut().zip(gate).zip(up) {
                *o = activate(mode, g) * u;
            }
        });
    Ok(())
}

fn check_same(kernel: &str, a: usize, b: usize) -> KernelResult<()> {
    if a != b {
        return Err(KernelError::ShapeMismatch(format!(
            "{} operands differ in length: {} vs {}",
            kernel, a, b
        )));
    }
    Ok(())
}

pub fn softmax_inplace(mut scores: ArrayViewMut2<'_, f32>) {
    scores
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            row -= max;
            row.mapv_inplace(|x| x.exp());
            let sum = row.sum();
            row /= sum.max(f32::EPSILON);
        });
}

/// Set `-inf` wherever key `j` lies after query `i`'s absolute position `nr_past + i`.
pub fn diag_mask_inplace(mut scores: ArrayViewMut2<'_, f32>, nr_past: usize) {
    for (i, mut row) in scores.axis_iter_mut(Axis(0)).enumerate() {
        for (j, value) in row.iter_mut().enumerate() {
            if j > nr_past + i {
                *value = f32::NEG_INFINITY;
            }
        }
    }
}

/// Gather embedding rows for `ids`, dequantizing as needed.
pub fn embedding_lookup(
    table: &WeightView<'_>,
    ids: &[usize],
    mut out: ArrayViewMut2<'_, f32>,
) -> KernelResult<()> {
    if out.dim() != (ids.len(), table.cols()) {
        return Err(KernelError::ShapeMismatch(format!(
            "embedding output {:?} for {} ids of width {}",
            out.dim(),
            ids.len(),
            table.cols()
        )));
    }
    for (&id, mut row) in ids.iter().zip(out.axis_iter_mut(Axis(0))) {
        if id >= table.rows() {
            return Err(KernelError::ShapeMismatch(format!(
                "token id {} outside vocabulary of {}",
                id,
                table.rows()
            )));
        }
        let row = row.as_slice_mut().ok_or_else(|| {
            KernelError::ShapeMismatch("embedding output must be contiguous".to_string())
        })?;
        table.dequantize_row(id, row)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    #[test]
    fn add_with_scale() {
        let a = [1.0, 2.0, 3.0];
        let b = [0.5, 0.5, 0.5];
        let mut out = [0.0; 3];
        elemwise_binary(ElemMode::Add, &a, &b, Some(2.0), &mut out).expect("add");
        assert_eq!(out, [2.5, 4.5, 6.5]);
    }

    #[test]
    fn unary_rejects_binary_mode() {
        let mut out = [0.0; 2];
        assert!(elemwise_unary(ElemMode::Mul, &[1.0, 2.0], &mut out).is_err());
    }

    #[test]
    fn split_half_gates_second_half() {
        let src = [1.0, -2.0, 3.0, 4.0];
        let mut out = [0.0; 2];
        split_half_active_mul(ElemMode::Relu, &src, 4, &mut out).expect("split half");
        assert_eq!(out, [3.0, 0.0]);
    }

    #[test]
    fn diag_mask_then_softmax_is_causal() {
        let mut scores = Array2::<f32>::zeros((2, 4));
        diag_mask_inplace(scores.view_mut(), 1);
        softmax_inplace(scores.view_mut());
        assert_abs_diff_eq!(scores[(0, 2)], 0.0);
        assert_abs_diff_eq!(scores[(0, 0)], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(scores[(1, 2)], 1.0 / 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(scores[(1, 3)], 0.0);
    }

    #[test]
    fn silu_and_gelu_reference_points() {
        assert_abs_diff_eq!(silu(0.0), 0.0);
        assert_abs_diff_eq!(silu(1.0), 0.7310586, epsilon = 1e-6);
        assert_abs_diff_eq!(gelu(1.0), 0.8411920, epsilon = 1e-5);
    }
}
