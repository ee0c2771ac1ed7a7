//! Layer normalization kernels.

use crate::error::{KernelError, KernelResult};
use ndarray::{ArrayView1, ArrayViewMut2, Axis};
use rayon::prelude::*;

fn check_param(name: &str, param: Option<&ArrayView1<'_, f32>>, feature_dim: usize) -> KernelResult<()> {
    if let Some(param) = param {
        if param.len() != feature_dim {
            return Err(KernelError::ShapeMismatch(format!(
                "{} length {} must equal feature dimension {}",
                name,
                param.len(),
                feature_dim
            )));
        }
    }
    Ok(())
}

fn scale_shift(
    row: &mut ndarray::ArrayViewMut1<'_, f32>,
    gamma: Option<&ArrayView1<'_, f32>>,
    beta: Option<&ArrayView1<'_, f32>>,
) {
    if let Some(gamma) = gamma {
        *row *= gamma;
    }
    if let Some(beta) = beta {
        *row += beta;
    }
}

/// Mean/variance normalization per row.
pub fn layer_norm_inplace(
    mut data: ArrayViewMut2<'_, f32>,
    gamma: Option<ArrayView1<'_, f32>>,
    beta: Option<ArrayView1<'_, f32>>,
    epsilon: f32,
) -> KernelResult<()> {
    let feature_dim = data.len_of(Axis(1));
    check_param("gamma", gamma.as_ref(), feature_dim)?;
    check_param("beta", beta.as_ref(), feature_dim)?;

    data.axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            let len = row.len() as f32;
            let mean = row.iter().sum::<f32>() / len;
            let var = row.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / len;
            let inv_std = 1.0 / (var + epsilon).sqrt();
            row.mapv_inplace(|x| (x - mean) * inv_std);
            scale_shift(&mut row, gamma.as_ref(), beta.as_ref());
        });

    Ok(())
}

/// Root-mean-square normalization per row, no mean subtraction.
pub fn rms_norm_inplace(
    mut data: ArrayViewMut2<'_, f32>,
    gamma: Option<ArrayView1<'_, f32>>,
    beta: Option<ArrayView1<'_, f32>>,
    epsilon: f32,
) -> KernelResult<()> {
    let feature_dim = data.len_of(Axis(1));
    check_param("gamma", gamma.as_ref(), feature_dim)?;
    check_param("beta", beta.as_ref(), feature_dim)?;

    data.axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            let mean_sq = row.iter().map(|x| x * x).sum::<f32>() / row.len() as f32;
            let inv_rms = 1.0 / (mean_sq + epsilon).sqrt();
            row *= inv_rms;
            scale_shift(&mut row, gamma.as_ref(), beta.as_ref());
        });

    Ok(())
}
