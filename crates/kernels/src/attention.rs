//! Attention over a KV history.

use crate::error::{KernelError, KernelResult};
use crate::utils::softmax_inplace;
use ndarray::linalg::general_mat_mul;
use ndarray::{s, ArrayView2, ArrayViewMut2};

/// Which `(query, key)` pairs are hidden from each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskKind {
    None,
    /// Query `i` sees keys `j <= past + i`.
    Causal { past: usize },
    /// Causal, except keys `j <= context_end` are visible to every query.
    Prefix { context_end: usize, past: usize },
}

impl MaskKind {
    #[inline]
    pub fn is_masked(&self, i: usize, j: usize) -> bool {
        match *self {
            MaskKind::None => false,
            MaskKind::Causal { past } => j > past + i,
            MaskKind::Prefix { context_end, past } => j > past + i && j > context_end,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadLayout {
    pub n_head: usize,
    pub n_kv_head: usize,
    pub head_dim: usize,
}

impl HeadLayout {
    pub fn kv_head(&self, head: usize) -> usize {
        head / (self.n_head / self.n_kv_head)
    }
}

/// `out = softmax(scale · q·kᵀ + mask) · v` per head.
///
/// `query: (L, n_head·d)`, `keys`/`values: (T, n_kv_head·d)`, `scores` holds at
/// least `L·T` floats of scratch.
pub fn cached_attention(
    query: ArrayView2<'_, f32>,
    keys: ArrayView2<'_, f32>,
    values: ArrayView2<'_, f32>,
    layout: HeadLayout,
    mask: MaskKind,
    scale: f32,
    scores: &mut [f32],
    mut out: ArrayViewMut2<'_, f32>,
) -> KernelResult<()> {
    let HeadLayout { n_head, n_kv_head, head_dim } = layout;
    let (seq_len, q_width) = query.dim();
    let total = keys.nrows();

    if n_kv_head == 0 || n_head % n_kv_head != 0 {
        return Err(KernelError::ShapeMismatch(format!(
            "{} query heads cannot share {} kv heads",
            n_head, n_kv_head
        )));
    }
    if q_width != n_head * head_dim
        || keys.dim() != (total, n_kv_head * head_dim)
        || values.dim() != keys.dim()
        || out.dim() != query.dim()
    {
        return Err(KernelError::ShapeMismatch(format!(
            "attention q {:?} k {:?} v {:?} out {:?} for {} heads of {}",
            query.dim(),
            keys.dim(),
            values.dim(),
            out.dim(),
            n_head,
            head_dim
        )));
    }
    if scores.len() < seq_len * total {
        return Err(KernelError::ShapeMismatch(format!(
            "score scratch of {} floats is smaller than {}x{}",
            scores.len(),
            seq_len,
            total
        )));
    }

    let mut scores = ArrayViewMut2::from_shape((seq_len, total), &mut scores[..seq_len * total])?;
    for head in 0..n_head {
        let kv = layout.kv_head(head);
        let q = query.slice(s![.., head * head_dim..(head + 1) * head_dim]);
        let k = keys.slice(s![.., kv * head_dim..(kv + 1) * head_dim]);
        let v = values.slice(s![.., kv * head_dim..(kv + 1) * head_dim]);

        general_mat_mul(scale, &q, &k.t(), 0.0, &mut scores);
        if mask != MaskKind::None {
            for ((i, j), value) in scores.indexed_iter_mut() {
                if mask.is_masked(i, j) {
                    *value = f32::NEG_INFINITY;
                }
            }
        }
        softmax_inplace(scores.view_mut());

        let mut o = out.slice_mut(s![.., head * head_dim..(head + 1) * head_dim]);
        general_mat_mul(1.0, &scores, &v, 0.0, &mut o);
    }
    Ok(())
}
