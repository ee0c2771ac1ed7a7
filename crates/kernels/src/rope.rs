//! Rotary Position Embeddings (RoPE).
//!
//! Reference: https://arxiv.org/abs/2104.09864

use crate::config::RotMode;
use crate::error::{KernelError, KernelResult};
use ndarray::{Array2, ArrayViewMut2};

pub const ROPE_THETA: f32 = 10000.0;

/// Precomputed `cos`/`sin` tables of shape `(max_pos, n_rot / 2)`.
#[derive(Debug, Clone)]
pub struct RopeCache {
    cos: Array2<f32>,
    sin: Array2<f32>,
    n_rot: usize,
}

impl RopeCache {
    pub fn new(max_pos: usize, n_rot: usize, theta: f32) -> Self {
        let half = n_rot / 2;
        let mut cos = Array2::<f32>::zeros((max_pos, half));
        let mut sin = Array2::<f32>::zeros((max_pos, half));

        for pos in 0..max_pos {
            for i in 0..half {
                let freq = 1.0 / theta.powf((2 * i) as f32 / n_rot as f32);
                let angle = pos as f32 * freq;
                cos[[pos, i]] = angle.cos();
                sin[[pos, i]] = angle.sin();
            }
        }

        Self { cos, sin, n_rot }
    }

    pub fn n_rot(&self) -> usize {
        self.n_rot
    }

    pub fn max_pos(&self) -> usize {
        self.cos.nrows()
    }

    /// Rotate dims `offset..offset + n_rot` of every head in `qk`, a
    /// `(seq_len, n_heads * head_dim)` block. Row `r` is rotated by angle
    /// `position(r)`.
    pub fn apply(
        &self,
        mut qk: ArrayViewMut2<'_, f32>,
        head_dim: usize,
        offset: usize,
        mode: RotMode,
        position: impl Fn(usize) -> usize,
    ) -> KernelResult<()> {
        let (seq_len, feat_dim) = qk.dim();
        if head_dim == 0 || feat_dim % head_dim != 0 || offset + self.n_rot > head_dim {
            return Err(KernelError::ShapeMismatch(format!(
                "cannot rotate {} dims at offset {} in heads of {} (row width {})",
                self.n_rot, offset, head_dim, feat_dim
            )));
        }
        let half = self.n_rot / 2;

        for row in 0..seq_len {
            let pos = position(row);
            if pos >= self.max_pos() {
                return Err(KernelError::ShapeMismatch(format!(
                    "rotary position {} exceeds table of {}",
                    pos,
                    self.max_pos()
                )));
            }
            for head in (0..feat_dim).step_by(head_dim) {
                let base = head + offset;
                for i in 0..half {
                    let (d0, d1) = match mode {
                        RotMode::Mode0 => (base + 2 * i, base + 2 * i + 1),
                        RotMode::Neox => (base + i, base + i + half),
                    };
                    let x0 = qk[[row, d0]];
                    let x1 = qk[[row, d1]];
                    let c = self.cos[[pos, i]];
                    let s = self.sin[[pos, i]];

                    qk[[row, d0]] = x0 * c - x1 * s;
                    qk[[row, d1]] = x0 * s + x1 * c;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rope_cache_basic() {
        let cache = RopeCache::new(128, 64, ROPE_THETA);
        assert_eq!(cache.cos.dim(), (128, 32));
        assert_eq!(cache.sin.dim(), (128, 32));
    }

    #[test]
    fn position_zero_is_identity() {
        let cache = RopeCache::new(8, 16, ROPE_THETA);
        let mut qk = Array2::from_shape_fn((1, 32), |(_, j)| j as f32);
        let before = qk.clone();
        cache.apply(qk.view_mut(), 16, 0, RotMode::Mode0, |_| 0).expect("rope");
        assert_eq!(qk, before);
    }

    #[test]
    fn rotation_preserves_pair_norm() {
        let cache = RopeCache::new(8, 8, ROPE_THETA);
        let mut qk = Array2::from_shape_fn((2, 16), |(i, j)| (i + j) as f32 * 0.3 + 0.1);
        let before = qk.clone();
        cache.apply(qk.view_mut(), 16, 8, RotMode::Neox, |r| r + 3).expect("rope");

        // dims outside the rotated range are untouched
        for j in 0..8 {
            assert_eq!(qk[[1, j]], before[[1, j]]);
        }
        let norm = |a: &Array2<f32>| a.iter().map(|x| x * x).sum::<f32>();
        assert_abs_diff_eq!(norm(&qk), norm(&before), epsilon = 1e-3);
    }

    #[test]
    fn rejects_position_past_table() {
        let cache = RopeCache::new(4, 8, ROPE_THETA);
        let mut qk = Array2::<f32>::zeros((1, 8));
        assert!(cache.apply(qk.view_mut(), 8, 0, RotMode::Mode0, |_| 4).is_err());
    }
}
