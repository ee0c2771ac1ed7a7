//! Self-attention with a per-instance KV cache.
//!
//! One op covers the LLaMA, GLM-1 and GLM-2 flavours. They differ in how
//! the QKV projection is laid out, which dims get rotated, and how the mask
//! treats the GLM context prefix.

use inferforge_kernels::{DType, HeadLayout, MaskKind, RopeCache, RotMode, ROPE_THETA};
use ndarray::{ArrayView2, ArrayViewMut2};
use std::rc::Rc;

use super::matmul::run_matmul;
use super::{int4_reorder_applies, pack_weight, rows_and_width, MatmulInfo, Op, OpCore, Preprocessed};
use crate::device::Device;
use crate::error::{LlmError, Result};
use crate::kv_cache::KvStorage;
use crate::tensor::{Tensor, TensorRef};
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionVariant {
    /// Rotary embedding on the first `n_rot` dims of each head.
    Llama { n_rot: usize, rot_mode: RotMode },
    /// 2D rotary embedding: the first half of each head is rotated by the
    /// position clamped at `gmask_position`, the second half by the block
    /// position past it. Keys up to `gmask_position` are visible to every
    /// query.
    Glm { gmask_position: usize, rot_mode: RotMode },
    /// Grouped-query attention with `group` kv heads. Rotates the first
    /// half of each head.
    Glm2 { group: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QkvLayout {
    /// Separate `wq`, `wk`, `wv`.
    Split,
    /// One `wqkv` producing `[Q | K | V]` per row.
    Fused,
    /// One `wqkv` producing `[q_h | k_h | v_h]` for each head in turn.
    FusedInterleaved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionConfig {
    pub embd: usize,
    pub n_head: usize,
    pub n_ctx: usize,
    pub layout: QkvLayout,
    pub bias: bool,
    pub variant: AttentionVariant,
}

struct Projection {
    weight: TensorRef,
    bias: Option<TensorRef>,
    packed: bool,
}

pub struct Attention {
    core: OpCore,
    config: AttentionConfig,
    layout: HeadLayout,
    projections: Vec<Projection>,
    rope: RopeCache,
    k_cache: KvStorage,
    v_cache: KvStorage,
    /// Rows appended by the current step, committed in `end_execute`.
    pending: Option<usize>,
}

impl Attention {
    pub fn new(
        device: &Rc<Device>,
        name: impl Into<String>,
        input: TensorRef,
        config: AttentionConfig,
        compt: DType,
    ) -> Result<Self> {
        let name = name.into();
        let AttentionConfig { embd, n_head, n_ctx, layout, bias, variant } = config;
        if n_head == 0 || embd % n_head != 0 {
            return Err(LlmError::Config(format!(
                "attention `{}`: embd {} is not divisible by {} heads",
                name, embd, n_head
            )));
        }
        let head_dim = embd / n_head;
        let n_kv_head = match variant {
            AttentionVariant::Glm2 { group } => group,
            _ => n_head,
        };
        if n_kv_head == 0 || n_head % n_kv_head != 0 {
            return Err(LlmError::Config(format!(
                "attention `{}`: {} heads cannot share {} kv heads",
                name, n_head, n_kv_head
            )));
        }
        match (variant, layout) {
            (AttentionVariant::Glm2 { .. }, QkvLayout::Split) => {
                return Err(LlmError::Config(format!(
                    "attention `{}`: grouped-query attention needs a fused wqkv",
                    name
                )))
            }
            (AttentionVariant::Glm2 { .. }, QkvLayout::FusedInterleaved) => {
                return Err(LlmError::Config(format!(
                    "attention `{}`: grouped-query attention uses the contiguous layout",
                    name
                )))
            }
            _ => {}
        }

        let n_rot = match variant {
            AttentionVariant::Llama { n_rot, .. } => n_rot,
            AttentionVariant::Glm { .. } | AttentionVariant::Glm2 { .. } => head_dim / 2,
        };
        if n_rot > head_dim || n_rot % 2 != 0 {
            return Err(LlmError::Config(format!(
                "attention `{}`: cannot rotate {} dims of a {}-wide head",
                name, n_rot, head_dim
            )));
        }

        let d_kv = n_kv_head * head_dim;
        let mut core = OpCore::new(device, name, vec![input], 1, compt);
        let mut add = |prefix: &str, n: usize| {
            let weight = core.add_weight(&format!("{}.weight", prefix), vec![n, embd], false);
            let bias = bias.then(|| core.add_weight(&format!("{}.bias", prefix), vec![n], true));
            Projection { weight, bias, packed: false }
        };
        let projections = match layout {
            QkvLayout::Split => vec![add("wq", embd), add("wk", d_kv), add("wv", d_kv)],
            QkvLayout::Fused | QkvLayout::FusedInterleaved => vec![add("wqkv", embd + 2 * d_kv)],
        };

        Ok(Self {
            k_cache: KvStorage::new(device, n_ctx, d_kv, compt)?,
            v_cache: KvStorage::new(device, n_ctx, d_kv, compt)?,
            core,
            config,
            layout: HeadLayout { n_head, n_kv_head, head_dim },
            projections,
            rope: RopeCache::new(n_ctx, n_rot, ROPE_THETA),
            pending: None,
        })
    }

    fn d_kv(&self) -> usize {
        self.layout.n_kv_head * self.layout.head_dim
    }

    fn fused_width(&self) -> usize {
        self.config.embd + 2 * self.d_kv()
    }

    fn seq_len(&self) -> Result<usize> {
        let (rows, width) = rows_and_width(self.core.input(0))?;
        if width != self.config.embd {
            return Err(LlmError::Shape(format!(
                "attention `{}` expects width {}, input is {:?}",
                self.core.name(),
                self.config.embd,
                self.core.input(0).shape()
            )));
        }
        Ok(rows)
    }

    fn project(&self, lhs: ArrayView2<'_, f32>, idx: usize, out: &mut [f32]) -> Result<()> {
        let proj = &self.projections[idx];
        run_matmul(self.core.device(), lhs, &proj.weight, proj.bias.as_deref(), out)
    }

    /// Scatter a fused projection `{L, embd + 2·d_kv}` into Q, K and V.
    fn split_fused(&self, qkv: &[f32], q: &mut [f32], k: &mut [f32], v: &mut [f32]) {
        let embd = self.config.embd;
        let d_kv = self.d_kv();
        let d = self.layout.head_dim;
        let width = self.fused_width();
        for (r, row) in qkv.chunks_exact(width).enumerate() {
            let (q_row, k_row, v_row) = (
                &mut q[r * embd..(r + 1) * embd],
                &mut k[r * d_kv..(r + 1) * d_kv],
                &mut v[r * d_kv..(r + 1) * d_kv],
            );
            if self.config.layout == QkvLayout::FusedInterleaved {
                for (h, head) in row.chunks_exact(3 * d).enumerate() {
                    q_row[h * d..(h + 1) * d].copy_from_slice(&head[..d]);
                    k_row[h * d..(h + 1) * d].copy_from_slice(&head[d..2 * d]);
                    v_row[h * d..(h + 1) * d].copy_from_slice(&head[2 * d..]);
                }
            } else {
                q_row.copy_from_slice(&row[..embd]);
                k_row.copy_from_slice(&row[embd..embd + d_kv]);
                v_row.copy_from_slice(&row[embd + d_kv..]);
            }
        }
    }

    fn apply_rope(&self, data: &mut [f32], width: usize, nr_past: usize) -> Result<()> {
        let kernel = self.core.device().kernel();
        let d = self.layout.head_dim;
        let rows = data.len() / width;
        let mut view = ArrayViewMut2::from_shape((rows, width), data)?;
        match self.config.variant {
            AttentionVariant::Llama { rot_mode, .. } => {
                kernel.rope(&self.rope, view, d, 0, rot_mode, &|r: usize| nr_past + r)?;
            }
            AttentionVariant::Glm { gmask_position, rot_mode } => {
                let g = gmask_position;
                kernel.rope(&self.rope, view.view_mut(), d, 0, rot_mode, &|r: usize| {
                    (nr_past + r).min(g)
                })?;
                kernel.rope(&self.rope, view, d, d / 2, rot_mode, &|r: usize| {
                    (nr_past + r).saturating_sub(g)
                })?;
            }
            AttentionVariant::Glm2 { .. } => {
                kernel.rope(&self.rope, view, d, 0, RotMode::Mode0, &|r: usize| nr_past + r)?;
            }
        }
        Ok(())
    }

    fn mask(&self, seq_len: usize, nr_past: usize) -> MaskKind {
        match self.config.variant {
            _ if seq_len == 1 => MaskKind::None,
            AttentionVariant::Glm { gmask_position, .. } => MaskKind::Prefix {
                context_end: gmask_position,
                past: nr_past,
            },
            _ => MaskKind::Causal { past: nr_past },
        }
    }

    fn projection_of(&self, weight: &Tensor) -> Option<usize> {
        self.projections
            .iter()
            .position(|p| std::ptr::eq(p.weight.as_ref(), weight))
    }
}

impl Op for Attention {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn deduce_output_shape(&mut self) -> Result<()> {
        let seq_len = self.seq_len()?;
        self.core.output().set_shape(vec![seq_len, self.config.embd]);
        Ok(())
    }

    fn workspace_in_bytes(&self) -> usize {
        let seq_len = self.seq_len().unwrap_or(0);
        let qkv = match self.config.layout {
            QkvLayout::Split => 0,
            _ => seq_len * self.fused_width(),
        };
        let floats = qkv
            + seq_len * (self.config.embd + 2 * self.d_kv())
            + seq_len * self.config.n_ctx;
        floats * std::mem::size_of::<f32>()
    }

    fn execute(&mut self, workspace: &mut Workspace, nr_past: usize) -> Result<()> {
        let seq_len = self.seq_len()?;
        if nr_past != self.k_cache.current_length() {
            return Err(LlmError::Fatal(format!(
                "attention `{}` called with nr_past {} but holds {} cached tokens",
                self.core.name(),
                nr_past,
                self.k_cache.current_length()
            )));
        }
        self.k_cache.prepare_data_with_length(seq_len)?;
        self.v_cache.prepare_data_with_length(seq_len)?;

        let embd = self.config.embd;
        let d_kv = self.d_kv();
        let total = nr_past + seq_len;
        let fused = match self.config.layout {
            QkvLayout::Split => 0,
            _ => seq_len * self.fused_width(),
        };
        let [qkv, q, k, v, scores] = workspace.carve([
            fused,
            seq_len * embd,
            seq_len * d_kv,
            seq_len * d_kv,
            seq_len * total,
        ])?;

        {
            let input = self.core.input(0).read_f32()?;
            let lhs = ArrayView2::from_shape((seq_len, embd), &input[..])?;
            if self.config.layout == QkvLayout::Split {
                self.project(lhs.view(), 0, q)?;
                self.project(lhs.view(), 1, k)?;
                self.project(lhs, 2, v)?;
            } else {
                self.project(lhs, 0, qkv)?;
                self.split_fused(qkv, q, k, v);
            }
        }

        self.apply_rope(q, embd, nr_past)?;
        self.apply_rope(k, d_kv, nr_past)?;
        self.k_cache.write_rows(nr_past, k)?;
        self.v_cache.write_rows(nr_past, v)?;

        let keys = self.k_cache.rows(total)?;
        let values = self.v_cache.rows(total)?;
        let mut out = self.core.output().write_f32()?;
        self.core.device().kernel().attention(
            ArrayView2::from_shape((seq_len, embd), &q[..])?,
            ArrayView2::from_shape((total, d_kv), &keys[..])?,
            ArrayView2::from_shape((total, d_kv), &values[..])?,
            self.layout,
            self.mask(seq_len, nr_past),
            1.0 / (self.layout.head_dim as f32).sqrt(),
            scores,
            ArrayViewMut2::from_shape((seq_len, embd), &mut out[..])?,
        )?;
        out.commit()?;

        self.pending = Some(seq_len);
        Ok(())
    }

    fn end_execute(&mut self) -> Result<()> {
        for input in self.inputs() {
            input.decrease_curr_user_count()?;
        }
        if let Some(len) = self.pending.take() {
            self.k_cache.add_id(len);
            self.v_cache.add_id(len);
        }
        Ok(())
    }

    fn need_preprocess_weight(&self, weight: &Tensor) -> bool {
        self.projection_of(weight).is_some() && int4_reorder_applies(self.core.device(), weight)
    }

    fn preprocess_weight(&mut self, weight: &Tensor, src: &[u8]) -> Result<Preprocessed> {
        let idx = self
            .projection_of(weight)
            .filter(|_| int4_reorder_applies(self.core.device(), weight))
            .ok_or_else(|| {
                LlmError::Fatal(format!(
                    "weight `{}` does not qualify for the int4 reorder",
                    weight.name()
                ))
            })?;
        let packed = pack_weight(weight, src)?;
        self.projections[idx].packed = true;
        Ok(packed)
    }

    fn reset_ctx(&mut self) {
        self.pending = None;
        for cache in [&mut self.k_cache, &mut self.v_cache] {
            cache.reset_id();
            cache.recall_data();
        }
    }

    fn kv_length(&self) -> Option<usize> {
        Some(self.k_cache.current_length())
    }

    fn kv_bytes_per_token(&self) -> usize {
        self.k_cache.bytes_per_token() + self.v_cache.bytes_per_token()
    }

    fn matmul_info(&self, weight: &Tensor) -> Option<MatmulInfo> {
        let proj = &self.projections[self.projection_of(weight)?];
        let stored = proj.weight.dim(0);
        Some(MatmulInfo {
            weight_packed: proj.packed,
            n: if proj.packed { stored * inferforge_kernels::PACK_SIZE } else { stored },
            k: self.config.embd,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::testing::{bind_f32, filled, run};
    use approx::assert_abs_diff_eq;

    const EMBD: usize = 16;

    fn noise(len: usize, seed: u64) -> Vec<f32> {
        let mut rng = fastrand::Rng::with_seed(seed);
        (0..len).map(|_| rng.f32() - 0.5).collect()
    }

    fn llama(n_ctx: usize) -> AttentionConfig {
        AttentionConfig {
            embd: EMBD,
            n_head: 2,
            n_ctx,
            layout: QkvLayout::Split,
            bias: false,
            variant: AttentionVariant::Llama { n_rot: 8, rot_mode: RotMode::Mode0 },
        }
    }

    fn bind_all(op: &Attention, seed: u64) {
        for (i, w) in op.weights().iter().enumerate() {
            bind_f32(w, &noise(w.nr_elems(), seed + i as u64));
        }
    }

    fn feed(x: &TensorRef, rows: &[f32]) {
        x.set_shape(vec![rows.len() / EMBD, EMBD]);
        x.prepare_data().expect("prepare");
        x.f32_mut().expect("f32").copy_from_slice(rows);
    }

    #[test]
    fn single_token_returns_its_value() {
        let device = Device::reference();
        let row = noise(EMBD, 1);
        let x = filled(&device, "x", vec![1, EMBD], &row);
        let mut op = Attention::new(&device, "attn", x, llama(8), DType::F32).expect("attention");
        bind_all(&op, 10);

        let out = run(&mut op, 0).expect("run");
        let wv = op.weights()[2].f32().expect("wv").to_vec();
        for (n, got) in out.iter().enumerate() {
            let expected: f32 = (0..EMBD).map(|k| row[k] * wv[n * EMBD + k]).sum();
            assert_abs_diff_eq!(*got, expected, epsilon = 1e-5);
        }
        assert_eq!(op.kv_length(), Some(1));
    }

    #[test]
    fn incremental_decode_matches_prefill() {
        let device = Device::reference();
        let rows = noise(3 * EMBD, 2);

        let x = filled(&device, "x", vec![3, EMBD], &rows);
        let mut prefill = Attention::new(&device, "attn", x, llama(8), DType::F32).expect("attention");
        bind_all(&prefill, 20);
        let full = run(&mut prefill, 0).expect("prefill");

        let x = filled(&device, "x", vec![1, EMBD], &rows[..EMBD]);
        let mut step = Attention::new(&device, "attn", Rc::clone(&x), llama(8), DType::F32)
            .expect("attention");
        bind_all(&step, 20);
        let mut last = Vec::new();
        for t in 0..3 {
            feed(&x, &rows[t * EMBD..(t + 1) * EMBD]);
            last = run(&mut step, t).expect("decode");
        }
        for (a, b) in full[2 * EMBD..].iter().zip(&last) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
        assert_eq!(step.kv_length(), Some(3));
    }

    #[test]
    fn stale_past_is_fatal() {
        let device = Device::reference();
        let x = filled(&device, "x", vec![1, EMBD], &noise(EMBD, 3));
        let mut op = Attention::new(&device, "attn", x, llama(4), DType::F32).expect("attention");
        bind_all(&op, 30);
        assert!(matches!(run(&mut op, 2), Err(LlmError::Fatal(_))));
    }

    #[test]
    fn append_past_context_is_fatal() {
        let device = Device::reference();
        let x = filled(&device, "x", vec![2, EMBD], &noise(2 * EMBD, 4));
        let mut op = Attention::new(&device, "attn", x, llama(3), DType::F32).expect("attention");
        bind_all(&op, 40);
        run(&mut op, 0).expect("first two fit");
        assert!(matches!(run(&mut op, 2), Err(LlmError::Fatal(_))));
        assert_eq!(op.kv_length(), Some(2));

        op.reset_ctx();
        assert_eq!(op.kv_length(), Some(0));
        run(&mut op, 0).expect("fits again after reset");
    }

    #[test]
    fn grouped_query_shapes() {
        let device = Device::reference();
        let x = filled(&device, "x", vec![2, EMBD], &noise(2 * EMBD, 5));
        let config = AttentionConfig {
            n_head: 4,
            layout: QkvLayout::Fused,
            bias: true,
            variant: AttentionVariant::Glm2 { group: 2 },
            ..llama(4)
        };
        let mut op = Attention::new(&device, "attn", x, config, DType::F32).expect("attention");
        assert_eq!(op.weights()[0].shape(), vec![EMBD + 2 * 8, EMBD]);
        assert_eq!(op.weights()[1].shape(), vec![EMBD + 2 * 8]);
        assert_eq!(op.kv_bytes_per_token(), 2 * 8 * 4);
        bind_all(&op, 50);
        assert_eq!(run(&mut op, 0).expect("run").len(), 2 * EMBD);
    }

    #[test]
    fn grouped_query_rejects_split_weights() {
        let device = Device::reference();
        let x = filled(&device, "x", vec![1, EMBD], &noise(EMBD, 6));
        let config = AttentionConfig {
            n_head: 4,
            variant: AttentionVariant::Glm2 { group: 2 },
            ..llama(4)
        };
        assert!(matches!(
            Attention::new(&device, "attn", x, config, DType::F32),
            Err(LlmError::Config(_))
        ));
    }

    #[test]
    fn interleaved_fused_matches_split() {
        let device = Device::reference();
        let rows = noise(3 * EMBD, 7);
        let glm = AttentionConfig {
            bias: true,
            variant: AttentionVariant::Glm { gmask_position: 1, rot_mode: RotMode::Neox },
            ..llama(4)
        };

        let x = filled(&device, "x", vec![3, EMBD], &rows);
        let mut split = Attention::new(&device, "split", x, glm, DType::F32).expect("split");
        bind_all(&split, 70);

        let x = filled(&device, "x", vec![3, EMBD], &rows);
        let fused_config = AttentionConfig { layout: QkvLayout::FusedInterleaved, ..glm };
        let mut fused = Attention::new(&device, "fused", x, fused_config, DType::F32).expect("fused");

        let d = EMBD / 2;
        let parts: Vec<Vec<f32>> = split
            .weights()
            .iter()
            .map(|w| w.f32().expect("f32").to_vec())
            .collect();
        let (mut weight, mut bias) = (Vec::new(), Vec::new());
        for h in 0..2 {
            for p in 0..3 {
                weight.extend_from_slice(&parts[2 * p][h * d * EMBD..(h + 1) * d * EMBD]);
                bias.extend_from_slice(&parts[2 * p + 1][h * d..(h + 1) * d]);
            }
        }
        bind_f32(&fused.weights()[0], &weight);
        bind_f32(&fused.weights()[1], &bias);

        let a = run(&mut split, 0).expect("split run");
        let b = run(&mut fused, 0).expect("fused run");
        for (x, y) in a.iter().zip(&b) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-5);
        }
    }

    #[test]
    fn f16_cache_tracks_f32() {
        let device = Device::reference();
        let rows = noise(2 * EMBD, 8);
        let x = filled(&device, "x", vec![2, EMBD], &rows);
        let mut wide = Attention::new(&device, "attn", x, llama(4), DType::F32).expect("f32");
        bind_all(&wide, 80);
        let x = filled(&device, "x", vec![2, EMBD], &rows);
        let mut half = Attention::new(&device, "attn", x, llama(4), DType::F16).expect("f16");
        bind_all(&half, 80);
        assert_eq!(half.kv_bytes_per_token(), 2 * EMBD * 2);

        let a = run(&mut wide, 0).expect("f32 run");
        let b = run(&mut half, 0).expect("f16 run");
        for (x, y) in a.iter().zip(&b) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-2);
        }
    }
}
