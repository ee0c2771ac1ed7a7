use inferforge_kernels::RotMode;

use super::alias_table;
use crate::error::{LlmError, Result};
use crate::graph::{Architecture, GraphBuilder};
use crate::module::blocks::{self, AttentionBlock, Residual};
use crate::module::ffn;
use crate::ops::{AttentionConfig, AttentionVariant, NormConfig, QkvLayout};

const LAYER_NORM_EPS: f32 = 1e-5;

pub const GMASK_TOKEN: i32 = 130001;
pub const SOP_TOKEN: i32 = 130004;

/// ChatGLM-6B: LayerNorm with bias, fused per-head QKV, 2D rotary
/// positions and residuals scaled by `√(2·n_layer)`.
pub struct ChatGlm;

impl Architecture for ChatGlm {
    fn name(&self) -> &'static str {
        "chatglm"
    }

    fn construct_llm(&self, builder: &mut GraphBuilder) -> Result<()> {
        let params = builder.params().clone();
        let ctx = builder.ctx().clone();
        let gmask_position = builder.config().gmask_position.ok_or_else(|| {
            LlmError::Config("chatglm needs `gmask_position` in the user config".to_string())
        })?;
        let embd = params.n_embd;
        let norm = NormConfig::layer_norm(LAYER_NORM_EPS);
        let alpha = (2.0 * params.n_layer as f32).sqrt();

        let mut x = builder.push(blocks::embedding(
            &ctx,
            "word_embeddings",
            builder.input(),
            params.n_vocab,
            embd,
        ))?;
        for layer in 0..params.n_layer {
            let block = AttentionBlock {
                name: format!("layers.{layer}.attention_block"),
                norm_name: format!("layers.{layer}.input_layernorm"),
                norm,
                attn_name: format!("layers.{layer}.attention"),
                wo_name: None,
                attention: AttentionConfig {
                    embd,
                    n_head: params.n_head,
                    n_ctx: params.n_ctx,
                    layout: QkvLayout::FusedInterleaved,
                    bias: true,
                    variant: AttentionVariant::Glm {
                        gmask_position,
                        rot_mode: RotMode::Neox,
                    },
                },
                proj_bias: true,
                residual: Residual::ScaledNorm(alpha),
            };
            x = builder.push(blocks::attention_module(&ctx, x, &block)?)?;
            x = builder.push(blocks::ffn_module(
                &ctx,
                &format!("layers.{layer}.ffn_block"),
                x,
                &format!("layers.{layer}.post_attention_layernorm"),
                norm,
                embd,
                Residual::ScaledNorm(alpha),
                |module, normed| {
                    ffn::glm_ffn(&ctx, module, &format!("layers.{layer}.ffn"), normed, embd, params.n_mult)
                },
            )?)?;
        }
        builder.push(blocks::head(&ctx, x, "norm", norm, "output", params.n_vocab, embd))?;
        Ok(())
    }

    fn weight_aliases(&self) -> Vec<(String, String)> {
        let mut pairs = alias_table(&[
            ("transformer.word_embeddings.weight", "word_embeddings.weight"),
            ("transformer.final_layernorm.weight", "norm.weight"),
            ("transformer.final_layernorm.bias", "norm.bias"),
            ("lm_head.weight", "output.weight"),
        ]);
        for suffix in ["weight", "bias"] {
            pairs.extend(alias_table(&[
                ("input_layernorm", "input_layernorm"),
                ("attention.query_key_value", "attention.wqkv"),
                ("attention.dense", "attention.wo"),
                ("post_attention_layernorm", "post_attention_layernorm"),
                ("mlp.dense_h_to_4h", "ffn.matmul1"),
                ("mlp.dense_4h_to_h", "ffn.matmul2"),
            ])
            .into_iter()
            .map(|(alias, canonical)| {
                (
                    format!("transformer.layers.x.{alias}.{suffix}"),
                    format!("layers.x.{canonical}.{suffix}"),
                )
            }));
        }
        pairs
    }

    /// Append `[gMASK]` and `<sop>`.
    fn post_tokenize(&self, tokens: &mut Vec<i32>) {
        tokens.extend([GMASK_TOKEN, SOP_TOKEN]);
    }
}
