use super::alias_table;
use super::llama::RMS_EPS;
use crate::error::Result;
use crate::graph::{Architecture, GraphBuilder};
use crate::module::blocks::{self, AttentionBlock, Residual};
use crate::module::ffn;
use crate::ops::{AttentionConfig, AttentionVariant, NormConfig, QkvLayout};

/// ChatGLM2-6B: RMSNorm, grouped-query attention with a biased fused QKV,
/// SwiGLU FFN with a fused gate/up projection.
pub struct ChatGlm2;

impl Architecture for ChatGlm2 {
    fn name(&self) -> &'static str {
        "chatglm2"
    }

    fn construct_llm(&self, builder: &mut GraphBuilder) -> Result<()> {
        let params = builder.params().clone();
        let ctx = builder.ctx().clone();
        let embd = params.n_embd;
        let norm = NormConfig::rms(RMS_EPS);

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
                    layout: QkvLayout::Fused,
                    bias: true,
                    variant: AttentionVariant::Glm2 {
                        group: params.n_kv_head(),
                    },
                },
                proj_bias: false,
                residual: Residual::Input,
            };
            x = builder.push(blocks::attention_module(&ctx, x, &block)?)?;
            x = builder.push(blocks::ffn_module(
                &ctx,
                &format!("layers.{layer}.ffn_block"),
                x,
                &format!("layers.{layer}.post_attention_layernorm"),
                norm,
                embd,
                Residual::Input,
                |module, normed| {
                    ffn::glm2_ffn(&ctx, module, &format!("layers.{layer}.ffn"), normed, embd, params.n_mult)
                },
            )?)?;
        }
        builder.push(blocks::head(&ctx, x, "norm", norm, "output", params.n_vocab, embd))?;
        Ok(())
    }

    fn weight_aliases(&self) -> Vec<(String, String)> {
        let layer = |alias: &str, canonical: &str| {
            (
                format!("transformer.encoder.layers.x.{alias}"),
                format!("layers.x.{canonical}"),
            )
        };
        let mut pairs = alias_table(&[
            ("transformer.embedding.word_embeddings.weight", "word_embeddings.weight"),
            ("transformer.encoder.final_layernorm.weight", "norm.weight"),
            ("transformer.output_layer.weight", "output.weight"),
        ]);
        pairs.extend([
            layer("input_layernorm.weight", "input_layernorm.weight"),
            layer("self_attention.query_key_value.weight", "attention.wqkv.weight"),
            layer("self_attention.query_key_value.bias", "attention.wqkv.bias"),
            layer("self_attention.dense.weight", "attention.wo.weight"),
            layer("post_attention_layernorm.weight", "post_attention_layernorm.weight"),
            layer("mlp.dense_h_to_4h.weight", "ffn.matmul1.weight"),
            layer("mlp.dense_4h_to_h.weight", "ffn.matmul2.weight"),
        ]);
        pairs
    }

    /// Prepend `[gMASK]` and `sop`.
    fn post_tokenize(&self, tokens: &mut Vec<i32>) {
        tokens.splice(0..0, [64790, 64792]);
    }
}
