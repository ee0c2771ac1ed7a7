use inferforge_kernels::RotMode;

use super::alias_table;
use crate::error::Result;
use crate::graph::{Architecture, GraphBuilder};
use crate::module::blocks::{self, AttentionBlock, Residual};
use crate::module::{ffn, BuildContext, Module};
use crate::ops::{AttentionConfig, AttentionVariant, NormConfig, QkvLayout};
use crate::tensor::TensorRef;

pub(super) const RMS_EPS: f32 = 1e-5;

pub struct Llama;

/// Embedding, `n_layer` pre-norm attention blocks with the FFN pushed by
/// `ffn_branch(ctx, module, layer, normed)`, then the head.
pub(super) fn construct_llama_like<F>(builder: &mut GraphBuilder, ffn_branch: F) -> Result<()>
where
    F: Fn(&BuildContext, &mut Module, usize, TensorRef) -> Result<TensorRef>,
{
    let params = builder.params().clone();
    let ctx = builder.ctx().clone();
    let embd = params.n_embd;
    let norm = NormConfig::rms(RMS_EPS);

    let mut x = builder.push(blocks::embedding(
        &ctx,
        "tok_embeddings",
        builder.input(),
        params.n_vocab,
        embd,
    ))?;
    for layer in 0..params.n_layer {
        let block = AttentionBlock {
            name: format!("layers.{layer}.attention_block"),
            norm_name: format!("layers.{layer}.attention_norm"),
            norm,
            attn_name: format!("layers.{layer}.attention"),
            wo_name: None,
            attention: AttentionConfig {
                embd,
                n_head: params.n_head,
                n_ctx: params.n_ctx,
                layout: QkvLayout::Split,
                bias: false,
                variant: AttentionVariant::Llama {
                    n_rot: params.n_rot,
                    rot_mode: RotMode::Mode0,
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
            &format!("layers.{layer}.ffn_norm"),
            norm,
            embd,
            Residual::Input,
            |module, normed| ffn_branch(&ctx, module, layer, normed),
        )?)?;
    }
    builder.push(blocks::head(&ctx, x, "norm", norm, "output", params.n_vocab, embd))?;
    Ok(())
}

pub(super) fn llama_aliases() -> Vec<(String, String)> {
    alias_table(&[
        ("model.embed_tokens.weight", "tok_embeddings.weight"),
        ("model.norm.weight", "norm.weight"),
        ("lm_head.weight", "output.weight"),
        ("model.layers.x.input_layernorm.weight", "layers.x.attention_norm.weight"),
        ("model.layers.x.self_attn.q_proj.weight", "layers.x.attention.wq.weight"),
        ("model.layers.x.self_attn.k_proj.weight", "layers.x.attention.wk.weight"),
        ("model.layers.x.self_attn.v_proj.weight", "layers.x.attention.wv.weight"),
        ("model.layers.x.self_attn.o_proj.weight", "layers.x.attention.wo.weight"),
        ("model.layers.x.post_attention_layernorm.weight", "layers.x.ffn_norm.weight"),
        ("model.layers.x.mlp.gate_proj.weight", "layers.x.feed_forward.w1.weight"),
        ("model.layers.x.mlp.down_proj.weight", "layers.x.feed_forward.w2.weight"),
        ("model.layers.x.mlp.up_proj.weight", "layers.x.feed_forward.w3.weight"),
        // llama.cpp tensor names
        ("token_embd.weight", "tok_embeddings.weight"),
        ("output_norm.weight", "norm.weight"),
        ("blk.x.attn_norm.weight", "layers.x.attention_norm.weight"),
        ("blk.x.attn_q.weight", "layers.x.attention.wq.weight"),
        ("blk.x.attn_k.weight", "layers.x.attention.wk.weight"),
        ("blk.x.attn_v.weight", "layers.x.attention.wv.weight"),
        ("blk.x.attn_output.weight", "layers.x.attention.wo.weight"),
        ("blk.x.ffn_norm.weight", "layers.x.ffn_norm.weight"),
        ("blk.x.ffn_gate.weight", "layers.x.feed_forward.w1.weight"),
        ("blk.x.ffn_down.weight", "layers.x.feed_forward.w2.weight"),
        ("blk.x.ffn_up.weight", "layers.x.feed_forward.w3.weight"),
    ])
}

impl Architecture for Llama {
    fn name(&self) -> &'static str {
        "llama"
    }

    fn construct_llm(&self, builder: &mut GraphBuilder) -> Result<()> {
        let params = builder.params();
        let (embd, hidden) = (params.n_embd, ffn::llama_hidden(params.n_embd, params.n_mult));
        construct_llama_like(builder, |ctx, module, layer, normed| {
            ffn::llama_ffn(ctx, module, &format!("layers.{layer}.feed_forward"), normed, embd, hidden)
        })
    }

    fn weight_aliases(&self) -> Vec<(String, String)> {
        llama_aliases()
    }
}
