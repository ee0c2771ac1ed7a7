//! Embedding, attention and head modules.

use inferforge_kernels::ElemMode;
use std::rc::Rc;

use super::{BuildContext, Module};
use crate::error::Result;
use crate::ops::{
    Attention, AttentionConfig, Elemwise, Embedding, LayerNorm, MatMul, MatMulLast, NormConfig,
};
use crate::tensor::TensorRef;

/// How a block's branch output is combined back into the residual stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Residual {
    /// `branch + input`.
    Input,
    /// `normed · alpha + branch`, where `normed` is the block's norm output.
    ScaledNorm(f32),
}

/// Push `LayerNorm` named `name`.
pub fn norm(
    ctx: &BuildContext,
    module: &mut Module,
    name: &str,
    input: TensorRef,
    embd: usize,
    config: NormConfig,
) -> TensorRef {
    module.push(LayerNorm::new(&ctx.device, name, input, embd, config, ctx.compt))
}

/// Push the residual add for a block.
pub fn residual(
    ctx: &BuildContext,
    module: &mut Module,
    name: &str,
    input: TensorRef,
    normed: TensorRef,
    branch: TensorRef,
    kind: Residual,
) -> Result<TensorRef> {
    let (operands, scale) = match kind {
        Residual::Input => (vec![branch, input], None),
        Residual::ScaledNorm(alpha) => (vec![normed, branch], Some(alpha)),
    };
    let op = Elemwise::new(&ctx.device, name, operands, ElemMode::Add, scale, ctx.compt)?;
    Ok(module.push(op))
}

pub fn embedding(ctx: &BuildContext, name: &str, tokens: TensorRef, vocab: usize, embd: usize) -> Module {
    let mut module = Module::new(name, vec![Rc::clone(&tokens)]);
    module.push(Embedding::new(&ctx.device, name, tokens, vocab, embd, ctx.compt));
    module
}

/// Names and shape of one pre-norm attention block.
#[derive(Debug, Clone)]
pub struct AttentionBlock {
    /// Module name, also the prefix of the residual op.
    pub name: String,
    pub norm_name: String,
    pub norm: NormConfig,
    /// Name of the attention op; the output projection is `{attn_name}.wo`
    /// unless `wo_name` overrides it.
    pub attn_name: String,
    pub wo_name: Option<String>,
    pub attention: AttentionConfig,
    /// The output projection has a bias.
    pub proj_bias: bool,
    pub residual: Residual,
}

/// `norm → attention → wo → residual`.
pub fn attention_module(ctx: &BuildContext, input: TensorRef, block: &AttentionBlock) -> Result<Module> {
    let embd = block.attention.embd;
    let mut module = Module::new(block.name.as_str(), vec![Rc::clone(&input)]);
    let normed = norm(ctx, &mut module, &block.norm_name, Rc::clone(&input), embd, block.norm);
    let attn = module.push(Attention::new(
        &ctx.device,
        block.attn_name.as_str(),
        Rc::clone(&normed),
        block.attention,
        ctx.compt,
    )?);
    let wo_name = block
        .wo_name
        .clone()
        .unwrap_or_else(|| format!("{}.wo", block.attn_name));
    let wo = MatMul::new(&ctx.device, wo_name, attn, embd, embd, block.proj_bias, ctx.compt);
    let projected = module.push(wo);
    residual(
        ctx,
        &mut module,
        &format!("{}.residual", block.name),
        input,
        normed,
        projected,
        block.residual,
    )?;
    Ok(module)
}

/// `norm → ffn → residual`, with the FFN ops pushed by `ffn`.
#[allow(clippy::too_many_arguments)]
pub fn ffn_module<F>(
    ctx: &BuildContext,
    name: &str,
    input: TensorRef,
    norm_name: &str,
    norm_config: NormConfig,
    embd: usize,
    kind: Residual,
    ffn: F,
) -> Result<Module>
where
    F: FnOnce(&mut Module, TensorRef) -> Result<TensorRef>,
{
    let mut module = Module::new(name, vec![Rc::clone(&input)]);
    let normed = norm(ctx, &mut module, norm_name, Rc::clone(&input), embd, norm_config);
    let branch = ffn(&mut module, Rc::clone(&normed))?;
    residual(ctx, &mut module, &format!("{}.residual", name), input, normed, branch, kind)?;
    Ok(module)
}

/// Final norm then the vocabulary projection of the last row. The logits
/// tensor is marked shared so it survives until the graph copies it out.
pub fn head(
    ctx: &BuildContext,
    input: TensorRef,
    norm_name: &str,
    norm_config: NormConfig,
    output_name: &str,
    vocab: usize,
    embd: usize,
) -> Module {
    let mut module = Module::new("head", vec![Rc::clone(&input)]);
    let normed = norm(ctx, &mut module, norm_name, input, embd, norm_config);
    let output = MatMulLast::new(&ctx.device, output_name, normed, vocab, embd, false, ctx.compt);
    let logits = module.push(output);
    logits.mark_shared();
    module
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::ops::testing::{bind_f32, filled};
    use crate::ops::{AttentionVariant, Op, QkvLayout};
    use crate::workspace::Workspace;
    use inferforge_kernels::{DType, RotMode};

    fn bind_ones(module: &Module) {
        for op in module.ops() {
            for w in op.weights() {
                bind_f32(w, &vec![0.01; w.nr_elems()]);
            }
        }
    }

    #[test]
    fn attention_block_weight_names() {
        let device = Device::reference();
        let ctx = BuildContext::new(&device, DType::F32);
        let x = filled(&device, "x", vec![2, 8], &[0.5; 16]);
        let block = AttentionBlock {
            name: "layers.0.attention_block".into(),
            norm_name: "layers.0.attention_norm".into(),
            norm: NormConfig::rms(1e-5),
            attn_name: "layers.0.attention".into(),
            wo_name: None,
            attention: AttentionConfig {
                embd: 8,
                n_head: 2,
                n_ctx: 4,
                layout: QkvLayout::Split,
                bias: false,
                variant: AttentionVariant::Llama { n_rot: 4, rot_mode: RotMode::Mode0 },
            },
            proj_bias: false,
            residual: Residual::Input,
        };
        let mut module = attention_module(&ctx, x, &block).expect("module");
        let names: Vec<String> = module
            .ops()
            .iter()
            .flat_map(|op| op.weights().iter().map(|w| w.name().to_string()).collect::<Vec<_>>())
            .collect();
        assert_eq!(
            names,
            vec![
                "layers.0.attention_norm.weight",
                "layers.0.attention.wq.weight",
                "layers.0.attention.wk.weight",
                "layers.0.attention.wv.weight",
                "layers.0.attention.wo.weight",
            ]
        );

        bind_ones(&module);
        module.deduce_output_shape().expect("deduce");
        let mut ws = Workspace::new();
        ws.reserve_bytes(module.workspace_in_bytes());
        module.execute(&mut ws, 0, true).expect("execute");
        assert_eq!(module.kv_lengths().collect::<Vec<_>>(), vec![2]);
        assert_eq!(module.output().map(|t| t.shape()), Some(vec![2, 8]));
    }

    #[test]
    fn head_projects_last_row() {
        let device = Device::reference();
        let ctx = BuildContext::new(&device, DType::F32);
        let x = filled(&device, "x", vec![3, 4], &[1.0; 12]);
        let mut module = head(&ctx, x, "norm", NormConfig::rms(1e-5), "output", 5, 4);
        bind_ones(&module);
        module.deduce_output_shape().expect("deduce");
        module.execute(&mut Workspace::new(), 0, true).expect("execute");
        let logits = module.output().expect("logits");
        assert!(logits.is_shared());
        assert_eq!(logits.shape(), vec![1, 5]);
    }
}
