//! Feed-forward stacks. Each builder pushes its ops onto an existing module
//! and returns the branch output.

use inferforge_kernels::ElemMode;
use std::rc::Rc;

use super::{BuildContext, Module};
use crate::error::Result;
use crate::ops::{Elemwise, MatMul, SparseMatMul, SplitHalfActiveMul};
use crate::tensor::TensorRef;

/// LLaMA hidden width: `2/3 · 4 · embd` rounded up to a multiple of `mult`.
pub fn llama_hidden(embd: usize, mult: usize) -> usize {
    let mult = mult.max(1);
    (2 * 4 * embd / 3).div_ceil(mult) * mult
}

/// Rank of the sparse FFN activity predictor.
pub fn predictor_rank(embd: usize) -> usize {
    (embd / 4).max(1)
}

fn matmul(
    ctx: &BuildContext,
    module: &mut Module,
    name: String,
    input: TensorRef,
    n: usize,
    k: usize,
    bias: bool,
) -> TensorRef {
    module.push(MatMul::new(&ctx.device, name, input, n, k, bias, ctx.compt))
}

fn elemwise(
    ctx: &BuildContext,
    module: &mut Module,
    name: String,
    inputs: Vec<TensorRef>,
    mode: ElemMode,
) -> Result<TensorRef> {
    Ok(module.push(Elemwise::new(&ctx.device, name, inputs, mode, None, ctx.compt)?))
}

/// `w2 · (silu(w1 · x) ⊙ (w3 · x))`.
pub fn llama_ffn(
    ctx: &BuildContext,
    module: &mut Module,
    prefix: &str,
    input: TensorRef,
    embd: usize,
    hidden: usize,
) -> Result<TensorRef> {
    let gate = matmul(ctx, module, format!("{prefix}.w1"), Rc::clone(&input), hidden, embd, false);
    let gate = elemwise(ctx, module, format!("{prefix}.silu"), vec![gate], ElemMode::Silu)?;
    let up = matmul(ctx, module, format!("{prefix}.w3"), input, hidden, embd, false);
    let mixed = elemwise(ctx, module, format!("{prefix}.mul"), vec![gate, up], ElemMode::Mul)?;
    Ok(matmul(ctx, module, format!("{prefix}.w2"), mixed, embd, hidden, false))
}

/// `matmul2 · gelu(matmul1 · x + b1) + b2`.
pub fn glm_ffn(
    ctx: &BuildContext,
    module: &mut Module,
    prefix: &str,
    input: TensorRef,
    embd: usize,
    hidden: usize,
) -> Result<TensorRef> {
    let up = matmul(ctx, module, format!("{prefix}.matmul1"), input, hidden, embd, true);
    let act = elemwise(ctx, module, format!("{prefix}.gelu"), vec![up], ElemMode::Gelu)?;
    Ok(matmul(ctx, module, format!("{prefix}.matmul2"), act, embd, hidden, true))
}

/// Fused gate and up projection `{2·hidden, embd}` split in halves.
pub fn glm2_ffn(
    ctx: &BuildContext,
    module: &mut Module,
    prefix: &str,
    input: TensorRef,
    embd: usize,
    hidden: usize,
) -> Result<TensorRef> {
    let fused = matmul(ctx, module, format!("{prefix}.matmul1"), input, 2 * hidden, embd, false);
    let gated = module.push(SplitHalfActiveMul::new(
        &ctx.device,
        format!("{prefix}.swiglu"),
        fused,
        ElemMode::Silu,
        ctx.compt,
    ));
    Ok(matmul(ctx, module, format!("{prefix}.matmul2"), gated, embd, hidden, false))
}

/// Low-rank MLP scoring each hidden feature; positive scores are active.
pub fn predictor(
    ctx: &BuildContext,
    module: &mut Module,
    prefix: &str,
    input: TensorRef,
    embd: usize,
    hidden: usize,
) -> Result<TensorRef> {
    let rank = predictor_rank(embd);
    let low = matmul(ctx, module, format!("{prefix}.fc1"), input, rank, embd, false);
    let low = elemwise(ctx, module, format!("{prefix}.relu"), vec![low], ElemMode::Relu)?;
    Ok(matmul(ctx, module, format!("{prefix}.fc2"), low, hidden, rank, false))
}

/// LLaMA FFN whose gate and up projections only compute active features.
#[allow(clippy::too_many_arguments)]
pub fn sparse_ffn(
    ctx: &BuildContext,
    module: &mut Module,
    prefix: &str,
    input: TensorRef,
    scores: TensorRef,
    embd: usize,
    hidden: usize,
) -> Result<TensorRef> {
    let sparse = |module: &mut Module, name: String, input: TensorRef| {
        module.push(SparseMatMul::new(
            &ctx.device,
            name,
            input,
            Rc::clone(&scores),
            hidden,
            embd,
            ctx.compt,
        ))
    };
    let gate = sparse(module, format!("{prefix}.w1"), Rc::clone(&input));
    let gate = elemwise(ctx, module, format!("{prefix}.silu"), vec![gate], ElemMode::Silu)?;
    let up = sparse(module, format!("{prefix}.w3"), input);
    let mixed = elemwise(ctx, module, format!("{prefix}.mul"), vec![gate, up], ElemMode::Mul)?;
    Ok(matmul(ctx, module, format!("{prefix}.w2"), mixed, embd, hidden, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::ops::testing::{bind_f32, filled};
    use crate::ops::Op;
    use crate::workspace::Workspace;
    use inferforge_kernels::DType;

    #[test]
    fn llama_hidden_rounds_to_mult() {
        assert_eq!(llama_hidden(4096, 256), 11008);
        assert_eq!(llama_hidden(64, 32), 192);
    }

    fn run(module: &mut Module) -> Vec<f32> {
        module.deduce_output_shape().expect("deduce");
        module.execute(&mut Workspace::new(), 0, true).expect("execute");
        module.output().expect("output").f32().expect("f32").to_vec()
    }

    #[test]
    fn glm2_split_half_matches_gated_form() {
        let device = Device::reference();
        let ctx = BuildContext::new(&device, DType::F32);
        let x = filled(&device, "x", vec![1, 2], &[1.0, -1.0]);
        let mut module = Module::new("ffn", vec![Rc::clone(&x)]);
        glm2_ffn(&ctx, &mut module, "ffn", x, 2, 1).expect("ffn");

        let ops = module.ops();
        // gate row [2, 0], up row [1, 0.5]
        bind_f32(&ops[0].weights()[0], &[2.0, 0.0, 1.0, 0.5]);
        bind_f32(&ops[2].weights()[0], &[1.0, 3.0]);
        let out = run(&mut module);
        let silu = 2.0 / (1.0 + (-2.0f32).exp());
        let expected = silu * 0.5;
        assert!((out[0] - expected).abs() < 1e-5);
        assert!((out[1] - 3.0 * expected).abs() < 1e-5);
    }

    #[test]
    fn sparse_ffn_zeroes_inactive_features() {
        let device = Device::reference();
        let ctx = BuildContext::new(&device, DType::F32);
        let x = filled(&device, "x", vec![1, 2], &[1.0, 1.0]);
        let scores = filled(&device, "scores", vec![1, 2], &[-1.0, -1.0]);
        let mut module = Module::new("ffn", vec![Rc::clone(&x)]);
        sparse_ffn(&ctx, &mut module, "ffn", x, scores, 2, 2).expect("ffn");
        for op in module.ops() {
            for w in op.weights() {
                bind_f32(w, &vec![1.0; w.nr_elems()]);
            }
        }
        assert_eq!(run(&mut module), vec![0.0, 0.0]);
    }

    #[test]
    fn predictor_shapes() {
        let device = Device::reference();
        let ctx = BuildContext::new(&device, DType::F32);
        let x = filled(&device, "x", vec![3, 8], &[0.1; 24]);
        let mut module = Module::new("pred", vec![Rc::clone(&x)]);
        predictor(&ctx, &mut module, "layers.0.mlp_predictor", x, 8, 12).expect("predictor");
        let shapes: Vec<Vec<usize>> = module
            .ops()
            .iter()
            .flat_map(|op| op.weights().iter().map(|w| w.shape()).collect::<Vec<_>>())
            .collect();
        assert_eq!(shapes, vec![vec![2, 8], vec![12, 2]]);
        for op in module.ops() {
            for w in op.weights() {
                bind_f32(w, &vec![0.5; w.nr_elems()]);
            }
        }
        assert_eq!(run(&mut module).len(), 3 * 12);
    }
}
