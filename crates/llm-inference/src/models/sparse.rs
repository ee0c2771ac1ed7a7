use super::alias_table;
use super::llama::{construct_llama_like, llama_aliases};
use crate::error::Result;
use crate::graph::{Architecture, GraphBuilder};
use crate::module::ffn;

/// LLaMA with a predictor-gated FFN (TurboSparse-Mistral layout). `n_mult`
/// is the FFN hidden width.
pub struct SparseLlama;

impl Architecture for SparseLlama {
    fn name(&self) -> &'static str {
        "sparse-llama"
    }

    fn construct_llm(&self, builder: &mut GraphBuilder) -> Result<()> {
        let (embd, hidden) = (builder.params().n_embd, builder.params().n_mult);
        construct_llama_like(builder, |ctx, module, layer, normed| {
            let scores = ffn::predictor(
                ctx,
                module,
                &format!("layers.{layer}.mlp_predictor"),
                normed.clone(),
                embd,
                hidden,
            )?;
            ffn::sparse_ffn(
                ctx,
                module,
                &format!("layers.{layer}.feed_forward"),
                normed,
                scores,
                embd,
                hidden,
            )
        })
    }

    fn weight_aliases(&self) -> Vec<(String, String)> {
        let mut aliases = llama_aliases();
        aliases.extend(alias_table(&[
            ("model.layers.x.mlp.predictor.fc1.weight", "layers.x.mlp_predictor.fc1.weight"),
            ("model.layers.x.mlp.predictor.fc2.weight", "layers.x.mlp_predictor.fc2.weight"),
        ]));
        aliases
    }
}
