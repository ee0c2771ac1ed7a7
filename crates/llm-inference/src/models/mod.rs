//! Supported model families.

mod glm;
mod glm2;
mod llama;
mod sparse;

pub use glm::ChatGlm;
pub use glm2::ChatGlm2;
pub use llama::Llama;
pub use sparse::SparseLlama;

use crate::graph::Architecture;

/// Names accepted by [`crate::graph::make_graph`].
pub const ARCHITECTURES: &[&str] = &["llama", "chatglm", "chatglm2", "sparse-llama"];

pub fn by_name(name: &str) -> Option<Box<dyn Architecture>> {
    match name {
        "llama" => Some(Box::new(Llama)),
        "chatglm" => Some(Box::new(ChatGlm)),
        "chatglm2" => Some(Box::new(ChatGlm2)),
        "sparse-llama" => Some(Box::new(SparseLlama)),
        _ => None,
    }
}

fn alias_table(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(alias, canonical)| (alias.to_string(), canonical.to_string()))
        .collect()
}
