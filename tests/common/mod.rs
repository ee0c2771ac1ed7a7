#![allow(dead_code)]

use anyhow::Result;
use inferforge::llm::fixtures::{load_graph, synth_model, SynthOptions};
use inferforge::{Device, Graph, LlmParams, UserConfig};
use std::rc::Rc;

/// The 2-layer model used by the end-to-end scenarios: `n_embd=64`,
/// `n_head=4`, `n_vocab=32`, `n_ctx=16`, F32 weights and compute.
pub fn scenario_params() -> LlmParams {
    LlmParams::tiny()
}

pub fn scenario_config() -> UserConfig {
    UserConfig::with_n_ctx(16)
}

pub fn synth(arch: &str, params: &LlmParams, config: &UserConfig, options: &SynthOptions) -> Result<Vec<u8>> {
    Ok(synth_model(arch, params, config, options)?)
}

pub fn load(arch: &str, bytes: &[u8], config: UserConfig, device: Rc<Device>) -> Result<Graph> {
    Ok(load_graph(arch, bytes, config, device)?)
}

pub fn scenario_graph() -> Result<Graph> {
    let bytes = synth("llama", &scenario_params(), &scenario_config(), &SynthOptions::default())?;
    load("llama", &bytes, scenario_config(), Device::reference())
}

/// Run one step and return the logits.
pub fn step(graph: &mut Graph, tokens: &[i32], nr_past: usize, prefill: bool) -> Result<Vec<f32>> {
    let mut logits = vec![0.0; graph.n_vocab()];
    graph.execute(tokens, &mut logits, nr_past, prefill)?;
    Ok(logits)
}

pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}
