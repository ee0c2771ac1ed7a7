//! Autoregressive generation on top of [`Graph::execute`].

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{LlmError, Result};
use crate::graph::Graph;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// `0` selects greedy decoding.
    pub temperature: f32,
    /// Keep only the `top_k` most likely tokens; `0` keeps all.
    pub top_k: usize,
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_k: 0,
            seed: 42,
        }
    }
}

pub struct Sampler {
    config: SamplerConfig,
    rng: fastrand::Rng,
}

/// Index of the largest logit; the first one wins ties.
pub fn argmax(logits: &[f32]) -> usize {
    logits
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (idx, &value)| {
            if value > best.1 {
                (idx, value)
            } else {
                best
            }
        })
        .0
}

impl Sampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            rng: fastrand::Rng::with_seed(config.seed),
            config,
        }
    }

    pub fn greedy() -> Self {
        Self::new(SamplerConfig::default())
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn sample(&mut self, logits: &[f32]) -> usize {
        let temperature = self.config.temperature;
        if temperature < 1e-5 || logits.len() < 2 {
            return argmax(logits);
        }

        let mut candidates: Vec<(usize, f32)> = logits.iter().copied().enumerate().collect();
        if self.config.top_k > 0 && self.config.top_k < candidates.len() {
            candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
            candidates.truncate(self.config.top_k);
        }

        // Shift by the max so exp() cannot overflow.
        let max = candidates
            .iter()
            .map(|&(_, logit)| logit)
            .fold(f32::NEG_INFINITY, f32::max);
        let weights: Vec<f32> = candidates
            .iter()
            .map(|&(_, logit)| ((logit - max) / temperature).exp())
            .collect();
        let total: f32 = weights.iter().sum();

        let mut target = self.rng.f32() * total;
        for (&(idx, _), weight) in candidates.iter().zip(&weights) {
            if target < *weight {
                return idx;
            }
            target -= weight;
        }
        candidates.last().map_or(0, |&(idx, _)| idx)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationMetrics {
    pub prompt_tokens: usize,
    pub prefill_ms: f64,
    pub decode_ms: f64,
    pub tokens_generated: usize,
    /// Decode throughput.
    pub tokens_per_sec: f64,
    pub kv_cache_bytes_per_token: usize,
}

/// Drives one prefill step over the prompt, then single-token decode steps.
pub struct Generator<'g> {
    graph: &'g mut Graph,
    sampler: Sampler,
    eos: Option<i32>,
    logits: Vec<f32>,
}

impl<'g> Generator<'g> {
    pub fn new(graph: &'g mut Graph, sampler: Sampler) -> Self {
        let logits = vec![0.0; graph.n_vocab()];
        Self {
            graph,
            sampler,
            eos: None,
            logits,
        }
    }

    /// Stop after emitting `eos`.
    pub fn with_eos(mut self, eos: i32) -> Self {
        self.eos = Some(eos);
        self
    }

    /// Logits of the last executed step.
    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    /// Tokenize `text` with the model vocabulary and apply the
    /// architecture's special tokens.
    pub fn encode_prompt(&self, text: &str) -> Vec<i32> {
        let mut tokens: Vec<i32> = self
            .graph
            .vocab()
            .encode(text)
            .into_iter()
            .filter_map(|id| i32::try_from(id).ok())
            .collect();
        self.graph.post_tokenize(&mut tokens);
        tokens
    }

    pub fn decode(&self, tokens: &[i32]) -> String {
        let ids: Vec<usize> = tokens
            .iter()
            .filter_map(|&id| usize::try_from(id).ok())
            .collect();
        self.graph.vocab().decode(&ids)
    }

    /// Generate up to `max_new_tokens` after `prompt`, starting from an empty
    /// context. Stops early on EOS or when the context is full.
    pub fn generate(&mut self, prompt: &[i32], max_new_tokens: usize) -> Result<(Vec<i32>, GenerationMetrics)> {
        if prompt.is_empty() {
            return Err(LlmError::Config("prompt is empty".to_string()));
        }
        self.graph.reset_ctx();
        let n_ctx = self.graph.n_ctx();

        let prefill_start = Instant::now();
        self.graph.execute(prompt, &mut self.logits, 0, true)?;
        let prefill_ms = prefill_start.elapsed().as_secs_f64() * 1000.0;
        let mut nr_past = prompt.len();

        let mut generated = Vec::with_capacity(max_new_tokens);
        let decode_start = Instant::now();
        while generated.len() < max_new_tokens {
            let token = self.sample_token()?;
            generated.push(token);
            if Some(token) == self.eos || generated.len() == max_new_tokens {
                break;
            }
            if nr_past >= n_ctx {
                debug!(nr_past, "context full");
                break;
            }
            self.graph.execute(&[token], &mut self.logits, nr_past, false)?;
            nr_past += 1;
        }
        let decode_ms = decode_start.elapsed().as_secs_f64() * 1000.0;

        let tokens_per_sec = if decode_ms > 0.0 {
            generated.len() as f64 / decode_ms * 1000.0
        } else {
            0.0
        };
        let metrics = GenerationMetrics {
            prompt_tokens: prompt.len(),
            prefill_ms,
            decode_ms,
            tokens_generated: generated.len(),
            tokens_per_sec,
            kv_cache_bytes_per_token: self.graph.kv_bytes_per_token(),
        };
        info!(
            prompt = prompt.len(),
            generated = generated.len(),
            prefill_ms,
            tokens_per_sec,
            "generation finished"
        );
        Ok((generated, metrics))
    }

    fn sample_token(&mut self) -> Result<i32> {
        let id = self.sampler.sample(&self.logits);
        i32::try_from(id).map_err(|_| LlmError::Fatal(format!("sampled id {} overflows i32", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LlmParams, UserConfig};
    use crate::device::Device;
    use crate::fixtures::{synth_graph, SynthOptions};

    fn tiny_graph() -> Graph {
        synth_graph(
            "llama",
            &LlmParams::tiny(),
            UserConfig::with_n_ctx(16),
            &SynthOptions::default(),
            Device::reference(),
        )
        .unwrap()
    }

    #[test]
    fn argmax_prefers_first_maximum() {
        assert_eq!(argmax(&[0.1, 3.0, 3.0, -1.0]), 1);
        assert_eq!(argmax(&[]), 0);
    }

    #[test]
    fn greedy_sampler_is_argmax() {
        let mut sampler = Sampler::greedy();
        assert_eq!(sampler.sample(&[0.0, 0.5, 0.2]), 1);
    }

    #[test]
    fn top_one_is_greedy_at_any_temperature() {
        let mut sampler = Sampler::new(SamplerConfig {
            temperature: 5.0,
            top_k: 1,
            seed: 3,
        });
        for _ in 0..20 {
            assert_eq!(sampler.sample(&[0.3, -2.0, 0.9, 0.8]), 2);
        }
    }

    #[test]
    fn temperature_sampling_is_seeded() {
        let config = SamplerConfig {
            temperature: 1.0,
            top_k: 0,
            seed: 11,
        };
        let logits = [0.0f32; 8];
        let mut a = Sampler::new(config);
        let mut b = Sampler::new(config);
        let draws_a: Vec<usize> = (0..16).map(|_| a.sample(&logits)).collect();
        let draws_b: Vec<usize> = (0..16).map(|_| b.sample(&logits)).collect();
        assert_eq!(draws_a, draws_b);
        assert!(draws_a.iter().all(|&id| id < 8));
    }

    #[test]
    fn generation_advances_the_cache() {
        let mut graph = tiny_graph();
        let (tokens, metrics) = Generator::new(&mut graph, Sampler::greedy())
            .generate(&[1, 2, 3], 4)
            .unwrap();
        assert_eq!(tokens.len(), 4);
        assert_eq!(metrics.prompt_tokens, 3);
        assert_eq!(metrics.tokens_generated, 4);
        // The last sampled token is never fed back.
        assert_eq!(graph.kv_lengths(), vec![6, 6]);
    }

    #[test]
    fn greedy_generation_is_reproducible() {
        let mut graph = tiny_graph();
        let mut generator = Generator::new(&mut graph, Sampler::greedy());
        let (first, _) = generator.generate(&[4, 5], 5).unwrap();
        let (second, _) = generator.generate(&[4, 5], 5).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn stops_on_eos_and_full_context() {
        let mut graph = tiny_graph();
        let mut generator = Generator::new(&mut graph, Sampler::greedy());
        let (probe, _) = generator.generate(&[1], 1).unwrap();
        let mut generator = generator.with_eos(probe[0]);
        let (tokens, _) = generator.generate(&[1], 8).unwrap();
        assert_eq!(tokens, probe);

        let mut graph = tiny_graph();
        let (tokens, _) = Generator::new(&mut graph, Sampler::greedy())
            .generate(&[1; 14], 10)
            .unwrap();
        // 14 prompt tokens + 2 fed back fill n_ctx = 16; one more is sampled.
        assert_eq!(tokens.len(), 3);
        assert_eq!(graph.kv_lengths(), vec![16, 16]);
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let mut graph = tiny_graph();
        let err = Generator::new(&mut graph, Sampler::greedy()).generate(&[], 2);
        assert!(matches!(err, Err(LlmError::Config(_))));
    }
}
