//! CLI wiring for InferForge.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use inferforge_kernels::DType;
use inferforge_llm::fixtures::{synth_model, SynthOptions};
use inferforge_llm::models::ARCHITECTURES;
use inferforge_llm::{
    make_graph, Device, Generator, LlmParams, ModelReader, Sampler, SamplerConfig, UserConfig,
};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "inferforge", about = "InferForge LLM inference toolkit")]
pub struct Cli {
    /// Registered kernel to execute with (`parallel` or `reference`).
    #[arg(long, default_value = "parallel")]
    pub kernel: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComptArg {
    F32,
    F16,
}

impl From<ComptArg> for DType {
    fn from(value: ComptArg) -> DType {
        match value {
            ComptArg::F32 => DType::F32,
            ComptArg::F16 => DType::F16,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum WeightArg {
    F32,
    Int8,
    Int4,
}

impl From<WeightArg> for DType {
    fn from(value: WeightArg) -> DType {
        match value {
            WeightArg::F32 => DType::F32,
            WeightArg::Int8 => DType::Int8,
            WeightArg::Int4 => DType::Int4,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresetArg {
    Tiny,
    TinyGlm,
    TinyGlm2,
}

impl From<PresetArg> for LlmParams {
    fn from(value: PresetArg) -> LlmParams {
        match value {
            PresetArg::Tiny => LlmParams::tiny(),
            PresetArg::TinyGlm => LlmParams::tiny_glm(),
            PresetArg::TinyGlm2 => LlmParams::tiny_glm2(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate text from a prompt.
    Run {
        #[arg(long)]
        model: PathBuf,
        #[arg(long, default_value = "llama")]
        arch: String,
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value_t = 32)]
        max_tokens: usize,
        #[arg(long, default_value_t = 0.0)]
        temperature: f32,
        #[arg(long, default_value_t = 0)]
        top_k: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// JSON user config; flags below override its fields.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        n_ctx: Option<usize>,
        #[arg(long, value_enum)]
        compt: Option<ComptArg>,
        #[arg(long)]
        gmask_position: Option<usize>,
        #[arg(long)]
        eos: Option<i32>,
    },
    /// Print the header, vocabulary size and tensor table of a model file as JSON.
    Inspect {
        #[arg(long)]
        model: PathBuf,
    },
    /// Write a model file with random weights.
    Synth {
        #[arg(long, default_value = "llama")]
        arch: String,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, value_enum, default_value = "tiny")]
        preset: PresetArg,
        /// JSON `LlmParams`, replacing the preset.
        #[arg(long)]
        params: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "f32")]
        weight_dtype: WeightArg,
        #[arg(long, default_value_t = 0x5eed)]
        seed: u64,
        #[arg(long)]
        gmask_position: Option<usize>,
    },
}

#[derive(Debug, Serialize)]
pub struct TensorSummary {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub bytes: usize,
}

#[derive(Debug, Serialize)]
pub struct ModelSummary {
    pub params: LlmParams,
    pub vocab_size: usize,
    pub tensors: Vec<TensorSummary>,
    pub total_bytes: usize,
}

pub fn inspect_model(path: &Path) -> Result<ModelSummary> {
    let mut reader = ModelReader::open_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut tensors = Vec::new();
    while let Some(record) = reader.next_tensor()? {
        tensors.push(TensorSummary {
            bytes: record.data.len(),
            name: record.name,
            dtype: record.dtype,
            shape: record.shape,
        });
    }
    Ok(ModelSummary {
        params: reader.params().clone(),
        vocab_size: reader.vocab().len(),
        total_bytes: tensors.iter().map(|t| t.bytes).sum(),
        tensors,
    })
}

fn check_arch(arch: &str) -> Result<()> {
    if !ARCHITECTURES.contains(&arch) {
        bail!("unknown architecture `{}`; expected one of {:?}", arch, ARCHITECTURES);
    }
    Ok(())
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let Cli { kernel, command } = cli;

    match command {
        Command::Run {
            model,
            arch,
            prompt,
            max_tokens,
            temperature,
            top_k,
            seed,
            config,
            n_ctx,
            compt,
            gmask_position,
            eos,
        } => {
            check_arch(&arch)?;
            let mut user_config = match config {
                Some(path) => UserConfig::from_json_path(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => UserConfig::default(),
            };
            if let Some(n_ctx) = n_ctx {
                user_config.n_ctx = n_ctx;
            }
            if let Some(compt) = compt {
                user_config.compt_type = compt.into();
            }
            if gmask_position.is_some() {
                user_config.gmask_position = gmask_position;
            }

            info!(path = %model.display(), arch = %arch, "loading model");
            let mut reader = ModelReader::open_path(&model)
                .with_context(|| format!("opening {}", model.display()))?;
            let device = Device::by_kernel_name(&kernel)?;
            let mut graph = make_graph(&arch, user_config, device)?;
            graph.load(&mut reader)?;

            let sampler = Sampler::new(SamplerConfig {
                temperature,
                top_k,
                seed,
            });
            let mut generator = Generator::new(&mut graph, sampler);
            if let Some(eos) = eos {
                generator = generator.with_eos(eos);
            }
            let input_ids = generator.encode_prompt(&prompt);
            info!(prompt = %prompt, tokens = input_ids.len(), "prompt encoded");
            if input_ids.is_empty() {
                bail!("prompt produced no tokens for this vocabulary");
            }

            let (generated, metrics) = generator.generate(&input_ids, max_tokens)?;
            let output_text = generator.decode(&generated);

            println!("\n=== Generation ===");
            println!("Prompt: {}", prompt);
            println!("Output: {}", output_text);
            println!("\n=== Metrics ===");
            println!("Prompt tokens: {}", metrics.prompt_tokens);
            println!("Prefill time: {:.2} ms", metrics.prefill_ms);
            println!("Decode time: {:.2} ms", metrics.decode_ms);
            println!("Tokens generated: {}", metrics.tokens_generated);
            println!("Tokens/sec: {:.2}", metrics.tokens_per_sec);
            println!("KV-cache: {} bytes/token", metrics.kv_cache_bytes_per_token);
        }
        Command::Inspect { model } => {
            let summary = inspect_model(&model)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Synth {
            arch,
            output,
            preset,
            params,
            weight_dtype,
            seed,
            gmask_position,
        } => {
            check_arch(&arch)?;
            let params: LlmParams = match params {
                Some(path) => serde_json::from_str(&fs::read_to_string(&path)?)
                    .with_context(|| format!("parsing {}", path.display()))?,
                None => preset.into(),
            };
            let config = UserConfig {
                n_ctx: params.n_ctx,
                gmask_position,
                ..UserConfig::default()
            };
            let options = SynthOptions {
                weight_dtype: weight_dtype.into(),
                seed,
                ..SynthOptions::default()
            };
            let bytes = synth_model(&arch, &params, &config, &options)?;
            fs::write(&output, &bytes)?;
            info!(path = %output.display(), bytes = bytes.len(), arch = %arch, "model written");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from([
            "inferforge",
            "--kernel",
            "reference",
            "run",
            "--model",
            "m.bin",
            "--prompt",
            "hi",
            "--compt",
            "f16",
            "--top-k",
            "5",
        ])
        .unwrap();
        assert_eq!(cli.kernel, "reference");
        match cli.command {
            Command::Run {
                compt, top_k, arch, ..
            } => {
                assert_eq!(compt, Some(ComptArg::F16));
                assert_eq!(top_k, 5);
                assert_eq!(arch, "llama");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_weight_dtype() {
        let parsed = Cli::try_parse_from([
            "inferforge",
            "synth",
            "--output",
            "m.bin",
            "--weight-dtype",
            "int2",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn inspect_lists_synthesized_tensors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.bin");
        let params = LlmParams::tiny();
        let options = SynthOptions {
            weight_dtype: DType::Int8,
            ..SynthOptions::default()
        };
        let bytes = synth_model("llama", &params, &UserConfig::with_n_ctx(16), &options).unwrap();
        fs::write(&path, bytes).unwrap();

        let summary = inspect_model(&path).unwrap();
        assert_eq!(summary.vocab_size, params.n_vocab);
        assert_eq!(summary.tensors.len(), 1 + 9 * params.n_layer + 2);
        let wq = summary
            .tensors
            .iter()
            .find(|t| t.name == "layers.0.attention.wq.weight")
            .unwrap();
        assert_eq!(wq.dtype, DType::Int8);
        assert_eq!(wq.shape, vec![64, 64]);
        let norm = summary.tensors.iter().find(|t| t.name == "norm.weight").unwrap();
        assert_eq!(norm.dtype, DType::F32);
    }

    #[test]
    fn unknown_arch_is_rejected() {
        assert!(check_arch("llama").is_ok());
        assert!(check_arch("gpt2").is_err());
    }
}
