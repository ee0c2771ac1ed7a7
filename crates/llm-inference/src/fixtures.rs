//! Synthetic model files with random weights, for tests, benches and the
//! `synth` CLI command.

use inferforge_kernels::quant::{quantize_int4, quantize_int8};
use inferforge_kernels::{DType, QK};
use std::io::Cursor;
use std::rc::Rc;
use tracing::debug;

use crate::config::{LlmParams, UserConfig};
use crate::device::Device;
use crate::error::{LlmError, Result};
use crate::graph::{make_graph, Graph};
use crate::loader::{ModelReader, ModelWriter};
use crate::tensor::TensorKind;
use crate::vocab::Vocab;

#[derive(Debug, Clone)]
pub struct SynthOptions {
    /// Storage dtype for 2-D weights whose rows split into whole blocks.
    /// Norm gains, biases and ragged matrices stay f32.
    pub weight_dtype: DType,
    pub seed: u64,
    /// `(canonical, written)` name overrides.
    pub renames: Vec<(String, String)>,
    /// Canonical names left out of the file.
    pub omit: Vec<String>,
    /// Extra f32 records `(name, shape)` appended after the weights.
    pub extra: Vec<(String, Vec<usize>)>,
    pub vocab: Option<Vocab>,
}

impl Default for SynthOptions {
    fn default() -> Self {
        Self {
            weight_dtype: DType::F32,
            seed: 0x5eed,
            renames: Vec::new(),
            omit: Vec::new(),
            extra: Vec::new(),
            vocab: None,
        }
    }
}

/// `<unk>`, then printable ASCII characters, then `tok{i}` fillers.
pub fn synth_vocab(n_vocab: usize) -> Vocab {
    let mut vocab = Vocab::default();
    let mut printable = (b' '..=b'~').map(|c| vec![c]);
    for id in 0..n_vocab {
        let piece = match id {
            0 => b"<unk>".to_vec(),
            _ => printable
                .next()
                .unwrap_or_else(|| format!("tok{id}").into_bytes()),
        };
        vocab.push(piece, -(id as f32));
    }
    vocab
}

fn quantizable(dtype: DType, shape: &[usize], float_only: bool) -> bool {
    dtype.is_quantized() && !float_only && shape.len() == 2 && shape[1] % QK == 0
}

/// Serialize a complete model for `arch` with random weights.
pub fn synth_model(
    arch: &str,
    params: &LlmParams,
    config: &UserConfig,
    options: &SynthOptions,
) -> Result<Vec<u8>> {
    let mut graph = make_graph(arch, config.clone(), Device::reference())?;
    graph.build(params.clone())?;

    let vocab = options
        .vocab
        .clone()
        .unwrap_or_else(|| synth_vocab(params.n_vocab));
    let mut writer = ModelWriter::new(Vec::new(), params, &vocab)?;
    let mut rng = fastrand::Rng::with_seed(options.seed);
    let mut noise = move |scale: f32| (rng.f32() * 2.0 - 1.0) * scale;

    for (name, slot) in graph.weights_map() {
        if options.omit.iter().any(|omitted| omitted == name) {
            continue;
        }
        let shape = slot.tensor.shape();
        let count: usize = shape.iter().product();
        let float_only = matches!(slot.tensor.kind(), TensorKind::Weight { float_only: true });
        let values: Vec<f32> = if name.ends_with(".bias") {
            (0..count).map(|_| noise(0.02)).collect()
        } else if shape.len() == 1 {
            (0..count).map(|_| 1.0 + noise(0.1)).collect()
        } else {
            let scale = 1.0 / (shape[shape.len() - 1] as f32).sqrt();
            (0..count).map(|_| noise(scale)).collect()
        };

        let (dtype, bytes) = if quantizable(options.weight_dtype, &shape, float_only) {
            let bytes = match options.weight_dtype {
                DType::Int8 => quantize_int8(&values)?,
                _ => quantize_int4(&values)?,
            };
            (options.weight_dtype, bytes)
        } else {
            (DType::F32, bytemuck::cast_slice(&values).to_vec())
        };

        let written = options
            .renames
            .iter()
            .find(|(canonical, _)| canonical == name)
            .map_or(name.as_str(), |(_, renamed)| renamed.as_str());
        debug!(name = written, ?dtype, ?shape, "synth tensor");
        writer.write_tensor(written, dtype, &shape, &bytes)?;
    }

    for (name, shape) in &options.extra {
        let zeros = vec![0f32; shape.iter().product()];
        writer.write_tensor(name, DType::F32, shape, bytemuck::cast_slice(&zeros))?;
    }
    writer.finish()
}

/// Parse `bytes` and load them into a fresh graph for `arch`.
pub fn load_graph(arch: &str, bytes: &[u8], config: UserConfig, device: Rc<Device>) -> Result<Graph> {
    let mut reader = ModelReader::new(Cursor::new(bytes))?;
    let mut graph = make_graph(arch, config, device)?;
    graph.load(&mut reader)?;
    Ok(graph)
}

/// Synthesize and load in one step.
pub fn synth_graph(
    arch: &str,
    params: &LlmParams,
    config: UserConfig,
    options: &SynthOptions,
    device: Rc<Device>,
) -> Result<Graph> {
    if params.n_vocab == 0 {
        return Err(LlmError::Config("n_vocab must be positive".to_string()));
    }
    let bytes = synth_model(arch, params, &config, options)?;
    load_graph(arch, &bytes, config, device)
}
