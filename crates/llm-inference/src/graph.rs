//! The execution graph: modules wired at construction, weights bound at
//! load, then `execute` called once per prefill or decode step.

use inferforge_kernels::DType;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::rc::Rc;
use tracing::{debug, info, warn};

use crate::config::{LlmParams, UserConfig};
use crate::device::Device;
use crate::error::{LlmError, Result};
use crate::loader::ModelReader;
use crate::models;
use crate::module::{BuildContext, Module};
use crate::ops::MatmulInfo;
use crate::tensor::{Tensor, TensorKind, TensorRef};
use crate::vocab::Vocab;
use crate::workspace::Workspace;

/// A model family: how to wire its graph and how its files name weights.
pub trait Architecture {
    fn name(&self) -> &'static str;

    /// Push every module in execution order.
    fn construct_llm(&self, builder: &mut GraphBuilder) -> Result<()>;

    /// `(alias, canonical)` pairs. Layer-indexed names use `x` in place of
    /// the layer number.
    fn weight_aliases(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Architecture-specific special tokens around a tokenized prompt.
    fn post_tokenize(&self, _tokens: &mut Vec<i32>) {}
}

/// Handed to [`Architecture::construct_llm`].
pub struct GraphBuilder {
    ctx: BuildContext,
    params: LlmParams,
    config: UserConfig,
    input: TensorRef,
    modules: Vec<Module>,
}

impl GraphBuilder {
    pub fn ctx(&self) -> &BuildContext {
        &self.ctx
    }

    pub fn params(&self) -> &LlmParams {
        &self.params
    }

    pub fn config(&self) -> &UserConfig {
        &self.config
    }

    /// Token id tensor `{L}`.
    pub fn input(&self) -> TensorRef {
        Rc::clone(&self.input)
    }

    /// Append a module and return its output.
    pub fn push(&mut self, module: Module) -> Result<TensorRef> {
        let out = module.output().ok_or_else(|| {
            LlmError::Fatal(format!("module `{}` has no ops", module.name()))
        })?;
        self.modules.push(module);
        Ok(out)
    }
}

/// Where a weight lives: the tensor plus the owning module and op indices.
#[derive(Clone)]
pub struct WeightSlot {
    pub tensor: TensorRef,
    pub module: usize,
    pub op: usize,
}

pub struct Graph {
    arch: Box<dyn Architecture>,
    device: Rc<Device>,
    config: UserConfig,
    params: Option<LlmParams>,
    vocab: Vocab,
    input: TensorRef,
    output: Option<TensorRef>,
    modules: Vec<Module>,
    weights: BTreeMap<String, WeightSlot>,
    aliases: HashMap<String, String>,
    workspace: Workspace,
    last_seq_len: Option<usize>,
}

/// Build an empty graph for a registered architecture name.
pub fn make_graph(name: &str, config: UserConfig, device: Rc<Device>) -> Result<Graph> {
    let arch = models::by_name(name)
        .ok_or_else(|| LlmError::Config(format!("unknown model architecture `{}`", name)))?;
    Graph::new(arch, config, device)
}

impl Graph {
    pub fn new(arch: Box<dyn Architecture>, config: UserConfig, device: Rc<Device>) -> Result<Self> {
        if !matches!(config.compt_type, DType::F32 | DType::F16) {
            return Err(LlmError::KernelUnsupported {
                kernel: device.kernel().name().to_string(),
                what: format!("{:?} activations", config.compt_type),
            });
        }
        let input = Tensor::input(&device, "tokens");
        Ok(Self {
            arch,
            device,
            config,
            params: None,
            vocab: Vocab::default(),
            input,
            output: None,
            modules: Vec::new(),
            weights: BTreeMap::new(),
            aliases: HashMap::new(),
            workspace: Workspace::new(),
            last_seq_len: None,
        })
    }

    pub fn arch_name(&self) -> &'static str {
        self.arch.name()
    }

    /// Construct the modules for `params`. `n_ctx` is taken from the user
    /// config.
    pub fn build(&mut self, mut params: LlmParams) -> Result<()> {
        if self.params.is_some() {
            return Err(LlmError::Fatal("graph is already built".to_string()));
        }
        params.n_ctx = self.config.n_ctx;
        params.validate()?;

        let mut builder = GraphBuilder {
            ctx: BuildContext::new(&self.device, self.config.compt_type),
            params: params.clone(),
            config: self.config.clone(),
            input: Rc::clone(&self.input),
            modules: Vec::new(),
        };
        self.arch.construct_llm(&mut builder)?;
        self.modules = builder.modules;
        self.output = self.modules.last().and_then(Module::output);
        self.collect_weights()?;
        let aliases = self.arch.weight_aliases();
        self.set_weights_alias(aliases);
        self.params = Some(params);

        info!(
            arch = self.arch.name(),
            modules = self.modules.len(),
            weights = self.weights.len(),
            compt = ?self.config.compt_type,
            n_ctx = self.config.n_ctx,
            "graph constructed"
        );
        Ok(())
    }

    fn collect_weights(&mut self) -> Result<()> {
        self.weights.clear();
        for (module_idx, module) in self.modules.iter().enumerate() {
            for (op_idx, op) in module.ops().iter().enumerate() {
                for weight in op.weights() {
                    let slot = WeightSlot {
                        tensor: Rc::clone(weight),
                        module: module_idx,
                        op: op_idx,
                    };
                    if self.weights.insert(weight.name().to_string(), slot).is_some() {
                        return Err(LlmError::Fatal(format!(
                            "weight `{}` is declared twice",
                            weight.name()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn set_weights_alias(&mut self, aliases: impl IntoIterator<Item = (String, String)>) {
        self.aliases.extend(aliases);
    }

    /// Resolve an on-disk name to a canonical weight name.
    pub fn get_weight_alias(&self, name: &str) -> Option<String> {
        if self.weights.contains_key(name) {
            return Some(name.to_string());
        }
        if let Some(canonical) = self.aliases.get(name) {
            return Some(canonical.clone());
        }

        let segments: Vec<&str> = name.split('.').collect();
        let (idx, layer) = segments
            .iter()
            .enumerate()
            .find(|(_, s)| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))?;
        let mut pattern = segments.clone();
        pattern[idx] = "x";
        let canonical = self.aliases.get(&pattern.join("."))?;
        let resolved = canonical
            .split('.')
            .map(|s| if s == "x" { *layer } else { s })
            .collect::<Vec<_>>()
            .join(".");
        Some(resolved)
    }

    /// Build from the file header, then stream and bind every tensor.
    pub fn load<R: Read>(&mut self, reader: &mut ModelReader<R>) -> Result<()> {
        self.build(reader.params().clone())?;
        self.vocab = reader.vocab().clone();

        let mut seen = HashSet::new();
        let mut packed = 0usize;
        while let Some(record) = reader.next_tensor()? {
            if record.name.ends_with("inv_freq") {
                debug!(name = %record.name, "skipping rotary frequency table");
                continue;
            }
            let canonical = self.get_weight_alias(&record.name).ok_or_else(|| {
                LlmError::Load(format!("file tensor `{}` matches no graph weight", record.name))
            })?;
            let slot = self.weights.get(&canonical).cloned().ok_or_else(|| {
                LlmError::Load(format!(
                    "`{}` resolves to `{}`, which the graph does not declare",
                    record.name, canonical
                ))
            })?;
            if !seen.insert(canonical.clone()) {
                return Err(LlmError::Load(format!("weight `{}` appears twice", canonical)));
            }

            let tensor = &slot.tensor;
            if record.shape != tensor.shape() {
                return Err(LlmError::Load(format!(
                    "weight `{}`: file shape {:?}, graph expects {:?}",
                    canonical,
                    record.shape,
                    tensor.shape()
                )));
            }
            if matches!(tensor.kind(), TensorKind::Weight { float_only: true })
                && record.dtype.is_quantized()
            {
                return Err(LlmError::Load(format!(
                    "weight `{}` must be float, file has {:?}",
                    canonical, record.dtype
                )));
            }

            tensor.set_dtype(record.dtype);
            let op = &mut self.modules[slot.module].ops_mut()[slot.op];
            if op.need_preprocess_weight(tensor) {
                if tensor.preprocess_count() > 0 {
                    return Err(LlmError::Fatal(format!(
                        "weight `{}` was already preprocessed",
                        canonical
                    )));
                }
                let pre = op.preprocess_weight(tensor, &record.data)?;
                tensor.bind(pre.dtype, pre.shape, &pre.bytes)?;
                tensor.mark_preprocessed();
                packed += 1;
            } else {
                tensor.bind(record.dtype, record.shape, &record.data)?;
            }
        }

        if let Some(missing) = self.weights.keys().find(|name| !seen.contains(*name)) {
            return Err(LlmError::Load(format!(
                "weight `{}` is missing from the model file ({} of {} loaded)",
                missing,
                seen.len(),
                self.weights.len()
            )));
        }
        info!(
            arch = self.arch.name(),
            weights = seen.len(),
            packed,
            vocab = self.vocab.len(),
            "model loaded"
        );
        Ok(())
    }

    /// True when the last executed step had `seq_len` tokens, so shapes and
    /// workspace size are still valid.
    pub fn same_input_shape(&self, seq_len: usize) -> bool {
        self.last_seq_len == Some(seq_len)
    }

    pub fn workspace_in_bytes(&self) -> usize {
        self.modules
            .iter()
            .map(Module::workspace_in_bytes)
            .max()
            .unwrap_or(0)
    }

    /// Run one step and write the last token's logits into `logits`.
    pub fn execute(
        &mut self,
        tokens: &[i32],
        logits: &mut [f32],
        nr_past: usize,
        prefill: bool,
    ) -> Result<()> {
        let n_ctx = self.n_ctx();
        let n_vocab = self.n_vocab();
        let output = self
            .output
            .clone()
            .ok_or_else(|| LlmError::Config("graph executed before it was built".to_string()))?;
        let seq_len = tokens.len();
        if seq_len == 0 {
            return Err(LlmError::Config("execute needs at least one token".to_string()));
        }
        if nr_past + seq_len > n_ctx {
            return Err(LlmError::Config(format!(
                "{} past + {} new tokens exceed n_ctx {}",
                nr_past, seq_len, n_ctx
            )));
        }
        if logits.len() != n_vocab {
            return Err(LlmError::Config(format!(
                "logits buffer holds {} values, vocabulary has {}",
                logits.len(),
                n_vocab
            )));
        }
        if !prefill && seq_len > 1 {
            warn!(seq_len, nr_past, "decode step with more than one token");
        }

        if !self.same_input_shape(seq_len) {
            self.input.set_shape(vec![seq_len]);
            for module in &mut self.modules {
                module.deduce_output_shape()?;
            }
            let needed = self.workspace_in_bytes();
            self.workspace.reserve_bytes(needed);
            self.last_seq_len = Some(seq_len);
        }
        debug!(seq_len, nr_past, prefill, workspace = self.workspace.len_in_bytes(), "execute");

        self.input.prepare_data()?;
        self.input.resume_user_count();
        self.input.i32_mut()?.copy_from_slice(tokens);

        for module in &mut self.modules {
            module.execute(&mut self.workspace, nr_past, prefill)?;
        }

        let out = output.read_f32()?;
        logits.copy_from_slice(&out[out.len() - n_vocab..]);
        Ok(())
    }

    /// Clear every KV cache before an unrelated conversation.
    pub fn reset_ctx(&mut self) {
        for module in &mut self.modules {
            module.reset_ctx();
        }
    }

    pub fn post_tokenize(&self, tokens: &mut Vec<i32>) {
        self.arch.post_tokenize(tokens);
    }

    pub fn weights_map(&self) -> &BTreeMap<String, WeightSlot> {
        &self.weights
    }

    pub fn weight(&self, name: &str) -> Option<&TensorRef> {
        self.weights.get(name).map(|slot| &slot.tensor)
    }

    /// Shape summary of the matmul that owns weight `name`.
    pub fn matmul_info(&self, name: &str) -> Option<MatmulInfo> {
        let slot = self.weights.get(name)?;
        self.modules[slot.module].ops()[slot.op].matmul_info(&slot.tensor)
    }

    pub fn kv_lengths(&self) -> Vec<usize> {
        self.modules.iter().flat_map(|m| m.kv_lengths()).collect()
    }

    pub fn kv_bytes_per_token(&self) -> usize {
        self.modules.iter().map(Module::kv_bytes_per_token).sum()
    }

    /// Non-weight, non-shared tensors produced or consumed by the graph.
    pub fn activations(&self) -> Vec<TensorRef> {
        let mut seen = HashSet::new();
        std::iter::once(&self.input)
            .chain(self.modules.iter().flat_map(|m| m.ops().iter().flat_map(|op| op.outputs())))
            .filter(|t| matches!(t.kind(), TensorKind::Activation | TensorKind::Input))
            .filter(|t| seen.insert(t.name().to_string()))
            .cloned()
            .collect()
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn workspace_len(&self) -> usize {
        self.workspace.len_in_bytes()
    }

    pub fn workspace_peak(&self) -> usize {
        self.workspace.peak_bytes()
    }

    pub fn n_ctx(&self) -> usize {
        self.config.n_ctx
    }

    pub fn n_vocab(&self) -> usize {
        self.params.as_ref().map_or(0, |p| p.n_vocab)
    }

    pub fn params(&self) -> Option<&LlmParams> {
        self.params.as_ref()
    }

    pub fn config(&self) -> &UserConfig {
        &self.config
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn device(&self) -> &Rc<Device> {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built(name: &str) -> Graph {
        let mut graph = make_graph(name, UserConfig::with_n_ctx(8), Device::reference()).expect("graph");
        graph.build(LlmParams::tiny()).expect("build");
        graph
    }

    #[test]
    fn unknown_architecture_is_config_error() {
        assert!(matches!(
            make_graph("gpt-j", UserConfig::default(), Device::reference()),
            Err(LlmError::Config(_))
        ));
    }

    #[test]
    fn int8_compute_is_unsupported() {
        let config = UserConfig {
            compt_type: DType::Int8,
            ..UserConfig::default()
        };
        assert!(matches!(
            make_graph("llama", config, Device::reference()),
            Err(LlmError::KernelUnsupported { .. })
        ));
    }

    #[test]
    fn layer_aliases_substitute_the_index() {
        let graph = built("llama");
        assert_eq!(
            graph.get_weight_alias("model.layers.1.self_attn.q_proj.weight").as_deref(),
            Some("layers.1.attention.wq.weight")
        );
        assert_eq!(
            graph.get_weight_alias("layers.0.attention.wq.weight").as_deref(),
            Some("layers.0.attention.wq.weight")
        );
        assert_eq!(graph.get_weight_alias("lm_head.bias"), None);
    }

    #[test]
    fn execute_validates_before_touching_state() {
        let mut graph = built("llama");
        let mut logits = vec![0.0; 32];
        assert!(matches!(graph.execute(&[], &mut logits, 0, true), Err(LlmError::Config(_))));
        assert!(matches!(graph.execute(&[1], &mut logits, 8, false), Err(LlmError::Config(_))));
        assert!(matches!(graph.execute(&[1], &mut logits[..4], 0, true), Err(LlmError::Config(_))));
        assert_eq!(graph.kv_lengths(), vec![0, 0]);
    }

    #[test]
    fn weights_are_collected_once() {
        let graph = built("llama");
        assert!(graph.weight("tok_embeddings.weight").is_some());
        assert!(graph.weight("output.weight").is_some());
        assert_eq!(graph.weights_map().len(), 1 + 2 * 9 + 2);
    }
}
