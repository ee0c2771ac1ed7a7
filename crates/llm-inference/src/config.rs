//! Model hyper-parameters and per-session user configuration.

use crate::error::{LlmError, Result};
use inferforge_kernels::DType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Hyper-parameters read from the model file header. `n_ctx` is supplied by
/// the user at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmParams {
    pub n_vocab: usize,
    pub n_embd: usize,
    pub n_mult: usize,
    pub n_head: usize,
    pub n_layer: usize,
    pub n_rot: usize,
    pub ftype: i32,
    pub n_ctx: usize,
    pub is_multi_query: bool,
    pub multi_query_group_num: usize,
}

impl LlmParams {
    /// Tiny LLaMA-shaped config for tests.
    pub fn tiny() -> Self {
        Self {
            n_vocab: 32,
            n_embd: 64,
            n_mult: 32,
            n_head: 4,
            n_layer: 2,
            n_rot: 16,
            ftype: 0,
            n_ctx: 16,
            is_multi_query: false,
            multi_query_group_num: 1,
        }
    }

    /// Tiny config for GLM-style graphs, where `n_mult` is the FFN width.
    pub fn tiny_glm() -> Self {
        Self {
            n_mult: 128,
            ..Self::tiny()
        }
    }

    /// Tiny grouped-query config: 8 heads sharing 2 kv groups.
    pub fn tiny_glm2() -> Self {
        Self {
            n_mult: 128,
            n_head: 8,
            n_rot: 8,
            is_multi_query: true,
            multi_query_group_num: 2,
            ..Self::tiny()
        }
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head.max(1)
    }

    /// Number of kv heads: the group count for multi-query models, else `n_head`.
    pub fn n_kv_head(&self) -> usize {
        if self.is_multi_query {
            self.multi_query_group_num
        } else {
            self.n_head
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_head == 0 || self.n_embd % self.n_head != 0 {
            return Err(LlmError::Config(format!(
                "n_embd {} is not divisible by n_head {}",
                self.n_embd, self.n_head
            )));
        }
        if self.n_vocab == 0 || self.n_layer == 0 || self.n_ctx == 0 {
            return Err(LlmError::Config(format!(
                "n_vocab, n_layer and n_ctx must be positive (got {}, {}, {})",
                self.n_vocab, self.n_layer, self.n_ctx
            )));
        }
        let kv = self.n_kv_head();
        if kv == 0 || self.n_head % kv != 0 {
            return Err(LlmError::Config(format!(
                "{} heads cannot be split into {} query groups",
                self.n_head, kv
            )));
        }
        if self.n_rot > self.head_dim() || self.n_rot % 2 != 0 {
            return Err(LlmError::Config(format!(
                "n_rot {} must be even and at most the head dim {}",
                self.n_rot,
                self.head_dim()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    /// Activation and KV cache dtype.
    pub compt_type: DType,
    pub n_ctx: usize,
    /// Index of the `[gMASK]` token for GLM-1 graphs.
    pub gmask_position: Option<usize>,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            compt_type: DType::F32,
            n_ctx: 2048,
            gmask_position: None,
        }
    }
}

impl UserConfig {
    pub fn with_n_ctx(n_ctx: usize) -> Self {
        Self {
            n_ctx,
            ..Self::default()
        }
    }

    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|err| LlmError::Config(format!("user config: {}", err)))
    }

    pub fn from_json_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }
}

/// Map an on-disk dtype code to a [`DType`].
pub fn convert_dtype(code: i32) -> Result<DType> {
    match code {
        0 => Ok(DType::F32),
        1 => Ok(DType::F16),
        2 => Ok(DType::Int4),
        3 => Ok(DType::Int8),
        other => Err(LlmError::Config(format!("unknown dtype code {}", other))),
    }
}

pub fn dtype_code(dtype: DType) -> Result<i32> {
    match dtype {
        DType::F32 => Ok(0),
        DType::F16 => Ok(1),
        DType::Int4 => Ok(2),
        DType::Int8 => Ok(3),
        other => Err(LlmError::Config(format!(
            "{:?} tensors cannot be stored in a model file",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_codes_round_trip() {
        for code in 0..4 {
            let dtype = convert_dtype(code).expect("known code");
            assert_eq!(dtype_code(dtype).expect("storable"), code);
        }
        assert!(matches!(convert_dtype(7), Err(LlmError::Config(_))));
    }

    #[test]
    fn validate_rejects_ragged_heads() {
        let params = LlmParams {
            n_head: 5,
            ..LlmParams::tiny()
        };
        assert!(matches!(params.validate(), Err(LlmError::Config(_))));
        LlmParams::tiny().validate().expect("tiny is valid");
        LlmParams::tiny_glm2().validate().expect("glm2 tiny is valid");
    }

    #[test]
    fn user_config_from_partial_json() {
        let config = UserConfig::from_json(r#"{"n_ctx": 64, "compt_type": "f16"}"#).expect("parse");
        assert_eq!(config.n_ctx, 64);
        assert_eq!(config.compt_type, DType::F16);
        assert_eq!(config.gmask_position, None);
        assert!(matches!(UserConfig::from_json("{"), Err(LlmError::Config(_))));
    }
}
