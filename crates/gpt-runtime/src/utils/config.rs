use std::fs;
use std::path::Path;

use anyhow::{Context, Result, ensure};
use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float,
    Half,
    Bfloat16,
}

impl DataType {
    pub fn dtype(self) -> DType {
        match self {
            Self::Float => DType::F32,
            Self::Half => DType::F16,
            Self::Bfloat16 => DType::BF16,
        }
    }

    pub fn elem_size(self) -> usize {
        self.dtype().size_in_bytes()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PositionEmbeddingType {
    None,
    #[default]
    Learned,
    RopeGptj,
    RopeNeox,
    Alibi,
}

impl PositionEmbeddingType {
    pub fn is_rope(self) -> bool {
        matches!(self, Self::RopeGptj | Self::RopeNeox)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MaskType {
    Causal,
    Padding,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextFmhaType {
    #[default]
    Disabled,
    Enabled,
    EnabledFp32Acc,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum KvCacheQuantMode {
    #[default]
    None,
    Int8,
    Fp8,
}

impl KvCacheQuantMode {
    pub fn is_quantized(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Model description read from an engine's `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    pub num_layers: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_size: usize,
    #[serde(default)]
    pub hidden_size: Option<usize>,
    pub vocab_size: usize,
    pub vocab_size_padded: usize,
    pub data_type: DataType,
    #[serde(default)]
    pub position_embedding_type: PositionEmbeddingType,
    #[serde(default)]
    pub rotary_embedding_dim: Option<usize>,
    #[serde(default = "default_rotary_base")]
    pub rotary_base: f32,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_true")]
    pub use_gpt_attention_plugin: bool,
    #[serde(default)]
    pub remove_input_padding: bool,
    #[serde(default)]
    pub paged_kv_cache: bool,
    #[serde(default = "default_tokens_per_block")]
    pub tokens_per_block: usize,
    #[serde(default)]
    pub use_packed_input: bool,
    #[serde(default)]
    pub multi_block_mode: bool,
    #[serde(default)]
    pub context_fmha_type: ContextFmhaType,
    #[serde(default)]
    pub kv_cache_quant_mode: KvCacheQuantMode,
    /// Multiplies keys and values before they are rounded into a quantized cache.
    #[serde(default = "default_kv_cache_quant_scale")]
    pub kv_cache_quant_scale: f32,
    #[serde(default)]
    pub qkv_bias_enabled: bool,
    #[serde(default)]
    pub mask_type: Option<MaskType>,
    #[serde(default = "default_true")]
    pub unidirectional: bool,
    #[serde(default = "default_tp_size")]
    pub tp_size: usize,
    #[serde(default)]
    pub tp_rank: usize,
    #[serde(default = "default_q_scaling")]
    pub q_scaling: f32,
    #[serde(default = "default_layernorm_eps")]
    pub layernorm_eps: f64,
}

impl ModelConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| RuntimeError::configuration(format!("malformed model config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading model config at {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.num_layers > 0, RuntimeError::configuration("num_layers must be positive"));
        ensure!(self.num_heads > 0, RuntimeError::configuration("num_heads must be positive"));
        ensure!(self.num_kv_heads > 0, RuntimeError::configuration("num_kv_heads must be positive"));
        ensure!(self.head_size > 0, RuntimeError::configuration("head_size must be positive"));
        ensure!(
            self.num_heads.is_multiple_of(self.num_kv_heads),
            RuntimeError::configuration(format!(
                "num_kv_heads {} must divide num_heads {}",
                self.num_kv_heads, self.num_heads
            ))
        );
        ensure!(self.vocab_size > 0, RuntimeError::configuration("vocab_size must be positive"));
        ensure!(
            self.vocab_size_padded >= self.vocab_size,
            RuntimeError::configuration("vocab_size_padded must be >= vocab_size")
        );
        ensure!(
            self.kv_cache_quant_scale.is_finite() && self.kv_cache_quant_scale > 0.0,
            RuntimeError::configuration("kv_cache_quant_scale must be positive")
        );
        ensure!(self.tp_size > 0, RuntimeError::configuration("tp_size must be positive"));
        ensure!(
            self.tp_rank < self.tp_size,
            RuntimeError::configuration(format!("tp_rank {} out of range for tp_size {}", self.tp_rank, self.tp_size))
        );
        ensure!(
            self.vocab_size_padded.is_multiple_of(self.tp_size),
            RuntimeError::configuration("vocab_size_padded must be divisible by tp_size")
        );
        ensure!(
            self.num_heads.is_multiple_of(self.tp_size),
            RuntimeError::configuration("num_heads must be divisible by tp_size")
        );
        match (self.position_embedding_type.is_rope(), self.rotary_embedding_dim) {
            (true, None) => {
                return Err(RuntimeError::configuration("rotary_embedding_dim is required for rope position embeddings").into());
            }
            (false, Some(dim)) if dim > 0 => {
                return Err(RuntimeError::configuration(format!(
                    "rotary_embedding_dim {dim} set with non-rope position embedding {:?}",
                    self.position_embedding_type
                ))
                .into());
            }
            (true, Some(dim)) => {
                ensure!(
                    dim <= self.head_size,
                    RuntimeError::configuration(format!("rotary_embedding_dim {dim} exceeds head_size {}", self.head_size))
                );
                ensure!(dim % 2 == 0, RuntimeError::configuration("rotary_embedding_dim must be even"));
            }
            _ => {}
        }
        ensure!(
            self.tokens_per_block > 0 && self.tokens_per_block.is_power_of_two(),
            RuntimeError::configuration("tokens_per_block must be a power of two")
        );
        ensure!(
            !self.use_packed_input || self.remove_input_padding,
            RuntimeError::configuration("use_packed_input requires remove_input_padding")
        );
        ensure!(
            self.q_scaling.is_finite() && self.q_scaling > 0.0,
            RuntimeError::configuration("q_scaling must be positive")
        );
        ensure!(
            self.max_position_embeddings > 0,
            RuntimeError::configuration("max_position_embeddings must be positive")
        );
        if let Some(hidden) = self.hidden_size {
            ensure!(hidden > 0, RuntimeError::configuration("hidden_size must be positive"));
        }
        Ok(())
    }

    pub fn dtype(&self) -> DType {
        self.data_type.dtype()
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
            .unwrap_or(self.num_heads * self.head_size)
    }

    /// Zero when rope is disabled.
    pub fn rotary_dim(&self) -> usize {
        if self.position_embedding_type.is_rope() {
            self.rotary_embedding_dim.unwrap_or(0)
        } else {
            0
        }
    }

    pub fn mask_type(&self) -> MaskType {
        self.mask_type.unwrap_or(if self.unidirectional {
            MaskType::Causal
        } else {
            MaskType::Bidirectional
        })
    }

    pub fn is_packed(&self) -> bool {
        self.remove_input_padding
    }

    pub fn num_heads_local(&self) -> usize {
        self.num_heads / self.tp_size
    }

    pub fn num_kv_heads_local(&self) -> usize {
        if self.num_kv_heads >= self.tp_size {
            self.num_kv_heads / self.tp_size
        } else {
            1
        }
    }

    /// Bytes of key plus value storage per token per layer on this rank.
    pub fn kv_bytes_per_token_per_layer(&self) -> usize {
        let elem = if self.kv_cache_quant_mode.is_quantized() {
            1
        } else {
            self.data_type.elem_size()
        };
        2 * self.num_kv_heads_local() * self.head_size * elem
    }
}

/// Shape limits an engine was built for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct OptimizationProfile {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_beam_width")]
    pub max_beam_width: usize,
    #[serde(default = "default_max_input_len")]
    pub max_input_len: usize,
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
}

impl Default for OptimizationProfile {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_beam_width: default_max_beam_width(),
            max_input_len: default_max_input_len(),
            max_seq_len: default_max_seq_len(),
        }
    }
}

impl OptimizationProfile {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_batch_size > 0, RuntimeError::configuration("max_batch_size must be positive"));
        ensure!(self.max_beam_width > 0, RuntimeError::configuration("max_beam_width must be positive"));
        ensure!(self.max_input_len > 0, RuntimeError::configuration("max_input_len must be positive"));
        ensure!(
            self.max_seq_len >= self.max_input_len,
            RuntimeError::configuration("max_seq_len must be >= max_input_len")
        );
        Ok(())
    }
}

/// Parameters of `GptSession::setup`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub max_batch_size: usize,
    #[serde(default = "default_max_beam_width")]
    pub max_beam_width: usize,
    pub max_seq_length: usize,
    #[serde(default)]
    pub decoder_per_request: bool,
    #[serde(default)]
    pub max_tokens_in_paged_kv_cache: Option<usize>,
    #[serde(default)]
    pub cuda_graph_mode: bool,
    #[serde(default = "default_kv_cache_free_memory_fraction")]
    pub kv_cache_free_memory_fraction: f32,
}

impl SessionConfig {
    pub fn new(max_batch_size: usize, max_beam_width: usize, max_seq_length: usize) -> Self {
        Self {
            max_batch_size,
            max_beam_width,
            max_seq_length,
            decoder_per_request: false,
            max_tokens_in_paged_kv_cache: None,
            cuda_graph_mode: false,
            kv_cache_free_memory_fraction: default_kv_cache_free_memory_fraction(),
        }
    }

    pub fn validate(&self, profile: &OptimizationProfile) -> Result<()> {
        ensure!(self.max_batch_size > 0, RuntimeError::configuration("max_batch_size must be positive"));
        ensure!(self.max_beam_width > 0, RuntimeError::configuration("max_beam_width must be positive"));
        ensure!(self.max_seq_length > 0, RuntimeError::configuration("max_seq_length must be positive"));
        ensure!(
            self.kv_cache_free_memory_fraction > 0.0 && self.kv_cache_free_memory_fraction <= 1.0,
            RuntimeError::configuration("kv_cache_free_memory_fraction must be in (0, 1]")
        );
        let over = |what: &str, got: usize, max: usize| {
            RuntimeError::ShapeUnsupported {
                name: what.to_string(),
                shape: vec![got],
                reason: format!("engine profile allows at most {max}"),
            }
        };
        ensure!(
            self.max_batch_size <= profile.max_batch_size,
            over("max_batch_size", self.max_batch_size, profile.max_batch_size)
        );
        ensure!(
            self.max_beam_width <= profile.max_beam_width,
            over("max_beam_width", self.max_beam_width, profile.max_beam_width)
        );
        ensure!(
            self.max_seq_length <= profile.max_seq_len,
            over("max_seq_length", self.max_seq_length, profile.max_seq_len)
        );
        Ok(())
    }
}

/// Sampling settings for a batch. Every optional list holds either one value
/// applied to all sequences or one value per sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplingConfig {
    #[serde(default = "default_beam_width")]
    pub beam_width: usize,
    #[serde(default)]
    pub temperature: Option<Vec<f32>>,
    #[serde(default)]
    pub min_length: Option<Vec<usize>>,
    #[serde(default)]
    pub repetition_penalty: Option<Vec<f32>>,
    #[serde(default)]
    pub presence_penalty: Option<Vec<f32>>,
    #[serde(default)]
    pub top_k: Option<Vec<usize>>,
    #[serde(default)]
    pub top_p: Option<Vec<f32>>,
    #[serde(default)]
    pub random_seed: Option<Vec<u64>>,
    #[serde(default)]
    pub top_p_decay: Option<Vec<f32>>,
    #[serde(default)]
    pub top_p_min: Option<Vec<f32>>,
    #[serde(default)]
    pub top_p_reset_ids: Option<Vec<u32>>,
    #[serde(default)]
    pub beam_search_diversity_rate: Option<Vec<f32>>,
    #[serde(default)]
    pub length_penalty: Option<Vec<f32>>,
}

/// Fully resolved sampling settings of one sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceSamplingConfig {
    pub beam_width: usize,
    pub temperature: f32,
    pub min_length: usize,
    pub repetition_penalty: f32,
    pub presence_penalty: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub random_seed: u64,
    pub top_p_decay: f32,
    pub top_p_min: f32,
    pub top_p_reset_id: Option<u32>,
    pub beam_search_diversity_rate: f32,
    pub length_penalty: f32,
}

impl Default for SequenceSamplingConfig {
    fn default() -> Self {
        Self {
            beam_width: default_beam_width(),
            temperature: 1.0,
            min_length: 1,
            repetition_penalty: 1.0,
            presence_penalty: 0.0,
            top_k: 0,
            top_p: 0.0,
            random_seed: 0,
            top_p_decay: 1.0,
            top_p_min: 1e-6,
            top_p_reset_id: None,
            beam_search_diversity_rate: 0.0,
            length_penalty: 1.0,
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            beam_width: default_beam_width(),
            temperature: None,
            min_length: None,
            repetition_penalty: None,
            presence_penalty: None,
            top_k: None,
            top_p: None,
            random_seed: None,
            top_p_decay: None,
            top_p_min: None,
            top_p_reset_ids: None,
            beam_search_diversity_rate: None,
            length_penalty: None,
        }
    }
}

impl SamplingConfig {
    pub fn new(beam_width: usize) -> Self {
        Self {
            beam_width,
            ..Self::default()
        }
    }

    pub fn validate(&self, batch_size: usize) -> Result<()> {
        ensure!(self.beam_width > 0, RuntimeError::configuration("beam_width must be positive"));
        check_len("temperature", self.temperature.as_deref(), batch_size)?;
        check_len("min_length", self.min_length.as_deref(), batch_size)?;
        check_len("repetition_penalty", self.repetition_penalty.as_deref(), batch_size)?;
        check_len("presence_penalty", self.presence_penalty.as_deref(), batch_size)?;
        check_len("top_k", self.top_k.as_deref(), batch_size)?;
        check_len("top_p", self.top_p.as_deref(), batch_size)?;
        check_len("random_seed", self.random_seed.as_deref(), batch_size)?;
        check_len("top_p_decay", self.top_p_decay.as_deref(), batch_size)?;
        check_len("top_p_min", self.top_p_min.as_deref(), batch_size)?;
        check_len("top_p_reset_ids", self.top_p_reset_ids.as_deref(), batch_size)?;
        check_len(
            "beam_search_diversity_rate",
            self.beam_search_diversity_rate.as_deref(),
            batch_size,
        )?;
        check_len("length_penalty", self.length_penalty.as_deref(), batch_size)?;
        if let Some(values) = &self.temperature {
            ensure!(
                values.iter().all(|t| t.is_finite() && *t > 0.0),
                RuntimeError::configuration("temperature must be positive")
            );
        }
        if let Some(values) = &self.top_p {
            ensure!(
                values.iter().all(|p| (0.0..=1.0).contains(p)),
                RuntimeError::configuration("top_p must be in [0, 1]")
            );
        }
        if let Some(values) = &self.repetition_penalty {
            ensure!(
                values.iter().all(|p| p.is_finite() && *p > 0.0),
                RuntimeError::configuration("repetition_penalty must be positive")
            );
        }
        Ok(())
    }

    /// Resolves the settings of sequence `idx` under the broadcast rule.
    pub fn for_sequence(&self, idx: usize) -> SequenceSamplingConfig {
        let d = SequenceSamplingConfig::default();
        SequenceSamplingConfig {
            beam_width: self.beam_width,
            temperature: pick(self.temperature.as_deref(), idx).unwrap_or(d.temperature),
            min_length: pick(self.min_length.as_deref(), idx).unwrap_or(d.min_length),
            repetition_penalty: pick(self.repetition_penalty.as_deref(), idx)
                .unwrap_or(d.repetition_penalty),
            presence_penalty: pick(self.presence_penalty.as_deref(), idx)
                .unwrap_or(d.presence_penalty),
            top_k: pick(self.top_k.as_deref(), idx).unwrap_or(d.top_k),
            top_p: pick(self.top_p.as_deref(), idx).unwrap_or(d.top_p),
            random_seed: pick(self.random_seed.as_deref(), idx).unwrap_or(d.random_seed),
            top_p_decay: pick(self.top_p_decay.as_deref(), idx).unwrap_or(d.top_p_decay),
            top_p_min: pick(self.top_p_min.as_deref(), idx).unwrap_or(d.top_p_min),
            top_p_reset_id: pick(self.top_p_reset_ids.as_deref(), idx),
            beam_search_diversity_rate: pick(self.beam_search_diversity_rate.as_deref(), idx)
                .unwrap_or(d.beam_search_diversity_rate),
            length_penalty: pick(self.length_penalty.as_deref(), idx).unwrap_or(d.length_penalty),
        }
    }
}

fn check_len<T>(name: &str, values: Option<&[T]>, batch_size: usize) -> Result<()> {
    if let Some(values) = values {
        ensure!(
            values.len() == 1 || values.len() == batch_size,
            RuntimeError::configuration(format!(
                "{name} has {} entries; expected 1 or {batch_size}",
                values.len()
            ))
        );
    }
    Ok(())
}

fn pick<T: Copy>(values: Option<&[T]>, idx: usize) -> Option<T> {
    let values = values?;
    match values.len() {
        0 => None,
        1 => Some(values[0]),
        _ => values.get(idx).copied(),
    }
}

const fn default_true() -> bool {
    true
}

const fn default_rotary_base() -> f32 {
    10_000.0
}

const fn default_max_position_embeddings() -> usize {
    1_024
}

const fn default_tokens_per_block() -> usize {
    64
}

const fn default_tp_size() -> usize {
    1
}

const fn default_kv_cache_quant_scale() -> f32 {
    1.0
}

fn default_q_scaling() -> f32 {
    1.0
}

const fn default_layernorm_eps() -> f64 {
    1e-5
}

const fn default_max_batch_size() -> usize {
    8
}

const fn default_max_beam_width() -> usize {
    1
}

const fn default_max_input_len() -> usize {
    512
}

const fn default_max_seq_len() -> usize {
    1_024
}

const fn default_beam_width() -> usize {
    1
}

const fn default_kv_cache_free_memory_fraction() -> f32 {
    0.9
}
