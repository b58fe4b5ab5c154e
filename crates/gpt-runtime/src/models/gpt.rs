use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, ensure};
use candle_core::{DType, Device, Tensor};
use tracing::info;

use crate::attention::{AttentionParams, ContextRequest, GenerationRequest, GptAttention};
use crate::error::RuntimeError;
use crate::gemm::GemmWrapper;
use crate::kv_cache::KvQuant;
use crate::models::layers::{
    Communicator, ForwardContext, LayerNorm, Linear, LmHead, RowParallelLinear, VocabEmbedding,
    gather_last_tokens, kv_head_range, shard_range,
};
use crate::models::{CONTEXT_LOGITS, LOGITS, step_bindings};
use crate::runtime::{BindingDesc, ExecutionPlan, StepContext};
use crate::utils::{ModelConfig, OptimizationProfile, PositionEmbeddingType};

pub type WeightMap = HashMap<String, Tensor>;

fn weight<'a>(weights: &'a WeightMap, name: &str) -> Result<&'a Tensor> {
    weights
        .get(name)
        .ok_or_else(|| RuntimeError::EngineLoad(format!("missing weight '{name}'")).into())
}

fn layer_weight<'a>(weights: &'a WeightMap, layer: usize, tail: &str) -> Result<&'a Tensor> {
    weight(weights, &format!("transformer.layers.{layer}.{tail}"))
}

/// Rows of the packed `[Q | K | V]` projection owned by this rank.
fn qkv_shard(
    packed: &Tensor,
    model: &ModelConfig,
    rank: usize,
    world_size: usize,
) -> Result<Tensor> {
    let d = model.head_size;
    let q_heads = shard_range(model.num_heads, rank, world_size)?;
    let kv_heads = kv_head_range(model.num_kv_heads, rank, world_size)?;
    let k_base = model.num_heads * d;
    let v_base = k_base + model.num_kv_heads * d;
    let q = packed.narrow(0, q_heads.start * d, q_heads.len() * d)?;
    let k = packed.narrow(0, k_base + kv_heads.start * d, kv_heads.len() * d)?;
    let v = packed.narrow(0, v_base + kv_heads.start * d, kv_heads.len() * d)?;
    Ok(Tensor::cat(&[&q, &k, &v], 0)?)
}

#[derive(Debug, Clone)]
struct GptMlp {
    fc: Linear,
    proj: RowParallelLinear,
}

impl GptMlp {
    fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let h = self.fc.forward(hidden_states)?.gelu()?;
        self.proj.forward(&h)
    }
}

#[derive(Debug, Clone)]
struct GptDecoderLayer {
    input_layernorm: LayerNorm,
    qkv: Linear,
    attention: GptAttention,
    dense: RowParallelLinear,
    post_layernorm: LayerNorm,
    mlp: GptMlp,
}

impl GptDecoderLayer {
    fn load(
        layer: usize,
        model: &ModelConfig,
        weights: &WeightMap,
        comm: &Arc<dyn Communicator>,
        gemm: &GemmWrapper,
        device: &Device,
    ) -> Result<Self> {
        let dtype = model.dtype();
        let eps = model.layernorm_eps;
        let (rank, world) = (comm.rank(), comm.world_size());
        let hidden = model.hidden_size();

        let qkv_w = layer_weight(weights, layer, "attention.qkv.weight")?;
        let qkv_w = qkv_shard(qkv_w, model, rank, world)?
            .to_device(device)?
            .to_dtype(dtype)?
            .contiguous()?;
        let qkv = Linear::new(qkv_w, None)?;
        let mut attention = GptAttention::new(AttentionParams::from_model(model), gemm.clone(), device)?;
        if model.qkv_bias_enabled {
            let bias = layer_weight(weights, layer, "attention.qkv.bias")?;
            let bias = qkv_shard(&bias.unsqueeze(1)?, model, rank, world)?
                .squeeze(1)?
                .to_device(device)?
                .to_dtype(dtype)?;
            attention = attention.with_qkv_bias(bias)?;
        }

        let dense = RowParallelLinear::load(
            layer_weight(weights, layer, "attention.dense.weight")?,
            weights.get(&format!("transformer.layers.{layer}.attention.dense.bias")),
            comm.clone(),
            dtype,
            device,
        )?;

        let fc_w = layer_weight(weights, layer, "mlp.fc.weight")?;
        let (inner, fc_in) = fc_w.dims2()?;
        ensure!(
            fc_in == hidden,
            RuntimeError::EngineLoad(format!(
                "layer {layer} mlp.fc expects {fc_in} inputs, hidden size is {hidden}"
            ))
        );
        let fc = Linear::load(
            fc_w,
            weights.get(&format!("transformer.layers.{layer}.mlp.fc.bias")),
            shard_range(inner, rank, world)?,
            0..hidden,
            dtype,
            device,
        )?;
        let proj = RowParallelLinear::load(
            layer_weight(weights, layer, "mlp.proj.weight")?,
            weights.get(&format!("transformer.layers.{layer}.mlp.proj.bias")),
            comm.clone(),
            dtype,
            device,
        )?;

        Ok(Self {
            input_layernorm: LayerNorm::load(
                layer_weight(weights, layer, "input_layernorm.weight")?,
                layer_weight(weights, layer, "input_layernorm.bias")?,
                eps,
                dtype,
                device,
            )?,
            qkv,
            attention,
            dense,
            post_layernorm: LayerNorm::load(
                layer_weight(weights, layer, "post_layernorm.weight")?,
                layer_weight(weights, layer, "post_layernorm.bias")?,
                eps,
                dtype,
                device,
            )?,
            mlp: GptMlp { fc, proj },
        })
    }

    fn forward(
        &self,
        hidden_states: &Tensor,
        fwd: &ForwardContext,
        ctx: &StepContext<'_>,
        layer: usize,
        quant: &KvQuant,
    ) -> Result<Tensor> {
        let residual = hidden_states;
        let h = self.input_layernorm.forward(hidden_states)?;
        let qkv = self.qkv.forward(&h)?;
        let cache = fwd.cache_view(ctx, layer, quant)?;
        let attn = if fwd.is_context() {
            if fwd.padded_len > 0 {
                let batch = fwd.context_lengths.len();
                let qkv = qkv.reshape((batch, fwd.padded_len, qkv.dim(1)?))?;
                let out = self.attention.enqueue_context(&ContextRequest {
                    qkv: &qkv,
                    input_lengths: &fwd.context_lengths,
                    beam_width: fwd.beam_width,
                    cache: &cache,
                })?;
                out.reshape((batch * fwd.padded_len, out.dim(2)?))?
            } else {
                self.attention.enqueue_context(&ContextRequest {
                    qkv: &qkv,
                    input_lengths: &fwd.context_lengths,
                    beam_width: fwd.beam_width,
                    cache: &cache,
                })?
            }
        } else {
            self.attention.enqueue_generation(&GenerationRequest {
                qkv: &qkv,
                past_lengths: &fwd.past_lengths,
                beam_width: fwd.beam_width,
                cache_indirection: fwd.cache_indirection.as_ref(),
                cache: &cache,
            })?
        };
        let hidden_states = (residual + self.dense.forward(&attn)?)?;
        let h = self.post_layernorm.forward(&hidden_states)?;
        Ok((&hidden_states + self.mlp.forward(&h)?)?)
    }
}

/// GPT decoder stack with learned, rotary or ALiBi positions, run as an
/// execution plan. Weights use the `transformer.*` / `lm_head.*` naming.
#[derive(Debug)]
pub struct GptModel {
    config: ModelConfig,
    profile: OptimizationProfile,
    embedding: VocabEmbedding,
    position_embedding: Option<VocabEmbedding>,
    layers: Vec<GptDecoderLayer>,
    ln_f: LayerNorm,
    lm_head: LmHead,
    device: Device,
}

impl GptModel {
    pub fn load(
        config: &ModelConfig,
        profile: &OptimizationProfile,
        weights: &WeightMap,
        comm: Arc<dyn Communicator>,
        gemm: GemmWrapper,
        device: &Device,
    ) -> Result<Self> {
        ensure!(
            config.tp_size == comm.world_size() && config.tp_rank == comm.rank(),
            RuntimeError::configuration(format!(
                "model expects rank {} of {}, communicator is rank {} of {}",
                config.tp_rank,
                config.tp_size,
                comm.rank(),
                comm.world_size()
            ))
        );
        let dtype = config.dtype();
        let embedding = VocabEmbedding::load(
            weight(weights, "transformer.vocab_embedding.weight")?,
            dtype,
            device,
        )?;
        let position_embedding = match config.position_embedding_type {
            PositionEmbeddingType::Learned => Some(VocabEmbedding::load(
                weight(weights, "transformer.position_embedding.weight")?,
                dtype,
                device,
            )?),
            _ => None,
        };
        let layers = (0..config.num_layers)
            .map(|layer| GptDecoderLayer::load(layer, config, weights, &comm, &gemm, device))
            .collect::<Result<Vec<_>>>()?;
        let ln_f = LayerNorm::load(
            weight(weights, "transformer.ln_f.weight")?,
            weight(weights, "transformer.ln_f.bias")?,
            config.layernorm_eps,
            dtype,
            device,
        )?;
        let head_weight = weight(weights, "lm_head.weight")?;
        ensure!(
            head_weight.dims2()?.0 == config.vocab_size_padded,
            RuntimeError::EngineLoad(format!(
                "lm_head has {} rows, vocab_size_padded is {}",
                head_weight.dims2()?.0,
                config.vocab_size_padded
            ))
        );
        let lm_head = LmHead::load(head_weight, comm.clone(), dtype, device)?;
        info!(
            layers = config.num_layers,
            rank = comm.rank(),
            world_size = comm.world_size(),
            "loaded gpt model"
        );
        Ok(Self {
            config: config.clone(),
            profile: *profile,
            embedding,
            position_embedding,
            layers,
            ln_f,
            lm_head,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn embed(&self, fwd: &ForwardContext) -> Result<Tensor> {
        let x = self.embedding.forward(&fwd.input_ids)?;
        match &self.position_embedding {
            Some(positions) => Ok((x + positions.forward(&fwd.position_ids)?)?),
            None => Ok(x),
        }
    }
}

impl ExecutionPlan for GptModel {
    fn name(&self) -> &str {
        "gpt"
    }

    fn bindings(&self) -> Vec<BindingDesc> {
        step_bindings(&self.config, &self.profile)
    }

    fn forward(&self, ctx: &StepContext<'_>) -> Result<HashMap<String, Tensor>> {
        let fwd = ForwardContext::from_step(ctx, &self.config)?;
        let quant = KvQuant::new(
            self.config.kv_cache_quant_mode,
            fwd.kv_quant_scale,
            &self.device,
        )?;
        let mut hidden_states = self.embed(&fwd)?;
        for (idx, layer) in self.layers.iter().enumerate() {
            hidden_states = layer.forward(&hidden_states, &fwd, ctx, idx, &quant)?;
        }
        let hidden_states = self.ln_f.forward(&hidden_states)?;

        let mut outputs = HashMap::new();
        if fwd.is_context() && ctx.wants(CONTEXT_LOGITS) {
            outputs.insert(
                CONTEXT_LOGITS.to_string(),
                self.lm_head.forward(&hidden_states)?,
            );
        }
        let last = if fwd.is_context() {
            gather_last_tokens(&hidden_states, &fwd.last_token_ids)?
        } else {
            hidden_states
        };
        let logits = self.lm_head.forward(&last)?.to_dtype(DType::F32)?;
        outputs.insert(LOGITS.to_string(), logits);
        Ok(outputs)
    }
}

/// Seeded random weights in the naming `GptModel::load` expects.
pub fn random_weights(config: &ModelConfig, seed: u64) -> Result<WeightMap> {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(seed);
    let mut tensor = |shape: &[usize], scale: f32| -> Result<Tensor> {
        let n = shape.iter().product::<usize>();
        let data: Vec<f32> = (0..n)
            .map(|_| (rng.random::<f32>() * 2.0 - 1.0) * scale)
            .collect();
        Ok(Tensor::from_vec(data, shape.to_vec(), &Device::Cpu)?)
    };
    let hidden = config.hidden_size();
    let inner = 4 * hidden;
    let qkv_out = (config.num_heads + 2 * config.num_kv_heads) * config.head_size;
    let attn_out = config.num_heads * config.head_size;
    let mut weights = WeightMap::new();
    weights.insert(
        "transformer.vocab_embedding.weight".to_string(),
        tensor(&[config.vocab_size_padded, hidden], 1.0)?,
    );
    if config.position_embedding_type == PositionEmbeddingType::Learned {
        weights.insert(
            "transformer.position_embedding.weight".to_string(),
            tensor(&[config.max_position_embeddings, hidden], 0.1)?,
        );
    }
    for layer in 0..config.num_layers {
        let name = |tail: &str| format!("transformer.layers.{layer}.{tail}");
        let ones = Tensor::ones(hidden, DType::F32, &Device::Cpu)?;
        let zeros = Tensor::zeros(hidden, DType::F32, &Device::Cpu)?;
        weights.insert(name("input_layernorm.weight"), ones.clone());
        weights.insert(name("input_layernorm.bias"), zeros.clone());
        weights.insert(name("post_layernorm.weight"), ones);
        weights.insert(name("post_layernorm.bias"), zeros);
        weights.insert(name("attention.qkv.weight"), tensor(&[qkv_out, hidden], 0.3)?);
        if config.qkv_bias_enabled {
            weights.insert(name("attention.qkv.bias"), tensor(&[qkv_out], 0.1)?);
        }
        weights.insert(name("attention.dense.weight"), tensor(&[hidden, attn_out], 0.3)?);
        weights.insert(name("attention.dense.bias"), tensor(&[hidden], 0.1)?);
        weights.insert(name("mlp.fc.weight"), tensor(&[inner, hidden], 0.3)?);
        weights.insert(name("mlp.fc.bias"), tensor(&[inner], 0.1)?);
        weights.insert(name("mlp.proj.weight"), tensor(&[hidden, inner], 0.2)?);
        weights.insert(name("mlp.proj.bias"), tensor(&[hidden], 0.1)?);
    }
    weights.insert(
        "transformer.ln_f.weight".to_string(),
        Tensor::ones(hidden, DType::F32, &Device::Cpu)?,
    );
    weights.insert(
        "transformer.ln_f.bias".to_string(),
        Tensor::zeros(hidden, DType::F32, &Device::Cpu)?,
    );
    weights.insert(
        "lm_head.weight".to_string(),
        tensor(&[config.vocab_size_padded, hidden], 1.0)?,
    );
    Ok(weights)
}
