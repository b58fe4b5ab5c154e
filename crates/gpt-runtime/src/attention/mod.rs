pub mod alibi;
pub mod fused;
pub mod masked;
pub mod rotary;
pub mod unfused;

use std::sync::Arc;

use anyhow::{Result, ensure};
use candle_core::{DType, Device, Tensor};
use tracing::warn;

use crate::gemm::GemmWrapper;
use crate::kv_cache::KvCacheView;
use crate::utils::{ContextFmhaType, MaskType, ModelConfig, PositionEmbeddingType};

pub use alibi::{alibi_bias, alibi_slopes, alibi_slopes_tensor};
pub use fused::FusedContextAttention;
pub use rotary::{RotaryEmbedding, RotaryStyle};
pub use unfused::UnfusedContextAttention;

/// Scratch reserved for the GEMM library at the front of the context workspace.
pub const GEMM_WORKSPACE_BYTES: usize = 32 << 20;
const WORKSPACE_ALIGNMENT: usize = 256;

fn total_workspace_size(buffers: &[usize]) -> usize {
    buffers
        .iter()
        .map(|size| size.div_ceil(WORKSPACE_ALIGNMENT) * WORKSPACE_ALIGNMENT)
        .sum()
}

/// Static configuration of one attention layer on this rank.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionParams {
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_size: usize,
    pub q_scaling: f32,
    pub position_embedding_type: PositionEmbeddingType,
    pub rotary_dim: usize,
    pub rotary_base: f32,
    pub max_positions: usize,
    pub mask_type: MaskType,
    pub context_fmha_type: ContextFmhaType,
    pub multi_block_mode: bool,
    pub remove_padding: bool,
    pub dtype: DType,
    pub tp_size: usize,
    pub tp_rank: usize,
}

impl AttentionParams {
    pub fn from_model(model: &ModelConfig) -> Self {
        Self {
            num_heads: model.num_heads_local(),
            num_kv_heads: model.num_kv_heads_local(),
            head_size: model.head_size,
            q_scaling: model.q_scaling,
            position_embedding_type: model.position_embedding_type,
            rotary_dim: model.rotary_dim(),
            rotary_base: model.rotary_base,
            max_positions: model.max_position_embeddings,
            mask_type: model.mask_type(),
            context_fmha_type: model.context_fmha_type,
            multi_block_mode: model.multi_block_mode,
            remove_padding: model.remove_input_padding,
            dtype: model.dtype(),
            tp_size: model.tp_size,
            tp_rank: model.tp_rank,
        }
    }

    /// `1 / (sqrt(d) * q_scaling)`.
    pub fn qk_scale(&self) -> f64 {
        1.0 / ((self.head_size as f64).sqrt() * self.q_scaling as f64)
    }

    /// Channels of one token of the packed `[Q | K | V]` projection.
    pub fn qkv_width(&self) -> usize {
        (self.num_heads + 2 * self.num_kv_heads) * self.head_size
    }

    pub fn is_alibi(&self) -> bool {
        self.position_embedding_type == PositionEmbeddingType::Alibi
    }

    /// Fused context attention only runs for half-precision types.
    pub fn fmha_requested(&self) -> bool {
        self.context_fmha_type != ContextFmhaType::Disabled
            && matches!(self.dtype, DType::F16 | DType::BF16)
    }

    /// bf16 always accumulates in fp32.
    pub fn fmha_force_fp32_acc(&self) -> bool {
        self.context_fmha_type == ContextFmhaType::EnabledFp32Acc || self.dtype == DType::BF16
    }

    /// Upper bound on timeline tiles in multi-block generation, zero when the
    /// mode is off.
    pub fn max_seq_len_tile(&self) -> usize {
        if !self.multi_block_mode {
            return 0;
        }
        let elem = self.dtype.size_in_bytes();
        let threads_per_value = (self.head_size.next_power_of_two() * elem / 16).max(1);
        (256 / threads_per_value).max(1)
    }

    pub fn context_workspace_size(&self, batch_size: usize, max_input_len: usize) -> usize {
        let elem = self.dtype.size_in_bytes();
        let fmha = self.fmha_requested();
        let tokens = batch_size * max_input_len;
        let hidden_qo = self.num_heads * self.head_size;
        let hidden_kv = self.num_kv_heads * self.head_size;
        let square = batch_size * max_input_len * max_input_len;
        let unless_fmha = |size: usize| if fmha { 0 } else { size };
        total_workspace_size(&[
            GEMM_WORKSPACE_BYTES,
            unless_fmha(elem * square),
            4 * (batch_size + 1),
            elem * tokens * hidden_qo,
            elem * tokens * hidden_kv,
            elem * tokens * hidden_kv,
            unless_fmha(elem * square * self.num_heads),
            unless_fmha(elem * tokens * hidden_qo),
            unless_fmha(4 * square * self.num_heads),
            4 * tokens,
        ])
    }

    pub fn generation_workspace_size(&self, batch_beam: usize) -> usize {
        let tiles = self.max_seq_len_tile();
        if tiles == 0 {
            return 0;
        }
        let elem = self.dtype.size_in_bytes();
        let heads = batch_beam * self.num_heads;
        total_workspace_size(&[
            elem * heads * self.head_size * tiles,
            4 * heads * tiles,
            4 * heads * tiles,
            4 * heads,
        ])
    }
}

/// Per-batch auxiliary tensors of the context phase.
#[derive(Debug, Clone)]
pub struct ContextAux {
    /// `[B + 1]` prefix sums of the input lengths.
    pub cu_seqlens: Tensor,
    /// `[tokens]` distance from each packed token to its padded slot.
    pub padding_offsets: Tensor,
    pub lengths: Vec<usize>,
    pub max_len: usize,
    pub num_tokens: usize,
    pack_index: Tensor,
    unpack_index: Tensor,
}

impl ContextAux {
    pub fn new(lengths: &[usize], max_len: usize, device: &Device) -> Result<Self> {
        ensure!(!lengths.is_empty(), "context batch must not be empty");
        let batch = lengths.len();
        let mut cu_seqlens = Vec::with_capacity(batch + 1);
        cu_seqlens.push(0u32);
        let mut padding_offsets = Vec::new();
        let mut pack_index = Vec::new();
        let num_tokens: usize = lengths.iter().sum();
        let mut unpack_index = vec![num_tokens as u32; batch * max_len];
        let mut token = 0usize;
        for (seq, &len) in lengths.iter().enumerate() {
            ensure!(
                len > 0 && len <= max_len,
                "input length {len} of sequence {seq} outside (0, {max_len}]"
            );
            let offset = seq * max_len - token;
            for i in 0..len {
                padding_offsets.push(offset as u32);
                pack_index.push((seq * max_len + i) as u32);
                unpack_index[seq * max_len + i] = (token + i) as u32;
            }
            token += len;
            cu_seqlens.push(token as u32);
        }
        Ok(Self {
            cu_seqlens: Tensor::from_vec(cu_seqlens, batch + 1, device)?,
            padding_offsets: Tensor::from_vec(padding_offsets, num_tokens, device)?,
            lengths: lengths.to_vec(),
            max_len,
            num_tokens,
            pack_index: Tensor::from_vec(pack_index, num_tokens, device)?,
            unpack_index: Tensor::from_vec(unpack_index, batch * max_len, device)?,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    /// Selects the real tokens of a `[B * S, ...]` padded tensor.
    pub fn pack(&self, padded: &Tensor) -> Result<Tensor> {
        Ok(padded.index_select(&self.pack_index, 0)?)
    }

    /// Inverse of `pack`; padding slots are zero.
    pub fn unpack(&self, packed: &Tensor) -> Result<Tensor> {
        ensure!(
            packed.dim(0)? == self.num_tokens,
            "expected {} packed tokens, got {}",
            self.num_tokens,
            packed.dim(0)?
        );
        let mut zero_shape = packed.dims().to_vec();
        zero_shape[0] = 1;
        let zero = Tensor::zeros(zero_shape, packed.dtype(), packed.device())?;
        Ok(Tensor::cat(&[packed, &zero], 0)?.index_select(&self.unpack_index, 0)?)
    }

    /// Position of every padded slot within its sequence, `[B * S]`.
    pub fn position_ids(&self) -> Result<Tensor> {
        let s = self.max_len as u32;
        let positions: Vec<u32> = (0..self.batch_size() as u32 * s).map(|i| i % s).collect();
        Ok(Tensor::from_vec(
            positions,
            self.batch_size() * self.max_len,
            self.cu_seqlens.device(),
        )?)
    }

    /// Additive f32 mask `[B, 1, S, S]`: zero where query `i` may attend key
    /// `j`, negative infinity elsewhere.
    pub fn mask_bias(&self, mask_type: MaskType) -> Result<Tensor> {
        let s = self.max_len;
        let mut bias = vec![f32::NEG_INFINITY; self.batch_size() * s * s];
        for (seq, &len) in self.lengths.iter().enumerate() {
            for i in 0..s {
                for j in 0..len {
                    let visible = match mask_type {
                        MaskType::Causal => j <= i,
                        MaskType::Padding => true,
                        // the prompt prefix sees itself; the last token is causal
                        MaskType::Bidirectional => j + 1 < len || j <= i,
                    };
                    if visible {
                        bias[(seq * s + i) * s + j] = 0.0;
                    }
                }
            }
        }
        Ok(Tensor::from_vec(
            bias,
            (self.batch_size(), 1, s, s),
            self.cu_seqlens.device(),
        )?)
    }
}

/// Inputs shared by the context-attention kernels. Tensors are padded to
/// `[B, S, heads, d]`.
#[derive(Debug)]
pub struct ContextBatch<'a> {
    pub query: &'a Tensor,
    pub key: &'a Tensor,
    pub value: &'a Tensor,
    pub aux: &'a ContextAux,
    pub mask_type: MaskType,
    pub alibi_slopes: Option<&'a Tensor>,
    pub qk_scale: f64,
}

/// Implements QK^T, mask, softmax and attention-V for the context phase.
pub trait ContextAttentionKernel: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns `[B, S, H_q, d]`.
    fn forward(&self, batch: &ContextBatch<'_>) -> Result<Tensor>;
}

#[derive(Debug)]
pub struct ContextRequest<'a> {
    /// `[tokens, C]` when inputs are packed, `[B, S, C]` when padded.
    pub qkv: &'a Tensor,
    pub input_lengths: &'a [usize],
    pub beam_width: usize,
    pub cache: &'a KvCacheView,
}

#[derive(Debug)]
pub struct GenerationRequest<'a> {
    /// `[B * w, C]`, one new token per cache row.
    pub qkv: &'a Tensor,
    /// Tokens already cached per row; the new token lands at this position.
    pub past_lengths: &'a [usize],
    pub beam_width: usize,
    /// `[B, w, S_cap]` parent beam per past position.
    pub cache_indirection: Option<&'a Tensor>,
    pub cache: &'a KvCacheView,
}

/// The GPT attention operator: bias, rotary, cache write and attention for
/// both the context and the generation phase.
#[derive(Debug, Clone)]
pub struct GptAttention {
    params: AttentionParams,
    rotary: Option<RotaryEmbedding>,
    alibi_slopes: Option<Tensor>,
    qkv_bias: Option<Tensor>,
    context_kernel: Arc<dyn ContextAttentionKernel>,
}

impl GptAttention {
    pub fn new(params: AttentionParams, gemm: GemmWrapper, device: &Device) -> Result<Self> {
        ensure!(
            params.num_heads.is_multiple_of(params.num_kv_heads),
            "num_heads must be divisible by num_kv_heads"
        );
        let rotary = RotaryEmbedding::for_position_embedding(
            params.position_embedding_type,
            params.rotary_dim,
            params.max_positions,
            params.rotary_base as f64,
            device,
        )?;
        let alibi_slopes = if params.is_alibi() {
            Some(alibi_slopes_tensor(
                params.num_heads * params.tp_size,
                params.tp_size,
                params.tp_rank,
                device,
            )?)
        } else {
            None
        };
        let context_kernel = build_context_kernel(&params, gemm, device)?;
        Ok(Self {
            params,
            rotary,
            alibi_slopes,
            qkv_bias: None,
            context_kernel,
        })
    }

    /// Adds `bias` (`[C]`) to the packed projection before attention.
    pub fn with_qkv_bias(mut self, bias: Tensor) -> Result<Self> {
        ensure!(
            bias.dims1()? == self.params.qkv_width(),
            "qkv bias must have {} channels",
            self.params.qkv_width()
        );
        self.qkv_bias = Some(bias);
        Ok(self)
    }

    pub fn params(&self) -> &AttentionParams {
        &self.params
    }

    pub fn context_kernel_name(&self) -> &'static str {
        self.context_kernel.name()
    }

    pub fn alibi_slopes(&self) -> Option<&Tensor> {
        self.alibi_slopes.as_ref()
    }

    /// Splits a `[N, C]` projection into `[N, heads, d]` query, key, value.
    fn split_qkv(&self, qkv: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let p = &self.params;
        let (n, width) = qkv.dims2()?;
        ensure!(
            width == p.qkv_width(),
            "qkv has {width} channels, expected {}",
            p.qkv_width()
        );
        let qkv = match &self.qkv_bias {
            Some(bias) => qkv.broadcast_add(&bias.to_dtype(qkv.dtype())?)?,
            None => qkv.clone(),
        };
        let q_width = p.num_heads * p.head_size;
        let kv_width = p.num_kv_heads * p.head_size;
        let q = qkv.narrow(1, 0, q_width)?.reshape((n, p.num_heads, p.head_size))?;
        let k = qkv
            .narrow(1, q_width, kv_width)?
            .reshape((n, p.num_kv_heads, p.head_size))?;
        let v = qkv
            .narrow(1, q_width + kv_width, kv_width)?
            .reshape((n, p.num_kv_heads, p.head_size))?;
        Ok((q, k, v))
    }

    fn apply_rotary(&self, q: Tensor, k: Tensor, positions: &Tensor) -> Result<(Tensor, Tensor)> {
        match &self.rotary {
            Some(rope) => Ok((rope.apply(&q, positions)?, rope.apply(&k, positions)?)),
            None => Ok((q, k)),
        }
    }

    /// Prefill attention over whole prompts. Writes the prompt keys and values
    /// into cache row `seq * beam_width` and returns `[tokens, H_q * d]`
    /// (packed) or `[B, S, H_q * d]` (padded).
    pub fn enqueue_context(&self, request: &ContextRequest<'_>) -> Result<Tensor> {
        let p = &self.params;
        let lengths = request.input_lengths;
        let batch = lengths.len();
        let device = request.qkv.device();
        let (padded, aux) = if p.remove_padding {
            let max_len = lengths.iter().copied().max().unwrap_or(0);
            let aux = ContextAux::new(lengths, max_len, device)?;
            (aux.unpack(request.qkv)?, aux)
        } else {
            let (b, s, width) = request.qkv.dims3()?;
            ensure!(b == batch, "qkv batch {b} does not match {batch} lengths");
            let aux = ContextAux::new(lengths, s, device)?;
            (request.qkv.reshape((b * s, width))?, aux)
        };
        let s = aux.max_len;

        let (q, k, v) = self.split_qkv(&padded)?;
        let (q, k) = self.apply_rotary(q, k, &aux.position_ids()?)?;

        let k = k.reshape((batch, s, p.num_kv_heads, p.head_size))?;
        let v = v.reshape((batch, s, p.num_kv_heads, p.head_size))?;
        for (seq, &len) in lengths.iter().enumerate() {
            let key = k.get(seq)?.narrow(0, 0, len)?.transpose(0, 1)?.contiguous()?;
            let value = v.get(seq)?.narrow(0, 0, len)?.transpose(0, 1)?.contiguous()?;
            request
                .cache
                .write(seq * request.beam_width, 0, &key, &value)?;
        }

        let q = q.reshape((batch, s, p.num_heads, p.head_size))?;
        let out = self.context_kernel.forward(&ContextBatch {
            query: &q,
            key: &k,
            value: &v,
            aux: &aux,
            mask_type: p.mask_type,
            alibi_slopes: self.alibi_slopes.as_ref(),
            qk_scale: p.qk_scale(),
        })?;
        let out = out
            .reshape((batch * s, p.num_heads * p.head_size))?
            .to_dtype(p.dtype)?;
        if p.remove_padding {
            aux.pack(&out)
        } else {
            Ok(out.reshape((batch, s, p.num_heads * p.head_size))?)
        }
    }

    /// One decoding step: writes each row's new key/value at its past length
    /// and attends over the row's history. Returns `[B * w, H_q * d]`.
    pub fn enqueue_generation(&self, request: &GenerationRequest<'_>) -> Result<Tensor> {
        let p = &self.params;
        let (rows, _) = request.qkv.dims2()?;
        ensure!(
            request.past_lengths.len() == rows,
            "expected {rows} past lengths, got {}",
            request.past_lengths.len()
        );
        ensure!(
            request.beam_width > 0 && rows.is_multiple_of(request.beam_width),
            "{rows} rows do not split into beams of {}",
            request.beam_width
        );
        let device = request.qkv.device();
        let (q, k, v) = self.split_qkv(request.qkv)?;
        let positions: Vec<u32> = request.past_lengths.iter().map(|&l| l as u32).collect();
        let positions = Tensor::from_vec(positions, rows, device)?;
        let (q, k) = self.apply_rotary(q, k, &positions)?;

        let indirection = request
            .cache_indirection
            .map(|t| t.to_dtype(DType::U32)?.to_vec3::<u32>())
            .transpose()?;
        let tiles_cap = p.max_seq_len_tile();
        let mut outputs = Vec::with_capacity(rows);
        for row in 0..rows {
            let past = request.past_lengths[row];
            let key = k.get(row)?.unsqueeze(1)?;
            let value = v.get(row)?.unsqueeze(1)?;
            request.cache.write(row, past, &key, &value)?;

            let sources =
                masked::history_sources(row, past, request.beam_width, indirection.as_deref())?;
            let (keys, values) = request.cache.gather(&sources, DType::F32)?;
            let bias = match &self.alibi_slopes {
                Some(slopes) => Some(alibi_bias(slopes, &[past], past + 1)?.squeeze(1)?),
                None => None,
            };
            let tiles = if p.multi_block_mode {
                masked::num_tiles(past + 1, tiles_cap)
            } else {
                1
            };
            outputs.push(masked::attend(
                &q.get(row)?.to_dtype(DType::F32)?,
                &keys,
                &values,
                p.qk_scale(),
                bias.as_ref(),
                tiles,
            )?);
        }
        Ok(Tensor::stack(&outputs, 0)?
            .reshape((rows, p.num_heads * p.head_size))?
            .to_dtype(p.dtype)?)
    }
}

pub fn build_context_kernel(
    params: &AttentionParams,
    gemm: GemmWrapper,
    device: &Device,
) -> Result<Arc<dyn ContextAttentionKernel>> {
    let unfused = UnfusedContextAttention::new(
        params.num_heads,
        params.num_kv_heads,
        params.head_size,
        gemm,
        params.fmha_force_fp32_acc(),
    )?;
    if !params.fmha_requested() {
        return Ok(Arc::new(unfused));
    }
    #[cfg(feature = "flash-attn")]
    {
        if !device.is_cuda() {
            warn!("fused context attention needs a cuda device, using unfused kernels");
            return Ok(Arc::new(unfused));
        }
        if params.mask_type == MaskType::Bidirectional {
            warn!("fused context attention has no bidirectional mask, using unfused kernels");
            return Ok(Arc::new(unfused));
        }
        Ok(Arc::new(FusedContextAttention::new(unfused)))
    }
    #[cfg(not(feature = "flash-attn"))]
    {
        let _ = device;
        warn!("fused context attention requested but flash-attn is disabled, using unfused kernels");
        Ok(Arc::new(unfused))
    }
}
