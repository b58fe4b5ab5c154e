use anyhow::{Result, ensure};
use candle_core::{DType, Tensor};

use crate::error::RuntimeError;
use crate::kv_cache::{KvCacheView, KvQuant};
use crate::models::{
    CACHE_INDIRECTION, CONTEXT_LENGTHS, HOST_REQUEST_TYPES, INPUT_IDS, KV_CACHE_BLOCK_POINTERS,
    KV_CACHE_QUANT_SCALE, LAST_TOKEN_IDS, PAST_KEY_VALUE_LENGTHS, POSITION_IDS, past_key_value,
};
use crate::runtime::StepContext;
use crate::utils::ModelConfig;

pub const REQUEST_TYPE_CONTEXT: u32 = 0;
pub const REQUEST_TYPE_GENERATION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Context,
    Generation,
}

/// Host view of one forward step, decoded from the bound inputs.
#[derive(Debug, Clone)]
pub struct ForwardContext {
    pub phase: StepPhase,
    /// `[N]` flattened token ids, packed or padded.
    pub input_ids: Tensor,
    /// `[N]` position of every token.
    pub position_ids: Tensor,
    /// Context phase: prompt length per sequence. Generation: one per row.
    pub context_lengths: Vec<usize>,
    /// Cached tokens per cache row before this step.
    pub past_lengths: Vec<usize>,
    pub beam_width: usize,
    /// Padded sequence width; zero when inputs are packed.
    pub padded_len: usize,
    /// Row of each sequence's last token in `input_ids`.
    pub last_token_ids: Vec<u32>,
    pub cache_indirection: Option<Tensor>,
    pub block_pointers: Option<Tensor>,
    pub kv_quant_scale: f32,
}

impl ForwardContext {
    pub fn from_step(ctx: &StepContext<'_>, model: &ModelConfig) -> Result<Self> {
        let request_types = to_u32_vec(ctx.input(HOST_REQUEST_TYPES)?)?;
        ensure!(!request_types.is_empty(), RuntimeError::invariant("empty step"));
        let phase = if request_types.iter().all(|&t| t == REQUEST_TYPE_CONTEXT) {
            StepPhase::Context
        } else if request_types.iter().all(|&t| t == REQUEST_TYPE_GENERATION) {
            StepPhase::Generation
        } else {
            return Err(RuntimeError::configuration(
                "a step must not mix context and generation requests",
            )
            .into());
        };

        let context_lengths: Vec<usize> = to_u32_vec(ctx.input(CONTEXT_LENGTHS)?)?
            .into_iter()
            .map(|l| l as usize)
            .collect();
        let past_lengths: Vec<usize> = to_u32_vec(ctx.input(PAST_KEY_VALUE_LENGTHS)?)?
            .into_iter()
            .map(|l| l as usize)
            .collect();
        let cache_indirection = ctx.optional_input(CACHE_INDIRECTION).cloned();
        let beam_width = match &cache_indirection {
            Some(table) => table.dim(1)?,
            None => 1,
        };
        ensure!(beam_width > 0, RuntimeError::invariant("beam width must be positive"));

        let ids = ctx.input(INPUT_IDS)?;
        let (dim0, dim1) = ids.dims2()?;
        let packed = model.is_packed();
        let input_ids = ids.flatten_all()?.to_dtype(DType::U32)?;
        let tokens = dim0 * dim1;

        let (padded_len, default_positions, default_last) = match phase {
            StepPhase::Context => {
                ensure!(
                    context_lengths.iter().all(|&l| l > 0),
                    RuntimeError::invariant("context lengths must be positive")
                );
                if packed {
                    ensure!(
                        dim0 == 1 && tokens == context_lengths.iter().sum::<usize>(),
                        RuntimeError::ShapeMismatch {
                            expected: vec![1, context_lengths.iter().sum()],
                            actual: vec![dim0, dim1],
                        }
                    );
                    let mut positions = Vec::with_capacity(tokens);
                    let mut last = Vec::with_capacity(context_lengths.len());
                    let mut offset = 0usize;
                    for &len in &context_lengths {
                        positions.extend(0..len as u32);
                        offset += len;
                        last.push(offset as u32 - 1);
                    }
                    (0, positions, last)
                } else {
                    ensure!(
                        dim0 == context_lengths.len()
                            && context_lengths.iter().all(|&l| l <= dim1),
                        RuntimeError::ShapeMismatch {
                            expected: vec![context_lengths.len(), dim1],
                            actual: vec![dim0, dim1],
                        }
                    );
                    let positions = (0..tokens).map(|i| (i % dim1) as u32).collect();
                    let last = context_lengths
                        .iter()
                        .enumerate()
                        .map(|(seq, &len)| (seq * dim1 + len - 1) as u32)
                        .collect();
                    (dim1, positions, last)
                }
            }
            StepPhase::Generation => {
                let rows = past_lengths.len();
                ensure!(
                    tokens == rows,
                    RuntimeError::ShapeMismatch {
                        expected: vec![rows],
                        actual: vec![dim0, dim1],
                    }
                );
                let positions = past_lengths.iter().map(|&p| p as u32).collect();
                let last = (0..rows as u32).collect();
                (if packed { 0 } else { 1 }, positions, last)
            }
        };

        let position_ids = match ctx.optional_input(POSITION_IDS) {
            Some(positions) => positions.flatten_all()?.to_dtype(DType::U32)?,
            None => Tensor::from_vec(default_positions, tokens, ids.device())?,
        };
        let last_token_ids = match ctx.optional_input(LAST_TOKEN_IDS) {
            Some(last) => to_u32_vec(last)?,
            None => default_last,
        };
        let kv_quant_scale = match ctx.optional_input(KV_CACHE_QUANT_SCALE) {
            Some(scale) => scale.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?
                .first()
                .copied()
                .unwrap_or(1.0),
            None => 1.0,
        };

        Ok(Self {
            phase,
            input_ids,
            position_ids,
            context_lengths,
            past_lengths,
            beam_width,
            padded_len,
            last_token_ids,
            cache_indirection,
            block_pointers: ctx.optional_input(KV_CACHE_BLOCK_POINTERS).cloned(),
            kv_quant_scale,
        })
    }

    pub fn is_context(&self) -> bool {
        self.phase == StepPhase::Context
    }

    pub fn num_tokens(&self) -> usize {
        self.input_ids.dims1().unwrap_or(0)
    }

    /// Cache view of `layer` over the bound storage.
    pub fn cache_view(
        &self,
        ctx: &StepContext<'_>,
        layer: usize,
        quant: &KvQuant,
    ) -> Result<KvCacheView> {
        let storage = ctx.input(&past_key_value(layer))?.clone();
        match &self.block_pointers {
            Some(tables) => KvCacheView::paged(storage, tables, quant.clone()),
            None => KvCacheView::contiguous(storage, quant.clone()),
        }
    }
}

fn to_u32_vec(t: &Tensor) -> Result<Vec<u32>> {
    Ok(t.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()?)
}
