use anyhow::{Result, ensure};
use candle_core::{DType, Device, Tensor};
use tracing::info;

use crate::error::RuntimeError;
use crate::kv_cache::block_manager::{BlockCopy, BlockManager, UNALLOCATED_BLOCK};
use crate::kv_cache::quant::KvQuant;
use crate::runtime::BufferManager;
use crate::utils::{KvCacheQuantMode, ModelConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvCacheLayout {
    Contiguous,
    Paged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KvCacheConfig {
    pub layout: KvCacheLayout,
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_size: usize,
    /// Longest sequence a row may hold (`S_cap`).
    pub max_seq_len: usize,
    pub max_batch_size: usize,
    pub beam_width: usize,
    pub tokens_per_block: usize,
    /// Pool size for the paged layout; ignored for the contiguous one.
    pub num_blocks: usize,
    pub dtype: DType,
    pub quant_mode: KvCacheQuantMode,
    pub quant_scale: f32,
}

impl KvCacheConfig {
    pub fn from_model(
        model: &ModelConfig,
        max_batch_size: usize,
        beam_width: usize,
        max_seq_len: usize,
        num_blocks: usize,
    ) -> Self {
        Self {
            layout: if model.paged_kv_cache {
                KvCacheLayout::Paged
            } else {
                KvCacheLayout::Contiguous
            },
            num_layers: model.num_layers,
            num_kv_heads: model.num_kv_heads_local(),
            head_size: model.head_size,
            max_seq_len,
            max_batch_size,
            beam_width,
            tokens_per_block: model.tokens_per_block,
            num_blocks,
            dtype: model.dtype(),
            quant_mode: model.kv_cache_quant_mode,
            quant_scale: model.kv_cache_quant_scale,
        }
    }

    pub fn rows(&self) -> usize {
        self.max_batch_size * self.beam_width
    }

    pub fn max_blocks_per_seq(&self) -> usize {
        self.max_seq_len.div_ceil(self.tokens_per_block)
    }

    fn layer_shape(&self) -> (usize, usize, usize, usize, usize) {
        match self.layout {
            KvCacheLayout::Contiguous => (
                self.rows(),
                2,
                self.num_kv_heads,
                self.max_seq_len,
                self.head_size,
            ),
            KvCacheLayout::Paged => (
                self.num_blocks,
                2,
                self.num_kv_heads,
                self.tokens_per_block,
                self.head_size,
            ),
        }
    }
}

/// Per-layer key/value storage owned by a session.
///
/// Contiguous layers are `[B*w, 2, H_kv, S_cap, d]`; paged layers are a pool of
/// `[num_blocks, 2, H_kv, tokens_per_block, d]` addressed through block tables.
#[derive(Debug)]
pub struct KvCache {
    config: KvCacheConfig,
    layers: Vec<Tensor>,
    quant: KvQuant,
    block_manager: Option<BlockManager>,
}

impl KvCache {
    pub fn new(config: KvCacheConfig, buffers: &BufferManager) -> Result<Self> {
        ensure!(config.num_layers > 0, "kv cache needs at least one layer");
        ensure!(
            config.layout == KvCacheLayout::Contiguous || config.num_blocks > 0,
            RuntimeError::configuration("paged kv cache needs a positive block count")
        );
        let quant = if config.quant_mode.is_quantized() {
            KvQuant::new(config.quant_mode, config.quant_scale, buffers.device())?
        } else {
            KvQuant::none()
        };
        let storage_dtype = quant.storage_dtype(config.dtype);
        let mut layers = Vec::with_capacity(config.num_layers);
        for _ in 0..config.num_layers {
            layers.push(buffers.gpu(config.layer_shape(), storage_dtype)?);
        }
        let block_manager = match config.layout {
            KvCacheLayout::Contiguous => None,
            KvCacheLayout::Paged => Some(BlockManager::new(
                config.num_blocks,
                config.tokens_per_block,
                config.max_blocks_per_seq(),
                config.max_batch_size,
                config.beam_width,
            )?),
        };
        info!(
            layout = ?config.layout,
            layers = config.num_layers,
            shape = ?config.layer_shape(),
            dtype = ?storage_dtype,
            "allocated kv cache"
        );
        Ok(Self {
            config,
            layers,
            quant,
            block_manager,
        })
    }

    pub fn config(&self) -> &KvCacheConfig {
        &self.config
    }

    pub fn layout(&self) -> KvCacheLayout {
        self.config.layout
    }

    pub fn layer(&self, idx: usize) -> Option<&Tensor> {
        self.layers.get(idx)
    }

    pub fn layers(&self) -> &[Tensor] {
        &self.layers
    }

    pub fn quant(&self) -> &KvQuant {
        &self.quant
    }

    pub fn block_manager(&self) -> Option<&BlockManager> {
        self.block_manager.as_ref()
    }

    /// Makes sure `row` can hold `needed_positions` tokens.
    pub fn reserve(&mut self, row: usize, needed_positions: usize) -> Result<()> {
        if needed_positions > self.config.max_seq_len {
            return Err(RuntimeError::ShapeUnsupported {
                name: "sequence_length".to_string(),
                shape: vec![needed_positions],
                reason: format!("kv cache holds at most {} positions", self.config.max_seq_len),
            }
            .into());
        }
        if let Some(manager) = self.block_manager.as_mut() {
            manager.reserve(row, needed_positions)?;
            let copies = manager.take_pending_copies();
            self.apply_block_copies(&copies)?;
        }
        Ok(())
    }

    /// Replicates the prompt of `seq_idx` from beam 0 into the other beams.
    pub fn tile_beams(&mut self, seq_idx: usize, prompt_len: usize) -> Result<()> {
        let beam_width = self.config.beam_width;
        if beam_width == 1 {
            return Ok(());
        }
        match self.block_manager.as_mut() {
            Some(manager) => {
                manager.share_beams(seq_idx, prompt_len)?;
                let copies = manager.take_pending_copies();
                self.apply_block_copies(&copies)?;
            }
            None => {
                let src_row = seq_idx * beam_width;
                for layer in &self.layers {
                    let src = layer.narrow(0, src_row, 1)?.copy()?;
                    for beam in 1..beam_width {
                        layer.narrow(0, src_row + beam, 1)?.slice_set(&src, 0, 0)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn release_sequence(&mut self, seq_idx: usize) -> usize {
        self.block_manager
            .as_mut()
            .map_or(0, |manager| manager.release_sequence(seq_idx))
    }

    pub fn release_all(&mut self) {
        if let Some(manager) = self.block_manager.as_mut() {
            manager.release_all();
        }
    }

    /// Block-pointer table bound to the engine, `[rows, max_blocks_per_seq]`.
    pub fn block_table_tensor(&self, rows: usize, device: &Device) -> Result<Option<Tensor>> {
        self.block_manager
            .as_ref()
            .map(|manager| manager.table_tensor(rows, device))
            .transpose()
    }

    /// Host copy of the current block tables, used to detect launch-graph
    /// invalidation.
    pub fn block_pointer_snapshot(&self, rows: usize) -> Vec<u32> {
        match self.block_manager.as_ref() {
            Some(manager) => (0..rows)
                .flat_map(|row| manager.block_table(row).iter().copied())
                .collect(),
            None => Vec::new(),
        }
    }

    fn apply_block_copies(&self, copies: &[BlockCopy]) -> Result<()> {
        for copy in copies {
            for layer in &self.layers {
                let src = layer.narrow(0, copy.src as usize, 1)?.copy()?;
                layer.narrow(0, copy.dst as usize, 1)?.slice_set(&src, 0, 0)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Addressing {
    Contiguous { max_seq_len: usize },
    Paged {
        tokens_per_block: usize,
        tables: Vec<Vec<u32>>,
    },
}

/// Non-owning view of one layer's cache as seen by the attention operator.
#[derive(Debug, Clone)]
pub struct KvCacheView {
    storage: Tensor,
    addressing: Addressing,
    num_kv_heads: usize,
    head_size: usize,
    quant: KvQuant,
}

impl KvCacheView {
    pub fn contiguous(storage: Tensor, quant: KvQuant) -> Result<Self> {
        let (_, two, num_kv_heads, max_seq_len, head_size) = storage.dims5()?;
        ensure!(two == 2, "kv cache layer must stack keys and values");
        Ok(Self {
            storage,
            addressing: Addressing::Contiguous { max_seq_len },
            num_kv_heads,
            head_size,
            quant,
        })
    }

    pub fn paged(storage: Tensor, block_tables: &Tensor, quant: KvQuant) -> Result<Self> {
        let (_, two, num_kv_heads, tokens_per_block, head_size) = storage.dims5()?;
        ensure!(two == 2, "kv cache pool must stack keys and values");
        let tables = block_tables.to_dtype(DType::U32)?.to_vec2::<u32>()?;
        Ok(Self {
            storage,
            addressing: Addressing::Paged {
                tokens_per_block,
                tables,
            },
            num_kv_heads,
            head_size,
            quant,
        })
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    pub fn quant(&self) -> &KvQuant {
        &self.quant
    }

    fn unit_len(&self) -> usize {
        match &self.addressing {
            Addressing::Contiguous { max_seq_len } => *max_seq_len,
            Addressing::Paged {
                tokens_per_block, ..
            } => *tokens_per_block,
        }
    }

    /// Maps a (row, position) pair to a storage unit (row or block) and the
    /// offset inside that unit.
    fn locate(&self, row: usize, pos: usize) -> Result<(usize, usize)> {
        match &self.addressing {
            Addressing::Contiguous { max_seq_len } => {
                ensure!(
                    pos < *max_seq_len,
                    RuntimeError::invariant(format!(
                        "position {pos} beyond cache capacity {max_seq_len}"
                    ))
                );
                Ok((row, pos))
            }
            Addressing::Paged {
                tokens_per_block,
                tables,
            } => {
                let table = tables.get(row).ok_or_else(|| {
                    RuntimeError::invariant(format!("no block table for row {row}"))
                })?;
                let block = table
                    .get(pos / tokens_per_block)
                    .copied()
                    .filter(|&b| b != UNALLOCATED_BLOCK && (b as usize) < self.storage.dims()[0])
                    .ok_or_else(|| {
                        RuntimeError::invariant(format!(
                            "row {row} has no block reserved for position {pos}"
                        ))
                    })?;
                Ok((block as usize, pos % tokens_per_block))
            }
        }
    }

    /// Writes `key`/`value` (`[H_kv, n, d]`) for `row` at positions
    /// `[start, start + n)`, quantizing when the cache is quantized.
    pub fn write(&self, row: usize, start: usize, key: &Tensor, value: &Tensor) -> Result<()> {
        let (heads, n, dim) = key.dims3()?;
        ensure!(key.dims() == value.dims(), "key/value shapes must match");
        ensure!(
            heads == self.num_kv_heads && dim == self.head_size,
            "key/value shape {:?} does not match cache heads {} x {}",
            key.dims(),
            self.num_kv_heads,
            self.head_size
        );
        let storage_dtype = self.storage.dtype();
        let kv = Tensor::stack(&[key, value], 0)?.unsqueeze(0)?;
        let kv = if self.quant.mode().is_quantized() {
            self.quant.quantize(&kv)?
        } else {
            kv.to_dtype(storage_dtype)?
        };
        let unit_len = self.unit_len();
        let mut offset = 0;
        while offset < n {
            let (unit, inner) = self.locate(row, start + offset)?;
            let chunk = (n - offset).min(unit_len - inner);
            let src = kv.narrow(3, offset, chunk)?.contiguous()?;
            self.storage.narrow(0, unit, 1)?.slice_set(&src, 3, inner)?;
            offset += chunk;
        }
        Ok(())
    }

    /// Gathers keys and values for positions `0..sources.len()`, reading
    /// position `p` from row `sources[p]`. Returns two `[H_kv, n, d]` tensors.
    pub fn gather(&self, sources: &[usize], dtype: DType) -> Result<(Tensor, Tensor)> {
        let n = sources.len();
        ensure!(n > 0, "cannot gather an empty history");
        let heads = self.num_kv_heads;
        let unit_len = self.unit_len();
        let mut located = Vec::with_capacity(n);
        for (pos, &row) in sources.iter().enumerate() {
            located.push(self.locate(row, pos)?);
        }
        let mut indices = Vec::with_capacity(2 * heads * n);
        for kv in 0..2 {
            for head in 0..heads {
                for &(unit, inner) in &located {
                    indices.push((((unit * 2 + kv) * heads + head) * unit_len + inner) as u32);
                }
            }
        }
        let total_vectors = self.storage.elem_count() / self.head_size;
        let flat = self.storage.reshape((total_vectors, self.head_size))?;
        let indices = Tensor::from_vec(indices, 2 * heads * n, self.storage.device())?;
        let gathered = flat
            .index_select(&indices, 0)?
            .reshape((2, heads, n, self.head_size))?;
        let gathered = self.quant.dequantize(&gathered, dtype)?;
        Ok((gathered.get(0)?, gathered.get(1)?))
    }

    /// Keys and values of `row` for positions `[0, len)`.
    pub fn read(&self, row: usize, len: usize, dtype: DType) -> Result<(Tensor, Tensor)> {
        self.gather(&vec![row; len], dtype)
    }
}
