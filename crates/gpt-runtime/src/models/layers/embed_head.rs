use std::sync::Arc;

use anyhow::{Result, ensure};
use candle_core::{DType, Device, Tensor};

use super::distributed::{Communicator, shard_range};
use super::linear::Linear;

#[derive(Debug, Clone)]
pub struct VocabEmbedding {
    weight: Tensor,
}

impl VocabEmbedding {
    pub fn new(weight: Tensor) -> Self {
        Self { weight }
    }

    pub fn load(weight: &Tensor, dtype: DType, device: &Device) -> Result<Self> {
        Ok(Self::new(weight.to_device(device)?.to_dtype(dtype)?))
    }

    pub fn num_embeddings(&self) -> Result<usize> {
        Ok(self.weight.dims2()?.0)
    }

    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let tokens = input_ids.dims1()?;
        ensure!(tokens > 0, "input_ids must not be empty");
        let ids = input_ids.to_dtype(DType::U32)?;
        Ok(self.weight.index_select(&ids, 0)?)
    }
}

/// Output projection over the padded vocabulary, split by rows across ranks.
/// `forward` returns full-width logits on every rank.
#[derive(Debug, Clone)]
pub struct LmHead {
    proj: Linear,
    vocab_size_padded: usize,
    comm: Arc<dyn Communicator>,
}

impl LmHead {
    pub fn load(
        weight: &Tensor,
        comm: Arc<dyn Communicator>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let (vocab_size_padded, hidden) = weight.dims2()?;
        let rows = shard_range(vocab_size_padded, comm.rank(), comm.world_size())?;
        let proj = Linear::load(weight, None, rows, 0..hidden, dtype, device)?;
        Ok(Self {
            proj,
            vocab_size_padded,
            comm,
        })
    }

    /// `[N, H]` hidden states to `[N, V']` f32 logits.
    pub fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let local = self.proj.forward(hidden_states)?.to_dtype(DType::F32)?;
        if self.comm.world_size() == 1 {
            return Ok(local);
        }
        let (n, shard) = local.dims2()?;
        let start = self.comm.rank() * shard;
        let full = Tensor::zeros((n, self.vocab_size_padded), DType::F32, local.device())?;
        full.slice_set(&local, 1, start)?;
        self.comm.all_reduce_sum(&full)
    }
}

/// Rows of `hidden_states` holding each sequence's last token.
pub fn gather_last_tokens(hidden_states: &Tensor, last_token_ids: &[u32]) -> Result<Tensor> {
    ensure!(!last_token_ids.is_empty(), "at least one sequence is required");
    let indices = Tensor::from_vec(
        last_token_ids.to_vec(),
        last_token_ids.len(),
        hidden_states.device(),
    )?;
    Ok(hidden_states.index_select(&indices, 0)?)
}
