use anyhow::Result;
#[cfg(feature = "flash-attn")]
use anyhow::ensure;
use candle_core::Tensor;
#[cfg(feature = "flash-attn")]
use tracing::warn;

use crate::attention::{ContextAttentionKernel, ContextBatch, UnfusedContextAttention};
#[cfg(feature = "flash-attn")]
use crate::utils::MaskType;

/// Single-kernel context attention over packed tokens. Falls back to the
/// unfused kernels whenever the fused call is unavailable or fails.
#[derive(Debug, Clone)]
pub struct FusedContextAttention {
    fallback: UnfusedContextAttention,
}

impl FusedContextAttention {
    pub fn new(fallback: UnfusedContextAttention) -> Self {
        Self { fallback }
    }

    #[cfg(feature = "flash-attn")]
    fn run_flash_attention(&self, batch: &ContextBatch<'_>) -> Result<Tensor> {
        ensure!(
            batch.mask_type != MaskType::Bidirectional,
            "fused attention has no bidirectional mask"
        );
        let (b, s, hq, d) = batch.query.dims4()?;
        let hkv = batch.key.dim(2)?;
        let q = batch.aux.pack(&batch.query.reshape((b * s, hq, d))?)?;
        let k = batch.aux.pack(&batch.key.reshape((b * s, hkv, d))?)?;
        let v = batch.aux.pack(&batch.value.reshape((b * s, hkv, d))?)?;
        let causal = batch.mask_type == MaskType::Causal;
        let scale = batch.qk_scale as f32;
        let cu = &batch.aux.cu_seqlens;
        let max_len = batch.aux.max_len;
        let out = match batch.alibi_slopes {
            Some(slopes) => candle_flash_attn::flash_attn_varlen_alibi(
                &q,
                &k,
                &v,
                &slopes.to_dtype(candle_core::DType::F32)?,
                cu,
                cu,
                max_len,
                max_len,
                scale,
                causal,
            )?,
            None => candle_flash_attn::flash_attn_varlen(
                &q, &k, &v, cu, cu, max_len, max_len, scale, causal,
            )?,
        };
        Ok(batch.aux.unpack(&out)?.reshape((b, s, hq, d))?)
    }
}

impl ContextAttentionKernel for FusedContextAttention {
    fn name(&self) -> &'static str {
        "fused"
    }

    fn forward(&self, batch: &ContextBatch<'_>) -> Result<Tensor> {
        #[cfg(feature = "flash-attn")]
        {
            match self.run_flash_attention(batch) {
                Ok(out) => return Ok(out),
                Err(err) => warn!("fused context attention failed, using unfused kernels: {err}"),
            }
        }
        self.fallback.forward(batch)
    }
}
