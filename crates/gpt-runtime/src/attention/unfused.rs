use anyhow::{Result, ensure};
use candle_core::{DType, Tensor};
use candle_nn::ops::softmax_last_dim;

use crate::attention::{ContextAttentionKernel, ContextBatch, alibi::alibi_bias};
use crate::gemm::{ComputeType, GemmWrapper, Operation};

/// Context attention built from batched GEMMs and a masked softmax.
#[derive(Debug, Clone)]
pub struct UnfusedContextAttention {
    num_heads: usize,
    num_kv_heads: usize,
    head_size: usize,
    gemm: GemmWrapper,
    fp32_probs: bool,
}

impl UnfusedContextAttention {
    pub fn new(
        num_heads: usize,
        num_kv_heads: usize,
        head_size: usize,
        gemm: GemmWrapper,
        fp32_probs: bool,
    ) -> Result<Self> {
        ensure!(num_heads > 0, "num_heads must be positive");
        ensure!(num_kv_heads > 0, "num_kv_heads must be positive");
        ensure!(head_size > 0, "head_size must be positive");
        ensure!(
            num_heads.is_multiple_of(num_kv_heads),
            "num_heads must be divisible by num_kv_heads"
        );
        Ok(Self {
            num_heads,
            num_kv_heads,
            head_size,
            gemm,
            fp32_probs,
        })
    }

    /// `[B, H_q, S, S]` f32 scores, scaled by `scale`.
    fn qk(&self, q: &Tensor, k: &Tensor, scale: f64) -> Result<Tensor> {
        let (b, hq, s, d) = q.dims4()?;
        let hkv = self.num_kv_heads;
        let gemm = |a: &Tensor, bt: &Tensor| {
            self.gemm
                .strided_batched_gemm(Operation::N, Operation::T, a, bt, scale, ComputeType::F32)
        };
        let scores = if hkv == hq {
            gemm(&q.reshape((b * hq, s, d))?, &k.reshape((b * hq, s, d))?)?
        } else if hkv == 1 {
            gemm(&q.reshape((b, hq * s, d))?, &k.reshape((b, s, d))?)?
        } else {
            let group = hq / hkv;
            let q = q.reshape((b, hkv, group * s, d))?;
            let mut per_kv_head = Vec::with_capacity(hkv);
            for ki in 0..hkv {
                let qi = q.narrow(1, ki, 1)?.squeeze(1)?.contiguous()?;
                let ki = k.narrow(1, ki, 1)?.squeeze(1)?.contiguous()?;
                per_kv_head.push(gemm(&qi, &ki)?);
            }
            Tensor::stack(&per_kv_head, 1)?
        };
        Ok(scores.reshape((b, hq, s, s))?)
    }

    /// `[B, H_q, S, d]` attention output.
    fn pv(&self, probs: &Tensor, v: &Tensor) -> Result<Tensor> {
        let (b, hq, s, _) = probs.dims4()?;
        let d = self.head_size;
        let hkv = self.num_kv_heads;
        let (probs, v, compute) = if self.fp32_probs {
            (probs.clone(), v.to_dtype(DType::F32)?, ComputeType::F32)
        } else {
            (probs.to_dtype(v.dtype())?, v.clone(), ComputeType::Native)
        };
        let gemm = |a: &Tensor, b: &Tensor| {
            self.gemm
                .strided_batched_gemm(Operation::N, Operation::N, a, b, 1.0, compute)
        };
        let out = if hkv == hq {
            gemm(&probs.reshape((b * hq, s, s))?, &v.reshape((b * hq, s, d))?)?
        } else if hkv == 1 {
            gemm(&probs.reshape((b, hq * s, s))?, &v.reshape((b, s, d))?)?
        } else {
            let group = hq / hkv;
            let probs = probs.reshape((b, hkv, group * s, s))?;
            let mut per_kv_head = Vec::with_capacity(hkv);
            for ki in 0..hkv {
                let pi = probs.narrow(1, ki, 1)?.squeeze(1)?.contiguous()?;
                let vi = v.narrow(1, ki, 1)?.squeeze(1)?.contiguous()?;
                per_kv_head.push(gemm(&pi, &vi)?);
            }
            Tensor::stack(&per_kv_head, 1)?
        };
        Ok(out.reshape((b, hq, s, d))?)
    }
}

impl ContextAttentionKernel for UnfusedContextAttention {
    fn name(&self) -> &'static str {
        "unfused"
    }

    fn forward(&self, batch: &ContextBatch<'_>) -> Result<Tensor> {
        let (_, s, hq, d) = batch.query.dims4()?;
        ensure!(hq == self.num_heads, "query head count mismatch");
        ensure!(d == self.head_size, "query head_size mismatch");
        ensure!(
            batch.key.dim(2)? == self.num_kv_heads,
            "key/value head count mismatch"
        );
        ensure!(batch.key.dims() == batch.value.dims(), "key/value shapes must match");

        let q = batch.query.transpose(1, 2)?.contiguous()?;
        let k = batch.key.transpose(1, 2)?.contiguous()?;
        let v = batch.value.transpose(1, 2)?.contiguous()?;

        let scores = self.qk(&q, &k, batch.qk_scale)?;
        let mut bias = batch.aux.mask_bias(batch.mask_type)?;
        if let Some(slopes) = batch.alibi_slopes {
            let positions: Vec<usize> = (0..s).collect();
            bias = bias.broadcast_add(&alibi_bias(slopes, &positions, s)?.unsqueeze(0)?)?;
        }
        let probs = softmax_last_dim(&scores.broadcast_add(&bias)?)?;
        let out = self.pv(&probs, &v)?;
        Ok(out.transpose(1, 2)?.contiguous()?)
    }
}
