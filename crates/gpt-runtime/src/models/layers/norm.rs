use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{LayerNorm as CandleLayerNorm, Module};

#[derive(Debug, Clone)]
pub struct LayerNorm {
    inner: CandleLayerNorm,
}

impl LayerNorm {
    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self {
            inner: CandleLayerNorm::new(weight, bias, eps),
        }
    }

    pub fn load(
        weight: &Tensor,
        bias: &Tensor,
        eps: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self::new(
            weight.to_device(device)?.to_dtype(dtype)?,
            bias.to_device(device)?.to_dtype(dtype)?,
            eps,
        ))
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.inner.forward(x)?)
    }
}
