use std::ops::Range;
use std::sync::Arc;

use anyhow::{Result, ensure};
use candle_core::{DType, Device, Tensor};

use super::distributed::Communicator;

#[derive(Debug, Clone)]
pub struct Linear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (out_dim, _) = weight.dims2()?;
        if let Some(bias) = &bias {
            ensure!(
                bias.dims1()? == out_dim,
                "bias shape mismatch: expected [{out_dim}], got {:?}",
                bias.dims()
            );
        }
        Ok(Self { weight, bias })
    }

    /// Loads `[out, in]` weights, keeping output rows `rows` (column
    /// parallelism) and input columns `cols` (row parallelism).
    pub fn load(
        weight: &Tensor,
        bias: Option<&Tensor>,
        rows: Range<usize>,
        cols: Range<usize>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let weight = weight
            .narrow(0, rows.start, rows.len())?
            .narrow(1, cols.start, cols.len())?
            .to_device(device)?
            .to_dtype(dtype)?
            .contiguous()?;
        let bias = bias
            .map(|b| -> Result<Tensor> {
                Ok(b.narrow(0, rows.start, rows.len())?
                    .to_device(device)?
                    .to_dtype(dtype)?)
            })
            .transpose()?;
        Self::new(weight, bias)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = x.matmul(&self.weight.t()?)?;
        match &self.bias {
            Some(bias) => Ok(y.broadcast_add(bias)?),
            None => Ok(y),
        }
    }
}

/// Linear layer whose input features are split across ranks. Partial products
/// are summed over the group before the bias is added once.
#[derive(Debug, Clone)]
pub struct RowParallelLinear {
    inner: Linear,
    bias: Option<Tensor>,
    comm: Arc<dyn Communicator>,
}

impl RowParallelLinear {
    pub fn load(
        weight: &Tensor,
        bias: Option<&Tensor>,
        comm: Arc<dyn Communicator>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let (out_dim, in_dim) = weight.dims2()?;
        let cols = super::distributed::shard_range(in_dim, comm.rank(), comm.world_size())?;
        let inner = Linear::load(weight, None, 0..out_dim, cols, dtype, device)?;
        let bias = bias
            .map(|b| -> Result<Tensor> { Ok(b.to_device(device)?.to_dtype(dtype)?) })
            .transpose()?;
        Ok(Self { inner, bias, comm })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = self.comm.all_reduce_sum(&self.inner.forward(x)?)?;
        match &self.bias {
            Some(bias) => Ok(y.broadcast_add(bias)?),
            None => Ok(y),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::layers::distributed::LocalComm;

    #[test]
    fn test_load_slices_rows_and_cols() -> Result<()> {
        let dev = Device::Cpu;
        let w = Tensor::arange(0f32, 12.0, &dev)?.reshape((3, 4))?;
        let b = Tensor::new(&[1f32, 2.0, 3.0], &dev)?;
        let lin = Linear::load(&w, Some(&b), 1..3, 2..4, DType::F32, &dev)?;
        assert_eq!(lin.weight().to_vec2::<f32>()?, vec![vec![6.0, 7.0], vec![10.0, 11.0]]);
        let y = lin.forward(&Tensor::new(&[[1f32, 1.0]], &dev)?)?;
        assert_eq!(y.to_vec2::<f32>()?, vec![vec![15.0, 24.0]]);
        Ok(())
    }

    #[test]
    fn test_row_parallel_single_rank_is_plain_linear() -> Result<()> {
        let dev = Device::Cpu;
        let w = Tensor::arange(0f32, 6.0, &dev)?.reshape((2, 3))?;
        let b = Tensor::new(&[0.5f32, -0.5], &dev)?;
        let row = RowParallelLinear::load(&w, Some(&b), Arc::new(LocalComm), DType::F32, &dev)?;
        let plain = Linear::load(&w, Some(&b), 0..2, 0..3, DType::F32, &dev)?;
        let x = Tensor::new(&[[1f32, 2.0, 3.0]], &dev)?;
        assert_eq!(row.forward(&x)?.to_vec2::<f32>()?, plain.forward(&x)?.to_vec2::<f32>()?);
        Ok(())
    }
}
