use anyhow::{Result, ensure};
use candle_core::{D, DType, Device, Tensor};

use crate::utils::PositionEmbeddingType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotaryStyle {
    /// Rotates adjacent channel pairs `(2i, 2i+1)`.
    GptJ,
    /// Rotates channel `i` against channel `i + r/2`.
    Neox,
}

#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    style: RotaryStyle,
    rotary_dim: usize,
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    /// Returns `None` when the position embedding is not rotary or the rotary
    /// dimension is zero.
    pub fn for_position_embedding(
        kind: PositionEmbeddingType,
        rotary_dim: usize,
        max_positions: usize,
        base: f64,
        device: &Device,
    ) -> Result<Option<Self>> {
        let style = match kind {
            PositionEmbeddingType::RopeGptj => RotaryStyle::GptJ,
            PositionEmbeddingType::RopeNeox => RotaryStyle::Neox,
            _ => return Ok(None),
        };
        if rotary_dim == 0 {
            return Ok(None);
        }
        Self::new(style, rotary_dim, max_positions, base, device).map(Some)
    }

    pub fn new(
        style: RotaryStyle,
        rotary_dim: usize,
        max_positions: usize,
        base: f64,
        device: &Device,
    ) -> Result<Self> {
        ensure!(
            rotary_dim.is_multiple_of(2),
            "rotary_dim must be even for rotary embedding"
        );
        ensure!(max_positions > 0, "max_positions must be positive");

        let half = rotary_dim / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| 1f32 / base.powf((2 * i) as f64 / rotary_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
        let positions = Tensor::arange(0u32, max_positions as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_positions, 1))?;
        let freqs = positions.matmul(&inv_freq)?;
        Ok(Self {
            style,
            rotary_dim,
            cos: freqs.cos()?,
            sin: freqs.sin()?,
        })
    }

    pub fn style(&self) -> RotaryStyle {
        self.style
    }

    pub fn rotary_dim(&self) -> usize {
        self.rotary_dim
    }

    /// Rotates the first `rotary_dim` channels of every head of `x`
    /// (`[tokens, heads, d]`) by the angle of the token's position.
    pub fn apply(&self, x: &Tensor, positions: &Tensor) -> Result<Tensor> {
        let (tokens, _, dim) = x.dims3()?;
        ensure!(
            self.rotary_dim <= dim,
            "rotary_dim {} exceeds head size {dim}",
            self.rotary_dim
        );
        ensure!(
            positions.dims1()? == tokens,
            "expected {tokens} positions, got {}",
            positions.dims1()?
        );
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let cos = self.cos.index_select(positions, 0)?.unsqueeze(1)?;
        let sin = self.sin.index_select(positions, 0)?.unsqueeze(1)?;
        let rot = x.narrow(D::Minus1, 0, self.rotary_dim)?;
        let rotated = match self.style {
            RotaryStyle::Neox => rotate_half(&rot, &cos, &sin)?,
            RotaryStyle::GptJ => rotate_interleaved(&rot, &cos, &sin)?,
        };
        let out = if self.rotary_dim == dim {
            rotated
        } else {
            let pass = x.narrow(D::Minus1, self.rotary_dim, dim - self.rotary_dim)?;
            Tensor::cat(&[&rotated, &pass], D::Minus1)?
        };
        Ok(out.to_dtype(dtype)?)
    }
}

fn rotate_half(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let half = x.dim(D::Minus1)? / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    let y1 = (x1.broadcast_mul(cos)? - x2.broadcast_mul(sin)?)?;
    let y2 = (x2.broadcast_mul(cos)? + x1.broadcast_mul(sin)?)?;
    Ok(Tensor::cat(&[&y1, &y2], D::Minus1)?)
}

fn rotate_interleaved(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let (tokens, heads, dim) = x.dims3()?;
    let pairs = x.reshape((tokens, heads, dim / 2, 2))?;
    let even = pairs.narrow(D::Minus1, 0, 1)?.squeeze(D::Minus1)?;
    let odd = pairs.narrow(D::Minus1, 1, 1)?.squeeze(D::Minus1)?;
    let y_even = (even.broadcast_mul(cos)? - odd.broadcast_mul(sin)?)?;
    let y_odd = (odd.broadcast_mul(cos)? + even.broadcast_mul(sin)?)?;
    Ok(Tensor::stack(&[&y_even, &y_odd], D::Minus1)?.reshape((tokens, heads, dim))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(values: &[u32]) -> Result<Tensor> {
        Ok(Tensor::new(values, &Device::Cpu)?)
    }

    #[test]
    fn test_position_zero_is_identity() -> Result<()> {
        let x = Tensor::randn(0f32, 1.0, (1, 2, 8), &Device::Cpu)?;
        for style in [RotaryStyle::GptJ, RotaryStyle::Neox] {
            let rope = RotaryEmbedding::new(style, 8, 16, 10000.0, &Device::Cpu)?;
            let out = rope.apply(&x, &positions(&[0])?)?;
            let diff = (out - &x)?.abs()?.max_all()?.to_scalar::<f32>()?;
            assert!(diff < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_gptj_rotates_adjacent_pairs() -> Result<()> {
        let rope = RotaryEmbedding::new(RotaryStyle::GptJ, 2, 4, 10000.0, &Device::Cpu)?;
        let x = Tensor::new(&[[[1f32, 0.0]]], &Device::Cpu)?;
        let out = rope.apply(&x, &positions(&[1])?)?.flatten_all()?.to_vec1::<f32>()?;
        assert!((out[0] - 1f32.cos()).abs() < 1e-6);
        assert!((out[1] - 1f32.sin()).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_partial_rotary_keeps_tail() -> Result<()> {
        let rope = RotaryEmbedding::new(RotaryStyle::Neox, 4, 8, 10000.0, &Device::Cpu)?;
        let x = Tensor::randn(0f32, 1.0, (3, 2, 6), &Device::Cpu)?;
        let out = rope.apply(&x, &positions(&[0, 3, 7])?)?;
        let tail = out.narrow(2, 4, 2)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(tail, x.narrow(2, 4, 2)?.flatten_all()?.to_vec1::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_rotation_preserves_norm() -> Result<()> {
        let x = Tensor::randn(0f32, 1.0, (2, 1, 8), &Device::Cpu)?;
        for style in [RotaryStyle::GptJ, RotaryStyle::Neox] {
            let rope = RotaryEmbedding::new(style, 8, 32, 10000.0, &Device::Cpu)?;
            let out = rope.apply(&x, &positions(&[5, 17])?)?;
            let before = x.sqr()?.sum_all()?.to_scalar::<f32>()?;
            let after = out.sqr()?.sum_all()?.to_scalar::<f32>()?;
            assert!((before - after).abs() < 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_zero_rotary_dim_disables_rope() -> Result<()> {
        let rope = RotaryEmbedding::for_position_embedding(
            PositionEmbeddingType::RopeNeox,
            0,
            8,
            10000.0,
            &Device::Cpu,
        )?;
        assert!(rope.is_none());
        Ok(())
    }
}
