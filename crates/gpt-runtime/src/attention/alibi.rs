use anyhow::{Result, ensure};
use candle_core::{Device, Tensor};

/// ALiBi slopes for `num_heads` total heads, sliced to the heads owned by
/// `tp_rank`.
///
/// Heads up to the nearest power of two `m` get `2^(-8/m)^k` for `k = 1..=m`;
/// any remaining heads take the odd powers of `2^(-4/m)`.
pub fn alibi_slopes(num_heads: usize, tp_size: usize, tp_rank: usize) -> Result<Vec<f32>> {
    ensure!(num_heads > 0, "num_heads must be positive");
    ensure!(
        tp_size > 0 && tp_rank < tp_size && num_heads.is_multiple_of(tp_size),
        "cannot shard {num_heads} alibi heads over tp_size {tp_size} at rank {tp_rank}"
    );
    let closest = 1usize << num_heads.ilog2();
    let base = 2f64.powf(-8.0 / closest as f64);
    let mut slopes: Vec<f64> = (1..=closest).map(|k| base.powi(k as i32)).collect();
    if closest < num_heads {
        let extra_base = 2f64.powf(-4.0 / closest as f64);
        let remaining = (num_heads - closest).min(closest);
        slopes.extend((0..remaining).map(|i| extra_base.powi((2 * i + 1) as i32)));
    }
    let per_rank = num_heads / tp_size;
    Ok(slopes
        .into_iter()
        .skip(tp_rank * per_rank)
        .take(per_rank)
        .map(|s| s as f32)
        .collect())
}

pub fn alibi_slopes_tensor(
    num_heads: usize,
    tp_size: usize,
    tp_rank: usize,
    device: &Device,
) -> Result<Tensor> {
    let slopes = alibi_slopes(num_heads, tp_size, tp_rank)?;
    let len = slopes.len();
    Ok(Tensor::from_vec(slopes, len, device)?)
}

/// Linear bias `slope[h] * (k - q_pos)` as an f32 `[H, queries, key_len]`
/// tensor.
pub fn alibi_bias(slopes: &Tensor, query_positions: &[usize], key_len: usize) -> Result<Tensor> {
    let heads = slopes.dims1()?;
    let mut rel = Vec::with_capacity(query_positions.len() * key_len);
    for &q in query_positions {
        rel.extend((0..key_len).map(|k| k as f32 - q as f32));
    }
    let rel = Tensor::from_vec(rel, (1, query_positions.len(), key_len), slopes.device())?;
    let slopes = slopes.to_dtype(candle_core::DType::F32)?.reshape((heads, 1, 1))?;
    Ok(rel.broadcast_mul(&slopes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_of_two_heads() -> Result<()> {
        let slopes = alibi_slopes(8, 1, 0)?;
        let expected: Vec<f32> = (1..=8).map(|k| 0.5f32.powi(k)).collect();
        for (a, b) in slopes.iter().zip(expected) {
            assert!((a - b).abs() < 1e-7);
        }
        Ok(())
    }

    #[test]
    fn test_extra_heads_use_odd_powers() -> Result<()> {
        let slopes = alibi_slopes(6, 1, 0)?;
        assert_eq!(slopes.len(), 6);
        // closest power of two is 4: base 2^-2, extras from 2^-1 at odd powers
        assert!((slopes[3] - 0.25f32.powi(4)).abs() < 1e-7);
        assert!((slopes[4] - 0.5).abs() < 1e-7);
        assert!((slopes[5] - 0.125).abs() < 1e-7);
        Ok(())
    }

    #[test]
    fn test_slopes_are_sliced_per_rank() -> Result<()> {
        let all = alibi_slopes(8, 1, 0)?;
        let rank1 = alibi_slopes(8, 2, 1)?;
        assert_eq!(rank1, all[4..].to_vec());
        Ok(())
    }

    #[test]
    fn test_bias_is_relative_to_query_position() -> Result<()> {
        let slopes = Tensor::new(&[0.5f32, 0.25], &Device::Cpu)?;
        let bias = alibi_bias(&slopes, &[2], 3)?.to_vec3::<f32>()?;
        assert_eq!(bias[0], vec![vec![-1.0, -0.5, 0.0]]);
        assert_eq!(bias[1], vec![vec![-0.5, -0.25, 0.0]]);
        Ok(())
    }
}
