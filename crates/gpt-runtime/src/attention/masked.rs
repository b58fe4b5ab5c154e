use anyhow::{Result, ensure};
use candle_core::Tensor;
use candle_nn::ops::softmax_last_dim;

use crate::error::RuntimeError;

/// Cache rows to read for positions `0..=past` of `row`, following the beam
/// cache indirection (`[B][w][S_cap]`) for past positions. The newest position
/// always comes from `row` itself.
pub fn history_sources(
    row: usize,
    past: usize,
    beam_width: usize,
    indirection: Option<&[Vec<Vec<u32>>]>,
) -> Result<Vec<usize>> {
    let seq = row / beam_width;
    let beam = row % beam_width;
    let base = seq * beam_width;
    let mut sources = Vec::with_capacity(past + 1);
    match indirection {
        Some(table) => {
            let parents = table
                .get(seq)
                .and_then(|beams| beams.get(beam))
                .ok_or_else(|| {
                    RuntimeError::invariant(format!("no cache indirection for row {row}"))
                })?;
            ensure!(
                parents.len() >= past,
                RuntimeError::invariant(format!(
                    "cache indirection of row {row} covers {} of {past} positions",
                    parents.len()
                ))
            );
            for &parent in &parents[..past] {
                ensure!(
                    (parent as usize) < beam_width,
                    RuntimeError::invariant(format!("indirection names beam {parent}"))
                );
                sources.push(base + parent as usize);
            }
        }
        None => sources.extend(std::iter::repeat_n(row, past)),
    }
    sources.push(row);
    Ok(sources)
}

/// Number of timeline tiles for multi-block mode over `len` positions.
pub fn num_tiles(len: usize, max_seq_len_tile: usize) -> usize {
    max_seq_len_tile.clamp(1, len.max(1))
}

/// Attention of one query (`[H_q, d]`) over keys/values (`[H_kv, L, d]`),
/// all in f32. `bias` is an optional `[H_q, L]` additive term. With more than
/// one tile the timeline is split and partial results are merged by a
/// rescaling reduction.
pub fn attend(
    query: &Tensor,
    keys: &Tensor,
    values: &Tensor,
    qk_scale: f64,
    bias: Option<&Tensor>,
    tiles: usize,
) -> Result<Tensor> {
    let (hq, d) = query.dims2()?;
    let (hkv, len, _) = keys.dims3()?;
    let group = hq / hkv;
    let scores = query
        .reshape((hkv, group, d))?
        .matmul(&keys.transpose(1, 2)?.contiguous()?)?
        .reshape((hq, len))?
        .affine(qk_scale, 0.0)?;
    let scores = match bias {
        Some(bias) => (scores + bias)?,
        None => scores,
    };
    if tiles <= 1 {
        let probs = softmax_last_dim(&scores)?.reshape((hkv, group, len))?;
        return Ok(probs.matmul(&values.contiguous()?)?.reshape((hq, d))?);
    }
    multi_block(&scores, values, group, tiles)
}

fn multi_block(scores: &Tensor, values: &Tensor, group: usize, tiles: usize) -> Result<Tensor> {
    let (hq, len) = scores.dims2()?;
    let (hkv, _, d) = values.dims3()?;
    let tile_len = len.div_ceil(tiles);
    let mut partial_out = Vec::with_capacity(tiles);
    let mut partial_sum = Vec::with_capacity(tiles);
    let mut partial_max = Vec::with_capacity(tiles);
    let mut start = 0;
    while start < len {
        let n = tile_len.min(len - start);
        let tile = scores.narrow(1, start, n)?;
        let max = tile.max_keepdim(1)?;
        let exp = tile.broadcast_sub(&max)?.exp()?;
        partial_sum.push(exp.sum_keepdim(1)?);
        let v = values.narrow(1, start, n)?.contiguous()?;
        partial_out.push(exp.reshape((hkv, group, n))?.matmul(&v)?.reshape((hq, d))?);
        partial_max.push(max);
        start += n;
    }
    let partial_max = Tensor::stack(&partial_max, 0)?;
    let global_max = partial_max.max_keepdim(0)?;
    let rescale = partial_max.broadcast_sub(&global_max)?.exp()?;
    let sum = Tensor::stack(&partial_sum, 0)?.mul(&rescale)?.sum(0)?;
    let out = Tensor::stack(&partial_out, 0)?
        .broadcast_mul(&rescale)?
        .sum(0)?;
    Ok(out.broadcast_div(&sum)?.reshape((hq, d))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{D, Device};

    /// Per-head dense attention.
    fn reference(query: &Tensor, keys: &Tensor, values: &Tensor, scale: f64) -> Result<Tensor> {
        let (hq, _) = query.dims2()?;
        let (hkv, _, _) = keys.dims3()?;
        let group = hq / hkv;
        let mut outs = Vec::with_capacity(hq);
        for h in 0..hq {
            let k = keys.get(h / group)?;
            let v = values.get(h / group)?;
            let q = query.get(h)?.unsqueeze(0)?;
            let s = q.matmul(&k.t()?)?.affine(scale, 0.0)?;
            let p = candle_nn::ops::softmax(&s, D::Minus1)?;
            outs.push(p.matmul(&v)?.squeeze(0)?);
        }
        Ok(Tensor::stack(&outs, 0)?)
    }

    #[test]
    fn test_sources_follow_indirection() -> Result<()> {
        // two sequences of two beams; row 3 is seq 1 beam 1
        let table = vec![
            vec![vec![0, 0, 0], vec![0, 0, 0]],
            vec![vec![0, 1, 0], vec![1, 0, 1]],
        ];
        assert_eq!(history_sources(3, 3, 2, Some(&table))?, vec![3, 2, 3, 3]);
        assert_eq!(history_sources(2, 2, 2, Some(&table))?, vec![2, 3, 2]);
        assert_eq!(history_sources(1, 2, 2, None)?, vec![1, 1, 1]);
        assert!(history_sources(3, 4, 2, Some(&table)).is_err());
        Ok(())
    }

    #[test]
    fn test_single_block_matches_reference() -> Result<()> {
        let q = Tensor::randn(0f32, 1.0, (4, 8), &Device::Cpu)?;
        let k = Tensor::randn(0f32, 1.0, (2, 9, 8), &Device::Cpu)?;
        let v = Tensor::randn(0f32, 1.0, (2, 9, 8), &Device::Cpu)?;
        let out = attend(&q, &k, &v, 0.35, None, 1)?;
        let expected = reference(&q, &k, &v, 0.35)?;
        let diff = (out - expected)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5, "diff {diff}");
        Ok(())
    }

    #[test]
    fn test_multi_block_matches_single_block() -> Result<()> {
        let q = Tensor::randn(0f32, 2.0, (2, 16), &Device::Cpu)?;
        let k = Tensor::randn(0f32, 2.0, (1, 37, 16), &Device::Cpu)?;
        let v = Tensor::randn(0f32, 1.0, (1, 37, 16), &Device::Cpu)?;
        let single = attend(&q, &k, &v, 0.25, None, 1)?;
        for tiles in [2, 5, 37, 64] {
            let multi = attend(&q, &k, &v, 0.25, None, num_tiles(37, tiles))?;
            let diff = (&multi - &single)?.abs()?.max_all()?.to_scalar::<f32>()?;
            assert!(diff < 1e-5, "{tiles} tiles differ by {diff}");
        }
        Ok(())
    }
}
