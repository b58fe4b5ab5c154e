use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{Result, ensure};
use candle_core::{DType, Tensor};
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    N,
    T,
}

/// Accumulation and output types of one GEMM call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GemmDescriptor {
    pub compute: ComputeType,
    pub dtype: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputeType {
    Native,
    F32,
    Int32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatrixLayout {
    pub batch: usize,
    pub rows: usize,
    pub cols: usize,
    pub op: Operation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GemmKey {
    pub desc: GemmDescriptor,
    pub a: MatrixLayout,
    pub b: MatrixLayout,
    pub c: MatrixLayout,
    pub d: MatrixLayout,
}

/// Candidate strategies probed on a heuristic-cache miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GemmAlgo {
    /// Hands strided operands straight to the backend matmul.
    Strided,
    /// Packs both operands contiguously first.
    Packed,
    /// Issues one matmul per batch entry.
    SplitBatch,
}

const CANDIDATES: [GemmAlgo; 3] = [GemmAlgo::Strided, GemmAlgo::Packed, GemmAlgo::SplitBatch];

#[derive(Debug, Default)]
pub struct GemmAlgoCache {
    entries: HashMap<GemmKey, GemmAlgo>,
    hits: u64,
    misses: u64,
}

impl GemmAlgoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide cache shared by every wrapper that does not bring its own.
    pub fn global() -> Arc<Mutex<GemmAlgoCache>> {
        static GLOBAL: OnceLock<Arc<Mutex<GemmAlgoCache>>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(Mutex::new(GemmAlgoCache::new())))
            .clone()
    }

    pub fn get(&self, key: &GemmKey) -> Option<GemmAlgo> {
        self.entries.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Int8Scale<'a> {
    PerTensor(f32),
    PerColumn(&'a Tensor),
}

/// Stateful matmul front-end with a persistent per-layout algorithm cache.
#[derive(Debug, Clone)]
pub struct GemmWrapper {
    cache: Arc<Mutex<GemmAlgoCache>>,
    workspace: Option<Tensor>,
}

impl GemmWrapper {
    pub fn new(cache: Arc<Mutex<GemmAlgoCache>>) -> Self {
        Self {
            cache,
            workspace: None,
        }
    }

    pub fn with_workspace(mut self, workspace: Tensor) -> Self {
        self.workspace = Some(workspace);
        self
    }

    pub fn workspace(&self) -> Option<&Tensor> {
        self.workspace.as_ref()
    }

    pub fn cache(&self) -> &Arc<Mutex<GemmAlgoCache>> {
        &self.cache
    }

    /// `alpha * op(a) @ op(b)` for rank-2 operands.
    pub fn gemm(
        &self,
        trans_a: Operation,
        trans_b: Operation,
        a: &Tensor,
        b: &Tensor,
        alpha: f64,
    ) -> Result<Tensor> {
        ensure!(a.rank() == 2 && b.rank() == 2, "gemm expects rank-2 operands");
        let out = self.strided_batched_gemm(
            trans_a,
            trans_b,
            &a.unsqueeze(0)?,
            &b.unsqueeze(0)?,
            alpha,
            ComputeType::Native,
        )?;
        Ok(out.squeeze(0)?)
    }

    /// `alpha * op(a[i]) @ op(b[i])` over the leading batch dimension.
    pub fn strided_batched_gemm(
        &self,
        trans_a: Operation,
        trans_b: Operation,
        a: &Tensor,
        b: &Tensor,
        alpha: f64,
        compute: ComputeType,
    ) -> Result<Tensor> {
        let (batch, a_rows, a_cols) = a.dims3()?;
        let (b_batch, b_rows, b_cols) = b.dims3()?;
        ensure!(batch == b_batch, "batch mismatch {batch} vs {b_batch}");
        let (m, k) = oriented(a_rows, a_cols, trans_a);
        let (k2, n) = oriented(b_rows, b_cols, trans_b);
        ensure!(k == k2, "inner dimension mismatch {k} vs {k2}");

        // F32 compute also keeps the output in F32.
        let (work_dtype, out_dtype) = match compute {
            ComputeType::F32 => (DType::F32, DType::F32),
            _ => (a.dtype(), a.dtype()),
        };
        let a = apply_op(&a.to_dtype(work_dtype)?, trans_a)?;
        let b = apply_op(&b.to_dtype(work_dtype)?, trans_b)?;
        let c = MatrixLayout {
            batch,
            rows: m,
            cols: n,
            op: Operation::N,
        };
        let key = GemmKey {
            desc: GemmDescriptor {
                compute,
                dtype: out_dtype.as_str(),
            },
            a: MatrixLayout {
                batch,
                rows: a_rows,
                cols: a_cols,
                op: trans_a,
            },
            b: MatrixLayout {
                batch,
                rows: b_rows,
                cols: b_cols,
                op: trans_b,
            },
            c,
            d: c,
        };
        let out = self.run_cached(key, &a, &b)?;
        let out = if alpha == 1.0 {
            out
        } else {
            out.affine(alpha, 0.0)?
        };
        Ok(out.to_dtype(out_dtype)?)
    }

    /// Independent matmuls over lists of operands that may differ in shape.
    pub fn batched_gemm(
        &self,
        trans_a: Operation,
        trans_b: Operation,
        a: &[Tensor],
        b: &[Tensor],
        alpha: f64,
    ) -> Result<Vec<Tensor>> {
        ensure!(a.len() == b.len(), "batched gemm operand counts differ");
        a.iter()
            .zip(b)
            .map(|(a, b)| self.gemm(trans_a, trans_b, a, b, alpha))
            .collect()
    }

    /// `a @ b^T` on int8 operands stored as `U8` with a +128 offset, accumulated
    /// exactly and scaled per tensor or per output column.
    pub fn int8_gemm(
        &self,
        a: &Tensor,
        b: &Tensor,
        scale: Int8Scale<'_>,
        out_dtype: DType,
    ) -> Result<Tensor> {
        ensure!(
            a.dtype() == DType::U8 && b.dtype() == DType::U8,
            "int8 gemm expects offset-encoded U8 operands"
        );
        let (m, k) = a.dims2()?;
        let (n, k2) = b.dims2()?;
        ensure!(k == k2, "inner dimension mismatch {k} vs {k2}");
        let decode = |x: &Tensor| -> Result<Tensor> {
            Ok(x.to_dtype(DType::F64)?.affine(1.0, -128.0)?.unsqueeze(0)?)
        };
        let a = decode(a)?;
        let b = decode(b)?.transpose(1, 2)?;
        let c = MatrixLayout {
            batch: 1,
            rows: m,
            cols: n,
            op: Operation::N,
        };
        let key = GemmKey {
            desc: GemmDescriptor {
                compute: ComputeType::Int32,
                dtype: out_dtype.as_str(),
            },
            a: MatrixLayout {
                batch: 1,
                rows: m,
                cols: k,
                op: Operation::N,
            },
            b: MatrixLayout {
                batch: 1,
                rows: n,
                cols: k,
                op: Operation::T,
            },
            c,
            d: c,
        };
        let acc = self.run_cached(key, &a, &b)?.squeeze(0)?;
        let scaled = match scale {
            Int8Scale::PerTensor(s) => acc.affine(s as f64, 0.0)?,
            Int8Scale::PerColumn(s) => {
                ensure!(
                    s.dims1()? == n,
                    "per-column scale must have {n} entries, got {}",
                    s.dims1()?
                );
                acc.broadcast_mul(&s.to_dtype(DType::F64)?.unsqueeze(0)?)?
            }
        };
        Ok(scaled.to_dtype(out_dtype)?)
    }

    fn run_cached(&self, key: GemmKey, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let mut cache = self.cache.lock();
        if let Some(algo) = cache.get(&key) {
            cache.hits += 1;
            drop(cache);
            return run_algo(algo, a, b);
        }
        cache.misses += 1;
        let mut best: Option<(GemmAlgo, Duration, Tensor)> = None;
        for algo in CANDIDATES {
            let start = Instant::now();
            let out = run_algo(algo, a, b)?;
            let elapsed = start.elapsed();
            if best.as_ref().is_none_or(|(_, t, _)| elapsed < *t) {
                best = Some((algo, elapsed, out));
            }
        }
        let (algo, elapsed, out) =
            best.ok_or_else(|| anyhow::anyhow!("no gemm candidate produced a result"))?;
        debug!(?key, ?algo, ?elapsed, "gemm heuristic cache miss");
        cache.entries.insert(key, algo);
        Ok(out)
    }
}

fn oriented(rows: usize, cols: usize, op: Operation) -> (usize, usize) {
    match op {
        Operation::N => (rows, cols),
        Operation::T => (cols, rows),
    }
}

fn apply_op(x: &Tensor, op: Operation) -> Result<Tensor> {
    Ok(match op {
        Operation::N => x.clone(),
        Operation::T => x.transpose(1, 2)?,
    })
}

fn run_algo(algo: GemmAlgo, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    match algo {
        GemmAlgo::Strided => Ok(a.matmul(b)?),
        GemmAlgo::Packed => Ok(a.contiguous()?.matmul(&b.contiguous()?)?),
        GemmAlgo::SplitBatch => {
            let batch = a.dim(0)?;
            let mut outs = Vec::with_capacity(batch);
            for i in 0..batch {
                outs.push(a.get(i)?.matmul(&b.get(i)?)?);
            }
            Ok(Tensor::stack(&outs, 0)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn wrapper() -> GemmWrapper {
        GemmWrapper::new(Arc::new(Mutex::new(GemmAlgoCache::new())))
    }

    #[test]
    fn test_gemm_transposes_and_scales() -> Result<()> {
        let gemm = wrapper();
        let a = Tensor::new(&[[1f32, 2.0], [3.0, 4.0]], &Device::Cpu)?;
        let b = Tensor::new(&[[1f32, 0.0], [1.0, 1.0]], &Device::Cpu)?;
        let c = gemm.gemm(Operation::N, Operation::T, &a, &b, 2.0)?;
        assert_eq!(c.to_vec2::<f32>()?, vec![vec![2.0, 6.0], vec![6.0, 14.0]]);
        Ok(())
    }

    #[test]
    fn test_cache_miss_then_hit() -> Result<()> {
        let gemm = wrapper();
        let a = Tensor::randn(0f32, 1.0, (3, 4, 5), &Device::Cpu)?;
        let b = Tensor::randn(0f32, 1.0, (3, 5, 2), &Device::Cpu)?;
        let first = gemm.strided_batched_gemm(Operation::N, Operation::N, &a, &b, 1.0, ComputeType::F32)?;
        let second = gemm.strided_batched_gemm(Operation::N, Operation::N, &a, &b, 1.0, ComputeType::F32)?;
        let cache = gemm.cache().lock();
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.len(), 1);
        drop(cache);
        let diff = (first - second)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn test_candidates_agree() -> Result<()> {
        let a = Tensor::randn(0f32, 1.0, (2, 3, 8), &Device::Cpu)?;
        let b = Tensor::randn(0f32, 1.0, (2, 6, 8), &Device::Cpu)?.transpose(1, 2)?;
        let reference = run_algo(GemmAlgo::Strided, &a, &b)?;
        for algo in CANDIDATES {
            let out = run_algo(algo, &a, &b)?;
            let diff = (&out - &reference)?.abs()?.max_all()?.to_scalar::<f32>()?;
            assert!(diff < 1e-5, "{algo:?} differs by {diff}");
        }
        Ok(())
    }

    #[test]
    fn test_batched_gemm_mixed_shapes() -> Result<()> {
        let gemm = wrapper();
        let a = vec![
            Tensor::ones((2, 3), DType::F32, &Device::Cpu)?,
            Tensor::ones((4, 3), DType::F32, &Device::Cpu)?,
        ];
        let b = vec![
            Tensor::ones((3, 1), DType::F32, &Device::Cpu)?,
            Tensor::ones((3, 2), DType::F32, &Device::Cpu)?,
        ];
        let out = gemm.batched_gemm(Operation::N, Operation::N, &a, &b, 1.0)?;
        assert_eq!(out[0].dims(), &[2, 1]);
        assert_eq!(out[1].to_vec2::<f32>()?, vec![vec![3.0, 3.0]; 4]);
        Ok(())
    }

    #[test]
    fn test_int8_gemm_per_column_scale() -> Result<()> {
        let gemm = wrapper();
        let encode = |v: &[i32]| v.iter().map(|x| (x + 128) as u8).collect::<Vec<_>>();
        let a = Tensor::from_vec(encode(&[1, -2, 3, 4]), (2, 2), &Device::Cpu)?;
        let b = Tensor::from_vec(encode(&[1, 1, -1, 2]), (2, 2), &Device::Cpu)?;
        let scale = Tensor::new(&[0.5f32, 2.0], &Device::Cpu)?;
        let out = gemm.int8_gemm(&a, &b, Int8Scale::PerColumn(&scale), DType::F32)?;
        // [[1,-2],[3,4]] @ [[1,-1],[1,2]] = [[-1,-5],[7,5]]
        assert_eq!(out.to_vec2::<f32>()?, vec![vec![-0.5, -10.0], vec![3.5, 10.0]]);
        let out = gemm.int8_gemm(&a, &b, Int8Scale::PerTensor(1.0), DType::F32)?;
        assert_eq!(out.to_vec2::<f32>()?, vec![vec![-1.0, -5.0], vec![7.0, 5.0]]);
        Ok(())
    }
}
