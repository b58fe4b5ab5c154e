use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, ensure};
use candle_core::{DType, Device, Shape, Tensor};

use crate::error::RuntimeError;
use crate::runtime::stream::Stream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    Gpu,
    Cpu,
    Pinned,
}

impl MemoryKind {
    pub fn of(device: &Device) -> Self {
        if device.is_cpu() { Self::Cpu } else { Self::Gpu }
    }
}

/// Bytes handed out by a `BufferManager`, per memory kind.
#[derive(Debug, Default)]
pub struct MemoryCounters {
    gpu: AtomicUsize,
    cpu: AtomicUsize,
    pinned: AtomicUsize,
}

impl MemoryCounters {
    fn record(&self, kind: MemoryKind, bytes: usize) {
        let counter = match kind {
            MemoryKind::Gpu => &self.gpu,
            MemoryKind::Cpu => &self.cpu,
            MemoryKind::Pinned => &self.pinned,
        };
        counter.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes(&self, kind: MemoryKind) -> usize {
        match kind {
            MemoryKind::Gpu => self.gpu.load(Ordering::Relaxed),
            MemoryKind::Cpu => self.cpu.load(Ordering::Relaxed),
            MemoryKind::Pinned => self.pinned.load(Ordering::Relaxed),
        }
    }
}

/// Typed allocation, copy and fill over device, host and pinned memory.
///
/// Tensors are the buffers. Device work is ordered on the manager's stream; host
/// memory has no pinned variant on candle, so `Pinned` allocations live on the CPU
/// device and are only tracked separately.
#[derive(Debug, Clone)]
pub struct BufferManager {
    stream: Stream,
    counters: Arc<MemoryCounters>,
}

impl BufferManager {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            counters: Arc::new(MemoryCounters::default()),
        }
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn device(&self) -> &Device {
        self.stream.device()
    }

    pub fn counters(&self) -> &MemoryCounters {
        &self.counters
    }

    pub fn gpu<S: Into<Shape>>(&self, shape: S, dtype: DType) -> Result<Tensor> {
        let device = self.stream.device().clone();
        self.allocate(shape.into(), dtype, &device, MemoryKind::Gpu)
    }

    pub fn cpu<S: Into<Shape>>(&self, shape: S, dtype: DType) -> Result<Tensor> {
        self.allocate(shape.into(), dtype, &Device::Cpu, MemoryKind::Cpu)
    }

    pub fn pinned<S: Into<Shape>>(&self, shape: S, dtype: DType) -> Result<Tensor> {
        self.allocate(shape.into(), dtype, &Device::Cpu, MemoryKind::Pinned)
    }

    pub fn allocate_kind<S: Into<Shape>>(
        &self,
        kind: MemoryKind,
        shape: S,
        dtype: DType,
    ) -> Result<Tensor> {
        match kind {
            MemoryKind::Gpu => self.gpu(shape, dtype),
            MemoryKind::Cpu => self.cpu(shape, dtype),
            MemoryKind::Pinned => self.pinned(shape, dtype),
        }
    }

    fn allocate(&self, shape: Shape, dtype: DType, device: &Device, kind: MemoryKind) -> Result<Tensor> {
        let bytes = shape
            .elem_count()
            .checked_mul(dtype.size_in_bytes())
            .ok_or_else(|| RuntimeError::OutOfMemory(format!("{shape:?} overflows usize bytes")))?;
        let tensor = Tensor::zeros(shape.clone(), dtype, device).map_err(|e| {
            RuntimeError::OutOfMemory(format!("allocating {bytes} bytes for {shape:?}: {e}"))
        })?;
        self.counters.record(kind, bytes);
        Ok(tensor)
    }

    /// Copies `src` into a fresh buffer of the requested kind.
    pub fn copy_from(&self, src: &Tensor, kind: MemoryKind) -> Result<Tensor> {
        let device = match kind {
            MemoryKind::Gpu => self.stream.device().clone(),
            MemoryKind::Cpu | MemoryKind::Pinned => Device::Cpu,
        };
        let out = src.to_device(&device)?.copy()?;
        self.counters
            .record(kind, out.elem_count() * out.dtype().size_in_bytes());
        Ok(out)
    }

    /// Copies `src` into the storage of `dst`. Both must hold the same number of
    /// elements of the same dtype; `dst` must be contiguous.
    pub fn copy(&self, src: &Tensor, dst: &Tensor) -> Result<()> {
        if src.dtype() != dst.dtype() {
            return Err(RuntimeError::KindMismatch(format!(
                "cannot copy {:?} into {:?}",
                src.dtype(),
                dst.dtype()
            ))
            .into());
        }
        if src.elem_count() != dst.elem_count() {
            return Err(RuntimeError::ShapeMismatch {
                expected: dst.dims().to_vec(),
                actual: src.dims().to_vec(),
            }
            .into());
        }
        let src = src.to_device(dst.device())?.flatten_all()?.contiguous()?;
        write_flat(dst, &src, 0)
    }

    pub fn fill(&self, dst: &Tensor, value: f64) -> Result<()> {
        let src = Tensor::full(value, dst.elem_count(), dst.device())?.to_dtype(dst.dtype())?;
        write_flat(dst, &src, 0)
    }

    pub fn set_zero(&self, dst: &Tensor) -> Result<()> {
        let src = Tensor::zeros(dst.elem_count(), dst.dtype(), dst.device())?;
        write_flat(dst, &src, 0)
    }

    /// Aliases `tensor` with a new shape of identical element count.
    pub fn view<S: Into<Shape>>(&self, tensor: &Tensor, shape: S) -> Result<Tensor> {
        let shape = shape.into();
        if shape.elem_count() != tensor.elem_count() {
            return Err(RuntimeError::ShapeMismatch {
                expected: tensor.dims().to_vec(),
                actual: shape.dims().to_vec(),
            }
            .into());
        }
        Ok(tensor.reshape(shape)?)
    }

    /// Zero-copy sub-range along the leading dimension.
    pub fn slice(&self, tensor: &Tensor, offset: usize, len: usize) -> Result<Tensor> {
        let leading = tensor.dims().first().copied().unwrap_or(0);
        ensure!(
            offset + len <= leading,
            "slice [{offset}, {}) out of range for leading dim {leading}",
            offset + len
        );
        Ok(tensor.narrow(0, offset, len)?)
    }
}

/// Writes a flat `src` into `dst`'s storage starting at element `offset`.
pub(crate) fn write_flat(dst: &Tensor, src: &Tensor, offset: usize) -> Result<()> {
    ensure!(
        dst.is_contiguous(),
        "destination buffer must be contiguous for in-place writes"
    );
    let flat_dst = dst.flatten_all()?;
    let flat_src = src.flatten_all()?.contiguous()?;
    ensure!(
        offset + flat_src.elem_count() <= flat_dst.elem_count(),
        "write of {} elements at {offset} overflows buffer of {}",
        flat_src.elem_count(),
        flat_dst.elem_count()
    );
    flat_dst.slice_set(&flat_src, 0, offset)?;
    Ok(())
}
