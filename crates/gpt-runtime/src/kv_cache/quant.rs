use anyhow::{Result, ensure};
use candle_core::{DType, Device, Tensor};

use crate::utils::KvCacheQuantMode;

const FP8_E4M3_MAX: f32 = 448.0;
const FP8_E4M3_NAN: u8 = 0x7f;

/// Quantization applied while keys and values are written to the cache.
///
/// Quantized caches store one byte per element. Int8 values carry a +128 offset
/// so they fit `U8`; fp8 values use the e4m3 bit layout and decode through a
/// 256-entry lookup table.
#[derive(Debug, Clone)]
pub struct KvQuant {
    mode: KvCacheQuantMode,
    scale: f32,
    fp8_table: Option<Tensor>,
}

impl KvQuant {
    pub fn none() -> Self {
        Self {
            mode: KvCacheQuantMode::None,
            scale: 1.0,
            fp8_table: None,
        }
    }

    /// `scale` multiplies values before rounding; reads divide by it again.
    pub fn new(mode: KvCacheQuantMode, scale: f32, device: &Device) -> Result<Self> {
        ensure!(
            scale.is_finite() && scale > 0.0,
            "kv cache quant scale must be positive, got {scale}"
        );
        let fp8_table = match mode {
            KvCacheQuantMode::Fp8 => {
                let table: Vec<f32> = (0..=255u8).map(fp8_e4m3_decode).collect();
                Some(Tensor::from_vec(table, 256, device)?)
            }
            _ => None,
        };
        Ok(Self {
            mode,
            scale,
            fp8_table,
        })
    }

    pub fn mode(&self) -> KvCacheQuantMode {
        self.mode
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn storage_dtype(&self, dtype: DType) -> DType {
        if self.mode.is_quantized() {
            DType::U8
        } else {
            dtype
        }
    }

    pub fn quantize(&self, x: &Tensor) -> Result<Tensor> {
        match self.mode {
            KvCacheQuantMode::None => Ok(x.clone()),
            KvCacheQuantMode::Int8 => Ok(x
                .to_dtype(DType::F32)?
                .affine(self.scale as f64, 0.0)?
                .round()?
                .clamp(-128f32, 127f32)?
                .affine(1.0, 128.0)?
                .to_dtype(DType::U8)?),
            KvCacheQuantMode::Fp8 => {
                let values = x
                    .to_dtype(DType::F32)?
                    .flatten_all()?
                    .to_vec1::<f32>()?;
                let codes: Vec<u8> = values
                    .into_iter()
                    .map(|v| fp8_e4m3_encode(v * self.scale))
                    .collect();
                Ok(Tensor::from_vec(codes, x.dims(), x.device())?)
            }
        }
    }

    pub fn dequantize(&self, x: &Tensor, dtype: DType) -> Result<Tensor> {
        let inv = 1.0 / self.scale as f64;
        match self.mode {
            KvCacheQuantMode::None => Ok(x.to_dtype(dtype)?),
            KvCacheQuantMode::Int8 => Ok(x
                .to_dtype(DType::F32)?
                .affine(inv, -128.0 * inv)?
                .to_dtype(dtype)?),
            KvCacheQuantMode::Fp8 => {
                let table = match &self.fp8_table {
                    Some(table) => table,
                    None => anyhow::bail!("fp8 kv cache without decode table"),
                };
                let decoded = table
                    .index_select(&x.flatten_all()?, 0)?
                    .reshape(x.dims())?;
                Ok(decoded.affine(inv, 0.0)?.to_dtype(dtype)?)
            }
        }
    }
}

pub fn fp8_e4m3_decode(code: u8) -> f32 {
    let magnitude = code & 0x7f;
    if magnitude == FP8_E4M3_NAN {
        return f32::NAN;
    }
    let exponent = (magnitude >> 3) as i32;
    let mantissa = (magnitude & 0x7) as f32 / 8.0;
    let value = if exponent == 0 {
        mantissa * 2f32.powi(-6)
    } else {
        (1.0 + mantissa) * 2f32.powi(exponent - 7)
    };
    if code & 0x80 != 0 { -value } else { value }
}

/// Round-to-nearest e4m3 encoding, saturating at +-448.
pub fn fp8_e4m3_encode(value: f32) -> u8 {
    if value.is_nan() {
        return FP8_E4M3_NAN;
    }
    let sign = if value.is_sign_negative() { 0x80 } else { 0x00 };
    let magnitude = value.abs().min(FP8_E4M3_MAX);
    // Codes 0..=0x7e decode to strictly increasing magnitudes.
    let (mut lo, mut hi) = (0u8, FP8_E4M3_NAN);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if fp8_e4m3_decode(mid) < magnitude {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    let upper = lo as usize;
    let code = if upper == 0 {
        0
    } else if upper >= FP8_E4M3_NAN as usize {
        FP8_E4M3_NAN - 1
    } else {
        let hi = upper as u8;
        let lo = hi - 1;
        if magnitude - fp8_e4m3_decode(lo) <= fp8_e4m3_decode(hi) - magnitude {
            lo
        } else {
            hi
        }
    };
    sign | code
}
