use anyhow::{Result, ensure};
use sysinfo::System;
use tracing::info;

use crate::error::RuntimeError;
use crate::utils::config::ModelConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KVCachePlan {
    pub num_blocks: usize,
    pub per_block_bytes: usize,
    pub kvcache_memory_bytes: usize,
    pub max_kvcache_tokens: usize,
}

/// Sizes the paged KV block pool from a token budget or from free memory.
#[derive(Debug, Clone)]
pub struct KVCacheAllocator {
    num_layers: usize,
    kv_bytes_per_token_per_layer: usize,
    tokens_per_block: usize,
    max_seq_len: usize,
    free_memory_fraction: f32,
    max_tokens: Option<usize>,
}

impl KVCacheAllocator {
    pub fn new(
        model_config: &ModelConfig,
        max_seq_len: usize,
        free_memory_fraction: f32,
        max_tokens: Option<usize>,
    ) -> Result<Self> {
        ensure!(max_seq_len > 0, "max_seq_len must be positive");
        ensure!(
            free_memory_fraction > 0.0 && free_memory_fraction <= 1.0,
            RuntimeError::configuration("free memory fraction must be in (0, 1]")
        );
        Ok(Self {
            num_layers: model_config.num_layers,
            kv_bytes_per_token_per_layer: model_config.kv_bytes_per_token_per_layer(),
            tokens_per_block: model_config.tokens_per_block,
            max_seq_len,
            free_memory_fraction,
            max_tokens,
        })
    }

    pub fn query_available_memory_bytes() -> Result<u64> {
        let mut system = System::new();
        system.refresh_memory();
        let available = system.available_memory();
        ensure!(available > 0, "available memory must be positive");
        Ok(available)
    }

    pub fn per_block_bytes(&self) -> Result<usize> {
        let mut bytes = self.tokens_per_block;
        bytes = checked_mul(bytes, self.kv_bytes_per_token_per_layer)?;
        bytes = checked_mul(bytes, self.num_layers)?;
        Ok(bytes)
    }

    pub fn plan_with_available_memory(&self, available_bytes: u64) -> Result<KVCachePlan> {
        let per_block_bytes = self.per_block_bytes()?;
        ensure!(per_block_bytes > 0, "per-block bytes must be positive");

        let num_blocks = match self.max_tokens {
            Some(tokens) => {
                let blocks = tokens.div_ceil(self.tokens_per_block);
                let required = (blocks as u128) * (per_block_bytes as u128);
                let usable = (available_bytes as f64 * self.free_memory_fraction as f64) as u128;
                ensure!(
                    required <= usable,
                    RuntimeError::OutOfMemory(format!(
                        "kv cache of {tokens} tokens needs {required} bytes, {usable} usable"
                    ))
                );
                blocks
            }
            None => {
                let usable = (available_bytes as f64 * self.free_memory_fraction as f64) as u64;
                (usable / per_block_bytes as u64) as usize
            }
        };

        let max_kvcache_tokens = checked_mul(num_blocks, self.tokens_per_block)?;
        ensure!(
            max_kvcache_tokens >= self.max_seq_len,
            RuntimeError::OutOfMemory(format!(
                "kv cache capacity {max_kvcache_tokens} tokens is smaller than one sequence of {}",
                self.max_seq_len
            ))
        );
        let kvcache_memory_bytes = checked_mul(num_blocks, per_block_bytes)?;
        info!(
            num_blocks,
            per_block_bytes, max_kvcache_tokens, "planned paged kv cache"
        );
        Ok(KVCachePlan {
            num_blocks,
            per_block_bytes,
            kvcache_memory_bytes,
            max_kvcache_tokens,
        })
    }

    /// Uses the explicit token budget when given; otherwise sizes the pool from
    /// host memory reported by the OS.
    pub fn plan_auto(&self) -> Result<KVCachePlan> {
        let available_bytes = match self.max_tokens {
            Some(_) => u64::MAX,
            None => Self::query_available_memory_bytes()?,
        };
        self.plan_with_available_memory(available_bytes)
    }
}

fn checked_mul(lhs: usize, rhs: usize) -> Result<usize> {
    lhs.checked_mul(rhs)
        .ok_or_else(|| anyhow::anyhow!("kv cache size overflow"))
}
