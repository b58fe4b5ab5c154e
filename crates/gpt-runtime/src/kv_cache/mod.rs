pub mod block_manager;
pub mod cache;
pub mod quant;

pub use block_manager::{BlockCopy, BlockManager, UNALLOCATED_BLOCK};
pub use cache::{KvCache, KvCacheConfig, KvCacheLayout, KvCacheView};
pub use quant::KvQuant;
