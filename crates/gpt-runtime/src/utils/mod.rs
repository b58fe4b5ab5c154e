pub mod config;
pub mod graph;
pub mod kvcache_allocator;

pub use config::{
    ContextFmhaType, DataType, KvCacheQuantMode, MaskType, ModelConfig, OptimizationProfile,
    PositionEmbeddingType, SamplingConfig, SequenceSamplingConfig, SessionConfig,
};
pub use graph::{GraphKey, GraphStats, LaunchGraph};
pub use kvcache_allocator::{KVCacheAllocator, KVCachePlan};
