pub mod attention;
pub mod core;
pub mod decoder;
pub mod error;
pub mod gemm;
pub mod kv_cache;
pub mod models;
pub mod runtime;
pub mod utils;

pub use crate::core::{GenerationInput, GenerationOutput, GptSession};
pub use decoder::{BatchedDecoder, JointDecoder, StatefulDecoder, WordsList};
pub use error::{ErrorCategory, RuntimeError, error_category};
pub use runtime::{Engine, EngineBuilder, PlanKind, RuntimeExecutor};
pub use utils::{ModelConfig, OptimizationProfile, SamplingConfig, SessionConfig};
