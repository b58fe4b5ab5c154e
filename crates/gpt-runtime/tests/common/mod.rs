#![allow(dead_code)]

use anyhow::Result;
use candle_core::Device;
use gpt_runtime::models::gpt::random_weights;
use gpt_runtime::{
    Engine, EngineBuilder, GptSession, ModelConfig, OptimizationProfile, PlanKind, SessionConfig,
};
use tracing_subscriber::EnvFilter;

pub const IDENTITY_VOCAB: usize = 16;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn profile(
    max_batch_size: usize,
    max_beam_width: usize,
    max_input_len: usize,
    max_seq_len: usize,
) -> OptimizationProfile {
    OptimizationProfile {
        max_batch_size,
        max_beam_width,
        max_input_len,
        max_seq_len,
    }
}

pub fn identity_config(packed: bool, paged: bool, tokens_per_block: usize) -> Result<ModelConfig> {
    ModelConfig::from_json_str(&format!(
        r#"{{"num_layers": 1, "num_heads": 1, "num_kv_heads": 1, "head_size": 4,
            "vocab_size": {IDENTITY_VOCAB}, "vocab_size_padded": {IDENTITY_VOCAB},
            "data_type": "float", "remove_input_padding": {packed},
            "paged_kv_cache": {paged}, "tokens_per_block": {tokens_per_block}}}"#
    ))
}

pub fn gpt_config(packed: bool, paged: bool, tp_size: usize) -> Result<ModelConfig> {
    ModelConfig::from_json_str(&format!(
        r#"{{"num_layers": 2, "num_heads": 4, "num_kv_heads": 2, "head_size": 4,
            "vocab_size": 20, "vocab_size_padded": 24, "data_type": "float",
            "position_embedding_type": "rope_neox", "rotary_embedding_dim": 4,
            "max_position_embeddings": 64, "remove_input_padding": {packed},
            "paged_kv_cache": {paged}, "tokens_per_block": 4, "tp_size": {tp_size}}}"#
    ))
}

/// Writes the artifact to a temporary file and loads it back.
pub fn load(builder: &EngineBuilder) -> Result<Engine> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("model.engine");
    builder.write(&path)?;
    Engine::from_path(&path)
}

pub fn identity_engine(model: ModelConfig, profile: OptimizationProfile) -> Result<Engine> {
    load(&EngineBuilder::new(model, PlanKind::Identity).with_profile(profile))
}

pub fn gpt_engine(model: ModelConfig, profile: OptimizationProfile, seed: u64) -> Result<Engine> {
    let weights = random_weights(&model, seed)?;
    load(
        &EngineBuilder::new(model, PlanKind::Gpt)
            .with_profile(profile)
            .weights(weights),
    )
}

pub fn session(engine: Engine, config: SessionConfig) -> Result<GptSession> {
    let mut session = GptSession::new(engine, &Device::Cpu)?;
    session.setup(config)?;
    Ok(session)
}
