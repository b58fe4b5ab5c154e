mod common;

use anyhow::Result;
use candle_core::Device;
use gpt_runtime::models::gpt::random_weights;
use gpt_runtime::utils::KvCacheQuantMode;
use gpt_runtime::{
    EngineBuilder, GenerationInput, GenerationOutput, PlanKind, SamplingConfig, SessionConfig,
};

use common::{gpt_config, init_tracing, load, profile, session};

const SEED: u64 = 7;
const NEW_TOKENS: usize = 10;
const PROMPTS: [&[u32]; 8] = [
    &[3, 1, 4, 1, 5],
    &[9, 2, 6],
    &[5, 3, 5, 8, 9, 7, 9],
    &[2, 7],
    &[1, 8, 2, 8, 1, 8],
    &[4, 5, 9, 0],
    &[6, 6, 6],
    &[11, 13, 17, 19, 12, 10],
];

/// Greedy continuations of `PROMPTS`. The attention projection is damped so
/// cache rounding perturbs, but cannot dominate, the residual stream.
fn continuations(mode: KvCacheQuantMode, scale: f32) -> Result<Vec<Vec<u32>>> {
    let mut model = gpt_config(false, false, 1)?;
    model.kv_cache_quant_mode = mode;
    model.kv_cache_quant_scale = scale;
    let mut weights = random_weights(&model, SEED)?;
    for layer in 0..model.num_layers {
        let name = format!("transformer.layers.{layer}.attention.dense.weight");
        if let Some(weight) = weights.get_mut(&name) {
            let damped = weight.affine(0.2, 0.0)?;
            *weight = damped;
        }
    }
    let engine = load(
        &EngineBuilder::new(model, PlanKind::Gpt)
            .with_profile(profile(PROMPTS.len(), 1, 8, 24))
            .weights(weights),
    )?;
    let mut session = session(engine, SessionConfig::new(PROMPTS.len(), 1, 24))?;
    let prompts: Vec<Vec<u32>> = PROMPTS.iter().map(|p| p.to_vec()).collect();
    let input = GenerationInput::from_prompts(&prompts, &Device::Cpu)?
        .with_end_id(23)
        .with_max_new_tokens(NEW_TOKENS);
    let mut output = GenerationOutput::new();
    session.generate(&mut output, &input, &SamplingConfig::default())?;
    prompts
        .iter()
        .enumerate()
        .map(|(seq, prompt)| Ok(output.tokens(seq, 0)?[prompt.len()..].to_vec()))
        .collect()
}

/// Share of steps with the same token, counted up to each sequence's first
/// mismatch since later steps see different histories.
fn top1_agreement(reference: &[Vec<u32>], other: &[Vec<u32>]) -> f64 {
    let (mut agreed, mut compared) = (0usize, 0usize);
    for (a, b) in reference.iter().zip(other) {
        for (x, y) in a.iter().zip(b) {
            compared += 1;
            if x != y {
                break;
            }
            agreed += 1;
        }
    }
    agreed as f64 / compared.max(1) as f64
}

#[test]
fn test_int8_cache_keeps_top1_tokens() -> Result<()> {
    init_tracing();
    let reference = continuations(KvCacheQuantMode::None, 1.0)?;
    assert!(reference.iter().all(|tokens| !tokens.is_empty()));
    let int8 = continuations(KvCacheQuantMode::Int8, 32.0)?;
    let agreement = top1_agreement(&reference, &int8);
    assert!(agreement >= 0.95, "int8 top-1 agreement {agreement}");
    Ok(())
}

#[test]
fn test_fp8_cache_keeps_top1_tokens() -> Result<()> {
    init_tracing();
    let reference = continuations(KvCacheQuantMode::None, 1.0)?;
    let fp8 = continuations(KvCacheQuantMode::Fp8, 1.0)?;
    let agreement = top1_agreement(&reference, &fp8);
    assert!(agreement >= 0.95, "fp8 top-1 agreement {agreement}");
    Ok(())
}
