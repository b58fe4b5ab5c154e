mod common;

use std::sync::Arc;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use gpt_runtime::models::{
    CONTEXT_LENGTHS, Communicator, HOST_REQUEST_TYPES, INPUT_IDS, LOGITS, PAST_KEY_VALUE_LENGTHS,
    ThreadComm, past_key_value,
};
use gpt_runtime::runtime::Stream;
use gpt_runtime::{
    Engine, GenerationInput, GenerationOutput, GptSession, RuntimeExecutor, SamplingConfig,
    SessionConfig,
};

use common::{gpt_config, gpt_engine, init_tracing, profile};

const SEED: u64 = 1234;
const PROMPT: [u32; 5] = [2, 9, 4, 11, 7];

/// Logits of one packed context step over `PROMPT`.
fn context_logits(engine: &Engine, comm: Option<Arc<dyn Communicator>>) -> Result<Vec<f32>> {
    let dev = Device::Cpu;
    let plan = match comm {
        Some(comm) => engine.build_plan_with(&dev, comm)?,
        None => engine.build_plan(&dev)?,
    };
    let kv_heads = engine.model().num_kv_heads / engine.model().tp_size;
    let mut exec = RuntimeExecutor::new(plan);
    let n = PROMPT.len();
    exec.set_binding(INPUT_IDS, &Tensor::new(&PROMPT, &dev)?.unsqueeze(0)?)?;
    exec.set_binding(CONTEXT_LENGTHS, &Tensor::new(&[n as u32], &dev)?)?;
    exec.set_binding(PAST_KEY_VALUE_LENGTHS, &Tensor::new(&[0u32], &dev)?)?;
    exec.set_binding(HOST_REQUEST_TYPES, &Tensor::new(&[0u32], &dev)?)?;
    for layer in 0..engine.model().num_layers {
        exec.set_binding(
            &past_key_value(layer),
            &Tensor::zeros((1, 2, kv_heads, 16, 4), DType::F32, &dev)?,
        )?;
    }
    exec.enqueue(&Stream::new(&dev))?;
    Ok(exec.output(LOGITS)?.flatten_all()?.to_vec1::<f32>()?)
}

#[test]
fn test_two_ranks_match_single_rank_logits() -> Result<()> {
    init_tracing();
    let single = gpt_engine(gpt_config(true, false, 1)?, profile(1, 1, 8, 16), SEED)?;
    let expected = context_logits(&single, None)?;

    let sharded = gpt_engine(gpt_config(true, false, 2)?, profile(1, 1, 8, 16), SEED)?;
    let comms = ThreadComm::group(2)?;
    let per_rank: Vec<Vec<f32>> = std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let engine = &sharded;
                scope.spawn(move || context_logits(engine, Some(comm)))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| anyhow::anyhow!("rank panicked"))?)
            .collect::<Result<Vec<_>>>()
    })?;

    assert_eq!(per_rank.len(), 2);
    assert_eq!(per_rank[0], per_rank[1]);
    assert_eq!(per_rank[0].len(), expected.len());
    for (got, want) in per_rank[0].iter().zip(&expected) {
        assert!((got - want).abs() < 1e-3, "{got} vs {want}");
    }
    Ok(())
}

fn generate(session: &mut GptSession) -> Result<Vec<u32>> {
    let input = GenerationInput::from_prompts(&[PROMPT.to_vec()], &Device::Cpu)?
        .with_end_id(23)
        .with_pad_id(0)
        .with_max_new_tokens(6);
    let mut output = GenerationOutput::new();
    session.generate(&mut output, &input, &SamplingConfig::default())?;
    output.tokens(0, 0)
}

#[test]
fn test_ranks_agree_on_generated_tokens() -> Result<()> {
    init_tracing();
    let sharded = gpt_engine(gpt_config(false, false, 2)?, profile(1, 1, 8, 16), SEED)?;
    let comms = ThreadComm::group(2)?;
    let per_rank: Vec<Vec<u32>> = std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let engine = sharded.clone();
                scope.spawn(move || {
                    let mut session = GptSession::with_communicator(engine, &Device::Cpu, comm)?;
                    session.setup(SessionConfig::new(1, 1, 16))?;
                    assert_eq!(session.model().num_kv_heads_local(), 1);
                    generate(&mut session)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| anyhow::anyhow!("rank panicked"))?)
            .collect::<Result<Vec<_>>>()
    })?;
    assert_eq!(per_rank[0], per_rank[1]);
    assert_eq!(per_rank[0].len(), PROMPT.len() + 6);
    assert_eq!(&per_rank[0][..PROMPT.len()], PROMPT.as_slice());
    Ok(())
}

#[test]
fn test_mismatched_group_size_is_rejected() -> Result<()> {
    let sharded = gpt_engine(gpt_config(true, false, 2)?, profile(1, 1, 8, 16), SEED)?;
    assert!(GptSession::new(sharded, &Device::Cpu).is_err());
    Ok(())
}
