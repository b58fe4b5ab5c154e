mod common;

use std::sync::Arc;

use anyhow::Result;
use candle_core::{Device, Tensor};
use gpt_runtime::{
    ErrorCategory, GenerationInput, GenerationOutput, RuntimeError, SamplingConfig,
    SessionConfig, WordsList, error_category,
};
use parking_lot::Mutex;

use common::{
    IDENTITY_VOCAB, gpt_config, gpt_engine, identity_config, identity_engine, init_tracing,
    profile, session,
};

fn prompts_input(
    prompts: &[Vec<u32>],
    end_id: u32,
    max_new_tokens: usize,
) -> Result<GenerationInput> {
    Ok(GenerationInput::from_prompts(prompts, &Device::Cpu)?
        .with_end_id(end_id)
        .with_pad_id(0)
        .with_max_new_tokens(max_new_tokens))
}

fn sampled(top_k: usize, seed: u64) -> SamplingConfig {
    SamplingConfig {
        top_k: Some(vec![top_k]),
        random_seed: Some(vec![seed]),
        ..SamplingConfig::default()
    }
}

fn all_tokens(output: &GenerationOutput, batch: usize) -> Result<Vec<Vec<u32>>> {
    (0..batch).map(|seq| output.tokens(seq, 0)).collect()
}

#[test]
fn test_greedy_identity_repeats_last_token() -> Result<()> {
    init_tracing();
    let engine = identity_engine(identity_config(false, false, 64)?, profile(4, 2, 16, 32))?;
    let mut session = session(engine, SessionConfig::new(2, 1, 16))?;
    let steps = Arc::new(Mutex::new(Vec::new()));
    let seen = steps.clone();
    let mut output = GenerationOutput::new().on_token(move |ids, step, finished| {
        seen.lock().push((ids.dims().to_vec(), step, finished));
    });
    session.generate(
        &mut output,
        &prompts_input(&[vec![1, 2, 3, 4]], 0, 3)?,
        &SamplingConfig::default(),
    )?;

    assert_eq!(output.tokens(0, 0)?, vec![1, 2, 3, 4, 4, 4, 4]);
    assert_eq!(output.ids.as_ref().map(|t| t.dims().to_vec()), Some(vec![1, 1, 16]));
    assert_eq!(output.lengths, vec![vec![7]]);
    let steps = steps.lock();
    assert_eq!(
        steps.iter().map(|(_, step, done)| (*step, *done)).collect::<Vec<_>>(),
        vec![(0, false), (1, false), (2, true)]
    );
    assert!(steps.iter().all(|(dims, _, _)| dims == &[1, 1, 16]));
    Ok(())
}

#[test]
fn test_packed_batch_matches_isolated_runs() -> Result<()> {
    init_tracing();
    let prompts = vec![vec![1, 2, 3, 4, 5], vec![3, 1, 4, 1, 5, 9, 2, 6]];
    let packed_engine = identity_engine(identity_config(true, false, 64)?, profile(2, 1, 8, 24))?;
    let mut packed = session(packed_engine, SessionConfig::new(2, 1, 24))?;
    let flat: Vec<u32> = prompts.iter().flatten().copied().collect();
    let input = GenerationInput::packed(
        Tensor::new(flat.as_slice(), &Device::Cpu)?.unsqueeze(0)?,
        Tensor::new(&[5u32, 8], &Device::Cpu)?,
    )
    .with_end_id(0)
    .with_pad_id(0)
    .with_max_new_tokens(4);
    assert_eq!(input.ids.dims(), &[1, 13]);
    let mut packed_out = GenerationOutput::new();
    packed.generate(&mut packed_out, &input, &SamplingConfig::default())?;
    assert_eq!(
        packed_out.ids.as_ref().map(|t| t.dims().to_vec()),
        Some(vec![2, 1, 24])
    );

    let padded_engine = identity_engine(identity_config(false, false, 64)?, profile(2, 1, 8, 24))?;
    let mut padded = session(padded_engine, SessionConfig::new(2, 1, 24))?;
    let mut padded_out = GenerationOutput::new();
    padded.generate(&mut padded_out, &prompts_input(&prompts, 0, 4)?, &SamplingConfig::default())?;
    assert_eq!(all_tokens(&packed_out, 2)?, all_tokens(&padded_out, 2)?);

    for (seq, prompt) in prompts.iter().enumerate() {
        let mut alone = GenerationOutput::new();
        padded.generate(
            &mut alone,
            &prompts_input(std::slice::from_ref(prompt), 0, 4)?,
            &SamplingConfig::default(),
        )?;
        assert_eq!(alone.tokens(0, 0)?, packed_out.tokens(seq, 0)?);
    }
    Ok(())
}

#[test]
fn test_replicated_prompt_gives_identical_rows() -> Result<()> {
    init_tracing();
    let engine = gpt_engine(gpt_config(true, false, 1)?, profile(3, 1, 8, 16), 5)?;
    let mut session = session(engine, SessionConfig::new(3, 1, 16))?;
    let prompt = vec![3, 1, 4, 1];
    let mut output = GenerationOutput::new();
    session.generate(
        &mut output,
        &prompts_input(&[prompt.clone(), prompt.clone(), prompt], 23, 6)?,
        &sampled(3, 42),
    )?;
    let rows = all_tokens(&output, 3)?;
    assert_eq!(rows[0].len(), 10);
    assert_eq!(rows[0], rows[1]);
    assert_eq!(rows[1], rows[2]);
    Ok(())
}

#[test]
fn test_generate_is_idempotent() -> Result<()> {
    init_tracing();
    let engine = gpt_engine(gpt_config(false, false, 1)?, profile(2, 1, 8, 16), 11)?;
    let mut session = session(engine, SessionConfig::new(2, 1, 16))?;
    let input = prompts_input(&[vec![5, 6, 7], vec![8, 9]], 23, 5)?;
    let sampling = sampled(4, 9);
    let mut first = GenerationOutput::new();
    session.generate(&mut first, &input, &sampling)?;
    let mut second = GenerationOutput::new();
    session.generate(&mut second, &input, &sampling)?;
    assert_eq!(all_tokens(&first, 2)?, all_tokens(&second, 2)?);
    assert_eq!(first.cum_log_probs, second.cum_log_probs);
    Ok(())
}

#[test]
fn test_contiguous_and_paged_layouts_agree() -> Result<()> {
    init_tracing();
    let input = prompts_input(&[vec![2, 7, 1, 8, 2], vec![4, 4]], 23, 8)?;
    let mut outputs = Vec::new();
    for paged in [false, true] {
        let engine = gpt_engine(gpt_config(true, paged, 1)?, profile(2, 1, 8, 16), 3)?;
        let mut session = session(engine, SessionConfig::new(2, 1, 16))?;
        let mut output = GenerationOutput::new();
        session.generate(&mut output, &input, &SamplingConfig::default())?;
        if paged {
            let cache = session.kv_cache().ok_or_else(|| anyhow::anyhow!("no cache"))?;
            let manager = cache
                .block_manager()
                .ok_or_else(|| anyhow::anyhow!("no block manager"))?;
            assert_eq!(manager.num_free_blocks(), manager.num_blocks());
        }
        outputs.push(all_tokens(&output, 2)?);
    }
    assert_eq!(outputs[0], outputs[1]);
    Ok(())
}

#[test]
fn test_launch_graph_matches_eager() -> Result<()> {
    init_tracing();
    let input = prompts_input(&[vec![1, 2, 3], vec![9, 8, 7, 6]], 23, 6)?;
    let mut outputs = Vec::new();
    for graph in [false, true] {
        let engine = gpt_engine(gpt_config(false, true, 1)?, profile(2, 1, 8, 16), 17)?;
        let mut config = SessionConfig::new(2, 1, 16);
        config.cuda_graph_mode = graph;
        let mut session = session(engine, config)?;
        let mut output = GenerationOutput::new();
        session.generate(&mut output, &input, &SamplingConfig::default())?;
        let stats = session
            .launch_graph()
            .ok_or_else(|| anyhow::anyhow!("no launch graph"))?
            .stats();
        if graph {
            assert_eq!(stats.launches, 5);
            assert!(stats.captures >= 2);
        } else {
            assert_eq!(stats.launches, 0);
        }
        outputs.push(all_tokens(&output, 2)?);
    }
    assert_eq!(outputs[0], outputs[1]);
    Ok(())
}

#[test]
fn test_joint_and_per_request_decoders_agree() -> Result<()> {
    init_tracing();
    let input = prompts_input(&[vec![1, 5, 9], vec![2, 6]], 23, 5)?;
    let mut outputs = Vec::new();
    for per_request in [false, true] {
        let engine = gpt_engine(gpt_config(true, false, 1)?, profile(2, 1, 8, 16), 21)?;
        let mut config = SessionConfig::new(2, 1, 16);
        config.decoder_per_request = per_request;
        let mut session = session(engine, config)?;
        let mut output = GenerationOutput::new();
        session.generate(&mut output, &input, &sampled(5, 7))?;
        outputs.push(all_tokens(&output, 2)?);
    }
    assert_eq!(outputs[0], outputs[1]);
    Ok(())
}

#[test]
fn test_beam_search_ranks_and_gathers_live_tokens() -> Result<()> {
    init_tracing();
    let engine = gpt_engine(gpt_config(false, false, 1)?, profile(1, 2, 8, 16), 42)?;
    let mut session = session(engine, SessionConfig::new(1, 2, 16))?;
    let prompt = vec![3, 1, 4];
    let snapshots = Arc::new(Mutex::new(Vec::new()));
    let seen = snapshots.clone();
    let mut output = GenerationOutput::new().on_token(move |ids, _, _| {
        if let Ok(ids) = ids.to_vec3::<u32>() {
            seen.lock().push(ids);
        }
    });
    let mut sampling = SamplingConfig::new(2);
    sampling.random_seed = Some(vec![42]);
    session.generate(&mut output, &prompts_input(&[prompt.clone()], 23, 4)?, &sampling)?;

    let cum = &output.cum_log_probs[0];
    assert_eq!(cum.len(), 2);
    assert!(cum[0] >= cum[1]);
    let snapshots = snapshots.lock();
    assert_eq!(snapshots.len(), 4);
    for beam in 0..2 {
        let tokens = output.tokens(0, beam)?;
        assert_eq!(tokens.len(), prompt.len() + 4);
        assert_eq!(&tokens[..prompt.len()], prompt.as_slice());
        for (step, snapshot) in snapshots.iter().enumerate() {
            let pos = prompt.len() + step;
            let written: Vec<u32> = snapshot[0].iter().map(|row| row[pos]).collect();
            assert!(
                written.contains(&tokens[pos]),
                "beam {beam} step {step}: {} not in {written:?}",
                tokens[pos]
            );
        }
    }
    Ok(())
}

fn steering_bias() -> Result<Tensor> {
    let mut bias = vec![0f32; IDENTITY_VOCAB];
    bias[7] = 20.0;
    bias[8] = 15.0;
    Ok(Tensor::new(bias.as_slice(), &Device::Cpu)?)
}

#[test]
fn test_stop_word_finishes_sequence() -> Result<()> {
    init_tracing();
    let engine = identity_engine(identity_config(false, false, 64)?, profile(2, 1, 8, 16))?;
    let mut session = session(engine, SessionConfig::new(2, 1, 16))?;
    let stop = WordsList::from_words(&[vec![7u32, 8]])?;
    let bad = WordsList::from_words(&[vec![7u32, 7]])?;

    let steps = Arc::new(Mutex::new(Vec::new()));
    let seen = steps.clone();
    let mut output = GenerationOutput::new().on_token(move |_, step, finished| {
        seen.lock().push((step, finished));
    });
    let input = prompts_input(&[vec![1, 2]], 0, 5)?
        .with_embedding_bias(steering_bias()?)
        .with_bad_words(vec![bad.clone()])
        .with_stop_words(vec![stop.clone()]);
    session.generate(&mut output, &input, &SamplingConfig::default())?;
    assert_eq!(output.tokens(0, 0)?, vec![1, 2, 7, 8]);
    assert_eq!(*steps.lock(), vec![(0, false), (1, true)]);

    let mut output = GenerationOutput::new();
    let input = prompts_input(&[vec![1, 2], vec![3, 4]], 0, 5)?
        .with_embedding_bias(steering_bias()?)
        .with_bad_words(vec![bad])
        .with_stop_words(vec![stop, WordsList::default()]);
    session.generate(&mut output, &input, &SamplingConfig::default())?;
    assert_eq!(output.tokens(0, 0)?, vec![1, 2, 7, 8]);
    assert_eq!(output.tokens(1, 0)?, vec![3, 4, 7, 8, 8, 8, 8]);
    Ok(())
}

#[test]
fn test_logits_capture_shapes() -> Result<()> {
    init_tracing();
    let engine = identity_engine(identity_config(false, false, 64)?, profile(2, 1, 8, 16))?;
    let mut session = session(engine, SessionConfig::new(2, 1, 16))?;
    let mut output = GenerationOutput::new()
        .with_context_logits()
        .with_generation_logits();
    session.generate(
        &mut output,
        &prompts_input(&[vec![5, 6, 7], vec![9, 10]], 0, 2)?,
        &SamplingConfig::default(),
    )?;
    let context = output
        .context_logits
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("context logits missing"))?;
    assert_eq!(context.dims(), &[2, 3, IDENTITY_VOCAB]);
    assert_eq!(context.get(0)?.argmax(1)?.to_vec1::<u32>()?, vec![5, 6, 7]);
    let generation = output
        .generation_logits
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("generation logits missing"))?;
    assert_eq!(generation.dims(), &[2, 1, 2, IDENTITY_VOCAB]);
    Ok(())
}

#[test]
fn test_max_length_run_in_paged_cache() -> Result<()> {
    init_tracing();
    let engine = identity_engine(identity_config(false, true, 64)?, profile(1, 1, 128, 320))?;
    let mut config = SessionConfig::new(1, 1, 300);
    config.max_tokens_in_paged_kv_cache = Some(320);
    let mut session = session(engine, config)?;
    let prompt: Vec<u32> = (0..100).map(|i| 1 + (i % 5) as u32).collect();
    let mut output = GenerationOutput::new();
    session.generate(&mut output, &prompts_input(&[prompt], 0, 200)?, &SamplingConfig::default())?;

    let tokens = output.tokens(0, 0)?;
    assert_eq!(tokens.len(), 300);
    assert!(tokens[100..].iter().all(|&t| t == 5));
    let manager = session
        .kv_cache()
        .and_then(|cache| cache.block_manager())
        .ok_or_else(|| anyhow::anyhow!("no block manager"))?;
    assert_eq!(manager.num_blocks(), 5);
    assert_eq!(manager.num_free_blocks(), 5);
    Ok(())
}

#[test]
fn test_execution_error_poisons_until_setup() -> Result<()> {
    init_tracing();
    let engine = identity_engine(identity_config(false, false, 64)?, profile(2, 1, 8, 16))?;
    let mut session = session(engine, SessionConfig::new(2, 1, 16))?;
    let good = prompts_input(&[vec![1, 2]], 0, 2)?;

    let err = session
        .generate(
            &mut GenerationOutput::new(),
            &prompts_input(&[vec![1, 99]], 0, 2)?,
            &SamplingConfig::default(),
        )
        .unwrap_err();
    assert_eq!(error_category(&err), Some(ErrorCategory::Execution));
    assert!(session.is_poisoned());

    let err = session
        .generate(&mut GenerationOutput::new(), &good, &SamplingConfig::default())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RuntimeError>(),
        Some(RuntimeError::SessionPoisoned)
    ));

    session.setup(SessionConfig::new(2, 1, 16))?;
    let mut output = GenerationOutput::new();
    session.generate(&mut output, &good, &SamplingConfig::default())?;
    assert_eq!(output.tokens(0, 0)?, vec![1, 2, 2, 2]);
    Ok(())
}

#[test]
fn test_capacity_error_leaves_session_usable() -> Result<()> {
    init_tracing();
    let engine = identity_engine(identity_config(false, false, 64)?, profile(2, 1, 8, 16))?;
    let mut session = session(engine, SessionConfig::new(2, 1, 16))?;
    let err = session
        .generate(
            &mut GenerationOutput::new(),
            &prompts_input(&[vec![1], vec![2], vec![3]], 0, 2)?,
            &SamplingConfig::default(),
        )
        .unwrap_err();
    assert_eq!(error_category(&err), Some(ErrorCategory::Capacity));
    assert!(!session.is_poisoned());

    let mut output = GenerationOutput::new();
    session.generate(&mut output, &prompts_input(&[vec![3]], 0, 1)?, &SamplingConfig::default())?;
    assert_eq!(output.tokens(0, 0)?, vec![3, 3]);
    Ok(())
}

#[test]
fn test_generate_before_setup_is_configuration_error() -> Result<()> {
    let engine = identity_engine(identity_config(false, false, 64)?, profile(2, 1, 8, 16))?;
    let mut session = gpt_runtime::GptSession::new(engine, &Device::Cpu)?;
    let err = session
        .generate(
            &mut GenerationOutput::new(),
            &prompts_input(&[vec![1]], 0, 1)?,
            &SamplingConfig::default(),
        )
        .unwrap_err();
    assert_eq!(error_category(&err), Some(ErrorCategory::Configuration));
    Ok(())
}

#[test]
fn test_max_new_tokens_is_truncated_to_capacity() -> Result<()> {
    init_tracing();
    let engine = identity_engine(identity_config(false, false, 64)?, profile(1, 1, 16, 16))?;
    let mut session = session(engine, SessionConfig::new(1, 1, 16))?;
    let prompt: Vec<u32> = (1..=14).collect();
    let mut output = GenerationOutput::new();
    session.generate(&mut output, &prompts_input(&[prompt], 0, 10)?, &SamplingConfig::default())?;
    let tokens = output.tokens(0, 0)?;
    assert_eq!(tokens.len(), 16);
    assert_eq!(&tokens[14..], &[14, 14]);
    Ok(())
}

#[test]
fn test_unset_end_id_and_budget_use_defaults() -> Result<()> {
    init_tracing();
    let engine = identity_engine(identity_config(false, false, 64)?, profile(1, 1, 8, 16))?;
    let mut session = session(engine, SessionConfig::new(1, 1, 16))?;
    let last = (IDENTITY_VOCAB - 1) as u32;

    let mut output = GenerationOutput::new();
    let input = GenerationInput::from_prompts(&[vec![1, last]], &Device::Cpu)?;
    session.generate(&mut output, &input, &SamplingConfig::default())?;
    assert_eq!(output.tokens(0, 0)?, vec![1, last, last]);
    let row = output
        .ids
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("ids missing"))?
        .get(0)?
        .get(0)?
        .to_vec1::<u32>()?;
    assert_eq!(row.len(), 16);
    assert!(row[2..].iter().all(|&t| t == last));

    let mut output = GenerationOutput::new();
    let input = GenerationInput::from_prompts(&[vec![1, 2]], &Device::Cpu)?;
    session.generate(&mut output, &input, &SamplingConfig::default())?;
    let tokens = output.tokens(0, 0)?;
    assert_eq!(tokens.len(), 16);
    assert!(tokens[2..].iter().all(|&t| t == 2));
    Ok(())
}

#[test]
fn test_paged_and_contiguous_beam_search_agree() -> Result<()> {
    init_tracing();
    let input = prompts_input(&[vec![2, 7, 1, 8, 2, 8], vec![3, 1, 4]], 23, 12)?;
    let mut runs = Vec::new();
    for paged in [false, true] {
        let engine = gpt_engine(gpt_config(false, paged, 1)?, profile(2, 3, 8, 24), 29)?;
        let mut session = session(engine, SessionConfig::new(2, 3, 24))?;
        let mut output = GenerationOutput::new();
        session.generate(&mut output, &input, &SamplingConfig::new(3))?;
        if paged {
            let manager = session
                .kv_cache()
                .and_then(|cache| cache.block_manager())
                .ok_or_else(|| anyhow::anyhow!("no block manager"))?;
            assert_eq!(manager.num_free_blocks(), manager.num_blocks());
        }
        let mut tokens = Vec::new();
        for seq in 0..2 {
            for beam in 0..3 {
                tokens.push(output.tokens(seq, beam)?);
            }
        }
        runs.push((tokens, output.cum_log_probs.clone()));
    }
    let (contiguous, paged) = (&runs[0], &runs[1]);
    assert_eq!(contiguous.0, paged.0);
    for (a, b) in contiguous.1.iter().flatten().zip(paged.1.iter().flatten()) {
        assert!((a - b).abs() < 1e-4, "{a} vs {b}");
    }
    assert_eq!(contiguous.1.len(), 2);
    assert!(contiguous.1.iter().all(|beams| beams.len() == 3));
    Ok(())
}
