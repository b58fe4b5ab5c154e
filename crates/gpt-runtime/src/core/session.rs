use std::sync::Arc;

use anyhow::{Result, ensure};
use candle_core::{DType, Device, Tensor};
use tracing::{debug, info, warn};

use crate::core::io::{GenerationInput, GenerationOutput};
use crate::core::slot::{SequenceSlots, SlotState};
use crate::decoder::{
    BatchedDecoder, DecoderRequest, DecodingInput, DecodingOutput, JointDecoder, StatefulDecoder,
};
use crate::error::{ErrorCategory, RuntimeError, error_category};
use crate::kv_cache::{KvCache, KvCacheConfig, KvCacheLayout};
use crate::models::layers::{REQUEST_TYPE_CONTEXT, REQUEST_TYPE_GENERATION};
use crate::models::{
    CACHE_INDIRECTION, CONTEXT_LENGTHS, CONTEXT_LOGITS, Communicator, HOST_REQUEST_TYPES,
    INPUT_IDS, KV_CACHE_BLOCK_POINTERS, KV_CACHE_QUANT_SCALE, LOGITS, LocalComm,
    PAST_KEY_VALUE_LENGTHS, past_key_value,
};
use crate::runtime::{BufferManager, Engine, RuntimeExecutor, Stream};
use crate::utils::{
    GraphKey, KVCacheAllocator, LaunchGraph, ModelConfig, SamplingConfig, SessionConfig,
};

/// Host-side inputs of one forward step.
#[derive(Debug)]
struct PreparedStep {
    input_ids: Tensor,
    context_lengths: Tensor,
    past_lengths: Tensor,
    request_types: Tensor,
}

/// Everything `setup` materializes.
struct SessionState {
    config: SessionConfig,
    num_blocks: usize,
    kv_cache: KvCache,
    decoder: Box<dyn StatefulDecoder>,
    graph: LaunchGraph,
    slots: SequenceSlots,
}

/// Drives one engine through context and generation steps.
pub struct GptSession {
    engine: Engine,
    model: ModelConfig,
    device: Device,
    stream: Stream,
    buffers: BufferManager,
    executor: RuntimeExecutor,
    state: Option<SessionState>,
    poisoned: bool,
}

impl std::fmt::Debug for GptSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GptSession")
            .field("plan", &self.executor.plan().name())
            .field("device", &self.device)
            .field("config", &self.state.as_ref().map(|s| &s.config))
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl GptSession {
    pub fn new(engine: Engine, device: &Device) -> Result<Self> {
        Self::with_communicator(engine, device, Arc::new(LocalComm))
    }

    /// Session for one rank of a tensor-parallel group.
    pub fn with_communicator(
        engine: Engine,
        device: &Device,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        let model = engine.rank_config(comm.rank(), comm.world_size())?;
        let plan = engine.build_plan_with(device, comm)?;
        let stream = Stream::new(device);
        Ok(Self {
            engine,
            model,
            device: device.clone(),
            buffers: BufferManager::new(stream.clone()),
            stream,
            executor: RuntimeExecutor::new(plan),
            state: None,
            poisoned: false,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn model(&self) -> &ModelConfig {
        &self.model
    }

    pub fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    pub fn executor(&self) -> &RuntimeExecutor {
        &self.executor
    }

    pub fn config(&self) -> Option<&SessionConfig> {
        self.state.as_ref().map(|s| &s.config)
    }

    pub fn kv_cache(&self) -> Option<&KvCache> {
        self.state.as_ref().map(|s| &s.kv_cache)
    }

    pub fn launch_graph(&self) -> Option<&LaunchGraph> {
        self.state.as_ref().map(|s| &s.graph)
    }

    pub fn decoder(&self) -> Option<&dyn StatefulDecoder> {
        self.state.as_ref().map(|s| s.decoder.as_ref())
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Allocates the KV cache and decoder for `config` and clears poisoning.
    pub fn setup(&mut self, config: SessionConfig) -> Result<()> {
        config.validate(self.engine.profile())?;
        let model = &self.model;
        let num_blocks = if model.paged_kv_cache {
            let allocator = KVCacheAllocator::new(
                model,
                config.max_seq_length,
                config.kv_cache_free_memory_fraction,
                config.max_tokens_in_paged_kv_cache,
            )?;
            let plan = allocator.plan_auto()?;
            match config.max_tokens_in_paged_kv_cache {
                Some(_) => plan.num_blocks,
                None => {
                    let worst_case = config.max_batch_size
                        * config.max_beam_width
                        * config.max_seq_length.div_ceil(model.tokens_per_block);
                    plan.num_blocks.min(worst_case)
                }
            }
        } else {
            0
        };
        let kv_cache = self.build_cache(&config, config.max_beam_width, num_blocks)?;

        let decoder: Box<dyn StatefulDecoder> = if config.decoder_per_request {
            Box::new(BatchedDecoder::new(
                self.stream.clone(),
                config.max_batch_size,
                config.max_beam_width,
                config.max_seq_length,
                model.vocab_size,
            )?)
        } else {
            Box::new(JointDecoder::new(
                self.stream.clone(),
                config.max_batch_size,
                config.max_beam_width,
                config.max_seq_length,
                model.vocab_size,
            )?)
        };
        let graph = LaunchGraph::new(&self.device);
        if config.cuda_graph_mode && !graph.captures_on_device() {
            warn!("cuda graph mode requested without device capture, steps replay eagerly");
        }
        info!(
            plan = self.executor.plan().name(),
            batch = config.max_batch_size,
            beams = config.max_beam_width,
            seq = config.max_seq_length,
            layout = ?kv_cache.layout(),
            num_blocks,
            decoder = decoder.name(),
            graph = config.cuda_graph_mode,
            device_capture = graph.captures_on_device(),
            "session set up"
        );
        self.state = Some(SessionState {
            slots: SequenceSlots::new(config.max_batch_size),
            config,
            num_blocks,
            kv_cache,
            decoder,
            graph,
        });
        self.poisoned = false;
        Ok(())
    }

    fn build_cache(&self, config: &SessionConfig, beam_width: usize, num_blocks: usize) -> Result<KvCache> {
        let cache_config = KvCacheConfig::from_model(
            &self.model,
            config.max_batch_size,
            beam_width,
            config.max_seq_length,
            num_blocks,
        );
        KvCache::new(cache_config, &self.buffers)
    }

    /// Runs the context step and the generation loop for `input`.
    ///
    /// An execution failure poisons the session until the next `setup`; every
    /// other failure leaves it usable.
    pub fn generate(
        &mut self,
        output: &mut GenerationOutput,
        input: &GenerationInput,
        sampling: &SamplingConfig,
    ) -> Result<()> {
        if self.poisoned {
            return Err(RuntimeError::SessionPoisoned.into());
        }
        let result = self.run_generation(output, input, sampling);
        if let Err(err) = &result {
            if error_category(err) == Some(ErrorCategory::Execution) {
                warn!(error = %err, "generation failed, session poisoned");
                self.poisoned = true;
            }
            if let Some(state) = self.state.as_mut() {
                state.slots.reset();
                state.kv_cache.release_all();
                state.graph.clear();
            }
        }
        result
    }

    fn run_generation(
        &mut self,
        output: &mut GenerationOutput,
        input: &GenerationInput,
        sampling: &SamplingConfig,
    ) -> Result<()> {
        ensure!(
            input.ids.device().same_device(&self.device),
            RuntimeError::configuration("input ids live on a different device than the session")
        );
        let beam_width = sampling.beam_width;
        let (max_batch_size, max_beam_width, max_seq_length, rebuild) = {
            let state = self
                .state
                .as_ref()
                .ok_or_else(|| RuntimeError::configuration("setup must run before generate"))?;
            (
                state.config.max_batch_size,
                state.config.max_beam_width,
                state.config.max_seq_length,
                state.kv_cache.config().beam_width != beam_width,
            )
        };
        let mut requests = input.decoder_requests(self.model().vocab_size, max_seq_length)?;
        for request in &mut requests {
            let room = max_seq_length.saturating_sub(request.prompt.len());
            ensure!(
                room > 0,
                RuntimeError::ShapeUnsupported {
                    name: "input_length".to_string(),
                    shape: vec![request.prompt.len()],
                    reason: format!("no room for new tokens within {max_seq_length} positions"),
                }
            );
            if request.max_new_tokens > room {
                warn!(
                    requested = request.max_new_tokens,
                    allowed = room,
                    "truncating max_new_tokens to the session capacity"
                );
                request.max_new_tokens = room;
            }
        }
        let max_new_tokens = requests.iter().map(|r| r.max_new_tokens).max().unwrap_or(1);
        let batch_size = requests.len();
        ensure!(
            batch_size <= max_batch_size,
            RuntimeError::ShapeUnsupported {
                name: "batch_size".to_string(),
                shape: vec![batch_size],
                reason: format!("session was set up for {max_batch_size}"),
            }
        );
        ensure!(
            beam_width > 0 && beam_width <= max_beam_width,
            RuntimeError::ShapeUnsupported {
                name: "beam_width".to_string(),
                shape: vec![beam_width],
                reason: format!("session was set up for {max_beam_width}"),
            }
        );
        if rebuild {
            let state = self
                .state
                .as_ref()
                .ok_or_else(|| RuntimeError::configuration("setup must run before generate"))?;
            let cache = self.build_cache(&state.config, beam_width, state.num_blocks)?;
            if let Some(state) = self.state.as_mut() {
                state.kv_cache = cache;
                state.graph.clear();
            }
        }

        let Self {
            model,
            device,
            stream,
            buffers,
            executor,
            state,
            ..
        } = self;
        let state = state
            .as_mut()
            .ok_or_else(|| RuntimeError::configuration("setup must run before generate"))?;
        let s_cap = state.config.max_seq_length;
        let graph_mode = state.config.cuda_graph_mode;
        let vocab = model.vocab_size_padded;
        let rows = batch_size * beam_width;
        let input_lengths: Vec<usize> = requests.iter().map(|r| r.prompt.len()).collect();

        state.decoder.new_batch(requests.clone(), sampling)?;
        state.slots.advance_all(batch_size, SlotState::Prompted)?;

        let mut indirection = (beam_width > 1)
            .then(|| buffers.gpu((batch_size, beam_width, s_cap), DType::U32))
            .transpose()?;

        for (seq, &len) in input_lengths.iter().enumerate() {
            state.kv_cache.reserve(seq * beam_width, len)?;
        }
        let context = prepare_context(&requests, model.is_packed(), device)?;
        bind_step(executor, &context, &state.kv_cache, indirection.as_ref(), rows, device)?;
        executor.clear_binding(LOGITS);
        let context_logits_buf = if output.wants_context_logits() {
            let tokens = context.input_ids.elem_count();
            let buf = buffers.gpu((tokens, vocab), DType::F32)?;
            executor.set_binding(CONTEXT_LOGITS, &buf)?;
            Some(buf)
        } else {
            executor.clear_binding(CONTEXT_LOGITS);
            None
        };
        executor.enqueue(stream)?;
        if context_logits_buf.is_some() {
            let produced = executor.output(CONTEXT_LOGITS)?.copy()?;
            output.context_logits = Some(if model.is_packed() {
                produced
            } else {
                let (b, s) = context.input_ids.dims2()?;
                produced.reshape((b, s, vocab))?
            });
            executor.clear_binding(CONTEXT_LOGITS);
        }
        for (seq, &len) in input_lengths.iter().enumerate() {
            state.kv_cache.tile_beams(seq, len)?;
        }
        state.slots.advance_all(batch_size, SlotState::Prefilled)?;
        let mut logits = executor
            .output(LOGITS)?
            .unsqueeze(1)?
            .broadcast_as((batch_size, beam_width, vocab))?
            .contiguous()?;
        debug!(batch = batch_size, beams = beam_width, "context step done");

        let mut generation_logits = Vec::new();
        let mut step = 0usize;
        loop {
            if output.wants_generation_logits() {
                generation_logits.push(logits.copy()?);
            }
            let mut decoding_input = DecodingInput::new(logits);
            decoding_input.cache_indirection = indirection.clone();
            let mut decoding_output = DecodingOutput::default();
            let all_finished = state.decoder.forward(&mut decoding_output, &decoding_input)?;
            if let Some(next) = decoding_output.cache_indirection {
                indirection = Some(next);
            }
            for (seq, &done) in state.decoder.finished().iter().enumerate() {
                match state.slots.state(seq) {
                    Some(SlotState::Prefilled) if done => {
                        state.slots.advance(seq, SlotState::Finished)?
                    }
                    Some(SlotState::Prefilled) => state.slots.advance(seq, SlotState::Generating)?,
                    Some(SlotState::Generating) if done => {
                        state.slots.advance(seq, SlotState::Finished)?
                    }
                    _ => {}
                }
            }
            stream.synchronize()?;
            output.notify(state.decoder.ids(), step, all_finished);
            step += 1;
            if all_finished || step >= max_new_tokens {
                break;
            }

            let lengths = state.decoder.sequence_lengths();
            let past: Vec<usize> = lengths
                .iter()
                .flat_map(|beams| {
                    let current = beams.first().copied().unwrap_or(1);
                    std::iter::repeat_n(current.saturating_sub(1), beam_width)
                })
                .collect();
            if state.kv_cache.layout() == KvCacheLayout::Paged {
                for (row, &p) in past.iter().enumerate() {
                    state.kv_cache.reserve(row, p + 1)?;
                }
            }
            let prepared = prepare_generation(
                state.decoder.new_tokens(),
                &input_lengths,
                &past,
                beam_width,
                model.is_packed(),
                device,
            )?;
            bind_step(executor, &prepared, &state.kv_cache, indirection.as_ref(), rows, device)?;
            executor.clear_binding(LOGITS);
            if graph_mode {
                let active = state.decoder.finished().iter().map(|done| !done).collect();
                let key = GraphKey::new(
                    active,
                    executor,
                    state.kv_cache.block_pointer_snapshot(rows),
                );
                let slot = state.graph.prepare(key)?;
                state.graph.launch(slot, executor, stream)?;
            } else {
                executor.enqueue(stream)?;
            }
            logits = executor
                .output(LOGITS)?
                .reshape((batch_size, beam_width, vocab))?;
            debug!(step, rows, "generation step done");
        }

        state.decoder.finalize()?;
        for seq in 0..batch_size {
            if state.slots.state(seq) != Some(SlotState::Finished) {
                state.slots.advance(seq, SlotState::Finished)?;
            }
            state.slots.advance(seq, SlotState::Finalized)?;
        }
        output.ids = Some(state.decoder.ids().copy()?);
        output.lengths = state.decoder.sequence_lengths();
        output.cum_log_probs = state.decoder.cum_log_probs();
        output.generation_logits = if generation_logits.is_empty() {
            None
        } else {
            Some(Tensor::stack(&generation_logits, 2)?)
        };
        let mut released = 0;
        for seq in 0..batch_size {
            released += state.kv_cache.release_sequence(seq);
            state.slots.advance(seq, SlotState::Idle)?;
        }
        debug!(steps = step, released, "generation finished");
        Ok(())
    }
}

fn prepare_context(requests: &[DecoderRequest], packed: bool, device: &Device) -> Result<PreparedStep> {
    let batch = requests.len();
    let lengths: Vec<u32> = requests.iter().map(|r| r.prompt.len() as u32).collect();
    let input_ids = if packed {
        let flat: Vec<u32> = requests.iter().flat_map(|r| r.prompt.iter().copied()).collect();
        let total = flat.len();
        Tensor::from_vec(flat, (1, total), device)?
    } else {
        let width = lengths.iter().copied().max().unwrap_or(0) as usize;
        let mut flat = Vec::with_capacity(batch * width);
        for request in requests {
            flat.extend_from_slice(&request.prompt);
            flat.extend(std::iter::repeat_n(request.pad_id, width - request.prompt.len()));
        }
        Tensor::from_vec(flat, (batch, width), device)?
    };
    Ok(PreparedStep {
        input_ids,
        context_lengths: Tensor::new(lengths.as_slice(), device)?,
        past_lengths: Tensor::zeros(batch, DType::U32, device)?,
        request_types: Tensor::from_vec(vec![REQUEST_TYPE_CONTEXT; batch], batch, device)?,
    })
}

fn prepare_generation(
    new_tokens: &Tensor,
    input_lengths: &[usize],
    past: &[usize],
    beam_width: usize,
    packed: bool,
    device: &Device,
) -> Result<PreparedStep> {
    let rows = past.len();
    let tokens = new_tokens.flatten_all()?.to_dtype(DType::U32)?;
    ensure!(
        tokens.elem_count() == rows,
        RuntimeError::ShapeMismatch {
            expected: vec![rows],
            actual: tokens.dims().to_vec(),
        }
    );
    let input_ids = if packed {
        tokens.reshape((1, rows))?
    } else {
        tokens.reshape((rows, 1))?
    };
    let context_lengths: Vec<u32> = input_lengths
        .iter()
        .flat_map(|&len| std::iter::repeat_n(len as u32, beam_width))
        .collect();
    let past: Vec<u32> = past.iter().map(|&p| p as u32).collect();
    Ok(PreparedStep {
        input_ids: input_ids.to_device(device)?,
        context_lengths: Tensor::new(context_lengths.as_slice(), device)?,
        past_lengths: Tensor::new(past.as_slice(), device)?,
        request_types: Tensor::from_vec(vec![REQUEST_TYPE_GENERATION; rows], rows, device)?,
    })
}

fn bind_step(
    executor: &mut RuntimeExecutor,
    step: &PreparedStep,
    cache: &KvCache,
    indirection: Option<&Tensor>,
    rows: usize,
    device: &Device,
) -> Result<()> {
    executor.set_binding(INPUT_IDS, &step.input_ids)?;
    executor.set_binding(CONTEXT_LENGTHS, &step.context_lengths)?;
    executor.set_binding(PAST_KEY_VALUE_LENGTHS, &step.past_lengths)?;
    executor.set_binding(HOST_REQUEST_TYPES, &step.request_types)?;
    match indirection {
        Some(table) => executor.set_binding(CACHE_INDIRECTION, table)?,
        None => executor.clear_binding(CACHE_INDIRECTION),
    }
    if cache.quant().mode().is_quantized() {
        executor.set_binding(
            KV_CACHE_QUANT_SCALE,
            &Tensor::new(&[cache.quant().scale()], device)?,
        )?;
    }
    if let Some(tables) = cache.block_table_tensor(rows, device)? {
        executor.set_binding(KV_CACHE_BLOCK_POINTERS, &tables)?;
    }
    for (layer, storage) in cache.layers().iter().enumerate() {
        executor.set_binding(&past_key_value(layer), storage)?;
    }
    Ok(())
}
