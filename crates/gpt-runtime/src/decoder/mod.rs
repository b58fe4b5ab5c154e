pub mod batch;
pub mod beam;
pub mod joint;
pub mod penalties;
pub mod sampling;
pub mod sequence;
pub mod words;

use anyhow::{Result, ensure};
use candle_core::{DType, Device, Tensor};

use crate::error::RuntimeError;
use crate::runtime::Stream;
use crate::utils::SamplingConfig;

pub use batch::BatchedDecoder;
pub use beam::{BeamHypotheses, gather_tree, length_normalizer};
pub use joint::JointDecoder;
pub use sampling::{Sampler, SamplingStrategy};
pub use sequence::{DecoderRequest, SequenceDecoder, StepOutcome, beam_indirection};
pub use words::WordsList;

/// Step input shared by every decoder kind.
#[derive(Debug, Clone)]
pub struct DecodingInput {
    /// `[B, w, V']` logits of the last position of every beam.
    pub logits: Tensor,
    /// `[B, w, S_cap]` parent-beam table read by this step's attention.
    pub cache_indirection: Option<Tensor>,
    /// Sequences the caller wants advanced; `None` advances all of them.
    pub active: Option<Vec<bool>>,
}

impl DecodingInput {
    pub fn new(logits: Tensor) -> Self {
        Self {
            logits,
            cache_indirection: None,
            active: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecodingOutput {
    /// `[B, w, S_cap]` parent-beam table for the next step.
    pub cache_indirection: Option<Tensor>,
}

/// Contract shared by the joint and the per-request decoder.
pub trait StatefulDecoder: Send {
    fn name(&self) -> &'static str;

    /// Resets all sequences from `requests`, one per batch row.
    fn new_batch(&mut self, requests: Vec<DecoderRequest>, sampling: &SamplingConfig)
    -> Result<()>;

    /// Advances every live sequence by one token. Returns whether all of them
    /// have finished.
    fn forward(&mut self, output: &mut DecodingOutput, input: &DecodingInput) -> Result<bool>;

    /// Flattens beam forests into final ids.
    fn finalize(&mut self) -> Result<()>;

    /// `[B, w, S_cap]` ids so far, padded with each sequence's end id.
    fn ids(&self) -> &Tensor;

    /// `[B, w]` tokens produced by the last step.
    fn new_tokens(&self) -> &Tensor;

    fn finished(&self) -> &[bool];

    fn sequence_lengths(&self) -> Vec<Vec<usize>>;

    fn cum_log_probs(&self) -> Vec<Vec<f32>>;

    fn batch_size(&self) -> usize {
        self.finished().len()
    }

    fn all_finished(&self) -> bool {
        self.finished().iter().all(|done| *done)
    }
}

/// Per-sequence decoders plus the joint tensors every decoder kind exposes.
#[derive(Debug)]
pub(crate) struct DecoderBatchState {
    stream: Stream,
    max_batch_size: usize,
    max_beam_width: usize,
    max_seq_len: usize,
    vocab_size: usize,
    beam_width: usize,
    sequences: Vec<SequenceDecoder>,
    ids: Tensor,
    new_tokens: Tensor,
    finished: Vec<bool>,
}

impl DecoderBatchState {
    pub(crate) fn new(
        stream: Stream,
        max_batch_size: usize,
        max_beam_width: usize,
        max_seq_len: usize,
        vocab_size: usize,
    ) -> Result<Self> {
        let device = stream.device().clone();
        Ok(Self {
            ids: Tensor::zeros((0, 1, max_seq_len), DType::U32, &device)?,
            new_tokens: Tensor::zeros((0, 1), DType::U32, &device)?,
            stream,
            max_batch_size,
            max_beam_width,
            max_seq_len,
            vocab_size,
            beam_width: 1,
            sequences: Vec::new(),
            finished: Vec::new(),
        })
    }

    pub(crate) fn stream(&self) -> &Stream {
        &self.stream
    }

    pub(crate) fn device(&self) -> &Device {
        self.stream.device()
    }

    pub(crate) fn sequences(&self) -> &[SequenceDecoder] {
        &self.sequences
    }

    pub(crate) fn sequences_mut(&mut self) -> &mut [SequenceDecoder] {
        &mut self.sequences
    }

    pub(crate) fn reset(
        &mut self,
        requests: Vec<DecoderRequest>,
        sampling: &SamplingConfig,
    ) -> Result<()> {
        let batch_size = requests.len();
        ensure!(batch_size > 0, RuntimeError::configuration("empty decoder batch"));
        ensure!(
            batch_size <= self.max_batch_size,
            RuntimeError::ShapeUnsupported {
                name: "batch_size".to_string(),
                shape: vec![batch_size],
                reason: format!("decoder was set up for {}", self.max_batch_size),
            }
        );
        ensure!(
            sampling.beam_width <= self.max_beam_width,
            RuntimeError::ShapeUnsupported {
                name: "beam_width".to_string(),
                shape: vec![sampling.beam_width],
                reason: format!("decoder was set up for {}", self.max_beam_width),
            }
        );
        sampling.validate(batch_size)?;
        let mut sequences = Vec::with_capacity(batch_size);
        for (idx, request) in requests.into_iter().enumerate() {
            if let Some(bias) = &request.embedding_bias {
                ensure!(
                    bias.len() >= self.vocab_size,
                    RuntimeError::ShapeMismatch {
                        expected: vec![self.vocab_size],
                        actual: vec![bias.len()],
                    }
                );
            }
            sequences.push(SequenceDecoder::new(
                request,
                sampling.for_sequence(idx),
                self.max_seq_len,
            )?);
        }
        self.beam_width = sampling.beam_width;
        self.sequences = sequences;
        self.finished = self.sequences.iter().map(|s| s.is_finished()).collect();
        self.ids = self.joint_ids()?;
        self.new_tokens = Tensor::zeros((batch_size, self.beam_width), DType::U32, self.device())?;
        Ok(())
    }

    /// Replaces slot `slot` with a fresh sequence; `slot` may also append one.
    pub(crate) fn reset_slot(
        &mut self,
        slot: usize,
        request: DecoderRequest,
        config: crate::utils::SequenceSamplingConfig,
    ) -> Result<()> {
        ensure!(
            slot <= self.sequences.len() && slot < self.max_batch_size,
            RuntimeError::invariant(format!("slot {slot} outside a batch of {}", self.sequences.len()))
        );
        ensure!(
            config.beam_width == self.beam_width || self.sequences.is_empty(),
            RuntimeError::configuration("all slots of a batch share one beam width")
        );
        let sequence = SequenceDecoder::new(request, config, self.max_seq_len)?;
        self.beam_width = sequence.beam_width();
        if slot == self.sequences.len() {
            self.sequences.push(sequence);
            self.finished.push(false);
            self.ids = self.joint_ids()?;
            self.new_tokens = Tensor::zeros(
                (self.sequences.len(), self.beam_width),
                DType::U32,
                self.device(),
            )?;
        } else {
            self.finished[slot] = sequence.is_finished();
            self.sequences[slot] = sequence;
            self.write_ids(slot)?;
        }
        Ok(())
    }

    fn joint_ids(&self) -> Result<Tensor> {
        let width = self.max_seq_len;
        let flat: Vec<u32> = self
            .sequences
            .iter()
            .flat_map(|s| s.padded_ids(width))
            .collect();
        Ok(Tensor::from_vec(
            flat,
            (self.sequences.len(), self.beam_width, width),
            self.device(),
        )?)
    }

    /// Copies sequence `idx`'s histories into row `idx` of the joint ids.
    pub(crate) fn write_ids(&mut self, idx: usize) -> Result<()> {
        let row = Tensor::from_vec(
            self.sequences[idx].padded_ids(self.max_seq_len),
            (1, self.beam_width, self.max_seq_len),
            self.device(),
        )?;
        self.ids.slice_set(&row, 0, idx)?;
        Ok(())
    }

    /// `[B][w][V]` host logits with the padded vocabulary tail dropped.
    pub(crate) fn host_logits(&self, logits: &Tensor) -> Result<Vec<Vec<Vec<f32>>>> {
        let (batch, beams, vocab_padded) = logits.dims3()?;
        ensure!(
            batch == self.sequences.len() && beams == self.beam_width,
            RuntimeError::ShapeMismatch {
                expected: vec![self.sequences.len(), self.beam_width, vocab_padded],
                actual: vec![batch, beams, vocab_padded],
            }
        );
        ensure!(
            vocab_padded >= self.vocab_size,
            RuntimeError::ShapeMismatch {
                expected: vec![batch, beams, self.vocab_size],
                actual: vec![batch, beams, vocab_padded],
            }
        );
        let rows = logits
            .narrow(2, 0, self.vocab_size)?
            .to_dtype(DType::F32)?
            .to_vec3::<f32>()?;
        Ok(rows)
    }

    pub(crate) fn host_indirection(&self, input: &DecodingInput) -> Result<Option<Vec<Vec<Vec<u32>>>>> {
        if self.beam_width == 1 {
            return Ok(None);
        }
        let Some(src) = &input.cache_indirection else {
            return Err(RuntimeError::invariant("beam search needs a cache indirection input").into());
        };
        Ok(Some(src.to_vec3::<u32>()?))
    }

    pub(crate) fn is_active(&self, input: &DecodingInput, idx: usize) -> bool {
        !self.finished[idx]
            && input
                .active
                .as_ref()
                .is_none_or(|flags| flags.get(idx).copied().unwrap_or(false))
    }

    /// Folds per-sequence step results into the joint tensors and the next
    /// cache indirection.
    pub(crate) fn commit(
        &mut self,
        outcomes: Vec<Option<StepOutcome>>,
        src_indirection: Option<Vec<Vec<Vec<u32>>>>,
        output: &mut DecodingOutput,
    ) -> Result<bool> {
        let batch_size = self.sequences.len();
        let mut tokens = Vec::with_capacity(batch_size * self.beam_width);
        let mut tgt = Vec::new();
        for (idx, outcome) in outcomes.iter().enumerate() {
            let sequence = &self.sequences[idx];
            match outcome {
                Some(step) => tokens.extend_from_slice(&step.tokens),
                None => tokens.extend(std::iter::repeat_n(sequence.end_id(), self.beam_width)),
            }
            if let Some(src) = &src_indirection {
                let rows = match outcome {
                    Some(step) => beam_indirection(&src[idx], &step.parents, step.past_length),
                    None => src[idx].clone(),
                };
                tgt.extend(rows.into_iter().flatten());
            }
        }
        for (idx, outcome) in outcomes.iter().enumerate() {
            if outcome.is_some() {
                self.write_ids(idx)?;
            }
            self.finished[idx] = self.sequences[idx].is_finished();
        }
        self.new_tokens = Tensor::from_vec(tokens, (batch_size, self.beam_width), self.device())?;
        if src_indirection.is_some() {
            output.cache_indirection = Some(Tensor::from_vec(
                tgt,
                (batch_size, self.beam_width, self.max_seq_len),
                self.device(),
            )?);
        }
        Ok(self.finished.iter().all(|done| *done))
    }

    pub(crate) fn finalize(&mut self) -> Result<()> {
        for idx in 0..self.sequences.len() {
            self.sequences[idx].finalize()?;
            self.finished[idx] = true;
            self.write_ids(idx)?;
        }
        self.stream.synchronize()
    }

    pub(crate) fn ids(&self) -> &Tensor {
        &self.ids
    }

    pub(crate) fn new_tokens(&self) -> &Tensor {
        &self.new_tokens
    }

    pub(crate) fn finished(&self) -> &[bool] {
        &self.finished
    }

    pub(crate) fn sequence_lengths(&self) -> Vec<Vec<usize>> {
        self.sequences
            .iter()
            .map(|s| s.histories().iter().map(Vec::len).collect())
            .collect()
    }

    pub(crate) fn cum_log_probs(&self) -> Vec<Vec<f32>> {
        self.sequences.iter().map(|s| s.cum_log_probs().to_vec()).collect()
    }
}
