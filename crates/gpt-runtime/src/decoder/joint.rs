use anyhow::{Result, ensure};
use candle_core::{DType, Tensor};
use tracing::debug;

use crate::decoder::{
    DecoderBatchState, DecoderRequest, DecodingInput, DecodingOutput, StatefulDecoder,
};
use crate::error::RuntimeError;
use crate::runtime::Stream;
use crate::utils::SamplingConfig;

/// Steps the whole batch together on the session stream. Bias and temperature
/// run as one tensor op over `[B, w, V]`; every row shares the sampling setup.
#[derive(Debug)]
pub struct JointDecoder {
    state: DecoderBatchState,
    vocab_size: usize,
    bias: Option<Tensor>,
    temperature: f32,
    step: usize,
}

impl JointDecoder {
    pub fn new(
        stream: Stream,
        max_batch_size: usize,
        max_beam_width: usize,
        max_seq_len: usize,
        vocab_size: usize,
    ) -> Result<Self> {
        Ok(Self {
            state: DecoderBatchState::new(
                stream,
                max_batch_size,
                max_beam_width,
                max_seq_len,
                vocab_size,
            )?,
            vocab_size,
            bias: None,
            temperature: 1.0,
            step: 0,
        })
    }

    fn scaled_logits(&self, logits: &Tensor) -> Result<Tensor> {
        let mut logits = logits
            .narrow(2, 0, self.vocab_size)?
            .to_dtype(DType::F32)?;
        if let Some(bias) = &self.bias {
            logits = logits.broadcast_add(bias)?;
        }
        if self.temperature != 1.0 {
            let temperature = Tensor::new(self.temperature, logits.device())?;
            logits = logits.broadcast_div(&temperature)?;
        }
        Ok(logits)
    }
}

fn batch_wide<T>(name: &str, values: Option<&[T]>) -> Result<()> {
    ensure!(
        values.is_none_or(|v| v.len() <= 1),
        RuntimeError::configuration(format!(
            "the joint decoder needs one {name} for the whole batch"
        ))
    );
    Ok(())
}

impl StatefulDecoder for JointDecoder {
    fn name(&self) -> &'static str {
        "joint"
    }

    fn new_batch(&mut self, requests: Vec<DecoderRequest>, sampling: &SamplingConfig) -> Result<()> {
        batch_wide("temperature", sampling.temperature.as_deref())?;
        batch_wide("min_length", sampling.min_length.as_deref())?;
        batch_wide("repetition_penalty", sampling.repetition_penalty.as_deref())?;
        batch_wide("presence_penalty", sampling.presence_penalty.as_deref())?;
        batch_wide("top_k", sampling.top_k.as_deref())?;
        batch_wide("top_p", sampling.top_p.as_deref())?;
        batch_wide("top_p_decay", sampling.top_p_decay.as_deref())?;
        batch_wide("top_p_min", sampling.top_p_min.as_deref())?;
        batch_wide("top_p_reset_ids", sampling.top_p_reset_ids.as_deref())?;
        batch_wide(
            "beam_search_diversity_rate",
            sampling.beam_search_diversity_rate.as_deref(),
        )?;
        batch_wide("length_penalty", sampling.length_penalty.as_deref())?;

        let bias = if requests.iter().any(|r| r.embedding_bias.is_some()) {
            let mut flat = Vec::with_capacity(requests.len() * self.vocab_size);
            for request in &requests {
                match &request.embedding_bias {
                    Some(bias) => flat.extend(bias.iter().copied().take(self.vocab_size)),
                    None => flat.extend(std::iter::repeat_n(0.0f32, self.vocab_size)),
                }
            }
            Some(flat)
        } else {
            None
        };
        self.state.reset(requests, sampling)?;
        self.bias = match bias {
            Some(flat) => {
                let batch = flat.len() / self.vocab_size;
                Some(Tensor::from_vec(flat, (batch, 1, self.vocab_size), self.state.device())?)
            }
            None => None,
        };
        self.temperature = sampling.for_sequence(0).temperature;
        self.step = 0;
        Ok(())
    }

    fn forward(&mut self, output: &mut DecodingOutput, input: &DecodingInput) -> Result<bool> {
        let src = self.state.host_indirection(input)?;
        let scaled = self.scaled_logits(&input.logits)?;
        let rows = self.state.host_logits(&scaled)?;
        let mut outcomes = Vec::with_capacity(rows.len());
        for (idx, logits) in rows.into_iter().enumerate() {
            let outcome = if self.state.is_active(input, idx) {
                self.state.sequences_mut()[idx].step(logits, true)?
            } else {
                None
            };
            outcomes.push(outcome);
        }
        self.state.stream().synchronize()?;
        self.step += 1;
        debug!(step = self.step, "joint decoder step");
        self.state.commit(outcomes, src, output)
    }

    fn finalize(&mut self) -> Result<()> {
        self.state.finalize()
    }

    fn ids(&self) -> &Tensor {
        self.state.ids()
    }

    fn new_tokens(&self) -> &Tensor {
        self.state.new_tokens()
    }

    fn finished(&self) -> &[bool] {
        self.state.finished()
    }

    fn sequence_lengths(&self) -> Vec<Vec<usize>> {
        self.state.sequence_lengths()
    }

    fn cum_log_probs(&self) -> Vec<Vec<f32>> {
        self.state.cum_log_probs()
    }
}
