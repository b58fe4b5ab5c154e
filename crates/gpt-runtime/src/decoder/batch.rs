use anyhow::Result;
use candle_core::Tensor;
use rayon::prelude::*;
use tracing::debug;

use crate::decoder::{
    DecoderBatchState, DecoderRequest, DecodingInput, DecodingOutput, StatefulDecoder,
};
use crate::runtime::Stream;
use crate::utils::{SamplingConfig, SequenceSamplingConfig};

/// Per-request decoder: every sequence runs its own state machine on its own
/// stream, ordered after the session stream by a start event.
#[derive(Debug)]
pub struct BatchedDecoder {
    state: DecoderBatchState,
    streams: Vec<Stream>,
    step: usize,
}

impl BatchedDecoder {
    pub fn new(
        stream: Stream,
        max_batch_size: usize,
        max_beam_width: usize,
        max_seq_len: usize,
        vocab_size: usize,
    ) -> Result<Self> {
        let streams = (0..max_batch_size)
            .map(|_| Stream::new(stream.device()))
            .collect();
        Ok(Self {
            state: DecoderBatchState::new(
                stream,
                max_batch_size,
                max_beam_width,
                max_seq_len,
                vocab_size,
            )?,
            streams,
            step: 0,
        })
    }

    /// (Re)initializes one slot without touching the others.
    pub fn new_request(
        &mut self,
        slot: usize,
        request: DecoderRequest,
        config: SequenceSamplingConfig,
    ) -> Result<()> {
        self.state.reset_slot(slot, request, config)
    }

    pub fn sequence(&self, idx: usize) -> Option<&crate::decoder::SequenceDecoder> {
        self.state.sequences().get(idx)
    }
}

impl StatefulDecoder for BatchedDecoder {
    fn name(&self) -> &'static str {
        "batched"
    }

    fn new_batch(&mut self, requests: Vec<DecoderRequest>, sampling: &SamplingConfig) -> Result<()> {
        self.step = 0;
        self.state.reset(requests, sampling)
    }

    fn forward(&mut self, output: &mut DecodingOutput, input: &DecodingInput) -> Result<bool> {
        let rows = self.state.host_logits(&input.logits)?;
        let src = self.state.host_indirection(input)?;
        let active: Vec<bool> = (0..rows.len())
            .map(|idx| self.state.is_active(input, idx))
            .collect();

        let start = self.state.stream().record();
        let streams = &self.streams[..rows.len()];
        let stepped: Vec<(Option<_>, _)> = self
            .state
            .sequences_mut()
            .par_iter_mut()
            .zip(rows.into_par_iter())
            .zip(streams.par_iter())
            .zip(active.par_iter())
            .map(|(((sequence, logits), stream), &active)| {
                stream.wait(&start)?;
                let outcome = if active {
                    sequence.step(logits, false)?
                } else {
                    None
                };
                Ok((outcome, stream.record()))
            })
            .collect::<Result<_>>()?;

        let mut outcomes = Vec::with_capacity(stepped.len());
        for (outcome, done) in stepped {
            self.state.stream().wait(&done)?;
            outcomes.push(outcome);
        }
        self.state.stream().synchronize()?;
        self.step += 1;
        let live = outcomes.iter().filter(|o| o.is_some()).count();
        debug!(step = self.step, live, "batched decoder step");
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

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    fn logits_for(tokens: &[&[usize]], vocab: usize) -> Result<Tensor> {
        let beams = tokens[0].len();
        let mut flat = vec![0.0f32; tokens.len() * beams * vocab];
        for (b, row) in tokens.iter().enumerate() {
            for (j, &t) in row.iter().enumerate() {
                flat[(b * beams + j) * vocab + t] = 10.0;
            }
        }
        Ok(Tensor::from_vec(flat, (tokens.len(), beams, vocab), &Device::Cpu)?)
    }

    #[test]
    fn test_sequences_finish_independently() -> Result<()> {
        let stream = Stream::new(&Device::Cpu);
        let mut decoder = BatchedDecoder::new(stream, 2, 1, 8, 6)?;
        let requests = vec![
            DecoderRequest::new(vec![1, 2], 1, 0),
            DecoderRequest::new(vec![3], 4, 0),
        ];
        decoder.new_batch(requests, &SamplingConfig::new(1))?;
        assert_eq!(decoder.ids().dims(), &[2, 1, 8]);

        let mut out = DecodingOutput::default();
        let done = decoder.forward(&mut out, &DecodingInput::new(logits_for(&[&[4], &[5]], 6)?))?;
        assert!(!done);
        assert_eq!(decoder.finished(), &[true, false]);
        assert_eq!(decoder.new_tokens().to_vec2::<u32>()?, vec![vec![4], vec![5]]);

        decoder.forward(&mut out, &DecodingInput::new(logits_for(&[&[3], &[3]], 6)?))?;
        let ids = decoder.ids().to_vec3::<u32>()?;
        assert_eq!(ids[0][0], vec![1, 2, 4, 0, 0, 0, 0, 0]);
        assert_eq!(ids[1][0], vec![3, 5, 3, 0, 0, 0, 0, 0]);
        assert_eq!(decoder.sequence_lengths(), vec![vec![3], vec![3]]);
        Ok(())
    }

    #[test]
    fn test_padded_vocab_tail_is_ignored() -> Result<()> {
        let stream = Stream::new(&Device::Cpu);
        let mut decoder = BatchedDecoder::new(stream, 1, 1, 8, 4)?;
        decoder.new_batch(vec![DecoderRequest::new(vec![1], 2, 0)], &SamplingConfig::new(1))?;
        let mut logits = vec![0.0f32; 6];
        logits[2] = 1.0;
        logits[5] = 9.0;
        let logits = Tensor::from_vec(logits, (1, 1, 6), &Device::Cpu)?;
        decoder.forward(&mut DecodingOutput::default(), &DecodingInput::new(logits))?;
        assert_eq!(decoder.new_tokens().to_vec2::<u32>()?, vec![vec![2]]);
        Ok(())
    }

    #[test]
    fn test_beam_step_writes_indirection() -> Result<()> {
        let stream = Stream::new(&Device::Cpu);
        let mut decoder = BatchedDecoder::new(stream, 1, 2, 6, 5)?;
        decoder.new_batch(vec![DecoderRequest::new(vec![1, 1], 3, 0)], &SamplingConfig::new(2))?;
        let row = vec![-5.0f32, 2.0, 1.5, 0.0, -1.0];
        let logits = Tensor::from_vec([row.clone(), row].concat(), (1, 2, 5), &Device::Cpu)?;
        let src = Tensor::zeros((1, 2, 6), DType::U32, &Device::Cpu)?;
        let mut input = DecodingInput::new(logits);
        input.cache_indirection = Some(src);
        let mut out = DecodingOutput::default();
        decoder.forward(&mut out, &input)?;
        let tgt = out
            .cache_indirection
            .ok_or_else(|| anyhow::anyhow!("missing indirection"))?;
        assert_eq!(tgt.dims(), &[1, 2, 6]);
        assert!(tgt.to_vec3::<u32>()?[0].iter().all(|row| row.iter().all(|&p| p == 0)));
        let cum = &decoder.cum_log_probs()[0];
        assert!(cum[0] >= cum[1]);
        Ok(())
    }

    #[test]
    fn test_new_request_replaces_one_slot() -> Result<()> {
        let stream = Stream::new(&Device::Cpu);
        let mut decoder = BatchedDecoder::new(stream, 2, 1, 8, 6)?;
        decoder.new_batch(
            vec![DecoderRequest::new(vec![1], 1, 0), DecoderRequest::new(vec![2], 1, 0)],
            &SamplingConfig::new(1),
        )?;
        decoder.new_request(1, DecoderRequest::new(vec![4, 4], 2, 0), SequenceSamplingConfig::default())?;
        let ids = decoder.ids().to_vec3::<u32>()?;
        assert_eq!(ids[1][0][..3], [4, 4, 0]);
        assert_eq!(ids[0][0][..2], [1, 0]);
        assert!(decoder.new_request(5, DecoderRequest::new(vec![1], 1, 0), SequenceSamplingConfig::default()).is_err());
        Ok(())
    }
}
