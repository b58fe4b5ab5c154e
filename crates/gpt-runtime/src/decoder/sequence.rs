use anyhow::{Result, ensure};

use crate::decoder::beam::{BeamHypotheses, HypothesisTail, gather_tree, top_candidates};
use crate::decoder::penalties::{
    PenaltyConfig, apply_embedding_bias, apply_min_length, apply_penalties, apply_temperature,
    log_softmax,
};
use crate::decoder::sampling::Sampler;
use crate::decoder::words::WordsList;
use crate::error::RuntimeError;
use crate::utils::SequenceSamplingConfig;

/// Everything a decoder needs to start one sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderRequest {
    pub prompt: Vec<u32>,
    pub max_new_tokens: usize,
    pub end_id: u32,
    pub pad_id: u32,
    pub embedding_bias: Option<Vec<f32>>,
    pub bad_words: WordsList,
    pub stop_words: WordsList,
}

impl DecoderRequest {
    pub fn new(prompt: Vec<u32>, max_new_tokens: usize, end_id: u32) -> Self {
        Self {
            prompt,
            max_new_tokens,
            end_id,
            pad_id: end_id,
            embedding_bias: None,
            bad_words: WordsList::default(),
            stop_words: WordsList::default(),
        }
    }
}

/// Result of one decoding step of a live sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// One token per beam.
    pub tokens: Vec<u32>,
    /// Beam each new beam continues; the identity for `w = 1`.
    pub parents: Vec<usize>,
    /// Cached positions before this step.
    pub past_length: usize,
}

#[derive(Debug, Clone)]
struct BeamState {
    hyps: BeamHypotheses,
    step_ids: Vec<Vec<u32>>,
    step_parents: Vec<Vec<usize>>,
}

/// Sampling or beam-search state machine of one sequence.
#[derive(Debug, Clone)]
pub struct SequenceDecoder {
    config: SequenceSamplingConfig,
    request: DecoderRequest,
    sequence_limit: usize,
    penalties: Option<PenaltyConfig>,
    sampler: Sampler,
    histories: Vec<Vec<u32>>,
    cum_log_probs: Vec<f32>,
    current_length: usize,
    finished: bool,
    beams: Option<BeamState>,
}

impl SequenceDecoder {
    pub fn new(
        request: DecoderRequest,
        config: SequenceSamplingConfig,
        max_seq_len: usize,
    ) -> Result<Self> {
        let input_length = request.prompt.len();
        ensure!(input_length > 0, RuntimeError::configuration("prompt must not be empty"));
        let beam_width = config.beam_width;
        ensure!(beam_width > 0, RuntimeError::configuration("beam_width must be positive"));
        let sequence_limit = input_length + request.max_new_tokens;
        ensure!(
            sequence_limit <= max_seq_len,
            RuntimeError::invariant(format!(
                "input length {input_length} plus {} new tokens exceeds {max_seq_len}",
                request.max_new_tokens
            ))
        );
        let mut cum_log_probs = vec![f32::NEG_INFINITY; beam_width];
        cum_log_probs[0] = 0.0;
        let beams = (beam_width > 1).then(|| BeamState {
            hyps: BeamHypotheses::new(beam_width, config.length_penalty),
            step_ids: Vec::new(),
            step_parents: Vec::new(),
        });
        Ok(Self {
            penalties: PenaltyConfig::from_sampling_config(&config),
            sampler: Sampler::new(&config),
            histories: vec![request.prompt.clone(); beam_width],
            cum_log_probs,
            current_length: input_length,
            finished: request.max_new_tokens == 0,
            sequence_limit,
            beams,
            config,
            request,
        })
    }

    pub fn beam_width(&self) -> usize {
        self.config.beam_width
    }

    pub fn input_length(&self) -> usize {
        self.request.prompt.len()
    }

    pub fn current_length(&self) -> usize {
        self.current_length
    }

    pub fn sequence_limit(&self) -> usize {
        self.sequence_limit
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn end_id(&self) -> u32 {
        self.request.end_id
    }

    pub fn config(&self) -> &SequenceSamplingConfig {
        &self.config
    }

    pub fn cum_log_probs(&self) -> &[f32] {
        &self.cum_log_probs
    }

    /// Token history of every beam, prompt included.
    pub fn histories(&self) -> &[Vec<u32>] {
        &self.histories
    }

    /// Beams that reached a final state.
    pub fn finished_beams(&self) -> usize {
        match &self.beams {
            _ if self.finished => self.beam_width(),
            Some(state) => state.hyps.len(),
            None => 0,
        }
    }

    /// Runs the logit pipeline on one beam's row in place. `scaled` skips the
    /// bias and temperature stages when the caller already applied them.
    pub fn process_logits(&self, beam: usize, logits: &mut [f32], scaled: bool) {
        if !scaled {
            if let Some(bias) = &self.request.embedding_bias {
                apply_embedding_bias(logits, bias);
            }
            apply_temperature(logits, self.config.temperature);
        }
        let history = &self.histories[beam];
        if let Some(cfg) = self.penalties {
            apply_penalties(logits, history, cfg);
        }
        self.request.bad_words.ban(logits, history);
        apply_min_length(
            logits,
            self.current_length - self.input_length(),
            self.config.min_length,
            self.request.end_id,
        );
    }

    /// Advances by one token per beam from `[w][V]` logits. Returns `None`
    /// once the sequence has finished.
    pub fn step(&mut self, mut logits: Vec<Vec<f32>>, scaled: bool) -> Result<Option<StepOutcome>> {
        if self.finished {
            return Ok(None);
        }
        ensure!(
            logits.len() == self.beam_width(),
            RuntimeError::ShapeMismatch {
                expected: vec![self.beam_width()],
                actual: vec![logits.len()],
            }
        );
        for (beam, row) in logits.iter_mut().enumerate() {
            self.process_logits(beam, row, scaled);
        }
        let past_length = self.current_length;
        let outcome = if self.beams.is_some() {
            self.beam_step(logits)?
        } else {
            self.sampling_step(&logits[0])?
        };
        Ok(Some(StepOutcome {
            past_length,
            ..outcome
        }))
    }

    fn sampling_step(&mut self, logits: &[f32]) -> Result<StepOutcome> {
        let (token, log_prob) = self.sampler.sample(logits)?;
        let history = &mut self.histories[0];
        history.push(token);
        self.cum_log_probs[0] += log_prob;
        self.current_length += 1;
        self.finished = token == self.request.end_id
            || self.request.stop_words.completed_by(history)
            || self.current_length >= self.sequence_limit;
        Ok(StepOutcome {
            tokens: vec![token],
            parents: vec![0],
            past_length: 0,
        })
    }

    fn beam_step(&mut self, logits: Vec<Vec<f32>>) -> Result<StepOutcome> {
        let beam_width = self.beam_width();
        let log_probs: Vec<Vec<f32>> = logits.iter().map(|row| log_softmax(row)).collect();
        let candidates = top_candidates(
            &log_probs,
            &self.cum_log_probs,
            self.config.beam_search_diversity_rate,
        )?;
        let generated = self.current_length - self.input_length() + 1;
        let Some(state) = self.beams.as_mut() else {
            return Err(RuntimeError::invariant("beam step without beam state").into());
        };
        let previous_step = state.step_ids.len().checked_sub(1);

        let mut live = Vec::with_capacity(beam_width);
        for (rank, cand) in candidates.iter().enumerate() {
            let history = &self.histories[cand.parent];
            let ends = cand.token == self.request.end_id
                || self
                    .request
                    .stop_words
                    .words()
                    .any(|word| word.last() == Some(&cand.token) && {
                        let prefix = &word[..word.len() - 1];
                        history.ends_with(prefix)
                    });
            if ends {
                if rank < beam_width {
                    state.hyps.add(
                        cand.cum_log_prob,
                        generated,
                        HypothesisTail {
                            step: previous_step,
                            beam: cand.parent,
                            final_token: Some(cand.token),
                        },
                    );
                }
            } else {
                live.push(*cand);
                if live.len() == beam_width {
                    break;
                }
            }
        }
        ensure!(
            !live.is_empty(),
            RuntimeError::invariant("beam search left no live beam")
        );
        while live.len() < beam_width {
            let mut filler = live[0];
            filler.cum_log_prob = f32::NEG_INFINITY;
            live.push(filler);
        }
        live.sort_by(|a, b| b.cum_log_prob.total_cmp(&a.cum_log_prob));

        let tokens: Vec<u32> = live.iter().map(|c| c.token).collect();
        let parents: Vec<usize> = live.iter().map(|c| c.parent).collect();
        self.histories = live
            .iter()
            .map(|c| {
                let mut history = self.histories[c.parent].clone();
                history.push(c.token);
                history
            })
            .collect();
        self.cum_log_probs = live.iter().map(|c| c.cum_log_prob).collect();
        state.step_ids.push(tokens.clone());
        state.step_parents.push(parents.clone());
        self.current_length += 1;

        self.finished = state.hyps.is_done(self.cum_log_probs[0], generated)
            || self.current_length >= self.sequence_limit;
        Ok(StepOutcome {
            tokens,
            parents,
            past_length: 0,
        })
    }

    /// Replaces the live beams with the best finished hypotheses, walking the
    /// parent tree. A no-op for `w = 1`.
    pub fn finalize(&mut self) -> Result<()> {
        let Some(state) = self.beams.take() else {
            return Ok(());
        };
        let BeamState {
            mut hyps,
            step_ids,
            step_parents,
        } = state;
        let last_step = step_ids.len().checked_sub(1);
        let generated = self.current_length - self.input_length();
        for (beam, &cum) in self.cum_log_probs.iter().enumerate() {
            if cum.is_finite() {
                hyps.add(
                    cum,
                    generated,
                    HypothesisTail {
                        step: last_step,
                        beam,
                        final_token: None,
                    },
                );
            }
        }
        let mut histories = Vec::with_capacity(self.beam_width());
        let mut cum_log_probs = Vec::with_capacity(self.beam_width());
        for hyp in hyps.into_sorted().into_iter().take(self.beam_width()) {
            let mut history = self.request.prompt.clone();
            if let Some(step) = hyp.tail.step {
                history.extend(gather_tree(&step_ids, &step_parents, step, hyp.tail.beam)?);
            }
            history.extend(hyp.tail.final_token);
            histories.push(history);
            cum_log_probs.push(hyp.cum_log_prob);
        }
        while histories.len() < self.beam_width() {
            histories.push(self.request.prompt.clone());
            cum_log_probs.push(f32::NEG_INFINITY);
        }
        self.histories = histories;
        self.cum_log_probs = cum_log_probs;
        self.finished = true;
        Ok(())
    }

    /// Beam histories padded with `end_id` to `width` tokens, `[w * width]`.
    pub fn padded_ids(&self, width: usize) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.beam_width() * width);
        for history in &self.histories {
            let kept = history.len().min(width);
            out.extend_from_slice(&history[..kept]);
            out.extend(std::iter::repeat_n(self.request.end_id, width - kept));
        }
        out
    }
}

/// New cache indirection of one sequence after a beam step: each beam reads
/// its parent's history, and the last cached position from the parent row.
pub fn beam_indirection(src: &[Vec<u32>], parents: &[usize], past_length: usize) -> Vec<Vec<u32>> {
    parents
        .iter()
        .map(|&parent| {
            let mut row = src[parent].clone();
            if let Some(last) = past_length.checked_sub(1)
                && let Some(slot) = row.get_mut(last)
            {
                *slot = parent as u32;
            }
            row
        })
        .collect()
}
