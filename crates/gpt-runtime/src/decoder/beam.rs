use std::cmp::Ordering;

use anyhow::{Result, ensure};

use crate::error::RuntimeError;

/// `((5 + len) / 6) ^ alpha`.
pub fn length_normalizer(len: usize, length_penalty: f32) -> f32 {
    ((5.0 + len as f32) / 6.0).powf(length_penalty)
}

/// Where a hypothesis ends in the step history: the live beam it extends at
/// `step`, plus an optional final token that never became a live beam.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HypothesisTail {
    pub step: Option<usize>,
    pub beam: usize,
    pub final_token: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    pub score: f32,
    pub cum_log_prob: f32,
    pub len: usize,
    pub tail: HypothesisTail,
}

/// The `w` best finished hypotheses of one sequence.
#[derive(Debug, Clone)]
pub struct BeamHypotheses {
    beam_width: usize,
    length_penalty: f32,
    hyps: Vec<Hypothesis>,
}

impl BeamHypotheses {
    pub fn new(beam_width: usize, length_penalty: f32) -> Self {
        Self {
            beam_width,
            length_penalty,
            hyps: Vec::with_capacity(beam_width + 1),
        }
    }

    pub fn len(&self) -> usize {
        self.hyps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hyps.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.hyps.len() >= self.beam_width
    }

    fn worst_score(&self) -> f32 {
        self.hyps
            .iter()
            .map(|h| h.score)
            .fold(f32::INFINITY, f32::min)
    }

    /// Adds a hypothesis of `len` generated tokens, evicting the worst one when
    /// more than `w` are held.
    pub fn add(&mut self, cum_log_prob: f32, len: usize, tail: HypothesisTail) {
        let score = cum_log_prob / length_normalizer(len, self.length_penalty);
        if self.is_full() && score <= self.worst_score() {
            return;
        }
        self.hyps.push(Hypothesis {
            score,
            cum_log_prob,
            len,
            tail,
        });
        if self.hyps.len() > self.beam_width {
            self.sort();
            self.hyps.truncate(self.beam_width);
        }
    }

    /// No live beam of `len` tokens scoring `best_cum_log_prob` can still beat
    /// the held hypotheses.
    pub fn is_done(&self, best_cum_log_prob: f32, len: usize) -> bool {
        self.is_full()
            && best_cum_log_prob / length_normalizer(len, self.length_penalty)
                <= self.worst_score()
    }

    fn sort(&mut self) {
        self.hyps
            .sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    }

    /// Hypotheses, best first.
    pub fn into_sorted(mut self) -> Vec<Hypothesis> {
        self.sort();
        self.hyps
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeamCandidate {
    pub parent: usize,
    pub token: u32,
    pub cum_log_prob: f32,
    pub rank_score: f32,
}

/// Top `2w` continuations over all beams. Each beam contributes its own best
/// `2w` tokens; the i-th of them is ranked with a `diversity_rate * i` penalty.
pub fn top_candidates(
    log_probs: &[Vec<f32>],
    cum_log_probs: &[f32],
    diversity_rate: f32,
) -> Result<Vec<BeamCandidate>> {
    let beam_width = log_probs.len();
    ensure!(
        cum_log_probs.len() == beam_width,
        RuntimeError::invariant("one cumulative log prob per beam")
    );
    let want = 2 * beam_width;
    let mut candidates = Vec::with_capacity(beam_width * want);
    for (parent, (row, &cum)) in log_probs.iter().zip(cum_log_probs).enumerate() {
        ensure!(
            row.len() >= want,
            RuntimeError::configuration(format!(
                "beam width {beam_width} needs a vocabulary of at least {want}"
            ))
        );
        let mut order: Vec<usize> = (0..row.len()).collect();
        order.sort_by(|&a, &b| row[b].total_cmp(&row[a]).then(a.cmp(&b)));
        for (rank, &token) in order.iter().take(want).enumerate() {
            let cum_log_prob = cum + row[token];
            candidates.push(BeamCandidate {
                parent,
                token: token as u32,
                cum_log_prob,
                rank_score: cum_log_prob - diversity_rate * rank as f32,
            });
        }
    }
    candidates.sort_by(|a, b| {
        b.rank_score
            .total_cmp(&a.rank_score)
            .then(a.parent.cmp(&b.parent))
            .then(a.token.cmp(&b.token))
    });
    candidates.truncate(want);
    Ok(candidates)
}

/// Rebuilds the tokens of one beam by walking parent ids back from `last_step`:
/// `out[i] = ids[i][beam_i]` where `beam_i = parents[i + 1][beam_{i+1}]`.
pub fn gather_tree(
    step_ids: &[Vec<u32>],
    step_parents: &[Vec<usize>],
    last_step: usize,
    beam: usize,
) -> Result<Vec<u32>> {
    ensure!(
        last_step < step_ids.len() && step_ids.len() == step_parents.len(),
        RuntimeError::invariant(format!(
            "gather tree from step {last_step} over {} steps",
            step_ids.len()
        ))
    );
    let mut out = vec![0u32; last_step + 1];
    let mut current = beam;
    for step in (0..=last_step).rev() {
        let token = step_ids[step].get(current).copied().ok_or_else(|| {
            RuntimeError::invariant(format!("beam {current} missing at step {step}"))
        })?;
        out[step] = token;
        current = step_parents[step][current];
    }
    Ok(out)
}
