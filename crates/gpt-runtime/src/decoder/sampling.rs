use anyhow::{Result, anyhow, ensure};
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand::{SeedableRng, rngs::StdRng};

use crate::decoder::penalties::log_softmax;
use crate::utils::SequenceSamplingConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingStrategy {
    ArgMax,
    TopK { k: usize },
    TopP { p: f32 },
    TopKThenTopP { k: usize, p: f32 },
}

impl SamplingStrategy {
    /// Greedy when both `top_k` and `top_p` are zero.
    pub fn new(top_k: usize, top_p: f32) -> Self {
        match (top_k, top_p > 0.0) {
            (0, false) => Self::ArgMax,
            (k, false) => Self::TopK { k },
            (0, true) => Self::TopP { p: top_p },
            (k, true) => Self::TopKThenTopP { k, p: top_p },
        }
    }
}

/// Runtime top-p: decays after every step, returns to its initial value when
/// the reset token is sampled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopPSchedule {
    initial: f32,
    current: f32,
    decay: f32,
    min: f32,
    reset_id: Option<u32>,
}

impl TopPSchedule {
    pub fn new(config: &SequenceSamplingConfig) -> Self {
        Self {
            initial: config.top_p,
            current: config.top_p,
            decay: config.top_p_decay,
            min: config.top_p_min,
            reset_id: config.top_p_reset_id,
        }
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    pub fn advance(&mut self, token: u32) {
        if self.initial <= 0.0 {
            return;
        }
        self.current = if self.reset_id == Some(token) {
            self.initial
        } else {
            (self.current * self.decay).max(self.min)
        };
    }
}

/// Per-sequence token sampler with its own seeded generator.
#[derive(Debug, Clone)]
pub struct Sampler {
    rng: StdRng,
    top_k: usize,
    top_p: TopPSchedule,
}

impl Sampler {
    pub fn new(config: &SequenceSamplingConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.random_seed),
            top_k: config.top_k,
            top_p: TopPSchedule::new(config),
        }
    }

    pub fn strategy(&self) -> SamplingStrategy {
        SamplingStrategy::new(self.top_k, self.top_p.current())
    }

    /// Draws one token from processed logits and returns it with its log
    /// probability under the full distribution.
    pub fn sample(&mut self, logits: &[f32]) -> Result<(u32, f32)> {
        ensure!(!logits.is_empty(), "logits row must not be empty");
        let log_probs = log_softmax(logits);
        let token = match self.strategy() {
            SamplingStrategy::ArgMax => argmax_index(logits)?,
            SamplingStrategy::TopK { k } => {
                let (indices, probs) = topk_probs(&log_probs, k)?;
                indices[self.sample_probs_index(&probs)?]
            }
            SamplingStrategy::TopP { p } => {
                let (indices, probs) = topk_probs(&log_probs, logits.len())?;
                let (indices, probs) = topp_filter(indices, probs, p);
                indices[self.sample_probs_index(&probs)?]
            }
            SamplingStrategy::TopKThenTopP { k, p } => {
                let (indices, probs) = topk_probs(&log_probs, k)?;
                let (indices, probs) = topp_filter(indices, probs, p);
                indices[self.sample_probs_index(&probs)?]
            }
        };
        self.top_p.advance(token as u32);
        Ok((token as u32, log_probs[token]))
    }

    fn sample_probs_index(&mut self, probs: &[f32]) -> Result<usize> {
        let dist = WeightedIndex::new(probs)
            .map_err(|_| anyhow!("invalid probabilities: must contain positive finite values"))?;
        Ok(dist.sample(&mut self.rng))
    }
}

pub fn argmax_index(values: &[f32]) -> Result<usize> {
    values
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| a.total_cmp(b).then(ib.cmp(ia)))
        .map(|(idx, _)| idx)
        .ok_or_else(|| anyhow!("empty values for argmax"))
}

/// Indices of the `k` most likely tokens, most likely first, with their
/// renormalized probabilities.
fn topk_probs(log_probs: &[f32], k: usize) -> Result<(Vec<usize>, Vec<f32>)> {
    ensure!(k > 0, "top-k must be positive");
    let mut pairs: Vec<(usize, f32)> = log_probs
        .iter()
        .map(|lp| lp.exp())
        .enumerate()
        .collect();
    pairs.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    pairs.truncate(k.min(log_probs.len()));
    let (indices, mut probs): (Vec<usize>, Vec<f32>) = pairs.into_iter().unzip();
    renorm(&mut probs);
    Ok((indices, probs))
}

/// Keeps the smallest prefix of sorted `probs` whose mass reaches `p`.
fn topp_filter(indices: Vec<usize>, probs: Vec<f32>, p: f32) -> (Vec<usize>, Vec<f32>) {
    let mut cum = 0.0f32;
    let mut kept = 0;
    for prob in &probs {
        kept += 1;
        cum += prob;
        if cum >= p {
            break;
        }
    }
    let mut kept_probs = probs[..kept].to_vec();
    renorm(&mut kept_probs);
    (indices[..kept].to_vec(), kept_probs)
}

fn renorm(probs: &mut [f32]) {
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        for prob in probs {
            *prob /= sum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(top_k: usize, top_p: f32, seed: u64) -> SequenceSamplingConfig {
        SequenceSamplingConfig {
            top_k,
            top_p,
            random_seed: seed,
            ..SequenceSamplingConfig::default()
        }
    }

    #[test]
    fn test_strategy_selection() {
        assert_eq!(SamplingStrategy::new(0, 0.0), SamplingStrategy::ArgMax);
        assert_eq!(SamplingStrategy::new(3, 0.0), SamplingStrategy::TopK { k: 3 });
        assert_eq!(SamplingStrategy::new(0, 0.9), SamplingStrategy::TopP { p: 0.9 });
        assert_eq!(
            SamplingStrategy::new(2, 0.5),
            SamplingStrategy::TopKThenTopP { k: 2, p: 0.5 }
        );
    }

    #[test]
    fn test_greedy_returns_argmax_and_log_prob() -> Result<()> {
        let mut sampler = Sampler::new(&config(0, 0.0, 0));
        let (token, lp) = sampler.sample(&[0.0, 3.0, 1.0])?;
        assert_eq!(token, 1);
        assert!(lp < 0.0 && lp > -0.2);
        Ok(())
    }

    #[test]
    fn test_top_k_one_is_greedy() -> Result<()> {
        let mut sampler = Sampler::new(&config(1, 0.0, 9));
        for _ in 0..10 {
            assert_eq!(sampler.sample(&[0.0, 0.5, 0.4])?.0, 1);
        }
        Ok(())
    }

    #[test]
    fn test_same_seed_same_draws() -> Result<()> {
        let logits = vec![0.1f32, 0.2, 0.3, 0.4, 0.5];
        let mut a = Sampler::new(&config(0, 1.0, 42));
        let mut b = Sampler::new(&config(0, 1.0, 42));
        for _ in 0..20 {
            assert_eq!(a.sample(&logits)?.0, b.sample(&logits)?.0);
        }
        Ok(())
    }

    #[test]
    fn test_small_top_p_keeps_the_most_likely_token() -> Result<()> {
        let mut sampler = Sampler::new(&config(0, 0.1, 3));
        for _ in 0..10 {
            assert_eq!(sampler.sample(&[5.0, 0.0, 0.0])?.0, 0);
        }
        Ok(())
    }

    #[test]
    fn test_top_p_decay_and_reset() {
        let mut schedule = TopPSchedule::new(&SequenceSamplingConfig {
            top_p: 0.8,
            top_p_decay: 0.5,
            top_p_min: 0.3,
            top_p_reset_id: Some(7),
            ..SequenceSamplingConfig::default()
        });
        schedule.advance(1);
        assert!((schedule.current() - 0.4).abs() < 1e-6);
        schedule.advance(1);
        assert!((schedule.current() - 0.3).abs() < 1e-6);
        schedule.advance(7);
        assert!((schedule.current() - 0.8).abs() < 1e-6);
    }
}
