use crate::utils::SequenceSamplingConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PenaltyConfig {
    pub repetition_penalty: f32,
    pub presence_penalty: f32,
}

impl PenaltyConfig {
    pub fn from_sampling_config(config: &SequenceSamplingConfig) -> Option<Self> {
        if config.repetition_penalty == 1.0 && config.presence_penalty == 0.0 {
            return None;
        }
        Some(Self {
            repetition_penalty: config.repetition_penalty,
            presence_penalty: config.presence_penalty,
        })
    }
}

pub fn apply_embedding_bias(logits: &mut [f32], bias: &[f32]) {
    for (logit, b) in logits.iter_mut().zip(bias) {
        *logit += b;
    }
}

pub fn apply_temperature(logits: &mut [f32], temperature: f32) {
    if temperature == 1.0 {
        return;
    }
    for logit in logits {
        *logit /= temperature;
    }
}

/// Penalizes every token already present in `history` once, however often it
/// occurs. Repetition divides positive logits and multiplies negative ones.
pub fn apply_penalties(logits: &mut [f32], history: &[u32], cfg: PenaltyConfig) {
    let mut seen = vec![false; logits.len()];
    for &token_id in history {
        if let Some(flag) = seen.get_mut(token_id as usize) {
            *flag = true;
        }
    }
    for (logit, _) in logits.iter_mut().zip(&seen).filter(|(_, seen)| **seen) {
        if *logit > 0.0 {
            *logit /= cfg.repetition_penalty;
        } else {
            *logit *= cfg.repetition_penalty;
        }
        *logit -= cfg.presence_penalty;
    }
}

/// Forbids `end_id` while fewer than `min_length` tokens have been generated.
pub fn apply_min_length(logits: &mut [f32], generated: usize, min_length: usize, end_id: u32) {
    if generated < min_length
        && let Some(logit) = logits.get_mut(end_id as usize)
    {
        *logit = f32::NEG_INFINITY;
    }
}

/// Log-softmax over a host row. Rows that are entirely negative infinity stay
/// that way.
pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return logits.to_vec();
    }
    let sum: f32 = logits.iter().map(|x| (x - max).exp()).sum();
    let log_sum = sum.ln() + max;
    logits.iter().map(|x| x - log_sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repetition_and_presence() {
        let mut logits = vec![2.0f32, -2.0, 1.0];
        let cfg = PenaltyConfig {
            repetition_penalty: 2.0,
            presence_penalty: 0.5,
        };
        apply_penalties(&mut logits, &[0, 1, 1], cfg);
        assert_eq!(logits, vec![0.5, -4.5, 1.0]);
    }

    #[test]
    fn test_default_config_has_no_penalties() {
        assert!(PenaltyConfig::from_sampling_config(&SequenceSamplingConfig::default()).is_none());
    }

    #[test]
    fn test_min_length_blocks_end_id() {
        let mut logits = vec![1.0f32; 4];
        apply_min_length(&mut logits, 0, 1, 3);
        assert_eq!(logits[3], f32::NEG_INFINITY);
        let mut logits = vec![1.0f32; 4];
        apply_min_length(&mut logits, 1, 1, 3);
        assert_eq!(logits[3], 1.0);
    }

    #[test]
    fn test_log_softmax_normalizes() {
        let lp = log_softmax(&[1.0, 2.0, f32::NEG_INFINITY]);
        let total: f32 = lp.iter().map(|x| x.exp()).sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert_eq!(lp[2], f32::NEG_INFINITY);
    }
}
