use std::collections::HashMap;

use anyhow::{Result, ensure};
use candle_core::{DType, Tensor};

use crate::error::RuntimeError;
use crate::models::layers::ForwardContext;
use crate::models::{CONTEXT_LOGITS, LOGITS, step_bindings};
use crate::runtime::{BindingDesc, ExecutionPlan, StepContext};
use crate::utils::{ModelConfig, OptimizationProfile};

const PEAK_LOGIT: f32 = 10.0;

/// Identity-next-token model: the logits of every position peak at the token
/// it consumed. Caches are bound but never touched.
#[derive(Debug, Clone)]
pub struct IdentityPlan {
    config: ModelConfig,
    profile: OptimizationProfile,
}

impl IdentityPlan {
    pub fn new(config: ModelConfig, profile: OptimizationProfile) -> Self {
        Self { config, profile }
    }

    fn one_hot(&self, tokens: &[u32], device: &candle_core::Device) -> Result<Tensor> {
        let vocab = self.config.vocab_size_padded;
        let mut data = vec![0f32; tokens.len() * vocab];
        for (row, &token) in tokens.iter().enumerate() {
            ensure!(
                (token as usize) < vocab,
                RuntimeError::invariant(format!("token {token} outside vocabulary of {vocab}"))
            );
            data[row * vocab + token as usize] = PEAK_LOGIT;
        }
        Ok(Tensor::from_vec(data, (tokens.len(), vocab), device)?)
    }
}

impl ExecutionPlan for IdentityPlan {
    fn name(&self) -> &str {
        "identity"
    }

    fn bindings(&self) -> Vec<BindingDesc> {
        step_bindings(&self.config, &self.profile)
    }

    fn forward(&self, ctx: &StepContext<'_>) -> Result<HashMap<String, Tensor>> {
        let fwd = ForwardContext::from_step(ctx, &self.config)?;
        let device = fwd.input_ids.device().clone();
        let ids = fwd.input_ids.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        let mut outputs = HashMap::new();
        if fwd.is_context() && ctx.wants(CONTEXT_LOGITS) {
            outputs.insert(CONTEXT_LOGITS.to_string(), self.one_hot(&ids, &device)?);
        }
        let last: Vec<u32> = fwd
            .last_token_ids
            .iter()
            .map(|&idx| {
                ids.get(idx as usize).copied().ok_or_else(|| {
                    RuntimeError::invariant(format!("last token index {idx} out of range")).into()
                })
            })
            .collect::<Result<_>>()?;
        outputs.insert(LOGITS.to_string(), self.one_hot(&last, &device)?);
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use candle_core::Device;

    use super::*;
    use crate::models::{CONTEXT_LENGTHS, HOST_REQUEST_TYPES, INPUT_IDS, PAST_KEY_VALUE_LENGTHS};

    #[test]
    fn test_logits_peak_at_last_token() -> Result<()> {
        let config = ModelConfig::from_json_str(
            r#"{"num_layers": 1, "num_heads": 1, "num_kv_heads": 1, "head_size": 2,
                "vocab_size": 6, "vocab_size_padded": 8, "data_type": "float",
                "remove_input_padding": true}"#,
        )?;
        let plan = IdentityPlan::new(config, OptimizationProfile::default());
        let dev = Device::Cpu;
        let inputs: HashMap<String, Tensor> = [
            (INPUT_IDS, Tensor::new(&[[1u32, 2, 3, 5, 4]], &dev)?),
            (CONTEXT_LENGTHS, Tensor::new(&[3u32, 2], &dev)?),
            (PAST_KEY_VALUE_LENGTHS, Tensor::new(&[0u32, 0], &dev)?),
            (HOST_REQUEST_TYPES, Tensor::new(&[0u32, 0], &dev)?),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        let wanted = HashSet::new();
        let out = plan.forward(&StepContext::new(&inputs, &wanted))?;
        let argmax = out[LOGITS].argmax(1)?.to_vec1::<u32>()?;
        assert_eq!(argmax, vec![3, 4]);
        assert!(!out.contains_key(CONTEXT_LOGITS));
        Ok(())
    }
}
