pub mod gpt;
pub mod layers;
pub mod reference;

use candle_core::DType;

use crate::runtime::{BindingDesc, DimProfile};
use crate::utils::{ModelConfig, OptimizationProfile};

pub use gpt::GptModel;
pub use layers::{Communicator, ForwardContext, LocalComm, StepPhase, ThreadComm, TpInfo};
pub use reference::IdentityPlan;

pub const INPUT_IDS: &str = "input_ids";
pub const CONTEXT_LENGTHS: &str = "context_lengths";
pub const POSITION_IDS: &str = "position_ids";
pub const LAST_TOKEN_IDS: &str = "last_token_ids";
pub const PAST_KEY_VALUE_LENGTHS: &str = "past_key_value_lengths";
pub const HOST_REQUEST_TYPES: &str = "host_request_types";
pub const CACHE_INDIRECTION: &str = "cache_indirection";
pub const KV_CACHE_BLOCK_POINTERS: &str = "kv_cache_block_pointers";
pub const KV_CACHE_QUANT_SCALE: &str = "kv_cache_quant_scale";
pub const LOGITS: &str = "logits";
pub const CONTEXT_LOGITS: &str = "context_logits";

pub fn past_key_value(layer: usize) -> String {
    format!("past_key_value_{layer}")
}

/// Binding table of one decoder step under `profile`, shared by every plan so
/// sessions drive them the same way.
pub fn step_bindings(model: &ModelConfig, profile: &OptimizationProfile) -> Vec<BindingDesc> {
    let rows = profile.max_batch_size * profile.max_beam_width;
    let max_tokens = (profile.max_batch_size * profile.max_input_len).max(rows);
    let seq = profile.max_seq_len;
    let vocab = model.vocab_size_padded;
    let kv_heads = model.num_kv_heads_local();
    let head = model.head_size;

    let ids_profile = if model.is_packed() {
        DimProfile::new(vec![1, 1], vec![1, max_tokens])
    } else {
        DimProfile::new(vec![1, 1], vec![rows, profile.max_input_len])
    };
    let per_row = || DimProfile::new(vec![1], vec![rows]);

    let mut bindings = vec![
        BindingDesc::input(INPUT_IDS, DType::U32, ids_profile.clone()),
        BindingDesc::input(POSITION_IDS, DType::U32, ids_profile).optional(),
        BindingDesc::input(CONTEXT_LENGTHS, DType::U32, per_row()),
        BindingDesc::input(LAST_TOKEN_IDS, DType::U32, per_row()).optional(),
        BindingDesc::input(PAST_KEY_VALUE_LENGTHS, DType::U32, per_row()),
        BindingDesc::input(HOST_REQUEST_TYPES, DType::U32, per_row()),
        BindingDesc::input(
            CACHE_INDIRECTION,
            DType::U32,
            DimProfile::new(
                vec![1, 1, 1],
                vec![profile.max_batch_size, profile.max_beam_width, seq],
            ),
        )
        .optional(),
        BindingDesc::input(KV_CACHE_QUANT_SCALE, DType::F32, DimProfile::fixed(vec![1])).optional(),
    ];

    let kv_dtype = if model.kv_cache_quant_mode.is_quantized() {
        DType::U8
    } else {
        model.dtype()
    };
    let kv_profile = if model.paged_kv_cache {
        let tpb = model.tokens_per_block;
        bindings.push(BindingDesc::input(
            KV_CACHE_BLOCK_POINTERS,
            DType::U32,
            DimProfile::new(vec![1, 1], vec![rows, seq.div_ceil(tpb).max(1)]),
        ));
        DimProfile::new(
            vec![1, 2, kv_heads, tpb, head],
            vec![usize::MAX, 2, kv_heads, tpb, head],
        )
    } else {
        DimProfile::new(
            vec![1, 2, kv_heads, 1, head],
            vec![rows, 2, kv_heads, seq, head],
        )
    };
    for layer in 0..model.num_layers {
        bindings.push(BindingDesc::input(
            past_key_value(layer),
            kv_dtype,
            kv_profile.clone(),
        ));
    }

    bindings.push(BindingDesc::output(
        LOGITS,
        DType::F32,
        DimProfile::new(vec![1, vocab], vec![rows, vocab]),
    ));
    bindings.push(
        BindingDesc::output(
            CONTEXT_LOGITS,
            DType::F32,
            DimProfile::new(vec![1, vocab], vec![max_tokens, vocab]),
        )
        .optional(),
    );
    bindings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::BindingIo;

    #[test]
    fn test_paged_bindings_include_block_pointers() -> anyhow::Result<()> {
        let mut model = ModelConfig::from_json_str(
            r#"{"num_layers": 2, "num_heads": 2, "num_kv_heads": 1, "head_size": 4,
                "vocab_size": 10, "vocab_size_padded": 12, "data_type": "float",
                "paged_kv_cache": true, "tokens_per_block": 4}"#,
        )?;
        let profile = OptimizationProfile {
            max_batch_size: 2,
            max_beam_width: 2,
            max_input_len: 8,
            max_seq_len: 16,
        };
        let bindings = step_bindings(&model, &profile);
        let pointers = bindings
            .iter()
            .find(|b| b.name == KV_CACHE_BLOCK_POINTERS)
            .ok_or_else(|| anyhow::anyhow!("missing block pointers"))?;
        assert_eq!(pointers.profile.max, vec![4, 4]);
        assert_eq!(
            bindings.iter().filter(|b| b.io == BindingIo::Output).count(),
            2
        );

        model.paged_kv_cache = false;
        let bindings = step_bindings(&model, &profile);
        assert!(bindings.iter().all(|b| b.name != KV_CACHE_BLOCK_POINTERS));
        let layer = bindings
            .iter()
            .find(|b| b.name == past_key_value(1))
            .ok_or_else(|| anyhow::anyhow!("missing layer binding"))?;
        assert_eq!(layer.profile.max, vec![4, 2, 1, 16, 4]);
        Ok(())
    }
}
