pub mod context;
pub mod distributed;
pub mod embed_head;
pub mod linear;
pub mod norm;

pub use context::{ForwardContext, REQUEST_TYPE_CONTEXT, REQUEST_TYPE_GENERATION, StepPhase};
pub use distributed::{Communicator, LocalComm, ThreadComm, TpInfo, kv_head_range, shard_range};
pub use embed_head::{LmHead, VocabEmbedding, gather_last_tokens};
pub use linear::{Linear, RowParallelLinear};
pub use norm::LayerNorm;
