pub mod buffer;
pub mod engine;
pub mod executor;
pub mod stream;

pub use buffer::{BufferManager, MemoryCounters, MemoryKind};
pub use engine::{Engine, EngineBuilder, PlanKind};
pub use executor::{
    BindingDesc, BindingIo, DimProfile, ExecutionPlan, RuntimeExecutor, StepContext,
};
pub use stream::{Event, Stream};
