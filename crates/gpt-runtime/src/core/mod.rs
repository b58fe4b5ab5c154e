pub mod io;
pub mod session;
pub mod slot;

pub use io::{GenerationInput, GenerationOutput, TokenCallback};
pub use session::GptSession;
pub use slot::{SequenceSlots, SlotState};
