use anyhow::Result;

use crate::error::RuntimeError;

/// Lifecycle of one batch slot within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    #[default]
    Idle,
    Prompted,
    Prefilled,
    Generating,
    Finished,
    Finalized,
}

impl SlotState {
    pub fn can_advance_to(self, next: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (Idle, Prompted)
                | (Prompted, Prefilled)
                | (Prefilled, Generating)
                | (Prefilled, Finished)
                | (Generating, Finished)
                | (Finished, Finalized)
                | (Finalized, Idle)
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct SequenceSlots {
    states: Vec<SlotState>,
}

impl SequenceSlots {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            states: vec![SlotState::Idle; max_batch_size],
        }
    }

    pub fn state(&self, slot: usize) -> Option<SlotState> {
        self.states.get(slot).copied()
    }

    pub fn states(&self) -> &[SlotState] {
        &self.states
    }

    pub fn advance(&mut self, slot: usize, next: SlotState) -> Result<()> {
        let state = self
            .states
            .get_mut(slot)
            .ok_or_else(|| RuntimeError::invariant(format!("slot {slot} does not exist")))?;
        if !state.can_advance_to(next) {
            return Err(RuntimeError::invariant(format!(
                "slot {slot} cannot go from {state:?} to {next:?}"
            ))
            .into());
        }
        *state = next;
        Ok(())
    }

    pub fn advance_all(&mut self, count: usize, next: SlotState) -> Result<()> {
        for slot in 0..count {
            self.advance(slot, next)?;
        }
        Ok(())
    }

    /// Drops every slot back to idle after a failed call.
    pub fn reset(&mut self) {
        self.states.fill(SlotState::Idle);
    }
}
