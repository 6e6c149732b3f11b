// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Frame slot arena
//!
//! Tracks the state of the two frame slots so the publisher never writes a
//! slot whose frame message the consumer still holds.

use lg_stream_protocol::layout::FRAME_SLOT_COUNT;

/// Slot state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Slot is free and available
    Free,
    /// Capture is writing into the slot
    Writing,
    /// Slot is referenced by frame message `message`
    Published { message: u32 },
}

/// Slot is still referenced by an outstanding message
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Frame slot {slot} is still referenced by message {message}")]
pub struct SlotBusy {
    pub slot: usize,
    pub message: u32,
}

/// State tags for the frame slots
#[derive(Debug)]
pub struct SlotArena {
    states: [SlotState; FRAME_SLOT_COUNT],
}

impl Default for SlotArena {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotArena {
    pub fn new() -> Self {
        Self {
            states: [SlotState::Free; FRAME_SLOT_COUNT],
        }
    }

    pub fn state(&self, slot: usize) -> SlotState {
        self.states[slot % FRAME_SLOT_COUNT]
    }

    /// Free every published slot whose message is below `completed`, the
    /// consumer's completion counter
    pub fn reclaim(&mut self, completed: u32) {
        for state in &mut self.states {
            if let SlotState::Published { message } = *state {
                // Wrapping comparison: message < completed
                if (completed.wrapping_sub(message) as i32) > 0 {
                    *state = SlotState::Free;
                }
            }
        }
    }

    /// Mark `slot` as being written
    pub fn begin_write(&mut self, slot: usize) -> Result<(), SlotBusy> {
        let state = &mut self.states[slot % FRAME_SLOT_COUNT];
        match *state {
            SlotState::Published { message } => Err(SlotBusy { slot, message }),
            SlotState::Free | SlotState::Writing => {
                *state = SlotState::Writing;
                Ok(())
            }
        }
    }

    /// Release a slot whose write did not produce a frame
    pub fn abort_write(&mut self, slot: usize) {
        let state = &mut self.states[slot % FRAME_SLOT_COUNT];
        if *state == SlotState::Writing {
            *state = SlotState::Free;
        }
    }

    /// Record that frame message `message` now references `slot`
    pub fn publish(&mut self, slot: usize, message: u32) {
        self.states[slot % FRAME_SLOT_COUNT] = SlotState::Published { message };
    }

    /// Forget every reference, after the queue was re-initialized
    pub fn reset(&mut self) {
        self.states = [SlotState::Free; FRAME_SLOT_COUNT];
    }
}
