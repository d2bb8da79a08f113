//! Running-frame table
//!
//! Maps each buffer index of the device pool to the frame currently lending
//! that buffer to hardware. A slot is occupied between submit and retrieve of
//! its buffer and empty otherwise. The table is owned by whichever thread
//! drives the node (the worker, or the caller in instant mode), so it needs
//! no lock.

use crate::error::{PipeError, Result};
use crate::types::Frame;
use serde::Serialize;

/// Fixed-capacity slot map from buffer index to in-flight frame
#[derive(Debug, Default)]
pub struct RunningFrameTable {
    slots: Vec<Option<Frame>>,
    occupied: usize,
}

/// Snapshot of one slot, for dumps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "slot", rename_all = "snake_case")]
pub enum SlotState {
    Empty,
    Occupied { sequence: u64 },
}

impl RunningFrameTable {
    /// Create a table with one empty slot per pool buffer
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            occupied: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.occupied
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Sequence of the frame holding `index`, if any
    pub fn occupant(&self, index: usize) -> Option<u64> {
        self.slots
            .get(index)
            .and_then(|slot| slot.as_ref())
            .map(Frame::sequence)
    }

    /// Record `frame` as the holder of buffer `index`
    ///
    /// An occupied slot is left untouched and the incoming frame is handed
    /// back with the error.
    pub fn insert(&mut self, index: usize, frame: Frame) -> std::result::Result<(), (Frame, PipeError)> {
        let Some(slot) = self.slots.get_mut(index) else {
            let error = PipeError::InvalidBuffer(format!(
                "index {} outside table of {}",
                index,
                self.slots.len()
            ));
            return Err((frame, error));
        };
        if let Some(occupant) = slot.as_ref() {
            let error = PipeError::SlotOccupied {
                index,
                occupant: occupant.sequence(),
                incoming: frame.sequence(),
            };
            return Err((frame, error));
        }
        *slot = Some(frame);
        self.occupied += 1;
        Ok(())
    }

    /// Take the frame holding buffer `index`
    pub fn remove(&mut self, index: usize) -> Result<Frame> {
        match self.slots.get_mut(index).and_then(Option::take) {
            Some(frame) => {
                self.occupied -= 1;
                Ok(frame)
            }
            None => Err(PipeError::UnknownBuffer { index }),
        }
    }

    /// Take every in-flight frame, lowest index first
    pub fn drain(&mut self) -> Vec<(usize, Frame)> {
        self.occupied = 0;
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| slot.take().map(|frame| (index, frame)))
            .collect()
    }

    /// Drop all slots and resize for a new pool
    pub fn reset(&mut self, capacity: usize) {
        *self = Self::new(capacity);
    }

    pub fn snapshot(&self) -> Vec<SlotState> {
        self.slots
            .iter()
            .map(|slot| match slot {
                Some(frame) => SlotState::Occupied {
                    sequence: frame.sequence(),
                },
                None => SlotState::Empty,
            })
            .collect()
    }
}
