//! Pipe statistics, timeout log limiting and state dumps

use super::running_table::SlotState;
use super::PipeState;
use crate::error::{PipeError, Result};
use serde::Serialize;
use std::time::Duration;

/// Counters for one pipe
///
/// Updated by whichever thread drives the node and readable at any time
/// through `Pipe::stats()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipeStats {
    /// Buffers accepted by the device node
    pub submitted: u64,
    /// Frames retrieved and forwarded as done
    pub completed: u64,
    /// Frames forwarded with this stage in error
    pub failed_local: u64,
    /// Input pops that timed out
    pub input_timeouts: u64,
    /// Retrieves that timed out
    pub retrieve_timeouts: u64,
    /// Double submits and unknown retrieved indices
    pub protocol_violations: u64,
    /// Frames discarded by `stop()`, in flight or still queued
    pub flushed_frames: u64,
    /// Worker loop iterations since start
    pub loop_iterations: u64,
    /// Duration of the last worker loop iteration
    pub last_loop_interval: Duration,
}

impl PipeStats {
    /// Frames that left the pipe, done or failed
    pub fn forwarded(&self) -> u64 {
        self.completed + self.failed_local
    }

    /// Completed share of submitted frames as percentage
    pub fn completion_rate(&self) -> f64 {
        if self.submitted == 0 {
            100.0
        } else {
            (self.completed as f64 / self.submitted as f64) * 100.0
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Rate limiter for consecutive timeout warnings
///
/// The first `threshold` consecutive timeouts are logged at warn level,
/// later ones at trace level until a success re-arms the limiter.
#[derive(Debug, Clone)]
pub struct TimeoutLogLimiter {
    threshold: u32,
    consecutive: u32,
}

impl TimeoutLogLimiter {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            consecutive: 0,
        }
    }

    /// Count a timeout; returns true if it should be logged at warn level
    pub fn record(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive <= self.threshold
    }

    /// Re-arm after a success; returns the streak that just ended
    pub fn reset(&mut self) -> u32 {
        std::mem::take(&mut self.consecutive)
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Serializable snapshot of a pipe for postmortem debugging
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipeDump {
    pub name: String,
    pub state: PipeState,
    pub started: bool,
    pub soft_stop: bool,
    pub thread_running: bool,
    pub outstanding: usize,
    pub pool_size: usize,
    pub pool_available: usize,
    pub input_queued: usize,
    /// One entry per buffer index; empty while the worker owns the table
    pub slots: Vec<SlotState>,
    pub stats: PipeStats,
}

impl PipeDump {
    pub fn occupied(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, SlotState::Occupied { .. }))
            .count()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| PipeError::Config(format!("Failed to serialize dump: {}", e)))
    }

    /// Log the dump, one line per occupied slot
    pub fn log(&self) {
        tracing::info!(
            "{}: dump state={} started={} soft_stop={} outstanding={} pool={}/{} queued={}",
            self.name,
            self.state,
            self.started,
            self.soft_stop,
            self.outstanding,
            self.pool_available,
            self.pool_size,
            self.input_queued
        );
        for (index, slot) in self.slots.iter().enumerate() {
            if let SlotState::Occupied { sequence } = slot {
                tracing::info!("{}:   slot {} -> frame {}", self.name, index, sequence);
            }
        }
    }
}
