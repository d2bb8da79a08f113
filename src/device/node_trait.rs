//! DeviceNode trait for the hardware data channel a pipe drives
//!
//! This module provides the common interface for device nodes, so the pipe
//! can run against a real driver handle as well as the scriptable mock node
//! used in tests and the demo binary.

use crate::config::NodeFormat;
use crate::error::{PipeError, Result};
use crate::types::Buffer;
use std::fmt;
use std::time::Duration;

/// A submit the node refused
///
/// The buffer is handed back together with the error so a failed submit
/// never loses it.
#[derive(Debug)]
pub struct Rejected {
    pub buffer: Buffer,
    pub error: PipeError,
}

impl Rejected {
    pub fn new(buffer: Buffer, error: PipeError) -> Self {
        Self { buffer, error }
    }

    /// Split into buffer and error
    pub fn into_parts(self) -> (Buffer, PipeError) {
        (self.buffer, self.error)
    }
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer {} rejected: {}", self.buffer.index, self.error)
    }
}

/// Control that makes the node hand back every buffer it still holds
///
/// The value is not interpreted.
pub const FORCE_DONE_CONTROL: u32 = 0x0800_0026;

/// Control that turns the sensor stream on (1) or off (0)
pub const STREAM_CONTROL: u32 = 0x0800_0027;

/// Counters kept by a device node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// Buffers accepted by `submit`
    pub submitted: u64,
    /// Buffers handed back by `retrieve`
    pub retrieved: u64,
    /// Retrieves that ran out of time
    pub timeouts: u64,
    /// Driver errors on any call
    pub errors: u64,
}

impl NodeStats {
    /// Buffers currently held by the hardware
    pub fn in_flight(&self) -> u64 {
        self.submitted.saturating_sub(self.retrieved)
    }
}

/// Unified interface for device nodes
///
/// A node is an open handle to one hardware data channel. The pipe never
/// calls `submit`/`retrieve` for the same node from two threads at once, and
/// never has more than one `retrieve` outstanding. Implementations must be
/// `Send` so the node can move into the worker thread.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceNode: Send {
    /// Node name used in logs and errors
    fn name(&self) -> &str;

    /// Open the hardware channel
    ///
    /// # Arguments
    /// * `device_id` - Driver specific channel id
    fn open(&mut self, device_id: u32) -> Result<()>;

    /// Close the hardware channel
    fn close(&mut self) -> Result<()>;

    /// Check if the channel is open
    fn is_open(&self) -> bool;

    /// Apply format, plane layout and buffer count
    fn configure(&mut self, format: &NodeFormat) -> Result<()>;

    /// Format applied by the last successful `configure`
    fn current_format(&self) -> Option<NodeFormat>;

    /// Request the buffer pool for the configured format
    ///
    /// The returned buffers carry indices `0..buffer_count`.
    fn allocate_buffer_pool(&mut self) -> Result<Vec<Buffer>>;

    /// Release the buffer pool; buffers still queued are dropped
    fn release_pool(&mut self) -> Result<()>;

    /// Number of buffers in the allocated pool (0 if none)
    fn pool_size(&self) -> usize;

    /// Queue a buffer to the hardware
    fn submit(&mut self, buffer: Buffer) -> std::result::Result<(), Rejected>;

    /// Wait for the hardware to hand back a processed buffer
    ///
    /// Fails with [`PipeError::Timeout`] if nothing returns within `timeout`,
    /// or with an I/O or device error on hardware failure.
    fn retrieve(&mut self, timeout: Duration) -> Result<Buffer>;

    /// Start streaming
    fn start_streaming(&mut self) -> Result<()>;

    /// Stop streaming, handing back every buffer still queued
    fn stop_streaming(&mut self) -> Result<Vec<Buffer>>;

    /// Set a driver control
    fn set_control(&mut self, id: u32, _value: i32) -> Result<()> {
        Err(PipeError::Unsupported(format!(
            "control {:#x} on {}",
            id,
            self.name()
        )))
    }

    /// Read a driver control
    fn get_control(&self, id: u32) -> Result<i32> {
        Err(PipeError::Unsupported(format!(
            "control {:#x} on {}",
            id,
            self.name()
        )))
    }

    /// Get node operation statistics
    fn stats(&self) -> NodeStats;
}
