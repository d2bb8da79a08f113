//! Mock Device Node Implementation for Testing
//!
//! This module provides a simulated device node so a pipe can run without
//! hardware. Buffers submitted to it are held in a queue and handed back by
//! `retrieve`, with the dynamic metadata block filled in the way a driver
//! would after processing.
//!
//! # Features
//!
//! - **Scripted retrieval**: Return buffers in FIFO order or in an explicit index order
//! - **Fault injection**: Timeouts, I/O failures, unknown buffer indices, rejected submits
//! - **Metadata write-back**: Dynamic metadata derived from the submitted request
//! - **Controls**: Stored driver controls, with force-done releasing held buffers
//! - **Inspection handle**: Counters and submitted requests readable from another thread
//!
//! # Example
//!
//! ```ignore
//! use pipe_stage::device::{MockNode, RetrieveStep};
//!
//! let node = MockNode::new("mock-3aa");
//! let handle = node.handle();
//! handle.script([RetrieveStep::Index(2), RetrieveStep::Timeout]);
//!
//! let pipe = Pipe::new(config, Box::new(node))?;
//! // ... run frames ...
//! assert_eq!(handle.submit_count(), 4);
//! ```
//!
//! # Enabling
//!
//! The mock node is only available when the `mock-node` feature is enabled
//! (on by default).

use crate::config::NodeFormat;
use crate::error::{PipeError, Result};
use crate::types::{Buffer, DynamicMetadata, Plane, ShotMetadata};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::node_trait::{DeviceNode, NodeStats, Rejected, FORCE_DONE_CONTROL};

/// Planes of mock buffers never exceed this many bytes
const MOCK_PLANE_CAP: usize = 64 * 1024;

/// Simulated sensor frame interval (30 fps)
const MOCK_FRAME_INTERVAL_NS: u64 = 33_333_333;

/// Default exposure reported in dynamic metadata
const MOCK_EXPOSURE_NS: u64 = 10_000_000;

/// What the next `retrieve` call does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrieveStep {
    /// Hand back the oldest queued buffer
    Next,
    /// Hand back the queued buffer with this index, waiting for it if needed
    Index(usize),
    /// Fail with a timeout without waiting
    Timeout,
    /// Fail with an I/O error
    IoError(String),
    /// Hand back a buffer with an index nothing submitted
    Unknown(usize),
}

#[derive(Debug, Default)]
struct MockState {
    open: bool,
    device_id: u32,
    format: Option<NodeFormat>,
    pool_size: usize,
    streaming: bool,
    queued: VecDeque<Buffer>,
    script: VecDeque<RetrieveStep>,
    submit_failures: VecDeque<String>,
    submitted_meta: Vec<ShotMetadata>,
    configure_calls: u32,
    allocate_calls: u32,
    exposure_ns: u64,
    controls: HashMap<u32, i32>,
    /// Set by a force-done until the queue drains; retrieves ignore the script
    forced: bool,
    force_done_calls: u32,
    stats: NodeStats,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<MockState>,
    queued: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Mock device node for testing without real hardware
#[derive(Debug)]
pub struct MockNode {
    name: String,
    shared: Arc<Shared>,
}

impl MockNode {
    /// Create a closed mock node
    pub fn new(name: impl Into<String>) -> Self {
        let shared = Arc::new(Shared::default());
        shared.lock().exposure_ns = MOCK_EXPOSURE_NS;
        Self {
            name: name.into(),
            shared,
        }
    }

    /// Handle for scripting and inspecting this node after it moved into a pipe
    pub fn handle(&self) -> MockNodeHandle {
        MockNodeHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn device_error(&self, message: impl Into<String>) -> PipeError {
        PipeError::device(self.name.clone(), message)
    }

    /// Fill in what the hardware would report for a processed request
    fn write_back(state: &mut MockState, buffer: &mut Buffer) {
        let sequence = state.stats.retrieved;
        let exposure_ns = state.exposure_ns;
        if let Some(meta) = buffer.meta.as_mut() {
            let applied_crop = (!meta.crop_region.is_empty()).then_some(meta.crop_region);
            meta.dynamic = Some(DynamicMetadata {
                frame_count: meta.request_frame_count,
                timestamp_ns: sequence * MOCK_FRAME_INTERVAL_NS,
                exposure_ns,
                applied_crop,
            });
        }
    }

    fn take_queued(&self, wanted: Option<usize>, timeout: Duration) -> Result<Buffer> {
        let guard = self.shared.lock();
        let (mut state, _) = self
            .shared
            .queued
            .wait_timeout_while(guard, timeout, |s| match wanted {
                Some(index) if !s.forced => !s.queued.iter().any(|b| b.index == index),
                _ => s.queued.is_empty(),
            })
            .unwrap_or_else(PoisonError::into_inner);

        let position = match wanted {
            Some(index) if !state.forced => state.queued.iter().position(|b| b.index == index),
            _ if state.queued.is_empty() => None,
            _ => Some(0),
        };
        let Some(position) = position else {
            state.stats.timeouts += 1;
            return Err(PipeError::Timeout(format!(
                "{}: no buffer returned within {:?}",
                self.name, timeout
            )));
        };
        // Only a satisfied Index step is consumed; Next is the implicit default
        if wanted.is_some() && !state.forced {
            state.script.pop_front();
        }

        let mut buffer = match state.queued.remove(position) {
            Some(buffer) => buffer,
            None => return Err(self.device_error("queue changed while waiting")),
        };
        if state.queued.is_empty() {
            state.forced = false;
        }
        Self::write_back(&mut state, &mut buffer);
        state.stats.retrieved += 1;
        Ok(buffer)
    }
}

impl DeviceNode for MockNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, device_id: u32) -> Result<()> {
        let mut state = self.shared.lock();
        if state.open {
            return Err(self.device_error("already open"));
        }
        state.open = true;
        state.device_id = device_id;
        tracing::debug!("{}: opened mock device {}", self.name, device_id);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.shared.lock();
        state.open = false;
        state.streaming = false;
        state.queued.clear();
        state.pool_size = 0;
        state.format = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.lock().open
    }

    fn configure(&mut self, format: &NodeFormat) -> Result<()> {
        let mut state = self.shared.lock();
        if !state.open {
            return Err(self.device_error("configure on closed node"));
        }
        if state.pool_size > 0 {
            return Err(self.device_error("configure while buffer pool is allocated"));
        }
        if format.buffer_count == 0 || format.plane_count < 2 {
            state.stats.errors += 1;
            return Err(PipeError::InvalidConfig(format!(
                "{}: unusable format {:?}",
                self.name, format
            )));
        }
        state.format = Some(format.clone());
        state.configure_calls += 1;
        Ok(())
    }

    fn current_format(&self) -> Option<NodeFormat> {
        self.shared.lock().format.clone()
    }

    fn allocate_buffer_pool(&mut self) -> Result<Vec<Buffer>> {
        let mut state = self.shared.lock();
        let Some(format) = state.format.clone() else {
            return Err(self.device_error("allocate before configure"));
        };
        if state.pool_size > 0 {
            return Err(self.device_error("buffer pool already allocated"));
        }

        let buffers = (0..format.buffer_count as usize)
            .map(|index| {
                let mut buffer = Buffer::new(index, 0, 0);
                buffer.planes = (0..format.image_planes())
                    .map(|plane| Plane::with_size(format.plane_size(plane).min(MOCK_PLANE_CAP)))
                    .collect();
                buffer
            })
            .collect::<Vec<_>>();

        state.pool_size = buffers.len();
        state.allocate_calls += 1;
        tracing::debug!("{}: allocated {} buffers", self.name, buffers.len());
        Ok(buffers)
    }

    fn release_pool(&mut self) -> Result<()> {
        let mut state = self.shared.lock();
        if state.streaming {
            return Err(self.device_error("release pool while streaming"));
        }
        state.queued.clear();
        state.pool_size = 0;
        Ok(())
    }

    fn pool_size(&self) -> usize {
        self.shared.lock().pool_size
    }

    fn submit(&mut self, buffer: Buffer) -> std::result::Result<(), Rejected> {
        let mut state = self.shared.lock();
        if state.pool_size == 0 {
            state.stats.errors += 1;
            return Err(Rejected::new(buffer, self.device_error("submit without buffer pool")));
        }
        if buffer.index >= state.pool_size {
            state.stats.errors += 1;
            let error = PipeError::InvalidBuffer(format!(
                "index {} outside pool of {}",
                buffer.index, state.pool_size
            ));
            return Err(Rejected::new(buffer, error));
        }
        if let Some(message) = state.submit_failures.pop_front() {
            state.stats.errors += 1;
            return Err(Rejected::new(buffer, self.device_error(message)));
        }
        if state.queued.iter().any(|b| b.index == buffer.index) {
            state.stats.errors += 1;
            let message = format!("buffer {} already queued", buffer.index);
            return Err(Rejected::new(buffer, self.device_error(message)));
        }

        if let Some(meta) = buffer.meta.as_ref() {
            state.submitted_meta.push(meta.clone());
        }
        state.queued.push_back(buffer);
        state.stats.submitted += 1;
        self.shared.queued.notify_all();
        Ok(())
    }

    fn retrieve(&mut self, timeout: Duration) -> Result<Buffer> {
        let step = {
            let mut state = self.shared.lock();
            if !state.streaming {
                state.stats.errors += 1;
                return Err(self.device_error("retrieve while not streaming"));
            }
            state.script.front().cloned().unwrap_or(RetrieveStep::Next)
        };

        match step {
            RetrieveStep::Next => self.take_queued(None, timeout),
            RetrieveStep::Index(index) => self.take_queued(Some(index), timeout),
            RetrieveStep::Timeout => {
                let mut state = self.shared.lock();
                state.script.pop_front();
                state.stats.timeouts += 1;
                Err(PipeError::Timeout(format!("{}: scripted timeout", self.name)))
            }
            RetrieveStep::IoError(message) => {
                let mut state = self.shared.lock();
                state.script.pop_front();
                state.stats.errors += 1;
                Err(PipeError::Io(std::io::Error::other(message)))
            }
            RetrieveStep::Unknown(index) => {
                let mut state = self.shared.lock();
                state.script.pop_front();
                let mut buffer = Buffer::new(index, 1, 16);
                Self::write_back(&mut state, &mut buffer);
                state.stats.retrieved += 1;
                Ok(buffer)
            }
        }
    }

    fn start_streaming(&mut self) -> Result<()> {
        let mut state = self.shared.lock();
        if state.pool_size == 0 {
            return Err(self.device_error("stream on without buffer pool"));
        }
        state.streaming = true;
        tracing::debug!("{}: stream on ({} queued)", self.name, state.queued.len());
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<Vec<Buffer>> {
        let mut state = self.shared.lock();
        state.streaming = false;
        state.forced = false;
        let returned: Vec<Buffer> = state.queued.drain(..).collect();
        tracing::debug!("{}: stream off, {} buffers returned", self.name, returned.len());
        Ok(returned)
    }

    fn set_control(&mut self, id: u32, value: i32) -> Result<()> {
        let mut state = self.shared.lock();
        if !state.open {
            state.stats.errors += 1;
            return Err(self.device_error("set_control on closed node"));
        }
        if id == FORCE_DONE_CONTROL {
            state.force_done_calls += 1;
            state.script.clear();
            state.forced = !state.queued.is_empty();
            tracing::debug!("{}: force done, {} buffers released", self.name, state.queued.len());
            self.shared.queued.notify_all();
            return Ok(());
        }
        state.controls.insert(id, value);
        tracing::debug!("{}: control {:#x} = {}", self.name, id, value);
        Ok(())
    }

    fn get_control(&self, id: u32) -> Result<i32> {
        let state = self.shared.lock();
        if !state.open {
            return Err(self.device_error("get_control on closed node"));
        }
        state
            .controls
            .get(&id)
            .copied()
            .ok_or_else(|| self.device_error(format!("control {:#x} never set", id)))
    }

    fn stats(&self) -> NodeStats {
        self.shared.lock().stats
    }
}

/// Shared view of a [`MockNode`] for scripting and assertions
#[derive(Debug, Clone)]
pub struct MockNodeHandle {
    shared: Arc<Shared>,
}

impl MockNodeHandle {
    /// Append steps to the retrieve script
    pub fn script(&self, steps: impl IntoIterator<Item = RetrieveStep>) {
        self.shared.lock().script.extend(steps);
    }

    /// Make the next submit fail with a device error
    pub fn fail_next_submit(&self, message: impl Into<String>) {
        self.shared.lock().submit_failures.push_back(message.into());
    }

    /// Exposure reported in dynamic metadata from now on
    pub fn set_exposure_ns(&self, exposure_ns: u64) {
        self.shared.lock().exposure_ns = exposure_ns;
    }

    pub fn submit_count(&self) -> u64 {
        self.shared.lock().stats.submitted
    }

    pub fn retrieve_count(&self) -> u64 {
        self.shared.lock().stats.retrieved
    }

    pub fn configure_count(&self) -> u32 {
        self.shared.lock().configure_calls
    }

    pub fn allocate_count(&self) -> u32 {
        self.shared.lock().allocate_calls
    }

    /// Indices currently held by the simulated hardware, oldest first
    pub fn queued_indices(&self) -> Vec<usize> {
        self.shared.lock().queued.iter().map(|b| b.index).collect()
    }

    /// Request blocks of every accepted submit, in submit order
    pub fn submitted_meta(&self) -> Vec<ShotMetadata> {
        self.shared.lock().submitted_meta.clone()
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().open
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.lock().streaming
    }

    /// Last value written to control `id`
    pub fn control(&self, id: u32) -> Option<i32> {
        self.shared.lock().controls.get(&id).copied()
    }

    pub fn force_done_count(&self) -> u32 {
        self.shared.lock().force_done_calls
    }

    pub fn device_id(&self) -> u32 {
        self.shared.lock().device_id
    }

    pub fn stats(&self) -> NodeStats {
        self.shared.lock().stats
    }
}
