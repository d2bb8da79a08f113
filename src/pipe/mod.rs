//! Pipe: one stage of the imaging pipeline
//!
//! A [`Pipe`] owns a device node and moves frames from its input queue to the
//! node and back out to its output queue, either from a dedicated worker
//! thread or synchronously in instant mode.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized --create()--> Created --setup()--> Configured --start()--> Running
//!       ^                        ^                     |                    |
//!       |                        +------ stop() -------+---- Stopping <-----+
//!       +------------------------------- destroy() -------------------------+
//! ```
//!
//! `start_thread()` spawns the worker once the pipe is running;
//! `instant_on()` runs it without a worker instead. Calls made in a state
//! that does not allow them fail with [`PipeError::InvalidState`].
//!
//! Driver controls (`set_control`, `get_control`, `force_done`,
//! `sensor_stream`) go straight to the node when the caller's thread owns
//! it, and through the worker otherwise.
//!
//! # Components
//!
//! - [`RunningFrameTable`] - Buffer index to in-flight frame
//! - [`BufferPool`] - Free list of the node's buffers
//! - [`NodeGroupTracker`] - Last applied crop per node, for change logging
//! - [`FrameQueue`] / [`CancelToken`] - Frame channels and worker cancellation
//! - [`PipeStats`] / [`PipeDump`] - Counters and postmortem snapshots
//!
//! # Example
//!
//! ```ignore
//! use pipe_stage::{Pipe, PipeConfig, PipeInfo, MockNode};
//!
//! let mut pipe = Pipe::new(PipeConfig::default(), Box::new(MockNode::new("node")))?;
//! let (out_tx, out_rx) = crossbeam_channel::unbounded();
//! pipe.set_output_queue(out_tx)?;
//! pipe.create()?;
//! pipe.setup(PipeInfo::new(1920, 1080, "NV21", 8))?;
//! pipe.start()?;
//! pipe.start_thread()?;
//!
//! let buffer = pipe.buffer_pool().acquire().unwrap();
//! pipe.push_frame(Frame::new(1).with_buffer(pipe.id(), buffer))?;
//! let done = out_rx.recv()?;
//! pipe.stop()?;
//! ```

pub mod buffer_pool;
mod instant;
pub mod node_group;
pub mod queue;
pub mod running_table;
pub mod stats;
pub(crate) mod worker;

pub use buffer_pool::BufferPool;
pub use node_group::{merge_node_group, NodeGroupTracker};
pub use queue::{cancel_pair, CancelListener, CancelToken, FrameQueue, PopOutcome, QueueKind};
pub use running_table::{RunningFrameTable, SlotState};
pub use stats::{PipeDump, PipeStats, TimeoutLogLimiter};

use crate::config::{PipeConfig, PipeInfo};
use crate::device::{DeviceNode, NodeStats, FORCE_DONE_CONTROL, STREAM_CONTROL};
use crate::error::{PipeError, Result, ResultExt};
use crate::types::{Frame, FrameDone, PipeId};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use worker::{NodeCommand, PipeCore, PipeShared, SubmitOutcome, WorkerExit};

/// Lifecycle state of a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipeState {
    #[default]
    Uninitialized,
    /// Device node open
    Created,
    /// Format applied and buffer pool allocated
    Configured,
    /// Streaming
    Running,
    /// Teardown in progress
    Stopping,
}

impl fmt::Display for PipeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipeState::Uninitialized => "uninitialized",
            PipeState::Created => "created",
            PipeState::Configured => "configured",
            PipeState::Running => "running",
            PipeState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Slack on top of one worker iteration when waiting for a control reply
const COMMAND_REPLY_MARGIN: Duration = Duration::from_secs(1);

/// One pipeline stage driving one device node
pub struct Pipe {
    config: PipeConfig,
    state: PipeState,
    shared: Arc<PipeShared>,
    /// `None` while the worker thread owns it
    core: Option<PipeCore>,
    worker: Option<JoinHandle<WorkerExit>>,
    /// Disconnects when the worker loop returns
    worker_exit: Option<Receiver<()>>,
    commands: Option<Sender<NodeCommand>>,
    cancel: Option<CancelToken>,
    input: FrameQueue,
    output: Option<Sender<Frame>>,
    frame_done: Option<Sender<FrameDone>>,
    pool: BufferPool,
    info: Option<PipeInfo>,
    instant_mode: bool,
    /// Failure of a worker that was joined before `stop()`
    worker_error: Option<PipeError>,
}

impl Pipe {
    /// Create a pipe over `node`
    pub fn new(config: PipeConfig, node: Box<dyn DeviceNode>) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(PipeShared::default());
        let input = FrameQueue::new();
        let pool = BufferPool::new(&config.name);
        let core = PipeCore::new(
            config.clone(),
            node,
            pool.clone(),
            Arc::clone(&shared),
            input.receiver(),
        );

        Ok(Self {
            config,
            state: PipeState::Uninitialized,
            shared,
            core: Some(core),
            worker: None,
            worker_exit: None,
            commands: None,
            cancel: None,
            input,
            output: None,
            frame_done: None,
            pool,
            info: None,
            instant_mode: false,
            worker_error: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn id(&self) -> PipeId {
        self.config.pipe_id
    }

    pub fn state(&self) -> PipeState {
        self.state
    }

    pub fn config(&self) -> &PipeConfig {
        &self.config
    }

    /// Geometry applied by the last `setup()`
    pub fn info(&self) -> Option<&PipeInfo> {
        self.info.as_ref()
    }

    /// Producer end of the input queue, for the upstream stage
    pub fn input_queue(&self) -> Sender<Frame> {
        self.input.sender()
    }

    /// Push a frame onto the input queue
    pub fn push_frame(&self, frame: Frame) -> Result<()> {
        self.input.push(frame)
    }

    /// Frames waiting on the input queue
    pub fn input_len(&self) -> usize {
        self.input.len()
    }

    /// Connect the downstream stage
    pub fn set_output_queue(&mut self, output: Sender<Frame>) -> Result<()> {
        let core = self.core_mut("set_output_queue")?;
        core.output = Some(output.clone());
        self.output = Some(output);
        Ok(())
    }

    /// Receive a [`FrameDone`] notice for every frame leaving the stage
    pub fn set_frame_done_queue(&mut self, frame_done: Sender<FrameDone>) -> Result<()> {
        let core = self.core_mut("set_frame_done_queue")?;
        core.frame_done = Some(frame_done.clone());
        self.frame_done = Some(frame_done);
        Ok(())
    }

    pub fn frame_done_queue(&self) -> Option<Sender<FrameDone>> {
        self.frame_done.clone()
    }

    /// Handle to the buffer pool allocated by `setup()`
    pub fn buffer_pool(&self) -> BufferPool {
        self.pool.clone()
    }

    fn require(&self, allowed: &[PipeState], operation: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(PipeError::InvalidState {
                operation,
                state: self.state.to_string(),
            })
        }
    }

    fn core_mut(&mut self, operation: &'static str) -> Result<&mut PipeCore> {
        if self.core.is_none() {
            self.reclaim_finished_worker();
        }
        self.core.as_mut().ok_or_else(|| PipeError::InvalidState {
            operation,
            state: "driven by the worker thread".to_string(),
        })
    }

    /// Open the device node
    pub fn create(&mut self) -> Result<()> {
        self.require(&[PipeState::Uninitialized], "create")?;
        let device_id = self.config.device_id;
        let core = self.core_mut("create")?;
        core.node
            .open(device_id)
            .with_context(|| format!("{}: open device {}", core.name, device_id))?;
        self.state = PipeState::Created;
        tracing::info!("{}: created on device {}", self.config.name, device_id);
        Ok(())
    }

    /// Apply geometry and allocate the buffer pool
    ///
    /// Repeating a setup with identical parameters keeps the existing pool.
    /// Changed parameters release the pool first, discarding any frames
    /// still held by primed buffers.
    pub fn setup(&mut self, info: PipeInfo) -> Result<()> {
        self.require(&[PipeState::Created, PipeState::Configured], "setup")?;
        info.validate()?;
        let format = info.node_format();
        let configured = self.state == PipeState::Configured;
        let core = self.core_mut("setup")?;

        let format_unchanged = core.node.current_format().as_ref() == Some(&format);
        if configured && format_unchanged && core.node.pool_size() == info.buffer_count as usize {
            tracing::debug!("{}: setup unchanged, keeping pool", core.name);
            self.info = Some(info);
            return Ok(());
        }

        if configured {
            let flushed = core.flush_running();
            if flushed > 0 {
                tracing::warn!("{}: reconfigure discarded {} primed frames", core.name, flushed);
            }
            core.node.release_pool().context("release pool for reconfigure")?;
            core.pool.clear();
            core.reset_table(0);
        }

        if !format_unchanged {
            core.node.configure(&format).context("configure node")?;
        }
        let buffers = core.node.allocate_buffer_pool().context("allocate buffer pool")?;
        let count = buffers.len();
        core.reset_table(count);
        core.pool.fill(buffers);
        tracing::info!(
            "{}: configured {}x{} {} ({} planes), {} buffers",
            core.name,
            info.width,
            info.height,
            info.pixel_format,
            format.plane_count,
            count
        );

        self.info = Some(info);
        self.state = PipeState::Configured;
        Ok(())
    }

    /// Queue priming buffers from the pool before streaming starts
    ///
    /// Returns the number of buffers lent to the node. Request-driven nodes
    /// are not primed.
    pub fn prepare(&mut self) -> Result<usize> {
        self.require(&[PipeState::Configured], "prepare")?;
        let mode = self.config.node_mode;
        let count = self.config.prepare_count as usize;
        let core = self.core_mut("prepare")?;

        if !mode.needs_priming() {
            tracing::warn!("{}: {:?} node is not primed", core.name, mode);
            return Ok(0);
        }

        let mut primed = 0;
        for _ in 0..count {
            let Some(buffer) = core.pool.acquire() else {
                tracing::warn!("{}: pool exhausted after {} priming buffers", core.name, primed);
                break;
            };
            let frame = Frame::new(0).with_buffer(core.pipe_id, buffer);
            if let SubmitOutcome::Submitted(_) = core.submit_frame(frame).context("prime node")? {
                primed += 1;
            }
        }
        tracing::debug!("{}: primed {} buffers", core.name, primed);
        Ok(primed)
    }

    /// Start streaming and open the gate for the worker loop
    pub fn start(&mut self) -> Result<()> {
        self.require(&[PipeState::Configured], "start")?;
        let core = self.core_mut("start")?;
        core.node.start_streaming().context("start streaming")?;
        core.reset_loop_state();
        {
            let mut stats = self.shared.stats();
            stats.loop_iterations = 0;
            stats.last_loop_interval = Duration::ZERO;
        }
        self.shared.started.store(true, Ordering::SeqCst);
        self.state = PipeState::Running;
        tracing::info!("{}: started", self.config.name);
        Ok(())
    }

    /// Spawn the worker thread if it is not already running
    pub fn start_thread(&mut self) -> Result<()> {
        self.require(&[PipeState::Running], "start_thread")?;
        if self.instant_mode {
            return Err(PipeError::InvalidState {
                operation: "start_thread",
                state: "instant mode".to_string(),
            });
        }
        if self.is_thread_running() {
            tracing::debug!("{}: worker already running", self.config.name);
            return Ok(());
        }
        if self.output.is_none() {
            return Err(PipeError::Channel(format!(
                "{}: no output queue set",
                self.config.name
            )));
        }

        let core = self
            .core
            .take()
            .ok_or_else(|| PipeError::WorkerFailed("device node was lost".to_string()))?;
        let (token, listener) = cancel_pair();
        let (command_tx, command_rx) = unbounded();
        let (exit_tx, exit_rx) = bounded(0);
        self.shared.thread_running.store(true, Ordering::SeqCst);

        let spawned = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || worker::run(core, listener, command_rx, exit_tx));
        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                self.worker_exit = Some(exit_rx);
                self.commands = Some(command_tx);
                self.cancel = Some(token);
                Ok(())
            }
            Err(e) => {
                // The core went down with the closure
                self.shared.thread_running.store(false, Ordering::SeqCst);
                self.shared.started.store(false, Ordering::SeqCst);
                self.state = PipeState::Uninitialized;
                tracing::error!("{}: failed to spawn worker: {}", self.config.name, e);
                Err(PipeError::Io(e).with_context("spawn worker thread"))
            }
        }
    }

    /// Ask the worker to exit, waking it if it is blocked on the input queue
    ///
    /// Hardware is left untouched; `stop()` or `stop_thread_and_wait()`
    /// collects the thread.
    pub fn stop_thread(&mut self) {
        if let Some(token) = self.cancel.as_mut() {
            token.cancel();
            tracing::debug!("{}: worker exit requested", self.config.name);
        }
    }

    /// Ask the worker to exit and wait up to `timeout` for it
    ///
    /// On timeout the worker keeps its exit request and can be waited for
    /// again.
    pub fn stop_thread_and_wait(&mut self, timeout: Duration) -> Result<()> {
        self.stop_thread();
        if self.worker.is_none() {
            return Ok(());
        }
        if let Some(exit) = self.worker_exit.as_ref() {
            if let Err(RecvTimeoutError::Timeout) = exit.recv_timeout(timeout) {
                return Err(PipeError::Timeout(format!(
                    "{}: worker did not exit within {:?}",
                    self.config.name, timeout
                )));
            }
        }

        if let Some(error) = self.join_worker() {
            tracing::warn!("{}: {}", self.config.name, error);
            self.worker_error = Some(error);
        }
        Ok(())
    }

    pub fn is_thread_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Whether the worker loop gate is open
    pub fn flag_start(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    /// Idle the worker loop without tearing anything down
    pub fn set_stop_flag(&self) {
        self.shared.soft_stop.store(true, Ordering::SeqCst);
        tracing::debug!("{}: soft stop set", self.config.name);
    }

    pub fn clear_stop_flag(&self) {
        self.shared.soft_stop.store(false, Ordering::SeqCst);
        tracing::debug!("{}: soft stop cleared", self.config.name);
    }

    pub fn is_stop_flag_set(&self) -> bool {
        self.shared.soft_stop.load(Ordering::SeqCst)
    }

    /// Cancel and join the worker, taking the core back
    fn join_worker(&mut self) -> Option<PipeError> {
        if let Some(mut token) = self.cancel.take() {
            token.cancel();
        }
        self.worker_exit = None;
        self.commands = None;
        let handle = self.worker.take()?;
        match handle.join() {
            Ok(exit) => {
                self.core = Some(exit.core);
                exit.result
                    .err()
                    .map(|e| PipeError::WorkerFailed(e.to_string()))
            }
            Err(_) => {
                self.shared.thread_running.store(false, Ordering::SeqCst);
                Some(PipeError::WorkerFailed(
                    "worker thread panicked, device node lost".to_string(),
                ))
            }
        }
    }

    /// Take the core back from a worker that already exited on its own
    fn reclaim_finished_worker(&mut self) {
        if self.worker.as_ref().is_some_and(JoinHandle::is_finished) {
            if let Some(error) = self.join_worker() {
                self.worker_error = Some(error);
            }
        }
    }

    /// Stop streaming and tear the pipe down to `Created`
    ///
    /// Frames still in flight or queued are dumped, counted as flushed and
    /// discarded; their buffers go back to the pool before it is released.
    /// Teardown always runs to the end; the first failure met on the way,
    /// including a worker that ended on a hardware error, is returned.
    pub fn stop(&mut self) -> Result<()> {
        self.require(&[PipeState::Running, PipeState::Configured], "stop")?;
        let was_running = self.state == PipeState::Running;
        self.state = PipeState::Stopping;
        self.shared.started.store(false, Ordering::SeqCst);

        let joined = self.join_worker();
        let mut first_error = self.worker_error.take().or(joined);

        let Some(core) = self.core.as_mut() else {
            self.state = PipeState::Uninitialized;
            return Err(first_error.unwrap_or_else(|| {
                PipeError::WorkerFailed("device node lost".to_string())
            }));
        };

        if was_running {
            match core.node.stop_streaming() {
                Ok(returned) => {
                    for buffer in returned {
                        core.pool.release(buffer);
                    }
                }
                Err(e) => {
                    tracing::error!("{}: stop streaming failed: {}", core.name, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        let in_flight = core.table.len();
        let queued = core.input.len();
        if in_flight + queued > 0 {
            tracing::warn!(
                "{}: stopping with {} frames in flight and {} queued",
                core.name,
                in_flight,
                queued
            );
            core.dump(PipeState::Stopping).log();
        }
        core.flush_running();
        core.flush_input();

        if let Err(e) = core.node.release_pool() {
            tracing::error!("{}: release pool failed: {}", core.name, e);
            first_error.get_or_insert(e);
        }
        core.pool.clear();
        core.reset_table(0);
        core.reset_loop_state();

        self.shared.soft_stop.store(false, Ordering::SeqCst);
        self.instant_mode = false;
        self.state = PipeState::Created;
        tracing::info!("{}: stopped", self.config.name);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop if needed and close the device node
    pub fn destroy(&mut self) -> Result<()> {
        let mut first_error = match self.state {
            PipeState::Uninitialized | PipeState::Stopping => {
                return Err(PipeError::InvalidState {
                    operation: "destroy",
                    state: self.state.to_string(),
                })
            }
            PipeState::Running | PipeState::Configured => self.stop().err(),
            PipeState::Created => None,
        };

        if let Some(core) = self.core.as_mut() {
            if let Err(e) = core.node.close() {
                tracing::error!("{}: close failed: {}", core.name, e);
                first_error.get_or_insert(e);
            }
        }
        self.info = None;
        self.state = PipeState::Uninitialized;
        tracing::info!("{}: destroyed", self.config.name);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Command channel of a live worker, or `None` if this thread owns the node
    fn worker_commands(&mut self) -> Option<Sender<NodeCommand>> {
        if self.core.is_none() {
            self.reclaim_finished_worker();
        }
        match self.core {
            Some(_) => None,
            None => self.commands.clone(),
        }
    }

    /// Hand `command` to the worker and wait for its reply
    fn ask_worker<T>(
        &self,
        commands: Sender<NodeCommand>,
        command: NodeCommand,
        reply: Receiver<Result<T>>,
    ) -> Result<T> {
        commands.send(command).map_err(|_| {
            PipeError::WorkerFailed(format!("{}: worker exited", self.config.name))
        })?;
        let wait = self.config.input_timeout()
            + self.config.retrieve_timeout()
            + self.config.soft_stop_idle()
            + COMMAND_REPLY_MARGIN;
        match reply.recv_timeout(wait) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(PipeError::Timeout(format!(
                "{}: worker did not answer within {:?}",
                self.config.name, wait
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(PipeError::WorkerFailed(format!(
                "{}: worker exited before answering",
                self.config.name
            ))),
        }
    }

    /// Forward a driver control to the device node
    pub fn set_control(&mut self, id: u32, value: i32) -> Result<()> {
        if let Some(commands) = self.worker_commands() {
            let (reply, answer) = bounded(1);
            return self.ask_worker(commands, NodeCommand::SetControl { id, value, reply }, answer);
        }
        let core = self.core_mut("set_control")?;
        core.node.set_control(id, value)
    }

    /// Read a driver control from the device node
    pub fn get_control(&mut self, id: u32) -> Result<i32> {
        if let Some(commands) = self.worker_commands() {
            let (reply, answer) = bounded(1);
            return self.ask_worker(commands, NodeCommand::GetControl { id, reply }, answer);
        }
        let core = self.core_mut("get_control")?;
        core.node.get_control(id)
    }

    /// Make the node hand back every buffer it holds
    ///
    /// Used before `stop()` on a node that may never return its buffers on
    /// its own. Only [`FORCE_DONE_CONTROL`] is accepted as `id`.
    pub fn force_done(&mut self, id: u32, value: i32) -> Result<()> {
        if id != FORCE_DONE_CONTROL {
            return Err(PipeError::InvalidConfig(format!(
                "{:#x} is not the force-done control",
                id
            )));
        }
        match self.set_control(id, value) {
            Ok(()) => {
                tracing::debug!("{}: force done", self.config.name);
                Ok(())
            }
            Err(e) => {
                tracing::error!("{}: force done failed: {}", self.config.name, e);
                self.dump();
                Err(e)
            }
        }
    }

    /// Turn the sensor stream on or off
    pub fn sensor_stream(&mut self, on: bool) -> Result<()> {
        self.set_control(STREAM_CONTROL, i32::from(on))
            .with_context(|| format!("{}: sensor stream {}", self.config.name, on))
    }

    /// Occupied slots of the running-frame table
    pub fn running_frame_count(&self) -> usize {
        match &self.core {
            Some(core) => core.table.len(),
            None => self.outstanding(),
        }
    }

    /// Buffers lent to hardware
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PipeStats {
        self.shared.stats().clone()
    }

    /// Device node counters; unavailable while the worker owns the node
    pub fn node_stats(&self) -> Option<NodeStats> {
        self.core.as_ref().map(|core| core.node.stats())
    }

    /// Snapshot the pipe and log it
    ///
    /// While the worker runs, slots come from the snapshot it republishes on
    /// every table change.
    pub fn dump(&self) -> PipeDump {
        let dump = match &self.core {
            Some(core) => core.dump(self.state),
            None => PipeDump {
                name: self.config.name.clone(),
                state: self.state,
                started: self.flag_start(),
                soft_stop: self.is_stop_flag_set(),
                thread_running: self.is_thread_running(),
                outstanding: self.outstanding(),
                pool_size: self.pool.size(),
                pool_available: self.pool.available(),
                input_queued: self.input.len(),
                slots: self.shared.slots().clone(),
                stats: self.stats(),
            },
        };
        dump.log();
        dump
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        if self.state != PipeState::Uninitialized {
            if let Err(e) = self.destroy() {
                tracing::warn!("{}: teardown on drop: {}", self.config.name, e);
            }
        } else if let Some(error) = self.join_worker() {
            tracing::warn!("{}: {}", self.config.name, error);
        }
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("name", &self.config.name)
            .field("state", &self.state)
            .field("thread_running", &self.is_thread_running())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
