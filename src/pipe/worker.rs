//! Pipe Worker Thread Implementation
//!
//! This module contains the state a pipe needs to drive its device node
//! ([`PipeCore`]) and the worker loop that runs it in a dedicated thread.
//!
//! # Ownership
//!
//! The core holds the device node, the running-frame table and the node-group
//! tracker. It is moved into the worker thread on `start_thread()` and handed
//! back through the join handle when the loop exits, so exactly one thread
//! touches the table at any time. Flags, the outstanding count, a per-slot
//! snapshot of the table and the statistics live in [`PipeShared`] and are
//! read by the owning `Pipe`.
//!
//! # Loop
//!
//! Each iteration runs a submit phase (pop one frame from the input queue,
//! lend its buffer to hardware) and then, if frames are outstanding, a
//! retrieve phase (take one buffer back and reconcile it with its frame by
//! index). While frames are outstanding the input pop does not block, so a
//! returned buffer is never held up by an idle upstream.
//!
//! Driver controls requested while the worker owns the node arrive as
//! [`NodeCommand`]s and are served at the top of each iteration.

use super::buffer_pool::BufferPool;
use super::node_group::{merge_node_group, NodeGroupTracker};
use super::queue::{pop_timeout, push_to, try_pop, CancelListener, PopOutcome};
use super::running_table::{RunningFrameTable, SlotState};
use super::stats::{PipeDump, PipeStats, TimeoutLogLimiter};
use super::PipeState;
use crate::config::PipeConfig;
use crate::device::DeviceNode;
use crate::error::{PipeError, Result};
use crate::types::{BufferState, Frame, FrameDone, PipeId, StageState};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// State shared between a pipe and its worker thread
#[derive(Debug, Default)]
pub(crate) struct PipeShared {
    pub started: AtomicBool,
    pub soft_stop: AtomicBool,
    pub thread_running: AtomicBool,
    pub outstanding: AtomicUsize,
    /// Table snapshot, republished on every insert, remove and drain
    slots: Mutex<Vec<SlotState>>,
    stats: Mutex<PipeStats>,
}

impl PipeShared {
    pub fn stats(&self) -> MutexGuard<'_, PipeStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn slots(&self) -> MutexGuard<'_, Vec<SlotState>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Node access requested by the pipe while the worker owns the node
pub(crate) enum NodeCommand {
    SetControl {
        id: u32,
        value: i32,
        reply: Sender<Result<()>>,
    },
    GetControl {
        id: u32,
        reply: Sender<Result<i32>>,
    },
}

/// What happened to a frame handed to [`PipeCore::submit_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubmitOutcome {
    /// Buffer lent to hardware under this index
    Submitted(usize),
    /// Frame forwarded failed without touching hardware
    Bypassed,
}

/// Result of one retrieve attempt
#[derive(Debug)]
pub(crate) enum RetrieveOutcome {
    Completed(Frame),
    Timeout,
    /// Hardware returned an index no frame was waiting for
    Unknown(usize),
}

enum Phase {
    Continue,
    Exit,
}

/// Everything the thread driving the device node owns
pub(crate) struct PipeCore {
    pub name: String,
    pub pipe_id: PipeId,
    pub config: PipeConfig,
    pub node: Box<dyn DeviceNode>,
    pub table: RunningFrameTable,
    pub groups: NodeGroupTracker,
    pub pool: BufferPool,
    pub shared: Arc<PipeShared>,
    pub input: Receiver<Frame>,
    pub output: Option<Sender<Frame>>,
    pub frame_done: Option<Sender<FrameDone>>,
    input_limiter: TimeoutLogLimiter,
    retrieve_limiter: TimeoutLogLimiter,
    last_sequence: Option<u64>,
}

/// Core handed back by the worker thread, with the reason the loop ended
pub(crate) struct WorkerExit {
    pub core: PipeCore,
    pub result: Result<()>,
}

impl PipeCore {
    pub fn new(
        config: PipeConfig,
        node: Box<dyn DeviceNode>,
        pool: BufferPool,
        shared: Arc<PipeShared>,
        input: Receiver<Frame>,
    ) -> Self {
        Self {
            name: config.name.clone(),
            pipe_id: config.pipe_id,
            input_limiter: TimeoutLogLimiter::new(config.timeout_log_threshold),
            retrieve_limiter: TimeoutLogLimiter::new(config.timeout_log_threshold),
            config,
            node,
            table: RunningFrameTable::default(),
            groups: NodeGroupTracker::new(),
            pool,
            shared,
            input,
            output: None,
            frame_done: None,
            last_sequence: None,
        }
    }

    /// Reset per-run loop state
    pub fn reset_loop_state(&mut self) {
        self.input_limiter.reset();
        self.retrieve_limiter.reset();
        self.last_sequence = None;
        self.groups.reset();
    }

    /// Publish the table for readers on other threads; slots go first so a
    /// reader that sees the new count also sees the slots behind it
    fn publish_table(&self) {
        *self.shared.slots() = self.table.snapshot();
        self.shared
            .outstanding
            .store(self.table.len(), Ordering::SeqCst);
    }

    /// Empty the table and resize it for a pool of `capacity` buffers
    pub fn reset_table(&mut self, capacity: usize) {
        self.table.reset(capacity);
        self.publish_table();
    }

    /// Submit steps for one frame: validate the buffer, check its slot, copy
    /// the request block and node-group geometry, lend the buffer to the
    /// node and record the frame as running.
    ///
    /// A frame that cannot be submitted is always forwarded failed. Errors
    /// are returned for an occupied slot and for a node that refused the
    /// buffer.
    pub fn submit_frame(&mut self, mut frame: Frame) -> Result<SubmitOutcome> {
        let pipe = self.pipe_id;

        let Some(mut buffer) = frame.take_buffer(pipe) else {
            self.fail_local(frame, "no buffer for this stage")?;
            return Ok(SubmitOutcome::Bypassed);
        };
        let unusable = if frame.buffer_state(pipe) == Some(BufferState::Error) {
            Some("buffer already in error")
        } else if !buffer.has_valid_memory() {
            Some("buffer has no valid memory")
        } else if buffer.index >= self.table.capacity() {
            Some("buffer index outside pool")
        } else {
            None
        };
        if let Some(reason) = unusable {
            frame.set_buffer(pipe, buffer);
            self.fail_local(frame, reason)?;
            return Ok(SubmitOutcome::Bypassed);
        }

        let index = buffer.index;
        if let Some(occupant) = self.table.occupant(index) {
            let error = PipeError::SlotOccupied {
                index,
                occupant,
                incoming: frame.sequence(),
            };
            self.record_violation(&error);
            frame.set_buffer(pipe, buffer);
            frame.fail_stage(pipe);
            self.shared.stats().failed_local += 1;
            self.forward(frame)?;
            return Err(error);
        }

        self.check_sequence(frame.sequence());

        if let Some(meta) = buffer.meta.as_mut() {
            match frame.metadata.as_ref() {
                Some(request) => *meta = request.clone(),
                None => meta.dynamic = None,
            }
            merge_node_group(&self.name, &self.config.perframe, &frame, meta, &mut self.groups);
        }

        if let Err(rejected) = self.node.submit(buffer) {
            let (buffer, error) = rejected.into_parts();
            tracing::error!(
                "{}: submit of buffer {} (frame {}) failed: {}",
                self.name,
                index,
                frame.sequence(),
                error
            );
            frame.set_buffer(pipe, buffer);
            frame.fail_stage(pipe);
            self.shared.stats().failed_local += 1;
            self.forward(frame)?;
            return Err(error.with_context(format!("{}: submit failed", self.name)));
        }

        frame.set_stage_state(pipe, StageState::Submitted);
        frame.set_buffer_state(pipe, BufferState::Processing);
        let sequence = frame.sequence();
        if let Err((mut frame, error)) = self.table.insert(index, frame) {
            // Slot and range were checked above; reaching this is a table defect
            self.record_violation(&error);
            frame.fail_stage(pipe);
            self.forward(frame)?;
            return Err(error);
        }
        self.publish_table();
        self.shared.stats().submitted += 1;
        tracing::trace!("{}: frame {} submitted on buffer {}", self.name, sequence, index);
        Ok(SubmitOutcome::Submitted(index))
    }

    /// Retrieve steps: take one buffer back from the node and reconcile it
    /// with the frame recorded for its index
    pub fn retrieve_frame(&mut self) -> Result<RetrieveOutcome> {
        let timeout = self.config.retrieve_timeout();
        let mut buffer = match self.node.retrieve(timeout) {
            Ok(buffer) => buffer,
            Err(e) if e.is_transient() => return self.on_retrieve_timeout(),
            Err(e) => {
                tracing::error!("{}: retrieve failed: {}", self.name, e);
                return Err(e.with_context(format!("{}: retrieve failed", self.name)));
            }
        };

        let streak = self.retrieve_limiter.reset();
        if streak > self.config.timeout_log_threshold {
            tracing::info!("{}: buffers returning again after {} timeouts", self.name, streak);
        }

        let index = buffer.index;
        let mut frame = match self.table.remove(index) {
            Ok(frame) => frame,
            Err(error) => {
                self.record_violation(&error);
                self.pool.release(buffer);
                return Ok(RetrieveOutcome::Unknown(index));
            }
        };
        self.publish_table();

        if let Some(dynamic) = buffer.meta.as_mut().and_then(|m| m.dynamic.take()) {
            frame.store_dynamic_metadata(dynamic);
        }
        let pipe = self.pipe_id;
        frame.set_buffer(pipe, buffer);
        frame.set_stage_state(pipe, StageState::Done);
        frame.set_buffer_state(pipe, BufferState::Complete);
        self.shared.stats().completed += 1;
        tracing::trace!("{}: frame {} done on buffer {}", self.name, frame.sequence(), index);
        Ok(RetrieveOutcome::Completed(frame))
    }

    fn on_retrieve_timeout(&mut self) -> Result<RetrieveOutcome> {
        self.shared.stats().retrieve_timeouts += 1;
        let warn = self.retrieve_limiter.record();
        let streak = self.retrieve_limiter.consecutive();
        if warn {
            tracing::warn!(
                "{}: no buffer back within {:?}, {} outstanding ({} in a row)",
                self.name,
                self.config.retrieve_timeout(),
                self.table.len(),
                streak
            );
        } else {
            tracing::trace!("{}: retrieve timeout ({} in a row)", self.name, streak);
        }

        if let Some(limit) = self.config.max_consecutive_retrieve_timeouts {
            if streak >= limit {
                tracing::error!(
                    "{}: hardware stalled, {} consecutive retrieve timeouts",
                    self.name,
                    streak
                );
                self.dump(PipeState::Running).log();
                return Err(PipeError::HardwareStalled {
                    consecutive_timeouts: streak,
                });
            }
        }
        Ok(RetrieveOutcome::Timeout)
    }

    fn check_sequence(&mut self, sequence: u64) {
        if let Some(last) = self.last_sequence {
            if sequence < last {
                tracing::warn!(
                    "{}: frame {} submitted after frame {}",
                    self.name,
                    sequence,
                    last
                );
            }
        }
        self.last_sequence = Some(sequence);
    }

    fn record_violation(&mut self, error: &PipeError) {
        self.shared.stats().protocol_violations += 1;
        tracing::error!("{}: protocol violation: {}", self.name, error);
        self.dump(PipeState::Running).log();
    }

    /// Mark a frame failed for this stage and pass it on
    pub fn fail_local(&mut self, mut frame: Frame, reason: &str) -> Result<()> {
        tracing::warn!(
            "{}: frame {} forwarded without processing: {}",
            self.name,
            frame.sequence(),
            reason
        );
        frame.fail_stage(self.pipe_id);
        self.shared.stats().failed_local += 1;
        self.forward(frame)
    }

    /// Push a frame to the output queue, then notify the frame-done queue
    pub fn forward(&mut self, frame: Frame) -> Result<()> {
        let notice = self
            .frame_done
            .as_ref()
            .map(|_| FrameDone::of(self.pipe_id, &frame));
        match &self.output {
            Some(tx) => push_to(tx, frame)?,
            None => tracing::warn!(
                "{}: no output queue, frame {} dropped",
                self.name,
                frame.sequence()
            ),
        }
        if let Some(notice) = notice {
            self.send_done(notice);
        }
        Ok(())
    }

    /// Tell the frame-done queue, if any, that `frame` left the stage
    pub fn notify_done(&self, frame: &Frame) {
        if self.frame_done.is_some() {
            self.send_done(FrameDone::of(self.pipe_id, frame));
        }
    }

    fn send_done(&self, notice: FrameDone) {
        let Some(tx) = &self.frame_done else { return };
        if tx.send(notice).is_err() {
            tracing::debug!("{}: frame-done queue closed", self.name);
        }
    }

    /// Serve control requests queued by the pipe
    fn serve_commands(&mut self, commands: &Receiver<NodeCommand>) {
        for command in commands.try_iter() {
            let delivered = match command {
                NodeCommand::SetControl { id, value, reply } => {
                    reply.send(self.node.set_control(id, value)).is_ok()
                }
                NodeCommand::GetControl { id, reply } => {
                    reply.send(self.node.get_control(id)).is_ok()
                }
            };
            if !delivered {
                tracing::debug!("{}: control caller stopped waiting", self.name);
            }
        }
    }

    /// Drop every in-flight frame; returns how many were discarded
    pub fn flush_running(&mut self) -> usize {
        let mut drained = self.table.drain();
        for (index, frame) in drained.iter_mut() {
            tracing::debug!(
                "{}: flushing frame {} held on buffer {}",
                self.name,
                frame.sequence(),
                index
            );
            if let Some(buffer) = frame.take_buffer(self.pipe_id) {
                self.pool.release(buffer);
            }
        }
        self.publish_table();
        self.shared.stats().flushed_frames += drained.len() as u64;
        drained.len()
    }

    /// Drop every frame still waiting on the input queue
    pub fn flush_input(&mut self) -> usize {
        let mut count = 0;
        for mut frame in self.input.try_iter() {
            tracing::debug!("{}: flushing queued frame {}", self.name, frame.sequence());
            if let Some(buffer) = frame.take_buffer(self.pipe_id) {
                self.pool.release(buffer);
            }
            count += 1;
        }
        self.shared.stats().flushed_frames += count as u64;
        count
    }

    pub fn dump(&self, state: PipeState) -> PipeDump {
        PipeDump {
            name: self.name.clone(),
            state,
            started: self.shared.started.load(Ordering::SeqCst),
            soft_stop: self.shared.soft_stop.load(Ordering::SeqCst),
            thread_running: self.shared.thread_running.load(Ordering::SeqCst),
            outstanding: self.table.len(),
            pool_size: self.pool.size(),
            pool_available: self.pool.available(),
            input_queued: self.input.len(),
            slots: self.table.snapshot(),
            stats: self.shared.stats().clone(),
        }
    }

    fn submit_phase(&mut self, cancel: &CancelListener) -> Result<Phase> {
        let outcome = if self.table.is_empty() {
            pop_timeout(&self.input, cancel, self.config.input_timeout())
        } else {
            try_pop(&self.input)
        };

        match outcome {
            PopOutcome::Frame(frame) => {
                self.input_limiter.reset();
                match self.submit_frame(frame) {
                    Ok(_) | Err(PipeError::SlotOccupied { .. }) => Ok(Phase::Continue),
                    Err(e) => Err(e),
                }
            }
            PopOutcome::Timeout => {
                if self.table.is_empty() {
                    self.on_input_timeout();
                }
                Ok(Phase::Continue)
            }
            PopOutcome::Cancelled | PopOutcome::Closed => Ok(Phase::Exit),
        }
    }

    fn on_input_timeout(&mut self) {
        if self.shared.soft_stop.load(Ordering::SeqCst) {
            return;
        }
        self.shared.stats().input_timeouts += 1;
        if self.input_limiter.record() {
            tracing::warn!(
                "{}: no input frame within {:?} ({} in a row)",
                self.name,
                self.config.input_timeout(),
                self.input_limiter.consecutive()
            );
        } else {
            tracing::trace!(
                "{}: input timeout ({} in a row)",
                self.name,
                self.input_limiter.consecutive()
            );
        }
    }

    fn retrieve_phase(&mut self) -> Result<()> {
        match self.retrieve_frame()? {
            RetrieveOutcome::Completed(frame) => self.forward(frame),
            RetrieveOutcome::Timeout | RetrieveOutcome::Unknown(_) => Ok(()),
        }
    }
}

/// Run the worker loop until cancelled or a hard failure
///
/// `exit` is dropped when the loop returns, which disconnects the pipe's
/// exit receiver.
pub(crate) fn run(
    mut core: PipeCore,
    cancel: CancelListener,
    commands: Receiver<NodeCommand>,
    exit: Sender<()>,
) -> WorkerExit {
    let shared = Arc::clone(&core.shared);
    tracing::info!("{}: worker started", core.name);

    let mut last_iteration = Instant::now();
    let result = loop {
        if cancel.is_cancelled() {
            break Ok(());
        }
        core.serve_commands(&commands);
        if shared.soft_stop.load(Ordering::SeqCst) || !shared.started.load(Ordering::SeqCst) {
            if cancel.sleep(core.config.soft_stop_idle()) {
                break Ok(());
            }
            continue;
        }

        match core.submit_phase(&cancel) {
            Ok(Phase::Continue) => {}
            Ok(Phase::Exit) => break Ok(()),
            Err(e) => break Err(e),
        }

        if !core.table.is_empty() && shared.started.load(Ordering::SeqCst) {
            if let Err(e) = core.retrieve_phase() {
                break Err(e);
            }
        }

        let now = Instant::now();
        {
            let mut stats = shared.stats();
            stats.loop_iterations += 1;
            stats.last_loop_interval = now - last_iteration;
        }
        last_iteration = now;
    };

    match &result {
        Ok(()) => tracing::info!("{}: worker stopped", core.name),
        Err(e) => tracing::error!("{}: worker stopped on error: {}", core.name, e),
    }
    shared.thread_running.store(false, Ordering::SeqCst);
    drop(exit);
    WorkerExit { core, result }
}
