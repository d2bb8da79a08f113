//! Frame queues and worker cancellation
//!
//! Frames travel between stages over crossbeam channels. The worker's input
//! pop selects over the input channel and a cancel channel: dropping the
//! [`CancelToken`] disconnects the cancel channel, which wakes a blocked pop
//! at once instead of waiting for its timeout.

use crate::error::{PipeError, Result};
use crate::types::Frame;
use crossbeam_channel::{select, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// Which queue `instant_push_frame` targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Input,
    Output,
}

/// Result of waiting on the input queue
#[derive(Debug)]
pub enum PopOutcome {
    Frame(Frame),
    /// Nothing arrived within the timeout
    Timeout,
    /// The cancel token was dropped
    Cancelled,
    /// Every sender is gone
    Closed,
}

/// Owning end of a cancellation pair; dropping or cancelling it wakes the listener
#[derive(Debug)]
pub struct CancelToken {
    tx: Option<Sender<()>>,
}

impl CancelToken {
    pub fn cancel(&mut self) {
        self.tx.take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.is_none()
    }
}

/// Listening end of a cancellation pair
#[derive(Debug, Clone)]
pub struct CancelListener {
    rx: Receiver<()>,
}

impl CancelListener {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for `duration` unless cancelled first; returns true if cancelled
    pub fn sleep(&self, duration: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(duration),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}

/// Create a linked token and listener
pub fn cancel_pair() -> (CancelToken, CancelListener) {
    let (tx, rx) = crossbeam_channel::bounded(0);
    (CancelToken { tx: Some(tx) }, CancelListener { rx })
}

/// Unbounded FIFO of frames
#[derive(Debug, Clone)]
pub struct FrameQueue {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Producer end, handed to the upstream stage
    pub fn sender(&self) -> Sender<Frame> {
        self.tx.clone()
    }

    /// Consumer end
    pub fn receiver(&self) -> Receiver<Frame> {
        self.rx.clone()
    }

    pub fn push(&self, frame: Frame) -> Result<()> {
        push_to(&self.tx, frame)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Take everything currently queued
    pub fn drain(&self) -> Vec<Frame> {
        self.rx.try_iter().collect()
    }
}

/// Send a frame, mapping a closed channel to [`PipeError::Channel`]
pub fn push_to(tx: &Sender<Frame>, frame: Frame) -> Result<()> {
    tx.send(frame).map_err(|e| {
        PipeError::Channel(format!("queue closed, frame {} dropped", e.0.sequence()))
    })
}

/// Wait up to `timeout` for a frame, returning early on cancellation
pub fn pop_timeout(rx: &Receiver<Frame>, cancel: &CancelListener, timeout: Duration) -> PopOutcome {
    select! {
        recv(rx) -> msg => match msg {
            Ok(frame) => PopOutcome::Frame(frame),
            Err(_) => PopOutcome::Closed,
        },
        recv(cancel.rx) -> _ => PopOutcome::Cancelled,
        default(timeout) => PopOutcome::Timeout,
    }
}

/// Take a frame if one is already queued
pub fn try_pop(rx: &Receiver<Frame>) -> PopOutcome {
    match rx.try_recv() {
        Ok(frame) => PopOutcome::Frame(frame),
        Err(TryRecvError::Empty) => PopOutcome::Timeout,
        Err(TryRecvError::Disconnected) => PopOutcome::Closed,
    }
}
