//! Instant (bypass) mode
//!
//! Drives the device node synchronously from the caller's thread for short
//! bursts such as fast stabilization before a capture. It shares the
//! running-frame table and node with the threaded path, so the worker thread
//! must not be running while instant mode is on.

use super::queue::{push_to, QueueKind};
use super::worker::{RetrieveOutcome, SubmitOutcome};
use super::{Pipe, PipeState};
use crate::config::{InstantProfile, PipeInfo};
use crate::error::{PipeError, Result};
use crate::types::{FpsRange, Frame, Rect, ShotMetadata};
use std::sync::atomic::Ordering;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Overwrite the request block with the stabilization profile
pub(crate) fn apply_instant_profile(frame: &mut Frame, profile: &InstantProfile, info: &PipeInfo) {
    let width = if profile.crop_width == 0 {
        info.width
    } else {
        profile.crop_width
    };
    let height = if profile.crop_height == 0 {
        info.height
    } else {
        profile.crop_height
    };
    let fps = profile.target_fps.max(1);

    let meta = frame.metadata.get_or_insert_with(ShotMetadata::default);
    meta.crop_region = Rect::sized(width, height);
    meta.ae_target_fps = Some(FpsRange { min: fps, max: fps });
    meta.frame_duration_ns = Some(NANOS_PER_SEC / u64::from(fps));
    meta.af_trigger_cancel = true;
}

impl Pipe {
    fn require_instant(&self, operation: &'static str) -> Result<()> {
        if self.instant_mode {
            Ok(())
        } else {
            Err(PipeError::InvalidState {
                operation,
                state: format!("{} without instant mode", self.state),
            })
        }
    }

    /// Start streaming for synchronous use, without the worker thread
    pub fn instant_on(&mut self) -> Result<()> {
        self.require(&[PipeState::Configured], "instant_on")?;
        let core = self.core_mut("instant_on")?;
        core.node.start_streaming()?;
        core.reset_loop_state();
        self.shared.started.store(true, Ordering::SeqCst);
        self.instant_mode = true;
        self.state = PipeState::Running;
        tracing::info!("{}: instant mode on", self.config.name);
        Ok(())
    }

    /// Submit one frame from the caller's thread
    ///
    /// Returns the buffer index lent to hardware, or `None` if the frame had
    /// no usable buffer and was forwarded failed instead.
    pub fn instant_submit(&mut self, mut frame: Frame) -> Result<Option<usize>> {
        self.require_instant("instant_submit")?;
        let info = self.info.clone().ok_or_else(|| PipeError::InvalidState {
            operation: "instant_submit",
            state: "no pipe info".to_string(),
        })?;
        apply_instant_profile(&mut frame, &self.config.instant, &info);

        let core = self.core_mut("instant_submit")?;
        match core.submit_frame(frame)? {
            SubmitOutcome::Submitted(index) => Ok(Some(index)),
            SubmitOutcome::Bypassed => Ok(None),
        }
    }

    /// Retrieve one buffer from the caller's thread and return its frame
    ///
    /// Returns `None` if nothing is outstanding, on timeout, or when the
    /// hardware handed back an index no frame was waiting for. A completed
    /// frame is also announced on the frame-done queue.
    pub fn instant_retrieve(&mut self) -> Result<Option<Frame>> {
        self.require_instant("instant_retrieve")?;
        let core = self.core_mut("instant_retrieve")?;
        if core.table.is_empty() {
            return Ok(None);
        }
        match core.retrieve_frame()? {
            RetrieveOutcome::Completed(frame) => {
                core.notify_done(&frame);
                Ok(Some(frame))
            }
            RetrieveOutcome::Timeout | RetrieveOutcome::Unknown(_) => Ok(None),
        }
    }

    /// Push a frame onto the input or output queue
    pub fn instant_push_frame(&mut self, queue: QueueKind, frame: Frame) -> Result<()> {
        match queue {
            QueueKind::Input => self.input.push(frame),
            QueueKind::Output => match &self.output {
                Some(tx) => push_to(tx, frame),
                None => Err(PipeError::Channel(format!(
                    "{}: no output queue set",
                    self.config.name
                ))),
            },
        }
    }

    /// Leave instant mode, tearing down like `stop()`
    pub fn instant_off(&mut self) -> Result<()> {
        self.require_instant("instant_off")?;
        tracing::info!("{}: instant mode off", self.config.name);
        self.stop()
    }

    pub fn is_instant_mode(&self) -> bool {
        self.instant_mode
    }
}
