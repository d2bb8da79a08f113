//! # pipe-stage: per-stage frame scheduling for hardware imaging pipelines
//!
//! A camera pipeline is a chain of stages, each wrapping one hardware device
//! node. This crate implements one such stage: it takes frames from an input
//! queue, lends each frame's buffer to the device node, takes buffers back
//! (possibly out of submission order), reconciles them with their frames by
//! buffer index and forwards the frames to the next stage.
//!
//! ## Architecture
//!
//! - **Device**: The [`DeviceNode`] trait hides the driver; [`MockNode`]
//!   simulates one for tests and the demo binary
//! - **Pipe**: Lifecycle state machine, worker thread and instant mode
//! - **Running-frame table**: Buffer index to in-flight frame, one owner per slot
//! - **Communication**: Crossbeam channels between stages and for cancellation
//!
//! ## Configuration
//!
//! Static settings live in [`PipeConfig`] and load from TOML. Geometry is
//! handed to [`Pipe::setup`] as a [`PipeInfo`] by the configuration layer
//! above the pipe.
//!
//! ## Example
//!
//! ```ignore
//! use pipe_stage::{Frame, MockNode, Pipe, PipeConfig, PipeId, PipeInfo};
//!
//! fn main() -> pipe_stage::Result<()> {
//!     let config = PipeConfig::new(PipeId(1), "PIPE_3AA");
//!     let mut pipe = Pipe::new(config, Box::new(MockNode::new("3aa")))?;
//!     let (out_tx, out_rx) = crossbeam_channel::unbounded();
//!     pipe.set_output_queue(out_tx)?;
//!
//!     pipe.create()?;
//!     pipe.setup(PipeInfo::new(1920, 1080, "NV21", 8))?;
//!     pipe.start()?;
//!     pipe.start_thread()?;
//!
//!     if let Some(buffer) = pipe.buffer_pool().acquire() {
//!         pipe.push_frame(Frame::new(1).with_buffer(PipeId(1), buffer))?;
//!     }
//!     let frame = out_rx.recv().expect("pipe forwards every frame");
//!     pipe.destroy()
//! }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod pipe;
pub mod types;

// Re-export commonly used types
pub use config::{NodeMode, PipeConfig, PipeInfo};
#[cfg(feature = "mock-node")]
pub use device::{MockNode, MockNodeHandle, RetrieveStep};
pub use device::{DeviceNode, Rejected, FORCE_DONE_CONTROL, STREAM_CONTROL};
pub use error::{PipeError, Result};
pub use pipe::{BufferPool, Pipe, PipeDump, PipeState, PipeStats, QueueKind, SlotState};
pub use types::{Buffer, BufferState, Frame, FrameDone, PipeId, ShotMetadata, StageState};
