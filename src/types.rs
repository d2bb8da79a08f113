//! Core data types for the pipe stage
//!
//! This module contains the data structures that flow through a pipe:
//! logical frames, the hardware buffers they carry, and the metadata block
//! exchanged with the device node.
//!
//! # Main Types
//!
//! - [`Frame`] - A logical unit of pipeline work, moved by value between owners
//! - [`Buffer`] - An indexed hardware buffer with image planes and a metadata plane
//! - [`ShotMetadata`] - The request block written into a buffer's metadata plane
//! - [`DynamicMetadata`] - Values the hardware reports back after processing
//! - [`NodeGroup`] - Per-destination crop rectangles for one hardware request
//!
//! # Ownership
//!
//! A [`Frame`] is never cloned on the hot path. Upstream hands it to the input
//! queue, the worker moves it into the running-frame table while its buffer is
//! lent to hardware, then moves it to the output queue. The buffer itself is
//! moved into the device node on submit and handed back on retrieve.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a pipe (stage) within the pipeline
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PipeId(pub u32);

impl fmt::Debug for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PipeId({})", self.0)
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Axis-aligned rectangle in pixels (x, y, width, height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle anchored at the origin
    pub const fn sized(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}, {})", self.x, self.y, self.width, self.height)
    }
}

/// Target frame rate range for auto exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FpsRange {
    pub min: u32,
    pub max: u32,
}

/// Crop request for one node of a node group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeCrop {
    /// Whether this node takes part in the request
    pub request: bool,
    /// Crop applied to the node input
    pub input: Rect,
    /// Crop applied to the node output
    pub output: Rect,
    /// Hardware video id of the node
    pub video_id: u32,
}

impl NodeCrop {
    pub fn requested(input: Rect, output: Rect) -> Self {
        Self {
            request: true,
            input,
            output,
            video_id: 0,
        }
    }

    /// Whether input or output geometry differs from `other`
    pub fn geometry_differs(&self, other: &NodeCrop) -> bool {
        self.input != other.input || self.output != other.output
    }
}

/// Per-destination geometry of one hardware request: a leader node and its
/// capture sub-nodes, each independently addressable
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeGroup {
    pub leader: NodeCrop,
    pub captures: Vec<NodeCrop>,
}

impl NodeGroup {
    pub fn with_leader(leader: NodeCrop) -> Self {
        Self {
            leader,
            captures: Vec::new(),
        }
    }

    pub fn capture(mut self, crop: NodeCrop) -> Self {
        self.captures.push(crop);
        self
    }
}

/// Values reported by the hardware after processing a request
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DynamicMetadata {
    /// Frame counter as seen by the hardware
    pub frame_count: u32,
    /// Capture timestamp in nanoseconds
    pub timestamp_ns: u64,
    /// Exposure time actually applied
    pub exposure_ns: u64,
    /// Crop the hardware actually applied, if reported
    pub applied_crop: Option<Rect>,
}

/// Request block carried in a buffer's metadata plane
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShotMetadata {
    /// Frame count the request was issued for
    pub request_frame_count: u32,
    /// Scaler crop region
    pub crop_region: Rect,
    /// Auto exposure target frame rate
    pub ae_target_fps: Option<FpsRange>,
    /// Sensor frame duration
    pub frame_duration_ns: Option<u64>,
    /// Cancel any pending autofocus trigger
    pub af_trigger_cancel: bool,
    /// Per-node crop geometry for this request
    pub node_group: NodeGroup,
    /// Filled in by the hardware on completion
    pub dynamic: Option<DynamicMetadata>,
}

/// Per-stage completion state of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StageState {
    /// Waiting to be submitted
    #[default]
    Ready,
    /// Buffer lent to hardware
    Submitted,
    /// Hardware finished
    Done,
    /// Stage failed; the frame was forwarded without hardware processing
    Error,
}

impl StageState {
    /// `Done` and `Error` are the only states a frame leaves a pipe in
    pub fn is_terminal(self) -> bool {
        matches!(self, StageState::Done | StageState::Error)
    }
}

/// State of the buffer a frame holds for a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BufferState {
    #[default]
    Requested,
    Ready,
    Processing,
    Complete,
    Error,
}

/// One image plane of a buffer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Plane {
    pub data: Vec<u8>,
}

impl Plane {
    pub fn with_size(size: usize) -> Self {
        Self {
            data: vec![0u8; size],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A hardware-addressable buffer
///
/// `index` is unique within the device node's pool. The metadata block lives
/// in a reserved last plane, modeled here as the typed `meta` field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Buffer {
    pub index: usize,
    pub planes: Vec<Plane>,
    pub meta: Option<ShotMetadata>,
}

impl Buffer {
    /// Create a buffer with `image_planes` planes of `plane_size` bytes and an
    /// empty metadata plane
    pub fn new(index: usize, image_planes: usize, plane_size: usize) -> Self {
        Self {
            index,
            planes: (0..image_planes).map(|_| Plane::with_size(plane_size)).collect(),
            meta: Some(ShotMetadata::default()),
        }
    }

    /// A buffer with no backing memory
    pub fn empty(index: usize) -> Self {
        Self {
            index,
            planes: Vec::new(),
            meta: None,
        }
    }

    /// Number of planes including the metadata plane
    pub fn plane_count(&self) -> usize {
        self.planes.len() + usize::from(self.meta.is_some())
    }

    pub fn has_valid_memory(&self) -> bool {
        self.planes.iter().any(|p| !p.is_empty())
    }
}

/// What a frame carries for one stage it visits
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Entity {
    pub pipe: PipeId,
    pub buffer: Option<Buffer>,
    pub state: StageState,
    pub buffer_state: BufferState,
}

/// A logical unit of pipeline work
#[derive(Debug, PartialEq, Eq, Default)]
pub struct Frame {
    sequence: u64,
    entities: Vec<Entity>,
    /// Request metadata, copied into the buffer on submit
    pub metadata: Option<ShotMetadata>,
    /// Node-group geometry, indexed by per-frame info index
    pub node_groups: Vec<NodeGroup>,
}

impl Frame {
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            entities: Vec::new(),
            metadata: None,
            node_groups: Vec::new(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Attach a destination buffer for `pipe`
    pub fn with_buffer(mut self, pipe: PipeId, buffer: Buffer) -> Self {
        self.set_buffer(pipe, buffer);
        self
    }

    /// Register a stage without a buffer
    pub fn with_stage(mut self, pipe: PipeId) -> Self {
        self.entity_mut(pipe);
        self
    }

    pub fn with_metadata(mut self, metadata: ShotMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_node_group(mut self, group: NodeGroup) -> Self {
        self.node_groups.push(group);
        self
    }

    pub fn entity(&self, pipe: PipeId) -> Option<&Entity> {
        self.entities.iter().find(|e| e.pipe == pipe)
    }

    fn entity_mut(&mut self, pipe: PipeId) -> &mut Entity {
        let pos = match self.entities.iter().position(|e| e.pipe == pipe) {
            Some(pos) => pos,
            None => {
                self.entities.push(Entity {
                    pipe,
                    ..Entity::default()
                });
                self.entities.len() - 1
            }
        };
        &mut self.entities[pos]
    }

    pub fn set_buffer(&mut self, pipe: PipeId, buffer: Buffer) {
        let entity = self.entity_mut(pipe);
        entity.buffer = Some(buffer);
        entity.buffer_state = BufferState::Ready;
    }

    /// Take the buffer for `pipe` out of the frame
    pub fn take_buffer(&mut self, pipe: PipeId) -> Option<Buffer> {
        self.entities
            .iter_mut()
            .find(|e| e.pipe == pipe)
            .and_then(|e| e.buffer.take())
    }

    pub fn buffer(&self, pipe: PipeId) -> Option<&Buffer> {
        self.entity(pipe).and_then(|e| e.buffer.as_ref())
    }

    pub fn stage_state(&self, pipe: PipeId) -> Option<StageState> {
        self.entity(pipe).map(|e| e.state)
    }

    pub fn set_stage_state(&mut self, pipe: PipeId, state: StageState) {
        self.entity_mut(pipe).state = state;
    }

    pub fn buffer_state(&self, pipe: PipeId) -> Option<BufferState> {
        self.entity(pipe).map(|e| e.buffer_state)
    }

    pub fn set_buffer_state(&mut self, pipe: PipeId, state: BufferState) {
        self.entity_mut(pipe).buffer_state = state;
    }

    /// Mark the stage failed
    pub fn fail_stage(&mut self, pipe: PipeId) {
        let entity = self.entity_mut(pipe);
        entity.state = StageState::Error;
        entity.buffer_state = BufferState::Error;
    }

    /// Node-group geometry stored at `index`
    pub fn node_group(&self, index: usize) -> Option<&NodeGroup> {
        self.node_groups.get(index)
    }

    /// Store values the hardware reported for this frame
    pub fn store_dynamic_metadata(&mut self, dynamic: DynamicMetadata) {
        self.metadata.get_or_insert_with(ShotMetadata::default).dynamic = Some(dynamic);
    }

    pub fn dynamic_metadata(&self) -> Option<&DynamicMetadata> {
        self.metadata.as_ref().and_then(|m| m.dynamic.as_ref())
    }
}

/// Notice sent on a pipe's frame-done queue when a frame leaves the stage
///
/// The frame itself travels on the output queue; this is the side channel
/// a controller waits on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameDone {
    pub pipe: PipeId,
    pub sequence: u64,
    pub state: StageState,
    pub dynamic: Option<DynamicMetadata>,
}

impl FrameDone {
    pub fn of(pipe: PipeId, frame: &Frame) -> Self {
        Self {
            pipe,
            sequence: frame.sequence(),
            state: frame.stage_state(pipe).unwrap_or_default(),
            dynamic: frame.dynamic_metadata().cloned(),
        }
    }
}
