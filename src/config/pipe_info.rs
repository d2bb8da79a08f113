//! Per-setup geometry for a pipe
//!
//! [`PipeInfo`] is what the external configuration layer hands to
//! `Pipe::setup()`: frame size, pixel layout and buffer-pool size. The values
//! are taken as given; computing them (crop, zoom, binning) happens upstream.

use crate::error::{PipeError, Result};
use serde::{Deserialize, Serialize};

/// Geometry and pool size for one setup of a pipe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeInfo {
    pub width: u32,
    pub height: u32,
    /// Pixel format as a fourcc string, e.g. "NV21"
    pub pixel_format: String,
    /// Bytes per image plane; an empty list lets the node compute them
    #[serde(default)]
    pub bytes_per_plane: Vec<u32>,
    /// Number of image planes, not counting the metadata plane
    pub image_planes: u32,
    /// Size of the device node's buffer pool
    pub buffer_count: u32,
}

impl PipeInfo {
    pub fn new(width: u32, height: u32, pixel_format: impl Into<String>, buffer_count: u32) -> Self {
        Self {
            width,
            height,
            pixel_format: pixel_format.into(),
            bytes_per_plane: Vec::new(),
            image_planes: 1,
            buffer_count,
        }
    }

    pub fn with_planes(mut self, image_planes: u32) -> Self {
        self.image_planes = image_planes;
        self
    }

    pub fn with_bytes_per_plane(mut self, bytes_per_plane: Vec<u32>) -> Self {
        self.bytes_per_plane = bytes_per_plane;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(PipeError::InvalidConfig(format!(
                "invalid size {}x{}",
                self.width, self.height
            )));
        }
        if self.buffer_count == 0 {
            return Err(PipeError::InvalidConfig("buffer_count is 0".to_string()));
        }
        if self.image_planes == 0 {
            return Err(PipeError::InvalidConfig("image_planes is 0".to_string()));
        }
        if self.pixel_format.len() != 4 {
            return Err(PipeError::InvalidConfig(format!(
                "pixel format '{}' is not a fourcc",
                self.pixel_format
            )));
        }
        if !self.bytes_per_plane.is_empty() && self.bytes_per_plane.len() != self.image_planes as usize {
            return Err(PipeError::InvalidConfig(format!(
                "{} plane sizes given for {} planes",
                self.bytes_per_plane.len(),
                self.image_planes
            )));
        }
        Ok(())
    }

    /// Format handed to `DeviceNode::configure`, with the metadata plane added
    pub fn node_format(&self) -> NodeFormat {
        NodeFormat {
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format.clone(),
            plane_count: self.image_planes + 1,
            bytes_per_plane: self.bytes_per_plane.clone(),
            buffer_count: self.buffer_count,
        }
    }
}

/// Format, plane layout and pool size applied to a device node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: String,
    /// Plane count including the trailing metadata plane
    pub plane_count: u32,
    pub bytes_per_plane: Vec<u32>,
    pub buffer_count: u32,
}

impl NodeFormat {
    /// Image planes only
    pub fn image_planes(&self) -> usize {
        self.plane_count.saturating_sub(1) as usize
    }

    /// Byte size of image plane `plane`, falling back to a packed estimate of
    /// width * height for the first plane and half of that for the others
    pub fn plane_size(&self, plane: usize) -> usize {
        if let Some(&size) = self.bytes_per_plane.get(plane) {
            return size as usize;
        }
        let luma = self.width as usize * self.height as usize;
        if plane == 0 {
            luma
        } else {
            luma / 2
        }
    }
}
