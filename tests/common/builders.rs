//! Test data builders for creating test objects

use super::TEST_PIPE;
use pipe_stage::types::{NodeGroup, Rect};
use pipe_stage::{Buffer, Frame, PipeId, ShotMetadata};

/// Builder for creating test Frames
pub struct FrameBuilder {
    sequence: u64,
    pipe: PipeId,
    buffer: Option<Buffer>,
    metadata: Option<ShotMetadata>,
    node_groups: Vec<NodeGroup>,
}

impl FrameBuilder {
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            pipe: TEST_PIPE,
            buffer: None,
            metadata: None,
            node_groups: Vec::new(),
        }
    }

    pub fn pipe(mut self, pipe: PipeId) -> Self {
        self.pipe = pipe;
        self
    }

    pub fn buffer(mut self, buffer: Buffer) -> Self {
        self.buffer = Some(buffer);
        self
    }

    /// Request block asking for `frame_count`
    pub fn request(mut self, frame_count: u32) -> Self {
        self.metadata
            .get_or_insert_with(ShotMetadata::default)
            .request_frame_count = frame_count;
        self
    }

    pub fn crop(mut self, crop: Rect) -> Self {
        self.metadata
            .get_or_insert_with(ShotMetadata::default)
            .crop_region = crop;
        self
    }

    pub fn node_group(mut self, group: NodeGroup) -> Self {
        self.node_groups.push(group);
        self
    }

    pub fn build(self) -> Frame {
        let mut frame = Frame::new(self.sequence);
        frame = match self.buffer {
            Some(buffer) => frame.with_buffer(self.pipe, buffer),
            None => frame.with_stage(self.pipe),
        };
        if let Some(metadata) = self.metadata {
            frame = frame.with_metadata(metadata);
        }
        for group in self.node_groups {
            frame = frame.with_node_group(group);
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_builder() {
        let frame = FrameBuilder::new(7)
            .buffer(Buffer::new(2, 1, 16))
            .request(7)
            .crop(Rect::sized(64, 32))
            .build();

        assert_eq!(frame.sequence(), 7);
        assert_eq!(frame.buffer(TEST_PIPE).map(|b| b.index), Some(2));
        let meta = frame.metadata.unwrap();
        assert_eq!(meta.request_frame_count, 7);
        assert_eq!(meta.crop_region, Rect::sized(64, 32));
    }
}
