//! Per-frame node-group crop propagation
//!
//! A leader pipe copies the node-group geometry a frame carries into the
//! request block of the outgoing buffer, stamping each node with its hardware
//! video id. The last geometry applied per node is kept only to log changes.

use crate::config::PerframeNodeGroupInfo;
use crate::types::{Frame, NodeCrop, NodeGroup, ShotMetadata};

/// Last crop applied to the leader and to each capture sub-node
#[derive(Debug, Default)]
pub struct NodeGroupTracker {
    leader: Option<NodeCrop>,
    captures: Vec<Option<NodeCrop>>,
}

impl NodeGroupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the leader crop; returns true if the geometry changed
    pub fn observe_leader(&mut self, crop: &NodeCrop) -> bool {
        let changed = self
            .leader
            .as_ref()
            .map_or(true, |last| last.geometry_differs(crop));
        self.leader = Some(*crop);
        changed
    }

    /// Record the crop of capture `slot`; returns true if the geometry changed
    pub fn observe_capture(&mut self, slot: usize, crop: &NodeCrop) -> bool {
        if self.captures.len() <= slot {
            self.captures.resize(slot + 1, None);
        }
        let changed = self.captures[slot]
            .as_ref()
            .map_or(true, |last| last.geometry_differs(crop));
        self.captures[slot] = Some(*crop);
        changed
    }

    pub fn reset(&mut self) {
        self.leader = None;
        self.captures.clear();
    }
}

/// Write the frame's node-group geometry into `meta`
///
/// Only a leader pipe writes geometry. The group is looked up at the
/// configured info index; capture slots follow `capture_video_ids` and any
/// slot the frame does not request stays unrequested.
pub fn merge_node_group(
    name: &str,
    info: &PerframeNodeGroupInfo,
    frame: &Frame,
    meta: &mut ShotMetadata,
    tracker: &mut NodeGroupTracker,
) {
    if !info.is_leader() {
        return;
    }
    meta.node_group = NodeGroup::default();

    let Some(group) = frame.node_group(info.info_index) else {
        tracing::trace!(
            "{}: frame {} has no node group at index {}",
            name,
            frame.sequence(),
            info.info_index
        );
        return;
    };

    if group.leader.request {
        if tracker.observe_leader(&group.leader) {
            tracing::debug!(
                "{}: leader crop in {} out {} (frame {})",
                name,
                group.leader.input,
                group.leader.output,
                frame.sequence()
            );
        }
        meta.node_group.leader = NodeCrop {
            video_id: info.leader_video_id,
            ..group.leader
        };
    }

    meta.node_group.captures = info
        .capture_video_ids
        .iter()
        .enumerate()
        .map(|(slot, &video_id)| match group.captures.get(slot) {
            Some(crop) if crop.request => {
                if tracker.observe_capture(slot, crop) {
                    tracing::debug!(
                        "{}: capture {} (video {}) crop in {} out {} (frame {})",
                        name,
                        slot,
                        video_id,
                        crop.input,
                        crop.output,
                        frame.sequence()
                    );
                }
                NodeCrop { video_id, ..*crop }
            }
            _ => NodeCrop::default(),
        })
        .collect();
}
