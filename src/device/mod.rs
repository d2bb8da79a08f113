//! Device node layer
//!
//! A device node is an open handle to one hardware data channel: it accepts
//! indexed buffers, processes them and hands them back, possibly out of
//! submission order. The pipe only talks to nodes through [`DeviceNode`].
//!
//! # Components
//!
//! - [`DeviceNode`] - Trait every node implementation provides
//! - [`Rejected`] - A refused submit, carrying the buffer back to the caller
//! - [`NodeStats`] - Per-node submit/retrieve counters
//! - [`MockNode`] - Simulated node for tests and the demo binary (feature-gated)

#[cfg(feature = "mock-node")]
pub mod mock_node;
pub mod node_trait;

#[cfg(feature = "mock-node")]
pub use mock_node::{MockNode, MockNodeHandle, RetrieveStep};
pub use node_trait::{DeviceNode, NodeStats, Rejected, FORCE_DONE_CONTROL, STREAM_CONTROL};

#[cfg(test)]
pub use node_trait::MockDeviceNode;
