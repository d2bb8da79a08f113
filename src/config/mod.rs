//! Configuration module for the pipe stage
//!
//! This module handles the static configuration of a pipe:
//! - Pipe identity and the device node it drives
//! - Worker loop timing (input wait, retrieve wait, soft-stop idle)
//! - Timeout logging and stall policy
//! - Per-frame node-group responsibility and the instant-mode profile
//!
//! The per-setup geometry handed over by the external configuration layer
//! lives in [`pipe_info`].
//!
//! # Files
//!
//! Pipe configurations are plain TOML:
//!
//! ```toml
//! pipe_id = 2
//! name = "PIPE_3AA"
//! node_mode = "streaming"
//! input_timeout_ms = 550
//! prepare_count = 2
//!
//! [perframe]
//! node_type = "leader"
//! info_index = 0
//! capture_video_ids = [31, 32]
//! ```

pub mod pipe_info;

pub use pipe_info::*;

use crate::error::{PipeError, Result};
use crate::types::PipeId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default wait for a frame on the input queue (0.55 s)
pub const DEFAULT_INPUT_TIMEOUT_MS: u64 = 550;

/// Default wait for a buffer to come back from the device node
pub const DEFAULT_RETRIEVE_TIMEOUT_MS: u64 = 550;

/// Consecutive timeouts logged at warn level before further ones are demoted
pub const DEFAULT_TIMEOUT_LOG_THRESHOLD: u32 = 5;

/// Sleep per loop iteration while the soft-stop flag is set
pub const DEFAULT_SOFT_STOP_IDLE_MS: u64 = 5;

/// Frame rate requested for instant-mode stabilization bursts
pub const DEFAULT_INSTANT_FPS: u32 = 120;

/// How the device node receives its data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeMode {
    /// Fed by an upstream hardware source; buffers must be queued before
    /// stream on, so priming applies
    #[default]
    Streaming,
    /// Memory-to-memory: each submitted buffer is a request of its own
    RequestDriven,
}

impl NodeMode {
    /// Whether `prepare()` should queue priming buffers for this mode
    pub fn needs_priming(self) -> bool {
        matches!(self, NodeMode::Streaming)
    }
}

/// Whether this pipe writes per-frame node-group geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerframeNodeType {
    /// Geometry is handled elsewhere
    #[default]
    None,
    /// This pipe's node leads the group and writes leader and capture crops
    Leader,
}

/// Per-frame node-group responsibility of a pipe
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PerframeNodeGroupInfo {
    pub node_type: PerframeNodeType,
    /// Index of this pipe's entry in a frame's node-group list
    pub info_index: usize,
    /// Hardware video id written for the leader
    pub leader_video_id: u32,
    /// Hardware video ids of the capture sub-nodes, one per capture slot
    pub capture_video_ids: Vec<u32>,
}

impl PerframeNodeGroupInfo {
    pub fn leader(info_index: usize, leader_video_id: u32, capture_video_ids: Vec<u32>) -> Self {
        Self {
            node_type: PerframeNodeType::Leader,
            info_index,
            leader_video_id,
            capture_video_ids,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.node_type == PerframeNodeType::Leader
    }

    /// Number of capture sub-nodes this pipe addresses
    pub fn capture_count(&self) -> usize {
        self.capture_video_ids.len()
    }
}

/// Request overrides applied by the instant (bypass) path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstantProfile {
    /// Crop width; 0 uses the configured frame width
    pub crop_width: u32,
    /// Crop height; 0 uses the configured frame height
    pub crop_height: u32,
    /// Fixed auto exposure frame rate
    pub target_fps: u32,
}

impl Default for InstantProfile {
    fn default() -> Self {
        Self {
            crop_width: 0,
            crop_height: 0,
            target_fps: DEFAULT_INSTANT_FPS,
        }
    }
}

/// Static configuration of one pipe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    /// Stage identifier; selects this pipe's entity in each frame
    pub pipe_id: PipeId,
    /// Human readable name, used as the thread name and log prefix
    pub name: String,
    /// Device id passed to `DeviceNode::open`
    pub device_id: u32,
    pub node_mode: NodeMode,
    pub input_timeout_ms: u64,
    pub retrieve_timeout_ms: u64,
    pub timeout_log_threshold: u32,
    pub soft_stop_idle_ms: u64,
    /// Consecutive retrieve timeouts (with frames outstanding) after which
    /// the worker gives up; unset means never
    pub max_consecutive_retrieve_timeouts: Option<u32>,
    /// Buffers queued by `prepare()` before streaming starts
    pub prepare_count: u32,
    pub perframe: PerframeNodeGroupInfo,
    pub instant: InstantProfile,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            pipe_id: PipeId(0),
            name: "pipe".to_string(),
            device_id: 0,
            node_mode: NodeMode::default(),
            input_timeout_ms: DEFAULT_INPUT_TIMEOUT_MS,
            retrieve_timeout_ms: DEFAULT_RETRIEVE_TIMEOUT_MS,
            timeout_log_threshold: DEFAULT_TIMEOUT_LOG_THRESHOLD,
            soft_stop_idle_ms: DEFAULT_SOFT_STOP_IDLE_MS,
            max_consecutive_retrieve_timeouts: None,
            prepare_count: 0,
            perframe: PerframeNodeGroupInfo::default(),
            instant: InstantProfile::default(),
        }
    }
}

impl PipeConfig {
    /// Create a config with defaults for the given id and name
    pub fn new(pipe_id: PipeId, name: impl Into<String>) -> Self {
        Self {
            pipe_id,
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn input_timeout(&self) -> Duration {
        Duration::from_millis(self.input_timeout_ms)
    }

    pub fn retrieve_timeout(&self) -> Duration {
        Duration::from_millis(self.retrieve_timeout_ms)
    }

    pub fn soft_stop_idle(&self) -> Duration {
        Duration::from_millis(self.soft_stop_idle_ms)
    }

    /// Check the values a running pipe depends on
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PipeError::InvalidConfig("pipe name is empty".to_string()));
        }
        if self.input_timeout_ms == 0 {
            return Err(PipeError::InvalidConfig(
                "input_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.retrieve_timeout_ms == 0 {
            return Err(PipeError::InvalidConfig(
                "retrieve_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_consecutive_retrieve_timeouts == Some(0) {
            return Err(PipeError::InvalidConfig(
                "max_consecutive_retrieve_timeouts must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse a config from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipeConfig = toml::from_str(content)
            .map_err(|e| PipeError::Config(format!("Failed to parse pipe config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!("Loaded pipe config '{}' from {:?}", config.name, path);
        Ok(config)
    }

    /// Save the config as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| PipeError::Config(format!("Failed to serialize pipe config: {}", e)))?;
        std::fs::write(path, content)?;
        tracing::debug!("Saved pipe config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipeConfig::default();
        assert_eq!(config.input_timeout(), Duration::from_millis(550));
        assert_eq!(config.timeout_log_threshold, 5);
        assert_eq!(config.node_mode, NodeMode::Streaming);
        assert!(config.max_consecutive_retrieve_timeouts.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config = PipeConfig::from_toml_str(
            r#"
            pipe_id = 2
            name = "PIPE_3AA"
            node_mode = "request_driven"
            retrieve_timeout_ms = 100
            max_consecutive_retrieve_timeouts = 20

            [perframe]
            node_type = "leader"
            info_index = 1
            leader_video_id = 10
            capture_video_ids = [31, 32]
            "#,
        )
        .unwrap();

        assert_eq!(config.pipe_id, PipeId(2));
        assert_eq!(config.name, "PIPE_3AA");
        assert_eq!(config.node_mode, NodeMode::RequestDriven);
        assert_eq!(config.retrieve_timeout(), Duration::from_millis(100));
        // untouched fields keep their defaults
        assert_eq!(config.input_timeout_ms, DEFAULT_INPUT_TIMEOUT_MS);
        assert_eq!(config.max_consecutive_retrieve_timeouts, Some(20));
        assert!(config.perframe.is_leader());
        assert_eq!(config.perframe.capture_count(), 2);
        assert_eq!(config.instant.target_fps, DEFAULT_INSTANT_FPS);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipeConfig::default();
        config.input_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(PipeError::InvalidConfig(_))));

        let mut config = PipeConfig::default();
        config.name = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = PipeConfig::default();
        config.max_consecutive_retrieve_timeouts = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_error_is_config_error() {
        let err = PipeConfig::from_toml_str("node_mode = \"sideways\"").unwrap_err();
        assert!(matches!(err, PipeError::Config(_)));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipe.toml");

        let mut config = PipeConfig::new(PipeId(7), "PIPE_MCSC");
        config.prepare_count = 3;
        config.perframe = PerframeNodeGroupInfo::leader(0, 5, vec![6]);
        config.save(&path).unwrap();

        let loaded = PipeConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_needs_priming() {
        assert!(NodeMode::Streaming.needs_priming());
        assert!(!NodeMode::RequestDriven.needs_priming());
    }
}
