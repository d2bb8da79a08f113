//! Error handling for the pipe stage
//!
//! This module defines the crate-wide error type and a Result alias used by
//! the device node, the pipe lifecycle and the worker loop.

use thiserror::Error;

/// Main error type for pipe stage operations
#[derive(Error, Debug)]
pub enum PipeError {
    /// A bounded wait expired (input queue pop or device retrieve)
    #[error("Timeout: {0}")]
    Timeout(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The device node reported a driver failure
    #[error("Device error on {node}: {message}")]
    Device { node: String, message: String },

    /// An operation was called in a lifecycle state that does not allow it
    #[error("Cannot {operation} while pipe is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// Setup parameters were rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A buffer was submitted while its running-frame slot was still occupied
    #[error("Buffer index {index} already held by frame {occupant}, rejected frame {incoming}")]
    SlotOccupied {
        index: usize,
        occupant: u64,
        incoming: u64,
    },

    /// The device returned a buffer no frame is waiting for
    #[error("Device returned unknown buffer index {index}")]
    UnknownBuffer { index: usize },

    /// A frame carried no usable buffer for this stage
    #[error("Invalid buffer: {0}")]
    InvalidBuffer(String),

    /// Retrieve kept timing out with frames outstanding
    #[error("Hardware stalled after {consecutive_timeouts} consecutive retrieve timeouts")]
    HardwareStalled { consecutive_timeouts: u32 },

    /// The worker thread ended with an error or panicked
    #[error("Worker failed: {0}")]
    WorkerFailed(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// The device node does not implement the requested capability
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<PipeError>,
    },
}

impl PipeError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        PipeError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for a device failure on a named node
    pub fn device(node: impl Into<String>, message: impl Into<String>) -> Self {
        PipeError::Device {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Whether this error is an expected, recoverable condition
    ///
    /// Timeouts are transient: the worker loop logs them and retries.
    pub fn is_transient(&self) -> bool {
        match self {
            PipeError::Timeout(_) => true,
            PipeError::WithContext { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

/// Result type alias for pipe stage operations
pub type Result<T> = std::result::Result<T, PipeError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
