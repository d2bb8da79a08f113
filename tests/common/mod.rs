//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use crossbeam_channel::Receiver;
use pipe_stage::Frame;
use std::time::{Duration, Instant};

/// Pipe id used by every test pipe
pub const TEST_PIPE: pipe_stage::PipeId = pipe_stage::PipeId(1);

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Receive `count` frames or panic after the test timeout
pub fn recv_frames(rx: &Receiver<Frame>, count: usize) -> Vec<Frame> {
    (0..count)
        .map(|i| {
            rx.recv_timeout(test_timeout())
                .unwrap_or_else(|_| panic!("timed out waiting for frame {} of {}", i + 1, count))
        })
        .collect()
}

/// Poll `condition` until it holds or the test timeout expires
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + test_timeout();
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
