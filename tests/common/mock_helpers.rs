//! Mock construction helpers

use super::builders::FrameBuilder;
use super::TEST_PIPE;
use crossbeam_channel::{unbounded, Receiver};
use pipe_stage::{Frame, MockNode, MockNodeHandle, Pipe, PipeConfig, PipeInfo};

/// Config with short timeouts so failure paths run quickly
pub fn test_config() -> PipeConfig {
    let mut config = PipeConfig::new(TEST_PIPE, "PIPE_TEST");
    config.input_timeout_ms = 20;
    config.retrieve_timeout_ms = 50;
    config.soft_stop_idle_ms = 1;
    config
}

/// Small geometry with `buffers` buffers
pub fn test_info(buffers: u32) -> PipeInfo {
    PipeInfo::new(64, 32, "NV21", buffers)
}

/// Pipe over a mock node, created and configured with `buffers` buffers
pub fn configured_pipe(
    config: PipeConfig,
    buffers: u32,
) -> (Pipe, MockNodeHandle, Receiver<Frame>) {
    let node = MockNode::new("mock-node");
    let handle = node.handle();
    let mut pipe = Pipe::new(config, Box::new(node)).unwrap();
    let (tx, rx) = unbounded();
    pipe.set_output_queue(tx).unwrap();
    pipe.create().unwrap();
    pipe.setup(test_info(buffers)).unwrap();
    (pipe, handle, rx)
}

/// Configured pipe that is streaming with its worker thread running
pub fn running_pipe(config: PipeConfig, buffers: u32) -> (Pipe, MockNodeHandle, Receiver<Frame>) {
    let (mut pipe, handle, rx) = configured_pipe(config, buffers);
    pipe.start().unwrap();
    pipe.start_thread().unwrap();
    (pipe, handle, rx)
}

/// Frame `sequence` carrying the next free buffer from the pipe's pool
pub fn pooled_frame(pipe: &Pipe, sequence: u64) -> Frame {
    let buffer = pipe
        .buffer_pool()
        .acquire()
        .expect("test pool has a free buffer");
    FrameBuilder::new(sequence).buffer(buffer).request(sequence as u32).build()
}
