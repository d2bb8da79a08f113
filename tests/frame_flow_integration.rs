//! Integration tests for frame flow through a pipe
//!
//! These tests validate the submit/retrieve path over a mock device node:
//! - Out-of-order buffer return, threaded and in instant mode
//! - Frames that never reach hardware, including a second frame on a held buffer
//! - Timeouts, stalls, unknown indices and hardware errors
//! - Metadata write-back and node-group propagation
//! - Frame-done notices

mod common;

use common::builders::FrameBuilder;
use common::mock_helpers::{configured_pipe, pooled_frame, running_pipe, test_config};
use common::{recv_frames, wait_until, TEST_PIPE};
use pipe_stage::config::PerframeNodeGroupInfo;
use pipe_stage::types::{NodeCrop, NodeGroup, Rect};
use pipe_stage::{Buffer, FrameDone, PipeError, PipeState, RetrieveStep, StageState};

#[test]
fn test_out_of_order_return_threaded() {
    let (mut pipe, handle, rx) = running_pipe(test_config(), 4);
    handle.script([
        RetrieveStep::Index(2),
        RetrieveStep::Index(0),
        RetrieveStep::Index(3),
        RetrieveStep::Index(1),
    ]);

    for sequence in 1..=4 {
        pipe.push_frame(pooled_frame(&pipe, sequence)).unwrap();
    }

    let frames = recv_frames(&rx, 4);
    let order: Vec<u64> = frames.iter().map(|f| f.sequence()).collect();
    assert_eq!(order, vec![3, 1, 4, 2]);
    for frame in &frames {
        // each frame gets back the buffer it was submitted with
        let index = frame.buffer(TEST_PIPE).map(|b| b.index);
        assert_eq!(index, Some(frame.sequence() as usize - 1));
        assert_eq!(frame.stage_state(TEST_PIPE), Some(StageState::Done));
    }

    pipe.stop().unwrap();
    let stats = pipe.stats();
    assert_eq!(stats.completed, 4);
    assert_eq!(stats.protocol_violations, 0);
}

#[test]
fn test_out_of_order_return_instant() {
    let (mut pipe, handle, _rx) = configured_pipe(test_config(), 4);
    handle.script([
        RetrieveStep::Index(2),
        RetrieveStep::Index(0),
        RetrieveStep::Index(3),
        RetrieveStep::Index(1),
    ]);
    pipe.instant_on().unwrap();
    assert!(pipe.is_instant_mode());

    for sequence in 1..=4 {
        let index = pipe.instant_submit(pooled_frame(&pipe, sequence)).unwrap();
        assert_eq!(index, Some(sequence as usize - 1));
    }
    assert_eq!(pipe.running_frame_count(), 4);

    let mut order = Vec::new();
    while let Some(frame) = pipe.instant_retrieve().unwrap() {
        order.push(frame.sequence());
    }
    assert_eq!(order, vec![3, 1, 4, 2]);
    assert_eq!(pipe.running_frame_count(), 0);

    pipe.instant_off().unwrap();
    assert_eq!(pipe.state(), PipeState::Created);
    assert!(!pipe.is_instant_mode());
}

#[test]
fn test_instant_profile_reaches_node() {
    let mut config = test_config();
    config.instant.crop_width = 32;
    config.instant.crop_height = 16;
    let (mut pipe, handle, _rx) = configured_pipe(config, 2);
    pipe.instant_on().unwrap();

    pipe.instant_submit(pooled_frame(&pipe, 1)).unwrap();
    let frame = pipe.instant_retrieve().unwrap().unwrap();

    let submitted = handle.submitted_meta();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].crop_region, Rect::sized(32, 16));
    assert_eq!(submitted[0].frame_duration_ns, Some(8_333_333));
    assert!(submitted[0].af_trigger_cancel);
    assert_eq!(
        frame.dynamic_metadata().and_then(|d| d.applied_crop),
        Some(Rect::sized(32, 16))
    );
    pipe.instant_off().unwrap();
}

#[test]
fn test_instant_calls_require_instant_mode() {
    let (mut pipe, _handle, _rx) = configured_pipe(test_config(), 2);
    let frame = pooled_frame(&pipe, 1);
    assert!(matches!(
        pipe.instant_submit(frame),
        Err(PipeError::InvalidState { .. })
    ));
    assert!(matches!(
        pipe.instant_retrieve(),
        Err(PipeError::InvalidState { .. })
    ));
    assert!(pipe.instant_off().is_err());

    pipe.start().unwrap();
    // instant mode is entered from Configured only
    assert!(pipe.instant_on().is_err());
}

#[test]
fn test_instant_push_frame_targets_queues() {
    let (mut pipe, _handle, rx) = configured_pipe(test_config(), 2);
    pipe.instant_push_frame(pipe_stage::QueueKind::Input, FrameBuilder::new(1).build())
        .unwrap();
    pipe.instant_push_frame(pipe_stage::QueueKind::Output, FrameBuilder::new(2).build())
        .unwrap();

    assert_eq!(pipe.input_len(), 1);
    assert_eq!(rx.try_recv().unwrap().sequence(), 2);
}

#[test]
fn test_frame_without_memory_is_forwarded_failed() {
    let (mut pipe, handle, rx) = running_pipe(test_config(), 4);

    let frame = FrameBuilder::new(5).buffer(Buffer::empty(2)).build();
    pipe.push_frame(frame).unwrap();

    let out = recv_frames(&rx, 1).remove(0);
    assert_eq!(out.sequence(), 5);
    assert_eq!(out.stage_state(TEST_PIPE), Some(StageState::Error));
    assert_eq!(handle.submit_count(), 0);
    assert_eq!(pipe.stats().failed_local, 1);
    pipe.stop().unwrap();
}

#[test]
fn test_frame_without_buffer_is_forwarded_failed() {
    let (mut pipe, handle, rx) = running_pipe(test_config(), 2);

    pipe.push_frame(FrameBuilder::new(9).build()).unwrap();

    let out = recv_frames(&rx, 1).remove(0);
    assert_eq!(out.stage_state(TEST_PIPE), Some(StageState::Error));
    assert_eq!(handle.submit_count(), 0);
    pipe.stop().unwrap();
}

#[test]
fn test_second_frame_on_held_buffer_keeps_occupant() {
    let (mut pipe, handle, rx) = running_pipe(test_config(), 4);
    // hold every buffer on the node
    handle.script([RetrieveStep::Index(3)]);

    let buffer = pipe.buffer_pool().acquire().unwrap();
    let duplicate = buffer.clone();
    pipe.push_frame(FrameBuilder::new(1).buffer(buffer).build()).unwrap();
    assert!(wait_until(|| pipe.outstanding() == 1));

    pipe.push_frame(FrameBuilder::new(2).buffer(duplicate).build()).unwrap();
    let out = recv_frames(&rx, 1).remove(0);
    assert_eq!(out.sequence(), 2);
    assert_eq!(out.stage_state(TEST_PIPE), Some(StageState::Error));

    let stats = pipe.stats();
    assert_eq!(stats.protocol_violations, 1);
    assert_eq!(stats.failed_local, 1);
    assert_eq!(pipe.outstanding(), 1);
    assert!(pipe.is_thread_running());
    assert_eq!(handle.submit_count(), 1);
    assert_eq!(pipe.dump().slots[0], pipe_stage::SlotState::Occupied { sequence: 1 });

    pipe.stop().unwrap();
    assert_eq!(pipe.stats().flushed_frames, 1);
}

#[test]
fn test_rejected_submit_stops_worker() {
    let (mut pipe, handle, rx) = running_pipe(test_config(), 2);
    handle.fail_next_submit("qbuf refused");

    pipe.push_frame(pooled_frame(&pipe, 1)).unwrap();

    let out = recv_frames(&rx, 1).remove(0);
    assert_eq!(out.stage_state(TEST_PIPE), Some(StageState::Error));
    assert!(wait_until(|| !pipe.is_thread_running()));

    let err = pipe.stop().unwrap_err();
    assert!(matches!(err, PipeError::WorkerFailed(_)));
    assert!(err.to_string().contains("qbuf refused"));
}

#[test]
fn test_retrieve_timeouts_are_not_fatal() {
    let (mut pipe, handle, rx) = running_pipe(test_config(), 2);
    handle.script([
        RetrieveStep::Timeout,
        RetrieveStep::Timeout,
        RetrieveStep::Timeout,
    ]);

    pipe.push_frame(pooled_frame(&pipe, 1)).unwrap();

    let out = recv_frames(&rx, 1).remove(0);
    assert_eq!(out.stage_state(TEST_PIPE), Some(StageState::Done));
    assert!(pipe.is_thread_running());
    assert!(pipe.stats().retrieve_timeouts >= 3);
    pipe.stop().unwrap();
}

#[test]
fn test_consecutive_timeouts_report_stall() {
    let mut config = test_config();
    config.max_consecutive_retrieve_timeouts = Some(3);
    let (mut pipe, handle, _rx) = running_pipe(config, 2);
    handle.script(vec![RetrieveStep::Timeout; 5]);

    pipe.push_frame(pooled_frame(&pipe, 1)).unwrap();
    assert!(wait_until(|| !pipe.is_thread_running()));

    let err = pipe.stop().unwrap_err();
    assert!(err.to_string().contains("stalled"), "unexpected error: {}", err);
    assert_eq!(pipe.state(), PipeState::Created);
    let stats = pipe.stats();
    assert_eq!(stats.retrieve_timeouts, 3);
    assert_eq!(stats.flushed_frames, 1);
}

#[test]
fn test_unknown_index_counts_violation() {
    let (mut pipe, handle, rx) = running_pipe(test_config(), 2);
    handle.script([RetrieveStep::Unknown(7)]);

    pipe.push_frame(pooled_frame(&pipe, 1)).unwrap();

    let out = recv_frames(&rx, 1).remove(0);
    assert_eq!(out.sequence(), 1);
    assert_eq!(out.stage_state(TEST_PIPE), Some(StageState::Done));
    assert_eq!(pipe.stats().protocol_violations, 1);
    assert!(pipe.is_thread_running());
    pipe.stop().unwrap();
}

#[test]
fn test_hardware_error_surfaces_on_stop() {
    let (mut pipe, handle, _rx) = running_pipe(test_config(), 2);
    handle.script([RetrieveStep::IoError("dma fault".to_string())]);

    pipe.push_frame(pooled_frame(&pipe, 1)).unwrap();
    assert!(wait_until(|| !pipe.is_thread_running()));

    match pipe.stop() {
        Err(PipeError::WorkerFailed(message)) => assert!(message.contains("dma fault")),
        other => panic!("expected worker failure, got {:?}", other),
    }
    assert_eq!(pipe.running_frame_count(), 0);
}

#[test]
fn test_dynamic_metadata_written_back() {
    let (mut pipe, handle, rx) = running_pipe(test_config(), 2);
    handle.set_exposure_ns(5_000);

    let buffer = pipe.buffer_pool().acquire().unwrap();
    let frame = FrameBuilder::new(42)
        .buffer(buffer)
        .request(42)
        .crop(Rect::new(8, 4, 32, 16))
        .build();
    pipe.push_frame(frame).unwrap();

    let out = recv_frames(&rx, 1).remove(0);
    let dynamic = out.dynamic_metadata().expect("dynamic metadata stored on frame");
    assert_eq!(dynamic.frame_count, 42);
    assert_eq!(dynamic.exposure_ns, 5_000);
    assert_eq!(dynamic.applied_crop, Some(Rect::new(8, 4, 32, 16)));
    pipe.stop().unwrap();
}

#[test]
fn test_leader_writes_node_group() {
    let mut config = test_config();
    config.perframe = PerframeNodeGroupInfo::leader(0, 10, vec![31, 32]);
    let (mut pipe, handle, rx) = running_pipe(config, 2);

    let group = NodeGroup::with_leader(NodeCrop::requested(
        Rect::sized(64, 32),
        Rect::sized(32, 16),
    ))
    .capture(NodeCrop::requested(Rect::sized(32, 16), Rect::sized(16, 8)));
    let buffer = pipe.buffer_pool().acquire().unwrap();
    pipe.push_frame(FrameBuilder::new(1).buffer(buffer).node_group(group).build())
        .unwrap();
    recv_frames(&rx, 1);

    let submitted = handle.submitted_meta();
    let written = &submitted[0].node_group;
    assert!(written.leader.request);
    assert_eq!(written.leader.video_id, 10);
    assert_eq!(written.leader.output, Rect::sized(32, 16));
    assert_eq!(written.captures.len(), 2);
    assert_eq!(written.captures[0].video_id, 31);
    assert_eq!(written.captures[0].output, Rect::sized(16, 8));
    // the second capture slot was not requested by the frame
    assert!(!written.captures[1].request);
    pipe.stop().unwrap();
}

#[test]
fn test_non_leader_leaves_node_group_alone() {
    let (mut pipe, handle, rx) = running_pipe(test_config(), 2);

    let group = NodeGroup::with_leader(NodeCrop::requested(Rect::sized(64, 32), Rect::sized(32, 16)));
    let buffer = pipe.buffer_pool().acquire().unwrap();
    pipe.push_frame(FrameBuilder::new(1).buffer(buffer).node_group(group).build())
        .unwrap();
    recv_frames(&rx, 1);

    assert!(!handle.submitted_meta()[0].node_group.leader.request);
    pipe.stop().unwrap();
}

#[test]
fn test_frame_done_queue_notified() {
    let (mut pipe, _handle, rx) = configured_pipe(test_config(), 2);
    let (done_tx, done_rx) = crossbeam_channel::unbounded();
    pipe.set_frame_done_queue(done_tx).unwrap();
    assert!(pipe.frame_done_queue().is_some());
    pipe.start().unwrap();
    pipe.start_thread().unwrap();

    pipe.push_frame(pooled_frame(&pipe, 1)).unwrap();
    pipe.push_frame(FrameBuilder::new(2).build()).unwrap();
    recv_frames(&rx, 2);

    let mut notices: Vec<FrameDone> = (0..2)
        .map(|_| done_rx.recv_timeout(common::test_timeout()).unwrap())
        .collect();
    notices.sort_by_key(|n| n.sequence);
    assert_eq!(notices[0].pipe, TEST_PIPE);
    assert_eq!(notices[0].state, StageState::Done);
    assert_eq!(notices[0].dynamic.as_ref().map(|d| d.frame_count), Some(1));
    // a frame forwarded failed is announced too
    assert_eq!(notices[1].sequence, 2);
    assert_eq!(notices[1].state, StageState::Error);
    pipe.stop().unwrap();
}

#[test]
fn test_frame_done_queue_notified_in_instant_mode() {
    let (mut pipe, _handle, _rx) = configured_pipe(test_config(), 2);
    let (done_tx, done_rx) = crossbeam_channel::unbounded();
    pipe.set_frame_done_queue(done_tx).unwrap();
    pipe.instant_on().unwrap();

    pipe.instant_submit(pooled_frame(&pipe, 4)).unwrap();
    assert!(done_rx.try_recv().is_err());
    let frame = pipe.instant_retrieve().unwrap().unwrap();

    let notice = done_rx.try_recv().unwrap();
    assert_eq!(notice.sequence, frame.sequence());
    assert_eq!(notice.state, StageState::Done);
    pipe.instant_off().unwrap();
}
