//! Reconnect behaviour: backoff, state transitions, and prompt shutdown
//! while a stream is down.

mod common;

use std::time::{Duration, Instant};

use common::{Harness, wait_until};
use infer_server::types::StreamConfig;
use video_ingest::synth::SyntheticFactory;

#[test]
fn dropped_source_reconnects_and_resumes() {
    // First connection dies after 10 frames; the second runs unbounded.
    let factory = SyntheticFactory::new(64, 64)
        .with_frame_interval(Duration::from_millis(5))
        .with_connection_limits([Some(10)]);
    let harness = Harness::new(factory);

    harness
        .manager
        .add(StreamConfig {
            cam_id: "cam-rc".to_string(),
            source_url: "synth://rc".to_string(),
            frame_skip: 1,
            models: Vec::new(),
        })
        .unwrap();

    wait_until(Duration::from_secs(5), "first connection running", || {
        harness
            .manager
            .get_status("cam-rc")
            .is_some_and(|s| s.status == "running")
    });

    // The stream drops, backs off, reopens.
    wait_until(Duration::from_secs(5), "reconnect counted", || {
        harness
            .manager
            .get_status("cam-rc")
            .is_some_and(|s| s.reconnect_count == 1)
    });
    wait_until(Duration::from_secs(5), "running again after reconnect", || {
        harness
            .manager
            .get_status("cam-rc")
            .is_some_and(|s| s.status == "running" && s.reconnect_count == 1)
    });

    assert_eq!(harness.factory.open_count(), 2);
    harness.shutdown();
}

#[test]
fn shutdown_mid_reconnect_does_not_hang() {
    // Every open fails: the stream lives in the backoff loop.
    let factory = SyntheticFactory::new(64, 64);
    factory.fail_next_opens(u32::MAX);
    let harness = Harness::new(factory);

    harness
        .manager
        .add(StreamConfig {
            cam_id: "cam-down".to_string(),
            source_url: "synth://down".to_string(),
            frame_skip: 1,
            models: Vec::new(),
        })
        .unwrap();

    wait_until(Duration::from_secs(5), "stream reconnecting", || {
        harness
            .manager
            .get_status("cam-down")
            .is_some_and(|s| s.status == "reconnecting" && s.reconnect_count >= 1)
    });

    let status = harness.manager.get_status("cam-down").unwrap();
    assert!(!status.last_error.is_empty());

    // Stop requests must be observed within one backoff polling quantum,
    // not after the full backoff sleep.
    let start = Instant::now();
    assert!(harness.manager.remove("cam-down"));
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "remove took {:?}",
        start.elapsed()
    );

    harness.shutdown();
}

#[test]
fn stopped_stream_restarts_with_fresh_statistics() {
    let factory = SyntheticFactory::new(64, 64).with_frame_interval(Duration::from_millis(5));
    let harness = Harness::new(factory);

    harness
        .manager
        .add(StreamConfig {
            cam_id: "cam-restart".to_string(),
            source_url: "synth://restart".to_string(),
            frame_skip: 1,
            models: Vec::new(),
        })
        .unwrap();

    wait_until(Duration::from_secs(5), "frames decoded", || {
        harness
            .manager
            .get_status("cam-restart")
            .is_some_and(|s| s.decoded_frames >= 5)
    });
    assert!(harness.manager.stop("cam-restart"));
    assert_eq!(
        harness.manager.get_status("cam-restart").unwrap().status,
        "stopped"
    );

    // Starting a stopped stream succeeds once and resets counters.
    assert!(harness.manager.start("cam-restart"));
    wait_until(Duration::from_secs(5), "running after restart", || {
        harness
            .manager
            .get_status("cam-restart")
            .is_some_and(|s| s.status == "running")
    });
    assert!(!harness.manager.start("cam-restart"), "already running");

    harness.shutdown();
}
