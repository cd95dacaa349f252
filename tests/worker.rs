//! Stream worker thread: shutdown, restarts and giving up.

mod common;

use common::*;
use std::time::{Duration, Instant};
use u3stream::worker::{RestartPolicy, StreamWorker};

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for the worker");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn patient() -> RestartPolicy {
    RestartPolicy {
        max_consecutive_transport_errors: u32::MAX,
        ..RestartPolicy::default()
    }
}

#[test]
fn test_default_policy() {
    let policy = RestartPolicy::default();
    assert_eq!(policy.max_restarts, 3);
    assert_eq!(policy.max_consecutive_transport_errors, 50);
}

#[test]
fn test_streams_until_stopped() {
    let (controller, mock) = controller(StreamConfig::single_ended(1));
    mock.script_startup();
    for n in 0..10u8 {
        mock.stream(normal_packet(n, &[n as u16 * 10]));
    }

    let worker = StreamWorker::spawn(controller, patient()).unwrap();
    let handoff = worker.handoff();
    wait_until(|| handoff.generation() == 10);

    let report = worker.join();
    println!("Worker report: {:?}", report);
    assert!(report.error.is_none());
    assert_eq!(report.restarts, 0);
    assert_eq!(report.final_state, StreamState::Idle);
    assert_eq!(report.stats.packets_decoded, 10);
    assert!((handoff.latest().unwrap().voltages[0] - 0.09).abs() < 1e-9);
    assert_eq!(mock.commands().last(), Some(&0xB0));
}

#[test]
fn test_restarts_after_desync() {
    let (controller, mock) = controller(StreamConfig::single_ended(1));
    mock.script_startup();
    // StreamStop issued on the way into Failed
    mock.respond(stream_ack(STREAM_STOP_ACK, 0));
    mock.script_startup();
    for n in [0u8, 1, 5, 0, 1, 2] {
        mock.stream(normal_packet(n, &[1]));
    }

    let worker = StreamWorker::spawn(controller, patient()).unwrap();
    let handoff = worker.handoff();
    wait_until(|| handoff.generation() == 5);

    let report = worker.join();
    assert!(report.error.is_none());
    assert_eq!(report.restarts, 1);
    assert_eq!(report.stats.packets_decoded, 5);
    assert_eq!(mock.pending_stream(), 0);
}

#[test]
fn test_gives_up_after_restart_limit() {
    let (controller, mock) = controller(StreamConfig::single_ended(1));
    mock.script_startup();
    mock.stream(normal_packet(0, &[1])).stream(normal_packet(2, &[1]));

    let policy = RestartPolicy {
        max_restarts: 0,
        ..patient()
    };
    let worker = StreamWorker::spawn(controller, policy).unwrap();
    wait_until(|| worker.is_finished());

    let report = worker.join();
    assert!(matches!(
        report.error,
        Some(StreamError::SequenceMismatch {
            expected: 1,
            received: 2
        })
    ));
    assert_eq!(report.restarts, 0);
    assert_eq!(report.final_state, StreamState::Failed);
}

#[test]
fn test_gives_up_after_consecutive_transport_errors() {
    let (controller, mock) = controller(StreamConfig::single_ended(1));
    mock.script_startup();

    let policy = RestartPolicy {
        max_restarts: 3,
        max_consecutive_transport_errors: 5,
    };
    let worker = StreamWorker::spawn(controller, policy).unwrap();
    wait_until(|| worker.is_finished());

    let report = worker.join();
    let err = report.error.expect("transport failure reported");
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(report.stats.transport_errors, 5);
    assert_eq!(report.final_state, StreamState::Idle);
    assert_eq!(mock.state.lock().stream_reads, 5);
}

#[test]
fn test_startup_failure_is_reported() {
    let (controller, _mock) = controller(StreamConfig::single_ended(1));

    let worker = StreamWorker::spawn(controller, patient()).unwrap();
    wait_until(|| worker.is_finished());

    let report = worker.join();
    assert!(matches!(report.error, Some(StreamError::ShortRead { .. })));
    assert_eq!(report.final_state, StreamState::Failed);
    assert_eq!(report.stats.packets_decoded, 0);
}
