//! Integration tests for the acquisition engine lifecycle.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::FakeDevice;
use daq_relay::calibration::{CalibrationTable, ChannelCalibration};
use daq_relay::engine::{AcquisitionEngine, EngineSettings};
use daq_relay::error::{DaqError, ErrorKind};
use daq_relay::measurement::MeasurementBatch;
use daq_relay::state::AcquisitionState;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(2);

fn settings(channels: usize) -> EngineSettings {
    EngineSettings {
        channel_count: channels,
        batch_queue_capacity: 256,
        ..Default::default()
    }
}

fn identity(channels: usize) -> CalibrationTable {
    (0..channels)
        .map(|ch| ChannelCalibration::new(ch, 1.0, 0.0))
        .collect()
}

async fn next_batch(rx: &mut broadcast::Receiver<Arc<MeasurementBatch>>) -> Arc<MeasurementBatch> {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("batch within timeout")
        .expect("batch queue open")
}

#[tokio::test]
async fn test_start_then_stop_releases_session() {
    let device = FakeDevice::new(Duration::from_millis(5));
    let engine = AcquisitionEngine::new(device.clone(), settings(2));

    engine.start(1000, 2, identity(2)).unwrap();
    assert_eq!(engine.state(), AcquisitionState::Running);
    assert_eq!(device.live_sessions(), 1);

    engine.stop();
    assert_eq!(engine.state(), AcquisitionState::Stopped);
    assert_eq!(device.live_sessions(), 0);

    // A second start proves nothing leaked.
    engine.start(1000, 2, identity(2)).unwrap();
    assert_eq!(device.live_sessions(), 1);
    engine.stop();
    assert_eq!(device.live_sessions(), 0);
    assert_eq!(device.state.sessions_opened.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_never_more_than_one_read_outstanding() {
    let device = FakeDevice::new(Duration::from_millis(1));
    let engine = AcquisitionEngine::new(device.clone(), settings(4));
    let mut batches = engine.subscribe_batches();

    engine.start(1000, 2, identity(4)).unwrap();
    for _ in 0..50 {
        next_batch(&mut batches).await;
    }
    engine.stop();

    assert_eq!(device.overlapping_reads(), 0);
    assert!(engine.stats().reads_completed >= 50);
}

#[tokio::test]
async fn test_batches_arrive_in_capture_order() {
    let device = FakeDevice::new(Duration::from_millis(1));
    let engine = AcquisitionEngine::new(device.clone(), settings(1));
    let mut batches = engine.subscribe_batches();

    engine.start(1000, 2, identity(1)).unwrap();
    for expected in 0..20u64 {
        let batch = next_batch(&mut batches).await;
        assert_eq!(batch.sequence, expected);
        // The fake fills read n with the value n.
        assert!(batch.iter().all(|m| m.value == (expected + 1) as f64));
    }
    engine.stop();
}

#[tokio::test]
async fn test_calibration_scenario_through_engine() {
    let device = FakeDevice::new(Duration::from_millis(1));
    device.script(vec![vec![1.0, 2.0]]);
    let engine = AcquisitionEngine::new(device.clone(), settings(1));
    let mut batches = engine.subscribe_batches();

    engine
        .start(1000, 2, CalibrationTable::new([ChannelCalibration::new(0, 2.0, 0.5)]))
        .unwrap();
    let batch = next_batch(&mut batches).await;
    engine.stop();

    assert_eq!(batch.len(), 2);
    assert_eq!(batch.measurements[0].channel_id, "Channel0");
    assert!((batch.measurements[0].value - 2.5).abs() < 1e-9);
    assert!((batch.measurements[1].value - 4.5).abs() < 1e-9);
    assert_eq!(batch.measurements[0].timestamp, batch.measurements[1].timestamp);
}

#[tokio::test]
async fn test_start_while_running_fails() {
    let device = FakeDevice::new(Duration::from_millis(5));
    let engine = AcquisitionEngine::new(device.clone(), settings(2));

    engine.start(1000, 2, identity(2)).unwrap();
    let err = engine.start(500, 4, identity(2)).unwrap_err();

    assert!(matches!(err, DaqError::AlreadyRunning(AcquisitionState::Running)));
    assert_eq!(engine.state(), AcquisitionState::Running);
    assert_eq!(device.state.sessions_opened.load(Ordering::SeqCst), 1);
    engine.stop();
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let device = FakeDevice::new(Duration::from_millis(5));
    let engine = AcquisitionEngine::new(device.clone(), settings(2));

    engine.stop();
    engine.stop();
    assert_eq!(engine.state(), AcquisitionState::Stopped);

    engine.start(1000, 2, identity(2)).unwrap();
    engine.stop();
    engine.stop();
    assert_eq!(engine.state(), AcquisitionState::Stopped);
    assert_eq!(device.live_sessions(), 0);
}

#[tokio::test]
async fn test_invalid_parameters_are_rejected() {
    let device = FakeDevice::new(Duration::from_millis(5));
    let engine = AcquisitionEngine::new(device.clone(), settings(2));

    let err = engine.start(0, 2, identity(2)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    let err = engine.start(1000, 0, identity(2)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);

    assert_eq!(engine.state(), AcquisitionState::Stopped);
    assert_eq!(device.state.sessions_opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_setup_failure_reports_device_error() {
    let device = FakeDevice::new(Duration::from_millis(5));
    device.state.fail_configure.store(true, Ordering::SeqCst);
    let engine = AcquisitionEngine::new(device.clone(), settings(2));
    let mut errors = engine.subscribe_errors();

    let err = engine.start(1000, 2, identity(2)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Device);
    assert_eq!(engine.state(), AcquisitionState::Stopped);
    assert_eq!(errors.try_recv().unwrap().kind, ErrorKind::Device);
}

#[tokio::test]
async fn test_rearm_failure_moves_to_error_and_cleans_up() {
    let device = FakeDevice::new(Duration::from_millis(1));
    *device.state.fail_read_number.lock() = Some(3);
    let engine = AcquisitionEngine::new(device.clone(), settings(2));
    let mut errors = engine.subscribe_errors();
    let mut states = engine.watch_state();

    engine.start(1000, 2, identity(2)).unwrap();
    let event = tokio::time::timeout(WAIT, errors.recv()).await.unwrap().unwrap();
    assert_eq!(event.kind, ErrorKind::Device);
    assert!(event.detail.contains("scripted failure"));

    tokio::time::timeout(WAIT, states.wait_for(|s| *s == AcquisitionState::Error))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(device.live_sessions(), 0);
    assert_eq!(engine.stats().batches_produced, 2);

    // Error needs an explicit stop before the next start.
    assert!(engine.start(1000, 2, identity(2)).is_err());
    engine.stop();
    assert_eq!(engine.state(), AcquisitionState::Stopped);
}

#[tokio::test]
async fn test_completion_after_stop_is_discarded() {
    let device = FakeDevice::new(Duration::from_millis(30));
    let engine = AcquisitionEngine::new(device.clone(), settings(2));
    let mut batches = engine.subscribe_batches();

    engine.start(1000, 2, identity(2)).unwrap();
    engine.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(matches!(
        batches.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert_eq!(engine.stats().stale_completions, 1);
    assert_eq!(device.state.reads_issued.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_state_changes_are_pushed() {
    let device = FakeDevice::new(Duration::from_millis(5));
    let engine = AcquisitionEngine::new(device, settings(1));
    let mut states = engine.watch_state();

    engine.start(1000, 2, identity(1)).unwrap();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == AcquisitionState::Running))
        .await
        .unwrap()
        .unwrap();

    engine.stop();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == AcquisitionState::Stopped))
        .await
        .unwrap()
        .unwrap();
}
