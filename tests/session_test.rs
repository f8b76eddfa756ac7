//! Integration tests for the acquisition session worker and its handle.

use std::time::Duration;
use tokio::sync::mpsc;
use vna_stream::mock::MockInstrument;
use vna_stream::{
    AcquisitionSession, CalibrationMetadata, CollectionEnd, ErrorKind, LifecyclePhase,
    SessionHandle, VnaConfig, VnaError,
};

const READY_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config() -> VnaConfig {
    let mut config = VnaConfig::default();
    config.instrument.mock = true;
    config.engine.start_timeout_ms = 2000;
    config.engine.start_attempts = 2;
    config.engine.poll_interval_ms = 20;
    config.acquisition.command_timeout_ms = 200;
    config.acquisition.probe_timeout_ms = 300;
    config.acquisition.probe_retry_interval_ms = 100;
    config.acquisition.first_sweep_timeout_ms = 2000;
    config
}

fn calibration() -> CalibrationMetadata {
    CalibrationMetadata::new(1_000_000, 3_000_000_000, 41)
}

fn spawn_session(mock: &MockInstrument) -> SessionHandle {
    AcquisitionSession::new(test_config(), mock.link(), mock.engine())
        .with_calibration(calibration())
        .spawn()
        .expect("Failed to spawn session")
}

fn mock() -> MockInstrument {
    MockInstrument::from_config(&test_config()).with_sweep_interval(Duration::from_millis(2))
}

#[tokio::test]
async fn test_session_probes_on_start() {
    let mock = mock();
    let session = spawn_session(&mock);

    session
        .wait_for_phase(LifecyclePhase::Ready, READY_TIMEOUT)
        .await
        .expect("Session never became ready");
    assert_eq!(mock.engine_starts(), 1);

    session.shutdown().await.expect("Failed to shut down");
    assert_eq!(mock.running_handle(), None);
}

#[tokio::test]
async fn test_collection_delivers_latest_sweeps_to_consumer() {
    let mock = mock();
    let session = spawn_session(&mock);
    session
        .wait_for_phase(LifecyclePhase::Ready, READY_TIMEOUT)
        .await
        .expect("Session never became ready");

    let ticket = session
        .begin_collection(Some(10))
        .await
        .expect("Collection rejected");
    let summary = ticket.finished().await.expect("Collection failed");

    assert_eq!(summary.ending, CollectionEnd::Completed);
    assert_eq!(summary.sweeps_delivered, 10);
    assert_eq!(session.phase(), LifecyclePhase::Ready);

    // Nobody drained during the collection, so only the newest sweep is left
    let dispatcher = session.dispatcher();
    let latest = dispatcher.drain().expect("No sweep pending");
    assert_eq!(latest.len(), 41);
    assert!(dispatcher.drain().is_none());

    let stats = dispatcher.stats();
    assert_eq!(stats.published, 10);
    assert_eq!(stats.coalesced, 9);
    assert_eq!(stats.drained, 1);

    session.shutdown().await.expect("Failed to shut down");
}

#[tokio::test]
async fn test_registry_listener_sees_every_sweep() {
    let mock = mock();
    let session = spawn_session(&mock);
    session
        .wait_for_phase(LifecyclePhase::Ready, READY_TIMEOUT)
        .await
        .expect("Session never became ready");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let port = vna_stream::PortId::new("S21");
    session
        .registry()
        .register(&port, move |record| {
            let _ = tx.send(record.sequence_no);
        });

    let ticket = session
        .begin_collection(Some(8))
        .await
        .expect("Collection rejected");
    let summary = ticket.finished().await.expect("Collection failed");
    assert_eq!(summary.sweeps_delivered, 8);

    let mut sequence = Vec::new();
    while let Ok(seq) = rx.try_recv() {
        sequence.push(seq);
    }
    assert!(sequence.windows(2).all(|w| w[0] < w[1]), "{sequence:?}");

    session.shutdown().await.expect("Failed to shut down");
}

#[tokio::test]
async fn test_commands_are_rejected_while_collecting() {
    let mock = mock();
    let session = spawn_session(&mock);
    session
        .wait_for_phase(LifecyclePhase::Ready, READY_TIMEOUT)
        .await
        .expect("Session never became ready");

    let ticket = session
        .begin_collection(None)
        .await
        .expect("Collection rejected");
    session
        .wait_for_phase(LifecyclePhase::Collecting, READY_TIMEOUT)
        .await
        .expect("Collection never started");

    let reload = session.reload_calibration(calibration()).await;
    assert!(matches!(reload, Err(VnaError::PreconditionFailed(_))));
    let probe = session.probe().await;
    assert!(matches!(probe, Err(VnaError::PreconditionFailed(_))));
    let second = session.begin_collection(Some(1)).await;
    assert!(matches!(second, Err(VnaError::PreconditionFailed(_))));

    session.cancel();
    let summary = ticket.finished().await.expect("Collection failed");
    assert_eq!(summary.ending, CollectionEnd::Cancelled);

    // Calibration can change again once the session is back in Ready
    session
        .reload_calibration(CalibrationMetadata::new(1_000_000, 2_000_000, 11))
        .await
        .expect("Failed to reload calibration");

    session.shutdown().await.expect("Failed to shut down");
}

#[tokio::test]
async fn test_calibration_reload_reconfigures_next_collection() {
    let mock = mock();
    let session = spawn_session(&mock);
    session
        .wait_for_phase(LifecyclePhase::Ready, READY_TIMEOUT)
        .await
        .expect("Session never became ready");

    let reloaded = CalibrationMetadata::new(2_000_000, 1_000_000_000, 17);
    session
        .reload_calibration(reloaded)
        .await
        .expect("Failed to reload calibration");
    assert_eq!(session.phase(), LifecyclePhase::Ready);

    let (tx, mut rx) = mpsc::unbounded_channel();
    for port in test_config().ports() {
        let tx = tx.clone();
        session.registry().register(&port, move |record| {
            let _ = tx.send(record.len());
        });
    }

    let ticket = session
        .begin_collection(Some(6))
        .await
        .expect("Collection rejected");
    let summary = ticket.finished().await.expect("Collection failed");
    assert_eq!(summary.sweeps_delivered, 6);

    let mut lengths = Vec::new();
    while let Ok(len) = rx.try_recv() {
        lengths.push(len);
    }
    assert_eq!(lengths.len(), 6);
    assert!(lengths.iter().all(|&len| len == 17), "{lengths:?}");
    assert_eq!(mock.sweep(), reloaded);
    assert!(mock
        .commands_received()
        .iter()
        .any(|c| c == "SENS:SWE:POIN 17"));

    session.shutdown().await.expect("Failed to shut down");
}

#[tokio::test]
async fn test_invalid_calibration_reload_is_rejected() {
    let mock = mock();
    let session = spawn_session(&mock);

    let result = session
        .reload_calibration(CalibrationMetadata::new(5_000_000, 1_000_000, 11))
        .await;
    assert!(matches!(result, Err(VnaError::Calibration(_))));

    session.shutdown().await.expect("Failed to shut down");
}

#[tokio::test]
async fn test_shutdown_during_collection_cancels_and_stops_engine() {
    let mock = mock();
    let session = spawn_session(&mock);
    session
        .wait_for_phase(LifecyclePhase::Ready, READY_TIMEOUT)
        .await
        .expect("Session never became ready");

    let ticket = session
        .begin_collection(None)
        .await
        .expect("Collection rejected");
    session
        .wait_for_phase(LifecyclePhase::Collecting, READY_TIMEOUT)
        .await
        .expect("Collection never started");

    session.shutdown().await.expect("Failed to shut down");

    let summary = ticket.finished().await.expect("Collection failed");
    assert_eq!(summary.ending, CollectionEnd::Cancelled);
    assert_eq!(mock.running_handle(), None);
    assert!(!mock.is_continuous());
}

#[tokio::test]
async fn test_fatal_error_reaches_handlers() {
    let mock = mock();
    mock.set_engine_fails(true);
    let session = spawn_session(&mock);

    let (tx, mut rx) = mpsc::unbounded_channel();
    session.on_fatal_error(move |kind| {
        let _ = tx.send(kind);
    });

    let err = session.probe().await.expect_err("Probe should fail");
    assert_eq!(err.kind(), ErrorKind::Engine);
    assert_eq!(rx.recv().await, Some(ErrorKind::Engine));
    assert_eq!(session.phase(), LifecyclePhase::Idle);

    session.shutdown().await.expect("Failed to shut down");
}

#[tokio::test]
async fn test_wait_for_phase_times_out() {
    let mock = mock();
    mock.set_engine_fails(true);
    let session = spawn_session(&mock);

    let result = session
        .wait_for_phase(LifecyclePhase::Ready, Duration::from_millis(200))
        .await;
    assert!(matches!(result, Err(VnaError::PreconditionFailed(_))));

    session.shutdown().await.expect("Failed to shut down");
}

#[tokio::test]
async fn test_transient_probe_failure_is_retried() {
    let mock = mock();
    mock.hang_on_command("*IDN?");
    let session = spawn_session(&mock);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_ne!(session.phase(), LifecyclePhase::Ready);
    assert!(mock.engine_starts() >= 1);

    mock.release_hang();
    session
        .wait_for_phase(LifecyclePhase::Ready, READY_TIMEOUT)
        .await
        .expect("Session did not recover");

    session.shutdown().await.expect("Failed to shut down");
}

#[tokio::test]
async fn test_collection_without_calibration_is_rejected() {
    let mock = mock();
    let session = AcquisitionSession::new(test_config(), mock.link(), mock.engine())
        .spawn()
        .expect("Failed to spawn session");
    session
        .wait_for_phase(LifecyclePhase::Ready, READY_TIMEOUT)
        .await
        .expect("Session never became ready");

    let result = session.begin_collection(None).await;
    assert!(matches!(result, Err(VnaError::PreconditionFailed(_))));
    assert_eq!(session.phase(), LifecyclePhase::Ready);

    session.shutdown().await.expect("Failed to shut down");
}
