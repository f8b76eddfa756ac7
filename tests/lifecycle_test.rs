//! Integration tests for the acquisition lifecycle against the simulated instrument.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use vna_stream::lifecycle::ProcessHandle;
use vna_stream::mock::MockInstrument;
use vna_stream::{
    CalibrationMetadata, CallbackRegistry, CollectionEnd, ErrorKind, LifecyclePhase, PortId,
    SweepLifecycleController, VnaConfig, VnaError,
};

/// Configuration with timeouts short enough for tests.
fn test_config() -> VnaConfig {
    let mut config = VnaConfig::default();
    config.instrument.mock = true;
    config.engine.start_timeout_ms = 2000;
    config.engine.start_attempts = 2;
    config.engine.poll_interval_ms = 20;
    config.acquisition.command_timeout_ms = 200;
    config.acquisition.probe_timeout_ms = 500;
    config.acquisition.probe_retry_interval_ms = 100;
    config.acquisition.first_sweep_timeout_ms = 2000;
    config
}

fn calibration() -> CalibrationMetadata {
    CalibrationMetadata::new(1_000_000, 2_000_000_000, 51)
}

struct Harness {
    mock: MockInstrument,
    controller: SweepLifecycleController,
    received: Arc<Mutex<Vec<(PortId, usize, LifecyclePhase)>>>,
    sweeps: mpsc::UnboundedReceiver<PortId>,
}

fn harness(config: VnaConfig) -> Harness {
    let mock = MockInstrument::from_config(&config).with_sweep_interval(Duration::from_millis(2));
    let registry = Arc::new(CallbackRegistry::new());
    let controller =
        SweepLifecycleController::new(config.clone(), mock.link(), mock.engine(), registry.clone());

    let received = Arc::new(Mutex::new(Vec::new()));
    let (tx, sweeps) = mpsc::unbounded_channel();
    for port in config.ports() {
        let received = received.clone();
        let tx = tx.clone();
        let phase = controller.subscribe_phase();
        registry.register(&port, move |record| {
            received
                .lock()
                .push((record.port.clone(), record.len(), *phase.borrow()));
            let _ = tx.send(record.port);
        });
    }

    Harness {
        mock,
        controller,
        received,
        sweeps,
    }
}

/// Record every phase the controller publishes.
fn record_phases(controller: &SweepLifecycleController) -> Arc<Mutex<Vec<LifecyclePhase>>> {
    let phases = Arc::new(Mutex::new(vec![controller.phase()]));
    let mut rx = controller.subscribe_phase();
    let sink = phases.clone();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let phase = *rx.borrow_and_update();
            sink.lock().push(phase);
        }
    });
    phases
}

fn is_subsequence(expected: &[LifecyclePhase], observed: &[LifecyclePhase]) -> bool {
    let mut observed = observed.iter();
    expected.iter().all(|phase| observed.any(|seen| seen == phase))
}

#[tokio::test]
async fn test_probe_cold_starts_engine_and_identifies() {
    let mut h = harness(test_config());

    let identity = h.controller.probe().await.expect("Failed to probe");

    assert_eq!(identity, "MockVNA,SIM-2P,000001,1.0");
    assert_eq!(h.controller.phase(), LifecyclePhase::Ready);
    assert_eq!(h.controller.identity(), Some(identity.as_str()));
    assert_eq!(h.mock.engine_starts(), 1);
    assert_eq!(h.controller.engine_handle(), h.mock.running_handle());
}

#[tokio::test]
async fn test_cancelled_collection_runs_full_lifecycle() {
    let mut h = harness(test_config());
    h.controller
        .set_calibration(calibration())
        .expect("Failed to set calibration");
    h.controller.probe().await.expect("Failed to probe");
    let probe_handle = h.controller.engine_handle().expect("No engine after probe");

    let phases = record_phases(&h.controller);
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    let sweeps = &mut h.sweeps;
    let canceller = async {
        for _ in 0..6 {
            sweeps.recv().await.expect("Sweep channel closed");
        }
        cancel_tx.send_replace(true);
    };
    let (summary, ()) = tokio::join!(h.controller.collect(None, &mut cancel_rx), canceller);
    let summary = summary.expect("Collection failed");

    assert_eq!(summary.ending, CollectionEnd::Cancelled);
    assert!(summary.sweeps_delivered >= 6);
    assert_eq!(h.controller.phase(), LifecyclePhase::Ready);

    // Gate closed: nothing reaches the registry once collect has returned
    let delivered = h.received.lock().len();
    assert_eq!(delivered as u64, summary.sweeps_delivered);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.received.lock().len(), delivered);

    // Every record was a complete sweep delivered while collecting
    for (_, _, phase) in h.received.lock().iter() {
        assert!(
            matches!(phase, LifecyclePhase::Starting | LifecyclePhase::Collecting),
            "record delivered in {phase}"
        );
    }

    tokio::task::yield_now().await;
    let observed = phases.lock().clone();
    assert!(
        is_subsequence(
            &[
                LifecyclePhase::Ready,
                LifecyclePhase::Starting,
                LifecyclePhase::Collecting,
                LifecyclePhase::Stopping,
                LifecyclePhase::Ready,
            ],
            &observed
        ),
        "unexpected phase sequence {observed:?}"
    );

    // Probe instance, then the collection instance, each stopped exactly once
    let stopped = h.mock.stopped_handles();
    let collection_handle = ProcessHandle(probe_handle.0 + 1);
    assert_eq!(stopped, vec![probe_handle, collection_handle]);
    assert!(!h.mock.is_continuous());
    assert!(h.controller.open_push_ports().await.is_empty());
}

#[tokio::test]
async fn test_sweep_limit_is_never_exceeded() {
    let mut h = harness(test_config());
    h.controller
        .set_calibration(calibration())
        .expect("Failed to set calibration");
    h.controller.probe().await.expect("Failed to probe");

    let (_cancel_tx, mut cancel_rx) = watch::channel(false);
    let summary = h
        .controller
        .collect(Some(5), &mut cancel_rx)
        .await
        .expect("Collection failed");

    assert_eq!(summary.ending, CollectionEnd::Completed);
    assert_eq!(summary.sweeps_delivered, 5);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.received.lock().len(), 5);
    assert_eq!(h.controller.phase(), LifecyclePhase::Ready);
}

#[tokio::test]
async fn test_sweep_setup_follows_calibration() {
    let mut h = harness(test_config());
    h.controller
        .set_calibration(calibration())
        .expect("Failed to set calibration");
    h.controller.probe().await.expect("Failed to probe");

    let (_cancel_tx, mut cancel_rx) = watch::channel(false);
    h.controller
        .collect(Some(2), &mut cancel_rx)
        .await
        .expect("Collection failed");

    assert_eq!(h.mock.sweep(), calibration());
    let commands = h.mock.commands_received();
    let setup = commands
        .iter()
        .position(|c| c == "SENS:SWE:POIN 51")
        .expect("Sweep setup was not sent");
    let enable = commands
        .iter()
        .position(|c| c == "INIT:CONT ON")
        .expect("Continuous mode was not enabled");
    assert!(setup < enable);
    assert!(commands.iter().any(|c| c == "INIT:CONT OFF"));
}

#[tokio::test]
async fn test_collection_without_calibration_is_rejected() {
    let mut h = harness(test_config());
    h.controller.probe().await.expect("Failed to probe");

    let (_cancel_tx, mut cancel_rx) = watch::channel(false);
    let result = h.controller.collect(None, &mut cancel_rx).await;

    assert!(matches!(result, Err(VnaError::PreconditionFailed(_))));
    assert_eq!(h.controller.phase(), LifecyclePhase::Ready);
    assert_eq!(h.mock.engine_starts(), 1, "no cold start for a rejected collection");
}

#[tokio::test]
async fn test_collection_requires_ready() {
    let mut h = harness(test_config());
    h.controller
        .set_calibration(calibration())
        .expect("Failed to set calibration");

    let (_cancel_tx, mut cancel_rx) = watch::channel(false);
    let result = h.controller.collect(None, &mut cancel_rx).await;

    assert!(matches!(result, Err(VnaError::PreconditionFailed(_))));
    assert_eq!(h.controller.phase(), LifecyclePhase::Idle);
    assert_eq!(h.mock.engine_starts(), 0);
}

#[tokio::test]
async fn test_hanging_continuous_command_times_out_to_idle() {
    let mut h = harness(test_config());
    h.controller
        .set_calibration(calibration())
        .expect("Failed to set calibration");
    h.controller.probe().await.expect("Failed to probe");
    h.mock.hang_on_command("INIT:CONT ON");

    let (_cancel_tx, mut cancel_rx) = watch::channel(false);
    let err = h
        .controller
        .collect(None, &mut cancel_rx)
        .await
        .expect_err("Collection should time out");

    assert_eq!(err.kind(), ErrorKind::CommandTimeout);
    assert!(err.is_recoverable());
    assert_eq!(h.controller.phase(), LifecyclePhase::Idle);
    assert!(h.controller.open_push_ports().await.is_empty());
    assert_eq!(h.mock.running_handle(), None);
    assert!(h.received.lock().is_empty());
}

#[tokio::test]
async fn test_engine_crash_during_collection_is_stream_lost() {
    let mut h = harness(test_config());
    h.controller
        .set_calibration(calibration())
        .expect("Failed to set calibration");
    h.controller.probe().await.expect("Failed to probe");

    let mock = h.mock.clone();
    let (_cancel_tx, mut cancel_rx) = watch::channel(false);
    let sweeps = &mut h.sweeps;
    let crasher = async {
        sweeps.recv().await.expect("Sweep channel closed");
        mock.crash_engine();
    };
    let (result, ()) = tokio::join!(h.controller.collect(None, &mut cancel_rx), crasher);

    let err = result.expect_err("Collection should fail");
    assert_eq!(err.kind(), ErrorKind::StreamLost);
    assert!(!err.is_recoverable());
    assert_eq!(h.controller.phase(), LifecyclePhase::Idle);
    assert!(h.controller.engine_handle().is_none());
}

#[tokio::test]
async fn test_engine_that_never_starts_fails_probe() {
    let mut h = harness(test_config());
    h.mock.set_engine_fails(true);

    let err = h.controller.probe().await.expect_err("Probe should fail");

    assert_eq!(err.kind(), ErrorKind::Engine);
    assert_eq!(h.controller.phase(), LifecyclePhase::Idle);
    assert_eq!(h.mock.engine_starts(), 2);
}

#[tokio::test]
async fn test_silent_identification_is_probe_timeout() {
    let mut h = harness(test_config());
    h.mock.hang_on_command("*IDN?");

    let err = h.controller.probe().await.expect_err("Probe should time out");

    assert_eq!(err.kind(), ErrorKind::ProbeTimeout);
    assert_eq!(h.controller.phase(), LifecyclePhase::Idle);
    assert_eq!(h.mock.running_handle(), None, "probe engine must be stopped");
}

#[tokio::test]
async fn test_malformed_push_lines_do_not_leak_partial_sweeps() {
    let mut h = harness(test_config());
    h.controller
        .set_calibration(calibration())
        .expect("Failed to set calibration");
    h.controller.probe().await.expect("Failed to probe");
    h.mock.inject_malformed(&PortId::new("S11"), 3);

    let (_cancel_tx, mut cancel_rx) = watch::channel(false);
    let summary = h
        .controller
        .collect(Some(6), &mut cancel_rx)
        .await
        .expect("Collection failed");

    assert_eq!(summary.sweeps_delivered, 6);
    assert!(h.received.lock().iter().all(|(_, len, _)| *len == 51));
    let skipped: u64 = h
        .controller
        .assembler_stats()
        .values()
        .map(|s| s.skipped_points)
        .sum();
    assert!(skipped > 0, "the mid-sweep attach must be skipped");
}

#[tokio::test]
async fn test_shutdown_stops_engine() {
    let mut h = harness(test_config());
    h.controller.probe().await.expect("Failed to probe");
    assert!(h.mock.running_handle().is_some());

    h.controller.shutdown().await;

    assert_eq!(h.controller.phase(), LifecyclePhase::Idle);
    assert_eq!(h.mock.running_handle(), None);
    assert!(h.controller.identity().is_none());
}
