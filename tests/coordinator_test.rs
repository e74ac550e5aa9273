//! Integration tests for the device coordinator
//!
//! Exercise the full coordinator stack against the mock transport: cycle
//! publication, failure isolation, the write path with forced
//! resynchronization, pause/resume, and the single-outstanding-request
//! discipline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regpoll::transport::mock::MockOp;
use regpoll::{
    AcquisitionError, ConnectionState, CoordinatorConfig, DeviceAddress, DeviceCoordinator,
    LoggingSection, MockTransport, RegisterSnapshot, RegisterSpace, RegisterSpans,
    RegisterTransport, UpdateError, WriteError,
};

fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        device: DeviceAddress {
            host: "device.test".to_string(),
            port: 502,
            unit_id: 1,
        },
        poll_interval_secs: 15,
        acquisition_timeout_secs: 10,
        connect_timeout_secs: 5,
        spans: RegisterSpans::default(),
        logging: LoggingSection::default(),
    }
}

fn coordinator_with_mock() -> (Arc<DeviceCoordinator>, MockTransport) {
    let mock = MockTransport::new();
    let handle = mock.clone();
    let coordinator = Arc::new(DeviceCoordinator::new(Box::new(mock), &test_config()));
    (coordinator, handle)
}

#[tokio::test]
async fn test_first_cycle_publishes_device_values() {
    let (coordinator, handle) = coordinator_with_mock();
    handle.set_coil(3, true);
    handle.set_discrete_input(12, true);
    handle.set_input_register(1, 215);
    handle.set_holding_register(40, 550);

    assert!(coordinator.snapshot().is_none());
    assert_eq!(coordinator.sequence(), 0);

    let snapshot = coordinator.poll_once().await.unwrap();
    assert_eq!(snapshot.sequence(), 1);
    assert_eq!(snapshot.coil(3), Some(true));
    assert_eq!(snapshot.coil(0), Some(false));
    assert_eq!(snapshot.discrete_input(12), Some(true));
    assert_eq!(snapshot.input_register(1), Some(215));
    assert_eq!(snapshot.holding_register(40), Some(550));

    // Spans bound what was acquired; addresses outside them are absent.
    assert_eq!(snapshot.coils().len(), 7);
    assert_eq!(snapshot.discrete_inputs().len(), 54);
    assert_eq!(snapshot.input_registers().len(), 33);
    assert_eq!(snapshot.holding_registers().len(), 69);
    assert_eq!(snapshot.coil(7), None);

    assert_eq!(coordinator.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_failed_cycle_keeps_previous_snapshot_intact() {
    let (coordinator, handle) = coordinator_with_mock();
    handle.set_holding_register(5, 1234);

    let before = coordinator.poll_once().await.unwrap();

    handle.set_holding_register(5, 9999);
    handle.fail_space(Some(RegisterSpace::HoldingRegisters));

    let err = coordinator.poll_once().await.unwrap_err();
    assert!(matches!(
        err,
        UpdateError::Acquisition(AcquisitionError::PartialReadFailure {
            space: RegisterSpace::HoldingRegisters,
            ..
        })
    ));

    // The published snapshot is the one from before the failure, unchanged.
    let after = coordinator.snapshot().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.holding_register(5), Some(1234));
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_sequence_increases_only_on_successful_publish() {
    let (coordinator, handle) = coordinator_with_mock();

    coordinator.poll_once().await.unwrap();
    assert_eq!(coordinator.sequence(), 1);

    handle.fail_space(Some(RegisterSpace::Coils));
    coordinator.poll_once().await.unwrap_err();
    assert_eq!(coordinator.sequence(), 1);

    handle.fail_space(None);
    coordinator.poll_once().await.unwrap();
    assert_eq!(coordinator.sequence(), 2);
}

#[tokio::test]
async fn test_write_coil_resyncs_snapshot() {
    let (coordinator, handle) = coordinator_with_mock();
    handle.set_coil(3, false);

    let first = coordinator.poll_once().await.unwrap();
    assert_eq!(first.coil(3), Some(false));

    let second = coordinator.write_coil(3, true).await.unwrap();
    assert_eq!(second.sequence(), 2);
    assert_eq!(second.coil(3), Some(true));

    // The resynchronized snapshot is the published one.
    let latest = coordinator.snapshot().unwrap();
    assert!(Arc::ptr_eq(&second, &latest));

    // Transport saw the write followed by a full read-back cycle.
    let log = handle.op_log();
    let write_pos = log
        .iter()
        .position(|op| *op == MockOp::WriteCoil(3, true))
        .unwrap();
    assert!(log[write_pos + 1..]
        .iter()
        .any(|op| *op == MockOp::Read(RegisterSpace::HoldingRegisters)));
}

#[tokio::test]
async fn test_write_register_visible_in_returned_snapshot() {
    let (coordinator, _handle) = coordinator_with_mock();
    coordinator.poll_once().await.unwrap();

    let snapshot = coordinator.write_register(5, 1234).await.unwrap();
    assert_eq!(snapshot.holding_register(5), Some(1234));
}

#[tokio::test]
async fn test_write_while_paused_fails_without_touching_device() {
    let (coordinator, handle) = coordinator_with_mock();
    coordinator.poll_once().await.unwrap();
    coordinator.pause().await;
    handle.clear_op_log();

    let err = coordinator.write_coil(0, true).await.unwrap_err();
    assert!(matches!(err, WriteError::Unreachable(_)));
    assert!(handle.op_log().is_empty());

    let stats = coordinator.stats();
    assert_eq!(stats.failed_writes, 1);
}

#[tokio::test]
async fn test_resync_failure_reports_but_write_stands() {
    let (coordinator, handle) = coordinator_with_mock();
    coordinator.poll_once().await.unwrap();

    // The write round-trip succeeds; the read-back cycle does not.
    handle.fail_space(Some(RegisterSpace::DiscreteInputs));

    let err = coordinator.write_register(7, 42).await.unwrap_err();
    assert!(matches!(err, WriteError::ResyncFailed(_)));
    assert!(handle
        .op_log()
        .contains(&MockOp::WriteRegister(7, 42)));

    // Snapshot still predates the write until a later cycle succeeds.
    assert_eq!(coordinator.sequence(), 1);
    assert_eq!(coordinator.snapshot().unwrap().holding_register(7), Some(0));

    handle.fail_space(None);
    let snapshot = coordinator.poll_once().await.unwrap();
    assert_eq!(snapshot.holding_register(7), Some(42));
}

#[tokio::test]
async fn test_rejected_write_does_not_publish() {
    let (coordinator, handle) = coordinator_with_mock();
    let first = coordinator.poll_once().await.unwrap();

    handle.fail_writes(true);
    let err = coordinator.write_coil(2, true).await.unwrap_err();
    assert!(matches!(err, WriteError::TransportRejected(_)));

    let latest = coordinator.snapshot().unwrap();
    assert!(Arc::ptr_eq(&first, &latest));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_poll_and_write_never_interleave() {
    let (coordinator, handle) = coordinator_with_mock();
    coordinator.poll_once().await.unwrap();
    handle.set_op_delay(Duration::from_millis(5));

    let (poll, write) = tokio::join!(
        coordinator.poll_once(),
        coordinator.write_register(10, 77),
    );
    poll.unwrap();
    write.unwrap();

    // Every round-trip went through the single transport slot.
    assert_eq!(handle.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_tick_during_write_is_skipped_not_queued() {
    let (coordinator, handle) = coordinator_with_mock();
    coordinator.start();

    // First tick fires immediately and publishes snapshot #1.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(coordinator.sequence(), 1);

    // Park just before the next tick, then issue a write slow enough that
    // the write plus its resync straddle the tick boundary.
    tokio::time::sleep(Duration::from_millis(14_450)).await;
    handle.set_op_delay(Duration::from_secs(1));
    coordinator.write_register(1, 5).await.unwrap();

    // The colliding tick was skipped, not queued behind the write: only the
    // resync publish happened, and no catch-up cycle follows.
    let stats = coordinator.stats();
    assert_eq!(stats.skipped_ticks, 1);
    assert_eq!(coordinator.sequence(), 2);
    assert_eq!(handle.max_in_flight(), 1);

    handle.set_op_delay(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(coordinator.sequence(), 2);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_lost_connection_mid_cycle_marks_disconnected() {
    let (coordinator, handle) = coordinator_with_mock();
    coordinator.poll_once().await.unwrap();
    assert_eq!(coordinator.connection_state(), ConnectionState::Connected);

    // The transport tears down its session partway through the cycle.
    handle.lose_connection_on(Some(RegisterSpace::InputRegisters));
    coordinator.poll_once().await.unwrap_err();
    assert_eq!(
        coordinator.connection_state(),
        ConnectionState::Disconnected
    );

    // The next forced cycle reconnects from scratch and recovers.
    handle.lose_connection_on(None);
    coordinator.poll_once().await.unwrap();
    assert_eq!(coordinator.connection_state(), ConnectionState::Connected);
    assert_eq!(handle.connect_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_acquisition_timeout() {
    let (coordinator, handle) = coordinator_with_mock();
    handle.stall_space(Some(RegisterSpace::InputRegisters));

    let err = coordinator.poll_once().await.unwrap_err();
    assert!(matches!(
        err,
        UpdateError::Acquisition(AcquisitionError::Timeout(_))
    ));
    assert!(coordinator.snapshot().is_none());

    // The device answers again; the next forced cycle recovers.
    handle.stall_space(None);
    let snapshot = coordinator.poll_once().await.unwrap();
    assert_eq!(snapshot.sequence(), 1);
}

#[tokio::test]
async fn test_observers_notified_in_order_for_each_publish() {
    let (coordinator, _handle) = coordinator_with_mock();
    let seen = Arc::new(AtomicU64::new(0));

    let counter = Arc::clone(&seen);
    let handle = coordinator.subscribe(move |snapshot: &Arc<RegisterSnapshot>| {
        counter.store(snapshot.sequence(), Ordering::SeqCst);
    });

    coordinator.poll_once().await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    coordinator.write_coil(0, true).await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    assert!(coordinator.unsubscribe(handle));
    coordinator.poll_once().await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_pause_resume_roundtrip() {
    let (coordinator, handle) = coordinator_with_mock();
    coordinator.poll_once().await.unwrap();
    assert_eq!(handle.connect_attempts(), 1);

    coordinator.pause().await;
    assert_eq!(coordinator.connection_state(), ConnectionState::Paused);
    assert!(!handle.is_connected());

    let err = coordinator.poll_once().await.unwrap_err();
    assert!(matches!(err, UpdateError::Connection(_)));

    // Resume reconnects and refreshes immediately.
    handle.set_holding_register(0, 11);
    let snapshot = coordinator.resume().await.unwrap();
    assert_eq!(coordinator.connection_state(), ConnectionState::Connected);
    assert_eq!(handle.connect_attempts(), 2);
    assert_eq!(snapshot.holding_register(0), Some(11));
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_loop_polls_on_interval() {
    let (coordinator, handle) = coordinator_with_mock();
    coordinator.start();

    // First tick fires immediately.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(coordinator.sequence(), 1);

    handle.set_input_register(2, 33);
    tokio::time::sleep(Duration::from_secs(16)).await;
    assert!(coordinator.sequence() >= 2);
    assert_eq!(
        coordinator.snapshot().unwrap().input_register(2),
        Some(33)
    );

    // Paused: ticks elapse without publishing.
    coordinator.pause().await;
    let sequence = coordinator.sequence();
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(coordinator.sequence(), sequence);

    coordinator.shutdown().await;
    assert_eq!(
        coordinator.connection_state(),
        ConnectionState::Disconnected
    );
}
