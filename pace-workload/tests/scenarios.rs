//! End-to-end runs of the controller against the in-memory store.

use std::time::Duration;

use pace_workload::{
    decode_document, soak_pattern, Controller, DriverConfig, DriverError, KeyPolicy,
    MemoryConnector, MemoryStore, OpKind, Outcome, SizeDistribution, SubmitError, Timeouts,
    ViewKind, Violation, WorkloadMode, EXIT_INTEGRITY, EXIT_SETUP,
};

fn readback_config(batch: u64) -> DriverConfig {
    DriverConfig::builder()
        .endpoint("mem://")
        .mode(WorkloadMode::Readback)
        .keys(KeyPolicy::Cyclic { pool_size: batch })
        .batch_size(batch)
        .document_size(SizeDistribution::Uniform { min: 64, max: 512 })
        .seed(7)
        .capture_dir(None)
        .reconnect_delay_ms(0)
        .build()
}

fn soak_config(mode: WorkloadMode, cycles: u64) -> DriverConfig {
    DriverConfig::builder()
        .endpoint("mem://")
        .mode(mode)
        .keys(KeyPolicy::Cyclic { pool_size: 10 })
        .batch_size(1)
        .document_size(SizeDistribution::Fixed(1024))
        .cycles(cycles)
        .capture_dir(None)
        .reconnect_delay_ms(0)
        .build()
}

fn controller(config: DriverConfig, store: &MemoryStore) -> Controller<MemoryConnector> {
    let connector = MemoryConnector::new(store.clone(), config.timeouts);
    Controller::new(config, connector).unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..5_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_readback_pool_of_100_verifies() {
    let store = MemoryStore::new().with_jitter(3, Duration::ZERO, Duration::from_millis(2));
    let mut config = readback_config(100);
    config.cycles = Some(1);
    let mut controller = controller(config, &store);

    let outcome = controller.run().await.unwrap();

    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(store.len(), 100);
    assert_eq!(store.phase_overlaps(), 0);
    assert!(controller.context().counters().all_zero());
    assert_eq!(controller.context().in_flight(), 0);
    assert_eq!(controller.context().overlapping_batches(), 0);

    let stats = controller.stats();
    assert_eq!(stats.kind(OpKind::Store).ok, 100);
    assert_eq!(stats.kind(OpKind::Fetch).ok, 100);
    assert_eq!(stats.cycles, 1);
    assert_eq!(stats.batches, 2);
}

#[tokio::test]
async fn test_out_of_order_completions_across_cycles() {
    let store = MemoryStore::new().with_jitter(11, Duration::ZERO, Duration::from_millis(5));
    let mut config = readback_config(50);
    config.keys = KeyPolicy::Unique;
    config.cycles = Some(3);
    let mut controller = controller(config, &store);

    assert_eq!(controller.run().await.unwrap(), Outcome::Completed);
    assert_eq!(store.len(), 150);
    assert_eq!(store.max_in_flight(), 50);
    assert_eq!(store.phase_overlaps(), 0);
    assert_eq!(controller.stats().kind(OpKind::Fetch).ok, 150);
}

#[tokio::test]
async fn test_corrupted_value_fails_with_one_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    store.corrupt_on_store("key:37");

    let mut config = readback_config(100);
    config.capture_dir = Some(dir.path().to_path_buf());
    let mut controller = controller(config, &store);

    let err = controller.run().await.unwrap_err();
    assert_eq!(err.exit_code(), EXIT_INTEGRITY);
    let DriverError::Integrity {
        violation,
        artifact,
    } = err
    else {
        panic!("expected integrity failure");
    };
    assert!(matches!(violation, Violation::DigestMismatch { ref key, .. } if key == "key:37"));

    let path = artifact.unwrap();
    assert_eq!(path, dir.path().join("invalid_37"));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    assert_eq!(std::fs::read(&path).unwrap(), store.get_raw("key:37").unwrap());
}

#[tokio::test]
async fn test_view_with_unexpected_rows_fails() {
    let store = MemoryStore::new().with_view(ViewKind::AllDocuments);
    for i in 0..5 {
        store.insert_raw(format!("key:{i}"), "x");
    }
    let config = DriverConfig::builder()
        .endpoint("mem://")
        .expected_rows(0)
        .reconnect_delay_ms(0)
        .build();
    let mut controller = controller(config, &store);

    let err = controller.run().await.unwrap_err();
    assert_eq!(err.exit_code(), EXIT_INTEGRITY);
    assert_eq!(
        err.violation(),
        Some(&Violation::CardinalityMismatch {
            expected: 0,
            observed: 5
        })
    );
    // Nothing is written once the view disagrees.
    assert_eq!(store.submitted(OpKind::Store), 0);
}

#[tokio::test]
async fn test_consistency_reissues_failed_view() {
    let store = MemoryStore::new();
    store.fail_next_views(2);
    let config = DriverConfig::builder()
        .endpoint("mem://")
        .keys(KeyPolicy::Cyclic { pool_size: 10 })
        .batch_size(10)
        .document_size(SizeDistribution::Fixed(256))
        .cycles(1)
        .reconnect_delay_ms(0)
        .build();
    let mut controller = controller(config, &store);

    assert_eq!(controller.run().await.unwrap(), Outcome::Completed);
    let view = controller.stats().kind(OpKind::View);
    assert_eq!((view.ok, view.failed), (1, 2));

    assert_eq!(store.len(), 10);
    let doc = decode_document(&store.get_raw("key:3").unwrap()).unwrap();
    assert!(doc.verify().is_ok());
    assert_eq!(doc.len(), 256);
}

#[tokio::test]
async fn test_interrupt_mid_batch_drains_before_exit() {
    let store = MemoryStore::new();
    store.hold();
    let mut config = readback_config(1000);
    config.timeouts = Timeouts::uniform(30_000);
    let mut controller = controller(config, &store);
    let interrupt = controller.interrupt_handle();

    let script = async {
        wait_until(|| store.held_count() == 1000).await;
        store.release(950);
        wait_until(|| store.completed(OpKind::Store) == 950).await;

        interrupt.interrupt();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Still draining: no new batch, the 50 stragglers are untouched.
        assert_eq!(store.submitted(OpKind::Store), 1000);
        assert_eq!(store.submitted(OpKind::Fetch), 0);
        assert_eq!(store.held_count(), 50);

        store.release_all();
    };

    let (result, ()) = tokio::join!(controller.run(), script);

    assert_eq!(result.unwrap(), Outcome::Interrupted);
    assert_eq!(store.completed(OpKind::Store), 1000);
    assert_eq!(store.submitted(OpKind::Fetch), 0);
    assert!(controller.context().counters().all_zero());
    assert_eq!(controller.stats().batches, 1);
}

#[tokio::test]
async fn test_transport_failure_reconnects() {
    let store = MemoryStore::new();
    store.hold();
    let mut config = readback_config(20);
    config.cycles = Some(2);
    let mut controller = controller(config, &store);

    let script = async {
        wait_until(|| store.held_count() == 20).await;
        assert!(store.break_connection("connection reset by peer"));
        store.release_all();
    };

    let (result, ()) = tokio::join!(controller.run(), script);

    assert_eq!(result.unwrap(), Outcome::Completed);
    assert_eq!(store.connections_opened(), 2);
    assert_eq!(controller.stats().reconnects, 1);
    assert_eq!(controller.stats().cycles, 2);
    assert!(controller.stats().kind(OpKind::Store).failed >= 20);
}

#[tokio::test]
async fn test_transport_failure_without_reconnect_exits() {
    let store = MemoryStore::new();
    store.hold();
    let mut config = readback_config(20);
    config.reconnect = false;
    let mut controller = controller(config, &store);

    let script = async {
        wait_until(|| store.held_count() == 20).await;
        store.break_connection("connection reset by peer");
        store.release_all();
    };

    let (result, ()) = tokio::join!(controller.run(), script);

    let err = result.unwrap_err();
    assert!(matches!(err, DriverError::ConnectionLost { .. }));
    assert_eq!(err.exit_code(), EXIT_SETUP);
    assert_eq!(store.completed(OpKind::Store), 20);
    assert!(controller.context().counters().all_zero());
}

#[tokio::test]
async fn test_interrupt_during_failure_drain_is_clean() {
    let store = MemoryStore::new();
    store.hold();
    let mut config = readback_config(20);
    config.reconnect = false;
    let mut controller = controller(config, &store);
    let interrupt = controller.interrupt_handle();

    let script = async {
        wait_until(|| store.held_count() == 20).await;
        store.break_connection("connection reset by peer");
        tokio::time::sleep(Duration::from_millis(20)).await;
        interrupt.interrupt();
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.release_all();
    };

    let (result, ()) = tokio::join!(controller.run(), script);

    let outcome = result.unwrap();
    assert_eq!(outcome, Outcome::Interrupted);
    assert_eq!(outcome.exit_code(), 0);
    assert!(controller.context().counters().all_zero());
}

#[tokio::test]
async fn test_connect_failures_are_retried() {
    let store = MemoryStore::new();
    store.fail_next_connect(2);
    let mut config = readback_config(10);
    config.cycles = Some(1);
    let mut controller = controller(config, &store);

    assert_eq!(controller.run().await.unwrap(), Outcome::Completed);
    assert_eq!(store.connections_opened(), 3);
    assert_eq!(controller.stats().reconnects, 2);
}

#[tokio::test]
async fn test_refused_connection_is_setup_failure() {
    let store = MemoryStore::new();
    store.refuse_connections(true);
    let mut controller = controller(readback_config(10), &store);

    let err = controller.run().await.unwrap_err();
    assert!(matches!(err, DriverError::Open(_)));
    assert_eq!(err.exit_code(), EXIT_SETUP);
}

#[tokio::test]
async fn test_backpressure_abandons_batch() {
    let store = MemoryStore::new().with_max_in_flight(10);
    let mut config = readback_config(50);
    config.reconnect = false;
    let mut controller = controller(config, &store);

    let err = controller.run().await.unwrap_err();
    assert!(matches!(
        err,
        DriverError::Submit(SubmitError::Backpressure { limit: 10 })
    ));
    assert_eq!(store.submitted(OpKind::Store), 10);
    assert_eq!(store.completed(OpKind::Store), 10);
    assert_eq!(store.submitted(OpKind::Fetch), 0);
    assert!(controller.context().counters().all_zero());
    assert_eq!(controller.stats().submit_failures, 1);
}

#[tokio::test]
async fn test_store_failures_are_soft() {
    let store = MemoryStore::new();
    store.fail_next_stores(3);
    let mut config = readback_config(30);
    config.keys = KeyPolicy::Unique;
    config.cycles = Some(1);
    let mut controller = controller(config, &store);

    assert_eq!(controller.run().await.unwrap(), Outcome::Completed);
    let stats = controller.stats();
    assert_eq!(stats.kind(OpKind::Store).failed, 3);
    assert_eq!(stats.not_found, 3);
    assert_eq!(stats.kind(OpKind::Fetch).ok, 27);
}

#[tokio::test]
async fn test_timeouts_complete_as_failures() {
    let store = MemoryStore::new();
    store.hold();
    let mut config = readback_config(10);
    config.cycles = Some(1);
    config.timeouts = Timeouts::uniform(20);
    let mut controller = controller(config, &store);

    assert_eq!(controller.run().await.unwrap(), Outcome::Completed);
    let stats = controller.stats();
    assert_eq!(stats.kind(OpKind::Store).failed, 10);
    assert_eq!(stats.kind(OpKind::Fetch).failed, 10);
    assert!(controller.context().counters().all_zero());
    assert_eq!(store.held_count(), 0);
}

#[tokio::test]
async fn test_soak_write_then_check() {
    let store = MemoryStore::new();
    let mut writer = controller(soak_config(WorkloadMode::SoakWrite, 10), &store);
    assert_eq!(writer.run().await.unwrap(), Outcome::Completed);
    assert_eq!(store.len(), 10);
    assert_eq!(store.get_raw("key:4").unwrap(), soak_pattern(4, 1024));

    let mut checker = controller(soak_config(WorkloadMode::SoakCheck, 10), &store);
    assert_eq!(checker.run().await.unwrap(), Outcome::Completed);
    assert_eq!(checker.stats().kind(OpKind::Fetch).ok, 10);
}

#[tokio::test]
async fn test_soak_check_captures_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    for serial in 0..10 {
        store.insert_raw(format!("key:{serial}"), soak_pattern(serial, 1024));
    }
    store.corrupt("key:3");

    let mut config = soak_config(WorkloadMode::SoakCheck, 10);
    config.capture_dir = Some(dir.path().to_path_buf());
    let mut checker = controller(config, &store);

    let err = checker.run().await.unwrap_err();
    assert_eq!(err.exit_code(), EXIT_INTEGRITY);
    assert_eq!(
        err.violation(),
        Some(&Violation::PatternMismatch {
            key: "key:3".to_string(),
            serial: 3,
            offset: 512
        })
    );
    assert!(dir.path().join("invalid_3").exists());
}

#[tokio::test]
async fn test_soak_check_missing_key_is_soft() {
    let store = MemoryStore::new();
    let mut checker = controller(soak_config(WorkloadMode::SoakCheck, 5), &store);

    assert_eq!(checker.run().await.unwrap(), Outcome::Completed);
    assert_eq!(checker.stats().not_found, 5);
}

#[tokio::test]
async fn test_soak_capture_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    store.insert_raw("key:0", "payload");

    let mut config = soak_config(WorkloadMode::SoakCapture, 10);
    config.capture_dir = Some(dir.path().to_path_buf());
    let mut capture = controller(config, &store);

    let outcome = capture.run().await.unwrap();
    let path = dir.path().join("invalid_0");
    assert_eq!(outcome, Outcome::Captured { path: path.clone() });
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(std::fs::read(path).unwrap(), b"payload");
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let store = MemoryStore::new();
    let mut config = readback_config(100);
    config.keys = KeyPolicy::Cyclic { pool_size: 10 };
    let connector = MemoryConnector::new(store, config.timeouts);

    let err = Controller::new(config, connector).err().unwrap();
    assert!(matches!(err, DriverError::Config(_)));
    assert_eq!(err.exit_code(), EXIT_SETUP);
}

#[tokio::test]
async fn test_soak_capture_without_capture_dir_rejected() {
    let config = soak_config(WorkloadMode::SoakCapture, 10);
    let connector = MemoryConnector::new(MemoryStore::new(), config.timeouts);

    let err = Controller::new(config, connector).err().unwrap();
    assert!(matches!(err, DriverError::Config(_)));
    assert_eq!(err.exit_code(), EXIT_SETUP);
}
