//! End-to-end runs of the controller runtime.
//!
//! The simulation test runs the full worker set on an accelerated clock
//! with millisecond ticks: 600 simulated seconds every 2ms, so a fifty-tick
//! simulation finishes in well under a second of wall time.

use std::sync::Arc;
use std::time::Duration;

use smartminer_core::clock::LogicalClock;
use smartminer_core::orders::{
    MarketplaceDriver, NewOrder, RampMode, RampPolicy, SimulationDriver,
};
use smartminer_core::store::{KeyValueStore, MemoryStore, OrderSampleSink, SqliteStore};
use smartminer_core::virtual_orders::{
    ValidityRule, VirtualOrderRegistry, VirtualOrderStatus, CHECKPOINT_KEY, CHECKPOINT_OWNER,
};
use smartminer_core::{Config, ControllerRuntime};
use tempfile::NamedTempFile;

const START: i64 = 1_574_464_584;

fn fast_simulation_config(identifier: &str) -> Config {
    let mut config = Config::simulation();
    config.identifier = identifier.to_string();
    config.real_tick_secs = 0.002;
    config.simulated_tick_secs = 600;
    config.clock_start = Some(START);
    config.simulation_end = Some(START + 50 * 600);
    config.ramp = RampPolicy::new(RampMode::Clamped, 0.1);
    config
}

#[test]
fn test_simulation_run_reconciles_checkpoints_and_samples() {
    smartminer_core::logging::init_tracing("smartminer_core=debug");

    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file.path().to_str().unwrap().to_string();
    let store = Arc::new(SqliteStore::open(&db_path).unwrap());

    let config = fast_simulation_config("it-sim");
    let clock = Arc::new(config.build_clock().unwrap());
    let market = Arc::new(SimulationDriver::new("it-sim", clock.clone(), config.ramp));
    market
        .create_order(NewOrder::new(START, 2.0, 0.002, 0.01).with_order_id("O1"))
        .unwrap();

    let runtime = ControllerRuntime::new(
        config,
        clock.clone(),
        store.clone(),
        Some(store.clone() as Arc<dyn OrderSampleSink>),
        market.clone(),
    )
    .unwrap();
    assert!(runtime.has_clock_advancer());

    // Filed before start: the fresh registry keeps them as its first checkpoint.
    let registry = runtime.registry().clone();
    registry.upsert("A", "O1", 3.0, START, START + 1_000_000);
    registry.upsert("B", "O1", 2.0, START, START + 1_000_000);
    registry.upsert("C", "O-missing", 1.0, START, START + 1_000_000);
    registry.upsert("D", "O1", 50.0, START, START + 1_200);

    runtime.start().unwrap();
    assert!(runtime.wait_for_simulation_end(Duration::from_millis(5)));
    runtime.shutdown().unwrap();

    assert!(clock.now() >= START + 50 * 600);

    // D expired and was swept; the rest carry reconciliation statuses.
    assert!(registry.get("D").is_none());
    assert_eq!(registry.get("A").unwrap().status, VirtualOrderStatus::Ok);
    assert_eq!(registry.get("B").unwrap().status, VirtualOrderStatus::Ok);
    assert_eq!(registry.get("C").unwrap().status, VirtualOrderStatus::OrderNotFound);

    let report = runtime.last_report().expect("reconciler ran at least once");
    assert!(report.bucket("O-missing").is_some());

    // The limit only ever moved by deltas appended to the order's log.
    let model = market.order_model("O1").unwrap();
    assert!(model.changes().len() > 1);
    assert_eq!(model.changes()[0].limit_delta, 2.0);

    // Final checkpoint reflects the swept, reconciled registry.
    let blob = store.get(CHECKPOINT_OWNER, CHECKPOINT_KEY).unwrap().unwrap();
    assert!(blob.contains("\"ORDER_NOT_FOUND\""));
    assert!(!blob.contains("\"virtual_order_id\":\"D\""));

    let samples = store.samples_for("it-sim").unwrap();
    assert!(!samples.is_empty());
    assert!(samples.iter().all(|s| s.order_id == "O1"));
}

#[test]
fn test_registry_restores_across_runtimes() {
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file.path().to_str().unwrap().to_string();

    let build = |identifier: &str| {
        let store = Arc::new(SqliteStore::open(&db_path).unwrap());
        let config = fast_simulation_config(identifier);
        let clock = Arc::new(config.build_clock().unwrap());
        let market = Arc::new(SimulationDriver::new(identifier, clock.clone(), config.ramp));
        let sink: Arc<dyn OrderSampleSink> = store.clone();
        ControllerRuntime::new(config, clock, store, Some(sink), market).unwrap()
    };

    let first = build("first");
    first
        .registry()
        .upsert("keep", "O1", 4.0, START, START + 10_000_000);
    first.start().unwrap();
    first.wait_for_simulation_end(Duration::from_millis(5));
    first.shutdown().unwrap();

    let second = build("second");
    second.start().unwrap();
    second.wait_for_simulation_end(Duration::from_millis(5));
    second.shutdown().unwrap();

    let kept = second.registry().get("keep").expect("restored from checkpoint");
    assert_eq!(kept.requested_limit, 4.0);
    assert_eq!(kept.status, VirtualOrderStatus::OrderNotFound);
}

#[test]
fn test_realtime_runtime_has_no_advancer_and_closes_orders() {
    let mut config = Config::realtime();
    config.close_orders_on_shutdown = true;

    let clock = Arc::new(LogicalClock::realtime());
    let market = Arc::new(SimulationDriver::new(
        "live",
        clock.clone(),
        RampPolicy::default(),
    ));
    market
        .create_order(NewOrder::new(clock.now(), 1.0, 0.002, 0.01))
        .unwrap();

    let runtime = ControllerRuntime::new(
        config,
        clock,
        Arc::new(MemoryStore::new()),
        None,
        market.clone(),
    )
    .unwrap();
    assert!(!runtime.has_clock_advancer());

    runtime.start().unwrap();
    assert!(!runtime.wait_for_simulation_end(Duration::from_millis(1)));
    runtime.shutdown().unwrap();

    assert!(market.list_orders().unwrap().is_empty());
}

fn realtime_runtime(store: Arc<MemoryStore>) -> ControllerRuntime {
    let clock = Arc::new(LogicalClock::realtime());
    let market = Arc::new(SimulationDriver::new("live", clock.clone(), RampPolicy::default()));
    ControllerRuntime::new(Config::realtime(), clock, store, None, market).unwrap()
}

#[test]
fn test_requests_filed_right_after_start_survive_restore() {
    let store = Arc::new(MemoryStore::new());
    let earlier = VirtualOrderRegistry::new(store.clone(), ValidityRule::UntilExpiration);
    earlier.upsert("old", "O1", 1.0, 0, i64::MAX);
    earlier.checkpoint().unwrap();

    let runtime = realtime_runtime(store.clone());
    runtime.start().unwrap();
    for i in 0..20 {
        assert!(runtime
            .registry()
            .upsert(&format!("new{}", i), "O1", 0.5, 0, i64::MAX));
    }
    // a second start must not restore over the new requests
    runtime.start().unwrap();
    runtime.shutdown().unwrap();

    let registry = runtime.registry();
    assert!(registry.get("old").is_some());
    assert_eq!(registry.len(), 21);

    let blob = store.get(CHECKPOINT_OWNER, CHECKPOINT_KEY).unwrap().unwrap();
    assert!(blob.contains("\"new19\""));
}

#[test]
fn test_unreadable_checkpoint_fails_start_and_is_left_alone() {
    let store = Arc::new(MemoryStore::new());
    store.put(CHECKPOINT_OWNER, CHECKPOINT_KEY, "not json").unwrap();

    let runtime = realtime_runtime(store.clone());
    assert!(runtime.start().is_err());
    runtime.shutdown().unwrap();

    assert!(runtime.registry().is_empty());
    assert_eq!(
        store.get(CHECKPOINT_OWNER, CHECKPOINT_KEY).unwrap().as_deref(),
        Some("not json")
    );
}

#[test]
fn test_wait_for_simulation_end_before_start_returns() {
    let config = fast_simulation_config("never-started");
    let clock = Arc::new(config.build_clock().unwrap());
    let market = Arc::new(SimulationDriver::new("never-started", clock.clone(), config.ramp));
    let store = Arc::new(MemoryStore::new());
    let sink: Arc<dyn OrderSampleSink> = store.clone();
    let runtime = ControllerRuntime::new(config, clock, store, Some(sink), market).unwrap();

    assert!(!runtime.wait_for_simulation_end(Duration::from_millis(1)));
}
