//! Reconciliation passes against a recording marketplace fake.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;

use super::*;
use crate::clock::{FixedClock, Timestamp};
use crate::orders::{
    MarketplaceDriver, NewOrder, OrderSnapshot, RampMode, RampPolicy, SimulationDriver,
};
use crate::store::MemoryStore;

#[derive(Default)]
struct RecordingDriver {
    limits: Mutex<HashMap<String, f64>>,
    deltas: Mutex<Vec<(String, f64)>>,
    failing_lookups: Mutex<HashSet<String>>,
    failing_applies: Mutex<HashSet<String>>,
}

impl RecordingDriver {
    fn with_order(self, order_id: &str, limit: f64) -> Self {
        self.limits.lock().insert(order_id.to_string(), limit);
        self
    }

    fn deltas(&self) -> Vec<(String, f64)> {
        self.deltas.lock().clone()
    }
}

impl MarketplaceDriver for RecordingDriver {
    fn get_order(&self, order_id: &str) -> Result<Option<OrderSnapshot>> {
        if self.failing_lookups.lock().contains(order_id) {
            return Err(anyhow!("connection reset"));
        }
        Ok(self.limits.lock().get(order_id).map(|&limit| OrderSnapshot {
            order_id: order_id.to_string(),
            created_at: 0,
            updated_at: 0,
            limit,
            effective_limit: limit,
            price: 0.002,
            budget_left: 0.0,
            pool_id: String::new(),
            market: Default::default(),
            algorithm: Default::default(),
            order_type: Default::default(),
        }))
    }

    fn apply_delta(&self, order_id: &str, limit_delta: f64, _price_delta: f64, _timestamp: Timestamp) -> Result<bool> {
        if self.failing_applies.lock().contains(order_id) {
            return Err(anyhow!("rate limited"));
        }
        let mut limits = self.limits.lock();
        let Some(limit) = limits.get_mut(order_id) else {
            return Ok(false);
        };
        *limit += limit_delta;
        self.deltas.lock().push((order_id.to_string(), limit_delta));
        Ok(true)
    }

    fn create_order(&self, _order: NewOrder) -> Result<OrderSnapshot> {
        Err(anyhow!("not supported by the fake"))
    }

    fn close_order(&self, order_id: &str) -> Result<bool> {
        Ok(self.limits.lock().remove(order_id).is_some())
    }

    fn list_orders(&self) -> Result<Vec<OrderSnapshot>> {
        Ok(Vec::new())
    }

    fn refill_order(&self, _order_id: &str, _amount: f64, _timestamp: Timestamp) -> Result<bool> {
        Ok(false)
    }
}

fn setup(driver: RecordingDriver) -> (Arc<VirtualOrderRegistry>, Arc<RecordingDriver>, AggregationReconciler) {
    let registry = Arc::new(VirtualOrderRegistry::new(
        Arc::new(MemoryStore::new()),
        ValidityRule::UntilExpiration,
    ));
    let driver = Arc::new(driver);
    let reconciler = AggregationReconciler::new(registry.clone(), driver.clone(), Duration::from_millis(10));
    (registry, driver, reconciler)
}

fn status(registry: &VirtualOrderRegistry, id: &str) -> VirtualOrderStatus {
    registry.get(id).unwrap().status
}

#[test]
fn test_applies_delta_not_absolute_limit() {
    let (registry, driver, mut reconciler) = setup(RecordingDriver::default().with_order("O1", 12.0));
    registry.upsert("A", "O1", 10.0, 0, 100);
    registry.upsert("B", "O1", 5.0, 0, 100);

    let report = reconciler.reconcile(40);

    assert_eq!(driver.deltas(), vec![("O1".to_string(), 3.0)]);
    let bucket = report.bucket("O1").unwrap();
    assert_eq!(bucket.requested_total, 15.0);
    assert_eq!(bucket.current_limit, Some(12.0));
    assert_eq!(bucket.outcome, BucketOutcome::Applied { delta: 3.0 });
    assert_eq!(status(&registry, "A"), VirtualOrderStatus::Ok);
    assert_eq!(status(&registry, "B"), VirtualOrderStatus::Ok);
    assert_eq!(reconciler.phase(), ReconcilePhase::Idle);
}

#[test]
fn test_missing_order_marks_bucket_without_delta() {
    let (registry, driver, mut reconciler) = setup(RecordingDriver::default().with_order("O1", 15.0));
    registry.upsert("A", "O1", 15.0, 0, 100);
    registry.upsert("C", "O2", 7.0, 0, 100);
    registry.upsert("D", "O2", 1.0, 0, 100);

    let report = reconciler.reconcile(40);

    assert!(driver.deltas().is_empty(), "O1 already matches and O2 is missing");
    assert_eq!(report.bucket("O1").unwrap().outcome, BucketOutcome::Unchanged);
    assert_eq!(report.bucket("O2").unwrap().outcome, BucketOutcome::OrderNotFound);
    assert_eq!(report.not_found(), 1);
    assert_eq!(status(&registry, "A"), VirtualOrderStatus::Ok);
    assert_eq!(status(&registry, "C"), VirtualOrderStatus::OrderNotFound);
    assert_eq!(status(&registry, "D"), VirtualOrderStatus::OrderNotFound);
}

#[test]
fn test_one_failing_bucket_does_not_block_others() {
    let driver = RecordingDriver::default()
        .with_order("O1", 0.0)
        .with_order("O2", 0.0)
        .with_order("O3", 0.0);
    driver.failing_lookups.lock().insert("O1".to_string());
    driver.failing_applies.lock().insert("O2".to_string());
    let (registry, driver, mut reconciler) = setup(driver);
    registry.upsert("A", "O1", 1.0, 0, 100);
    registry.upsert("B", "O2", 2.0, 0, 100);
    registry.upsert("C", "O3", 3.0, 0, 100);

    let report = reconciler.reconcile(40);

    assert_eq!(report.failures(), 2);
    assert!(matches!(report.bucket("O1").unwrap().outcome, BucketOutcome::LookupFailed { .. }));
    assert!(matches!(
        report.bucket("O2").unwrap().outcome,
        BucketOutcome::ApplyFailed { delta, .. } if delta == 2.0
    ));
    assert_eq!(driver.deltas(), vec![("O3".to_string(), 3.0)]);

    // lookup failure leaves status alone; a failed update still means the order exists
    assert_eq!(status(&registry, "A"), VirtualOrderStatus::NotSet);
    assert_eq!(status(&registry, "B"), VirtualOrderStatus::Ok);
    assert_eq!(status(&registry, "C"), VirtualOrderStatus::Ok);
}

#[test]
fn test_failed_update_is_rederived_next_pass() {
    let driver = RecordingDriver::default().with_order("O1", 4.0);
    driver.failing_applies.lock().insert("O1".to_string());
    let (registry, driver, mut reconciler) = setup(driver);
    registry.upsert("A", "O1", 9.0, 0, 100);

    reconciler.reconcile(10);
    assert!(driver.deltas().is_empty());

    driver.failing_applies.lock().clear();
    reconciler.reconcile(20);
    reconciler.reconcile(30);
    assert_eq!(driver.deltas(), vec![("O1".to_string(), 5.0)]);
}

#[test]
fn test_expired_requests_release_their_share() {
    let (registry, driver, mut reconciler) = setup(RecordingDriver::default().with_order("O1", 0.0));
    registry.upsert("A", "O1", 10.0, 0, 100);
    registry.upsert("B", "O1", 5.0, 0, 50);

    reconciler.reconcile(40);
    // B expired at 50; only A's share remains, so the limit comes back down
    reconciler.reconcile(60);

    assert_eq!(
        driver.deltas(),
        vec![("O1".to_string(), 15.0), ("O1".to_string(), -5.0)]
    );
}

#[test]
fn test_report_handle_tracks_last_pass() {
    let (registry, _driver, mut reconciler) = setup(RecordingDriver::default().with_order("O1", 0.0));
    let handle = reconciler.report_handle();
    assert!(handle.lock().is_none());

    registry.upsert("A", "O1", 1.0, 0, 100);
    reconciler.reconcile(40);
    let last = handle.lock().clone().unwrap();
    assert_eq!(last.now, 40);
    assert_eq!(last.applied(), 1);
}

#[test]
fn test_reconciles_against_simulated_marketplace() {
    let clock = Arc::new(FixedClock(2_000));
    let market = Arc::new(SimulationDriver::new(
        "sim",
        clock,
        RampPolicy::new(RampMode::Clamped, 0.1),
    ));
    market
        .create_order(NewOrder::new(1_000, 12.0, 0.002, 0.01).with_order_id("O1"))
        .unwrap();

    let registry = Arc::new(VirtualOrderRegistry::new(
        Arc::new(MemoryStore::new()),
        ValidityRule::UntilExpiration,
    ));
    registry.upsert("A", "O1", 10.0, 1_500, 5_000);
    registry.upsert("B", "O1", 5.0, 1_500, 5_000);

    let mut reconciler = AggregationReconciler::new(registry.clone(), market.clone(), Duration::from_millis(10));
    let report = reconciler.reconcile(2_000);

    assert_eq!(report.bucket("O1").unwrap().outcome, BucketOutcome::Applied { delta: 3.0 });
    let model = market.order_model("O1").unwrap();
    assert_eq!(model.changes().last().unwrap().limit_delta, 3.0);
    assert_eq!(model.changes().last().unwrap().timestamp, 2_000);
}

#[test]
fn test_repeated_passes_at_one_instant_apply_delta_once() {
    // Steep ramp so the first change is fully delivered by the time we look.
    let market = Arc::new(SimulationDriver::new(
        "sim",
        Arc::new(FixedClock(2_000)),
        RampPolicy::new(RampMode::Clamped, 1_000.0),
    ));
    market
        .create_order(NewOrder::new(1_000, 12.0, 0.002, 0.01).with_order_id("O1"))
        .unwrap();

    let registry = Arc::new(VirtualOrderRegistry::new(
        Arc::new(MemoryStore::new()),
        ValidityRule::UntilExpiration,
    ));
    registry.upsert("A", "O1", 15.0, 1_500, 5_000);

    let mut reconciler = AggregationReconciler::new(registry.clone(), market.clone(), Duration::from_millis(10));
    let outcomes: Vec<BucketOutcome> = (0..3)
        .map(|_| reconciler.reconcile(2_000).bucket("O1").unwrap().outcome.clone())
        .collect();

    assert_eq!(
        outcomes,
        vec![
            BucketOutcome::Applied { delta: 3.0 },
            BucketOutcome::Unchanged,
            BucketOutcome::Unchanged,
        ]
    );
    assert_eq!(market.order_model("O1").unwrap().changes().len(), 2);
    assert_eq!(market.order_at("O1", 2_001).unwrap().effective_limit, 15.0);
}
