use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::registry::VirtualOrderRegistry;
use super::types::{OrderBucket, OrderId, VirtualOrderStatus};
use crate::clock::Timestamp;
use crate::orders::MarketplaceDriver;
use crate::worker::{Mailbox, TickFlow, TickResult, TickTask};

/// Where a reconciliation pass currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcilePhase {
    #[default]
    Idle,
    Collect,
    ComputeDelta,
    Apply,
    PublishStatus,
}

/// What happened to one target order during a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum BucketOutcome {
    /// `delta` was sent to the marketplace.
    Applied { delta: f64 },
    /// Requested total already matches the applied limit.
    Unchanged,
    /// The order does not exist; its virtual orders were marked
    /// `ORDER_NOT_FOUND`.
    OrderNotFound,
    /// Could not read the order. Statuses untouched, retried next pass.
    LookupFailed { error: String },
    /// The order exists but the update failed. Retried next pass.
    ApplyFailed { delta: f64, error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BucketReport {
    pub order_id: OrderId,
    pub requested_total: f64,
    pub current_limit: Option<f64>,
    pub virtual_orders: usize,
    pub outcome: BucketOutcome,
}

/// Result of one full pass over every target order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub now: Timestamp,
    pub buckets: Vec<BucketReport>,
}

impl ReconcileReport {
    pub fn bucket(&self, order_id: &str) -> Option<&BucketReport> {
        self.buckets.iter().find(|b| b.order_id == order_id)
    }

    pub fn applied(&self) -> usize {
        self.count(|o| matches!(o, BucketOutcome::Applied { .. }))
    }

    pub fn not_found(&self) -> usize {
        self.count(|o| matches!(o, BucketOutcome::OrderNotFound))
    }

    pub fn failures(&self) -> usize {
        self.count(|o| {
            matches!(
                o,
                BucketOutcome::LookupFailed { .. } | BucketOutcome::ApplyFailed { .. }
            )
        })
    }

    fn count(&self, pred: impl Fn(&BucketOutcome) -> bool) -> usize {
        self.buckets.iter().filter(|b| pred(&b.outcome)).count()
    }
}

/// Shared view of the most recent pass, readable from outside the worker.
pub type ReportHandle = Arc<Mutex<Option<ReconcileReport>>>;

/// Periodically sums live virtual orders per physical order and moves each
/// order's limit by the difference between the requested total and what
/// is currently applied.
///
/// Always a delta, never an absolute set: a pass acting on a stale view is
/// corrected by the next one.
pub struct AggregationReconciler {
    registry: Arc<VirtualOrderRegistry>,
    driver: Arc<dyn MarketplaceDriver>,
    interval: Duration,
    phase: ReconcilePhase,
    last_report: ReportHandle,
}

impl AggregationReconciler {
    pub fn new(
        registry: Arc<VirtualOrderRegistry>,
        driver: Arc<dyn MarketplaceDriver>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            driver,
            interval,
            phase: ReconcilePhase::Idle,
            last_report: Arc::new(Mutex::new(None)),
        }
    }

    pub fn phase(&self) -> ReconcilePhase {
        self.phase
    }

    pub fn report_handle(&self) -> ReportHandle {
        self.last_report.clone()
    }

    fn enter(&mut self, phase: ReconcilePhase) {
        trace!(from = ?self.phase, to = ?phase, "reconcile phase");
        self.phase = phase;
    }

    /// One full pass at `now`. Never fails as a whole: each target order's
    /// trouble is recorded in its own bucket report.
    pub fn reconcile(&mut self, now: Timestamp) -> ReconcileReport {
        self.enter(ReconcilePhase::Collect);
        let buckets = self.registry.aggregate_by_target_order(now);

        let mut report = ReconcileReport {
            now,
            buckets: Vec::with_capacity(buckets.len()),
        };
        for (order_id, bucket) in buckets {
            let bucket_report = self.reconcile_bucket(now, order_id, bucket);
            report.buckets.push(bucket_report);
        }
        self.enter(ReconcilePhase::Idle);

        *self.last_report.lock() = Some(report.clone());
        report
    }

    fn reconcile_bucket(&mut self, now: Timestamp, order_id: OrderId, bucket: OrderBucket) -> BucketReport {
        let requested_total = bucket.total();
        let mut report = BucketReport {
            order_id,
            requested_total,
            current_limit: None,
            virtual_orders: bucket.len(),
            outcome: BucketOutcome::Unchanged,
        };

        self.enter(ReconcilePhase::ComputeDelta);
        let current = match self.driver.get_order(&report.order_id) {
            Ok(current) => current,
            Err(e) => {
                warn!(order_id = %report.order_id, error = %format!("{:#}", e), "order lookup failed, retrying next tick");
                report.outcome = BucketOutcome::LookupFailed {
                    error: format!("{:#}", e),
                };
                return report;
            }
        };

        let status = match current {
            None => {
                debug!(order_id = %report.order_id, virtual_orders = bucket.len(), "target order not found");
                report.outcome = BucketOutcome::OrderNotFound;
                VirtualOrderStatus::OrderNotFound
            }
            Some(order) => {
                report.current_limit = Some(order.limit);
                let delta = requested_total - order.limit;
                report.outcome = self.apply(now, &report.order_id, delta);
                if report.outcome == BucketOutcome::OrderNotFound {
                    VirtualOrderStatus::OrderNotFound
                } else {
                    VirtualOrderStatus::Ok
                }
            }
        };

        self.enter(ReconcilePhase::PublishStatus);
        self.registry.publish_status(&bucket.virtual_order_ids, status);
        report
    }

    fn apply(&mut self, now: Timestamp, order_id: &str, delta: f64) -> BucketOutcome {
        if delta == 0.0 {
            return BucketOutcome::Unchanged;
        }

        self.enter(ReconcilePhase::Apply);
        match self.driver.apply_delta(order_id, delta, 0.0, now) {
            Ok(true) => {
                info!(order_id, delta, now, "order limit adjusted");
                BucketOutcome::Applied { delta }
            }
            // Closed between lookup and update.
            Ok(false) => BucketOutcome::OrderNotFound,
            Err(e) => {
                warn!(order_id, delta, error = %format!("{:#}", e), "order update failed, retrying next tick");
                BucketOutcome::ApplyFailed {
                    delta,
                    error: format!("{:#}", e),
                }
            }
        }
    }
}

impl TickTask for AggregationReconciler {
    fn name(&self) -> &str {
        "reconciler"
    }

    fn tick_interval(&self) -> Duration {
        self.interval
    }

    fn is_background(&self) -> bool {
        false
    }

    fn on_tick(&mut self, now: Timestamp, _messages: Mailbox) -> TickResult {
        let report = self.reconcile(now);
        if !report.buckets.is_empty() {
            debug!(
                now,
                orders = report.buckets.len(),
                applied = report.applied(),
                not_found = report.not_found(),
                failures = report.failures(),
                "reconcile pass complete"
            );
        }
        Ok(TickFlow::Continue)
    }
}
