use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::RwLock;
use tracing::{debug, info};

use super::driver::{Algorithm, Market, MarketplaceDriver, NewOrder, OrderSnapshot, OrderType};
use super::model::{RampPolicy, RateLimitedOrder};
use crate::clock::{ClockReader, Timestamp};

struct SimulatedOrder {
    model: RateLimitedOrder,
    budget_left: f64,
    updated_at: Timestamp,
    pool_id: String,
    market: Market,
    algorithm: Algorithm,
    order_type: OrderType,
}

impl SimulatedOrder {
    fn snapshot_at(&self, timestamp: Timestamp) -> OrderSnapshot {
        OrderSnapshot {
            order_id: self.model.order_id().to_string(),
            created_at: self.model.created_at(),
            updated_at: self.updated_at,
            limit: self.model.requested_limit_through(timestamp),
            effective_limit: self.model.limit_at(timestamp),
            price: self.model.price_at(timestamp),
            budget_left: self.budget_left,
            pool_id: self.pool_id.clone(),
            market: self.market,
            algorithm: self.algorithm,
            order_type: self.order_type,
        }
    }
}

/// In-process marketplace backed by [`RateLimitedOrder`] change logs.
///
/// Snapshots are evaluated at the injected clock's `now`.
pub struct SimulationDriver {
    identifier: String,
    clock: Arc<dyn ClockReader>,
    policy: RampPolicy,
    orders: RwLock<BTreeMap<String, SimulatedOrder>>,
}

impl SimulationDriver {
    pub fn new(identifier: impl Into<String>, clock: Arc<dyn ClockReader>, policy: RampPolicy) -> Self {
        Self {
            identifier: identifier.into(),
            clock,
            policy,
            orders: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn policy(&self) -> RampPolicy {
        self.policy
    }

    /// Snapshot of one order at an arbitrary instant.
    pub fn order_at(&self, order_id: &str, timestamp: Timestamp) -> Option<OrderSnapshot> {
        self.orders
            .read()
            .get(order_id)
            .map(|o| o.snapshot_at(timestamp))
    }

    /// Copy of the change log of one order.
    pub fn order_model(&self, order_id: &str) -> Option<RateLimitedOrder> {
        self.orders.read().get(order_id).map(|o| o.model.clone())
    }

    fn generate_order_id(&self, created_at: Timestamp, taken: &BTreeMap<String, SimulatedOrder>) -> String {
        let base = format!("{}_{}", self.identifier, created_at);
        if !taken.contains_key(&base) {
            return base;
        }
        (1..)
            .map(|n| format!("{}_{}", base, n))
            .find(|candidate| !taken.contains_key(candidate))
            .unwrap_or(base)
    }
}

impl MarketplaceDriver for SimulationDriver {
    fn get_order(&self, order_id: &str) -> Result<Option<OrderSnapshot>> {
        Ok(self.order_at(order_id, self.clock.now()))
    }

    fn apply_delta(
        &self,
        order_id: &str,
        limit_delta: f64,
        price_delta: f64,
        timestamp: Timestamp,
    ) -> Result<bool> {
        if !limit_delta.is_finite() || !price_delta.is_finite() {
            bail!("non-finite delta for order {}: limit={}, price={}", order_id, limit_delta, price_delta);
        }
        let mut orders = self.orders.write();
        let Some(order) = orders.get_mut(order_id) else {
            return Ok(false);
        };
        order.model.record_change(timestamp, limit_delta, price_delta);
        order.updated_at = timestamp;
        debug!(order_id, limit_delta, price_delta, timestamp, "simulated order changed");
        Ok(true)
    }

    fn create_order(&self, new_order: NewOrder) -> Result<OrderSnapshot> {
        let mut orders = self.orders.write();
        let order_id = match new_order.order_id {
            Some(id) if orders.contains_key(&id) => bail!("order {} already exists", id),
            Some(id) => id,
            None => self.generate_order_id(new_order.created_at, &orders),
        };

        let order = SimulatedOrder {
            model: RateLimitedOrder::new(
                order_id.clone(),
                new_order.created_at,
                new_order.limit,
                new_order.price,
                self.policy,
            ),
            budget_left: new_order.amount,
            updated_at: new_order.created_at,
            pool_id: new_order.pool_id,
            market: new_order.market,
            algorithm: new_order.algorithm,
            order_type: new_order.order_type,
        };
        let snapshot = order.snapshot_at(new_order.created_at);
        orders.insert(order_id.clone(), order);

        info!(order_id = %order_id, limit = new_order.limit, price = new_order.price, "simulated order created");
        Ok(snapshot)
    }

    fn close_order(&self, order_id: &str) -> Result<bool> {
        let removed = self.orders.write().remove(order_id).is_some();
        if removed {
            info!(order_id, "simulated order closed");
        }
        Ok(removed)
    }

    fn list_orders(&self) -> Result<Vec<OrderSnapshot>> {
        let now = self.clock.now();
        Ok(self
            .orders
            .read()
            .values()
            .map(|o| o.snapshot_at(now))
            .collect())
    }

    fn refill_order(&self, order_id: &str, amount: f64, timestamp: Timestamp) -> Result<bool> {
        let mut orders = self.orders.write();
        let Some(order) = orders.get_mut(order_id) else {
            return Ok(false);
        };
        order.budget_left += amount;
        order.updated_at = timestamp;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::orders::RampMode;

    fn driver(now: Timestamp) -> SimulationDriver {
        SimulationDriver::new(
            "sim",
            Arc::new(FixedClock(now)),
            RampPolicy::new(RampMode::Clamped, 0.1),
        )
    }

    #[test]
    fn test_generated_ids_follow_identifier_and_timestamp() {
        let d = driver(2_000);
        let a = d.create_order(NewOrder::new(1_000, 1.0, 0.002, 0.01)).unwrap();
        let b = d.create_order(NewOrder::new(1_000, 1.0, 0.002, 0.01)).unwrap();
        assert_eq!(a.order_id, "sim_1000");
        assert_eq!(b.order_id, "sim_1000_1");
        assert_eq!(d.list_orders().unwrap().len(), 2);
    }

    #[test]
    fn test_explicit_id_must_be_free() {
        let d = driver(2_000);
        d.create_order(NewOrder::new(1_000, 1.0, 0.002, 0.01).with_order_id("O1"))
            .unwrap();
        assert!(d
            .create_order(NewOrder::new(1_000, 1.0, 0.002, 0.01).with_order_id("O1"))
            .is_err());
    }

    #[test]
    fn test_get_order_evaluates_model_at_clock_now() {
        let d = driver(1_050);
        d.create_order(NewOrder::new(1_000, 10.0, 0.002, 0.01).with_order_id("O1"))
            .unwrap();

        let snap = d.get_order("O1").unwrap().unwrap();
        assert_eq!(snap.limit, 10.0);
        assert!((snap.effective_limit - 5.0).abs() < 1e-9);
        assert_eq!(snap.market, Market::Eu);
        assert_eq!(snap.pool_id, crate::orders::DEFAULT_POOL_ID);
        assert!(d.get_order("missing").unwrap().is_none());
    }

    #[test]
    fn test_apply_delta_appends_change() {
        let d = driver(10_000);
        d.create_order(NewOrder::new(1_000, 12.0, 0.002, 0.01).with_order_id("O1"))
            .unwrap();

        assert!(d.apply_delta("O1", 3.0, 0.0, 5_000).unwrap());
        assert!(!d.apply_delta("O2", 3.0, 0.0, 5_000).unwrap());
        assert!(d.apply_delta("O1", f64::NAN, 0.0, 5_000).is_err());

        let model = d.order_model("O1").unwrap();
        assert_eq!(model.changes().len(), 2);
        assert_eq!(model.changes()[1].limit_delta, 3.0);
        assert!((d.get_order("O1").unwrap().unwrap().limit - 15.0).abs() < 1e-9);
        assert_eq!(d.get_order("O1").unwrap().unwrap().updated_at, 5_000);
    }

    #[test]
    fn test_delta_is_visible_in_limit_at_the_same_instant() {
        let d = driver(2_000);
        d.create_order(NewOrder::new(1_000, 12.0, 0.002, 0.01).with_order_id("O1"))
            .unwrap();

        assert!(d.apply_delta("O1", 3.0, 0.0, 2_000).unwrap());
        let snap = d.get_order("O1").unwrap().unwrap();
        assert_eq!(snap.limit, 15.0);
        assert!((snap.effective_limit - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_refill_and_close_all() {
        let d = driver(2_000);
        d.create_order(NewOrder::new(1_000, 1.0, 0.002, 0.01).with_order_id("A"))
            .unwrap();
        d.create_order(NewOrder::new(1_000, 1.0, 0.002, 0.01).with_order_id("B"))
            .unwrap();

        assert!(d.refill_order("A", 0.5, 1_500).unwrap());
        assert!((d.get_order("A").unwrap().unwrap().budget_left - 0.51).abs() < 1e-9);

        assert_eq!(d.close_all_orders().unwrap(), 2);
        assert!(d.list_orders().unwrap().is_empty());
        assert!(!d.close_order("A").unwrap());
    }
}
