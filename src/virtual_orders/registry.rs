use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::types::{
    OrderBucket, OrderId, ValidityRule, VirtualOrder, VirtualOrderId, VirtualOrderStatus,
};
use crate::clock::Timestamp;
use crate::store::KeyValueStore;

pub const CHECKPOINT_OWNER: &str = "virtual_orders_container";
pub const CHECKPOINT_KEY: &str = "data";
pub const VIRTUAL_ORDER_ID_LEN: usize = 16;

const CHECKPOINT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    version: u32,
    orders: Vec<VirtualOrder>,
}

/// Concurrent map of outstanding virtual orders.
///
/// Every operation takes the one map lock, so each observed state is one
/// the map actually passed through. Callers only ever get copies. Store
/// I/O happens outside the lock.
pub struct VirtualOrderRegistry {
    orders: Mutex<HashMap<VirtualOrderId, VirtualOrder>>,
    store: Arc<dyn KeyValueStore>,
    validity: ValidityRule,
}

impl VirtualOrderRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>, validity: ValidityRule) -> Self {
        Self {
            orders: Mutex::new(HashMap::new()),
            store,
            validity,
        }
    }

    pub fn validity(&self) -> ValidityRule {
        self.validity
    }

    /// Fresh id not used by any entry currently in the map.
    pub fn allocate_id(&self) -> VirtualOrderId {
        let orders = self.orders.lock();
        fresh_id(&orders)
    }

    /// Insert or replace the entry at `virtual_order_id`, resetting its status.
    /// Returns false (and stores nothing) if `requested_limit` is not finite.
    pub fn upsert(
        &self,
        virtual_order_id: &str,
        target_order_id: &str,
        requested_limit: f64,
        created_at: Timestamp,
        expires_at: Timestamp,
    ) -> bool {
        if !accepts_limit(virtual_order_id, requested_limit) {
            return false;
        }
        let order = VirtualOrder::new(
            virtual_order_id,
            target_order_id,
            requested_limit,
            created_at,
            expires_at,
        );
        self.orders.lock().insert(order.virtual_order_id.clone(), order);
        true
    }

    /// Allocate an id and insert under it in one step. `None` if
    /// `requested_limit` is not finite.
    pub fn submit(
        &self,
        target_order_id: &str,
        requested_limit: f64,
        created_at: Timestamp,
        expires_at: Timestamp,
    ) -> Option<VirtualOrderId> {
        if !accepts_limit(target_order_id, requested_limit) {
            return None;
        }
        let mut orders = self.orders.lock();
        let id = fresh_id(&orders);
        orders.insert(
            id.clone(),
            VirtualOrder::new(id.clone(), target_order_id, requested_limit, created_at, expires_at),
        );
        debug!(virtual_order_id = %id, target_order_id, requested_limit, expires_at, "virtual order submitted");
        Some(id)
    }

    /// Returns false (and does nothing) if the id is unknown.
    pub fn set_status(&self, virtual_order_id: &str, status: VirtualOrderStatus) -> bool {
        match self.orders.lock().get_mut(virtual_order_id) {
            Some(order) => {
                order.status = status;
                true
            }
            None => false,
        }
    }

    /// Set one status on many entries under a single lock acquisition.
    /// Unknown ids are skipped. Returns how many were updated.
    pub fn publish_status(&self, virtual_order_ids: &[VirtualOrderId], status: VirtualOrderStatus) -> usize {
        let mut orders = self.orders.lock();
        let mut updated = 0;
        for id in virtual_order_ids {
            if let Some(order) = orders.get_mut(id) {
                order.status = status;
                updated += 1;
            }
        }
        updated
    }

    pub fn remove(&self, virtual_order_id: &str) -> bool {
        self.orders.lock().remove(virtual_order_id).is_some()
    }

    pub fn get(&self, virtual_order_id: &str) -> Option<VirtualOrder> {
        self.orders.lock().get(virtual_order_id).cloned()
    }

    /// Every entry, live or not, ordered by id.
    pub fn snapshot(&self) -> Vec<VirtualOrder> {
        let mut all: Vec<VirtualOrder> = self.orders.lock().values().cloned().collect();
        all.sort_by(|a, b| a.virtual_order_id.cmp(&b.virtual_order_id));
        all
    }

    pub fn len(&self) -> usize {
        self.orders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.lock().is_empty()
    }

    /// Drop every entry that is not live at `as_of`. Returns how many went.
    pub fn sweep_expired(&self, as_of: Timestamp) -> usize {
        let rule = self.validity;
        let mut orders = self.orders.lock();
        let before = orders.len();
        orders.retain(|_, order| order.is_live_at(as_of, rule));
        let swept = before - orders.len();
        if swept > 0 {
            debug!(swept, remaining = orders.len(), as_of, "expired virtual orders swept");
        }
        swept
    }

    /// Group the entries live at `as_of` by target order.
    ///
    /// The live set is copied under one lock acquisition, so the result
    /// never mixes two versions of the map.
    pub fn aggregate_by_target_order(&self, as_of: Timestamp) -> BTreeMap<OrderId, OrderBucket> {
        let rule = self.validity;
        let mut live: Vec<(VirtualOrderId, OrderId, f64)> = {
            let orders = self.orders.lock();
            orders
                .values()
                .filter(|order| order.is_live_at(as_of, rule))
                .map(|order| {
                    (
                        order.virtual_order_id.clone(),
                        order.target_order_id.clone(),
                        order.requested_limit,
                    )
                })
                .collect()
        };
        live.sort_by(|a, b| a.0.cmp(&b.0));

        let mut buckets: BTreeMap<OrderId, OrderBucket> = BTreeMap::new();
        for (virtual_order_id, target_order_id, requested_limit) in live {
            let bucket = buckets.entry(target_order_id).or_default();
            bucket.requested_limits.push(requested_limit);
            bucket.virtual_order_ids.push(virtual_order_id);
        }
        buckets
    }

    /// Write the whole map as one blob. Returns the number of entries saved.
    pub fn checkpoint(&self) -> Result<usize> {
        let orders = self.snapshot();
        let count = orders.len();
        let blob = serde_json::to_string(&Checkpoint {
            version: CHECKPOINT_VERSION,
            orders,
        })
        .context("failed to serialize virtual orders")?;

        self.store
            .put(CHECKPOINT_OWNER, CHECKPOINT_KEY, &blob)
            .context("failed to checkpoint virtual orders")?;
        debug!(count, "virtual orders checkpointed");
        Ok(count)
    }

    /// Replace the map with the last checkpoint. A missing checkpoint is a
    /// fresh start: whatever the map holds now becomes the first checkpoint.
    pub fn restore(&self) -> Result<usize> {
        let blob = self
            .store
            .get(CHECKPOINT_OWNER, CHECKPOINT_KEY)
            .context("failed to load virtual orders checkpoint")?;

        let Some(blob) = blob else {
            let count = self.checkpoint()?;
            info!(count, "no virtual orders checkpoint found, starting fresh");
            return Ok(count);
        };

        let checkpoint: Checkpoint =
            serde_json::from_str(&blob).context("corrupt virtual orders checkpoint")?;
        if checkpoint.version != CHECKPOINT_VERSION {
            bail!(
                "unsupported virtual orders checkpoint version {} (expected {})",
                checkpoint.version,
                CHECKPOINT_VERSION
            );
        }

        let restored: HashMap<VirtualOrderId, VirtualOrder> = checkpoint
            .orders
            .into_iter()
            .map(|order| (order.virtual_order_id.clone(), order))
            .collect();
        let count = restored.len();
        *self.orders.lock() = restored;

        info!(count, "virtual orders restored");
        Ok(count)
    }
}

/// A NaN or infinite limit would serialize as `null` and make the next
/// checkpoint unreadable.
fn accepts_limit(context: &str, requested_limit: f64) -> bool {
    if requested_limit.is_finite() {
        return true;
    }
    warn!(context, requested_limit, "rejected virtual order with non-finite limit");
    false
}

fn fresh_id(taken: &HashMap<VirtualOrderId, VirtualOrder>) -> VirtualOrderId {
    let mut rng = rand::thread_rng();
    loop {
        let candidate: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(VIRTUAL_ORDER_ID_LEN)
            .map(char::from)
            .collect();
        if !taken.contains_key(&candidate) {
            return candidate;
        }
    }
}
