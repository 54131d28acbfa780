use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::Timestamp;

/// Pool orders point at unless the caller says otherwise.
pub const DEFAULT_POOL_ID: &str = "slushpool";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Market {
    #[default]
    #[serde(rename = "EU")]
    Eu,
    #[serde(rename = "USA")]
    Usa,
    #[serde(rename = "EU_N")]
    EuN,
    #[serde(rename = "USA_E")]
    UsaE,
}

impl Market {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eu => "EU",
            Self::Usa => "USA",
            Self::EuN => "EU_N",
            Self::UsaE => "USA_E",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EU" => Some(Self::Eu),
            "USA" => Some(Self::Usa),
            "EU_N" => Some(Self::EuN),
            "USA_E" => Some(Self::UsaE),
            _ => None,
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Algorithm {
    #[default]
    Sha256,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "SHA256",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    #[default]
    Standard,
    Fixed,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "STANDARD",
            Self::Fixed => "FIXED",
        }
    }
}

/// Point-in-time copy of a physical order as the marketplace reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// Limit the order is currently set to.
    pub limit: f64,
    /// Hash power actually delivered, which may lag `limit` while a change
    /// ramps in.
    pub effective_limit: f64,
    pub price: f64,
    pub budget_left: f64,
    pub pool_id: String,
    pub market: Market,
    pub algorithm: Algorithm,
    pub order_type: OrderType,
}

/// Parameters for opening a new order.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    /// Honored by the simulation driver; the live marketplace assigns its own.
    pub order_id: Option<String>,
    pub created_at: Timestamp,
    pub limit: f64,
    pub price: f64,
    pub amount: f64,
    pub pool_id: String,
    pub market: Market,
    pub algorithm: Algorithm,
    pub order_type: OrderType,
}

impl NewOrder {
    pub fn new(created_at: Timestamp, limit: f64, price: f64, amount: f64) -> Self {
        Self {
            order_id: None,
            created_at,
            limit,
            price,
            amount,
            pool_id: DEFAULT_POOL_ID.to_string(),
            market: Market::default(),
            algorithm: Algorithm::default(),
            order_type: OrderType::default(),
        }
    }

    pub fn with_order_id(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    pub fn with_pool(mut self, pool_id: impl Into<String>) -> Self {
        self.pool_id = pool_id.into();
        self
    }

    pub fn with_market(mut self, market: Market) -> Self {
        self.market = market;
        self
    }

    pub fn with_order_type(mut self, order_type: OrderType) -> Self {
        self.order_type = order_type;
        self
    }
}

/// Access to the hash-power marketplace.
///
/// The simulation and live implementations agree on `get_order` and
/// `apply_delta`: limits move by deltas, never by absolute sets, and a
/// missing order is `Ok(None)` / `Ok(false)` rather than an error. A delta
/// applied at `t` shows up in the `limit` of any snapshot taken at `t` or
/// later.
pub trait MarketplaceDriver: Send + Sync {
    fn get_order(&self, order_id: &str) -> Result<Option<OrderSnapshot>>;

    /// Shift limit and price by the given deltas. Returns false if no such
    /// order exists.
    fn apply_delta(
        &self,
        order_id: &str,
        limit_delta: f64,
        price_delta: f64,
        timestamp: Timestamp,
    ) -> Result<bool>;

    fn create_order(&self, order: NewOrder) -> Result<OrderSnapshot>;

    /// Returns true if a matching order was closed.
    fn close_order(&self, order_id: &str) -> Result<bool>;

    fn list_orders(&self) -> Result<Vec<OrderSnapshot>>;

    /// Add `amount` to the order's budget. Returns false if it does not exist.
    fn refill_order(&self, order_id: &str, amount: f64, timestamp: Timestamp) -> Result<bool>;

    /// Close every open order. Keeps going past individual failures and
    /// returns how many were closed.
    fn close_all_orders(&self) -> Result<usize> {
        let orders = self.list_orders()?;
        let mut closed = 0;
        for order in &orders {
            match self.close_order(&order.order_id) {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(e) => warn!(order_id = %order.order_id, error = %e, "failed to close order"),
            }
        }
        info!(closed, total = orders.len(), "closed all orders");
        Ok(closed)
    }
}
