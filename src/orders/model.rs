use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

/// Limit units the marketplace lets an order move per second.
pub const DEFAULT_MAX_RAMP_RATE: f64 = 0.1;

/// How a limit change phases in over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RampMode {
    /// Each change contributes `max(|delta|, elapsed * rate)`. Matches the
    /// behavior of historical simulation runs: a change is fully visible on
    /// the first query after it and keeps growing once `elapsed * rate`
    /// overtakes it.
    #[default]
    Literal,
    /// Each change contributes `min(|delta|, elapsed * rate)`, ramping
    /// linearly until the full delta is reached.
    Clamped,
}

impl FromStr for RampMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "literal" => Ok(Self::Literal),
            "clamped" => Ok(Self::Clamped),
            other => Err(format!("unknown ramp mode: {}", other)),
        }
    }
}

impl fmt::Display for RampMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal => write!(f, "literal"),
            Self::Clamped => write!(f, "clamped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RampPolicy {
    pub mode: RampMode,
    pub max_rate_per_sec: f64,
}

impl Default for RampPolicy {
    fn default() -> Self {
        Self {
            mode: RampMode::default(),
            max_rate_per_sec: DEFAULT_MAX_RAMP_RATE,
        }
    }
}

impl RampPolicy {
    pub fn new(mode: RampMode, max_rate_per_sec: f64) -> Self {
        Self {
            mode,
            max_rate_per_sec,
        }
    }

    /// Portion of `delta` visible `elapsed_secs` after the change.
    pub fn contribution(&self, delta: f64, elapsed_secs: i64) -> f64 {
        let ramped = elapsed_secs as f64 * self.max_rate_per_sec;
        let magnitude = match self.mode {
            RampMode::Literal => delta.abs().max(ramped),
            RampMode::Clamped => delta.abs().min(ramped),
        };
        magnitude.copysign(delta)
    }
}

/// One requested adjustment of an order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderChange {
    pub timestamp: Timestamp,
    pub limit_delta: f64,
    pub price_delta: f64,
}

/// A physical order modelled as an append-only log of changes.
///
/// There is no stored "current limit": [`limit_at`](Self::limit_at) and
/// [`price_at`](Self::price_at) replay the log for any instant, so queries
/// are pure and the same log always yields the same history.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitedOrder {
    order_id: String,
    created_at: Timestamp,
    changes: Vec<OrderChange>,
    policy: RampPolicy,
}

impl RateLimitedOrder {
    /// The initial limit and price are recorded as the first change.
    pub fn new(
        order_id: impl Into<String>,
        created_at: Timestamp,
        initial_limit: f64,
        initial_price: f64,
        policy: RampPolicy,
    ) -> Self {
        let mut order = Self {
            order_id: order_id.into(),
            created_at,
            changes: Vec::with_capacity(8),
            policy,
        };
        order.record_change(created_at, initial_limit, initial_price);
        order
    }

    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn policy(&self) -> RampPolicy {
        self.policy
    }

    pub fn changes(&self) -> &[OrderChange] {
        &self.changes
    }

    pub fn last_change_at(&self) -> Timestamp {
        self.changes
            .last()
            .map(|c| c.timestamp)
            .unwrap_or(self.created_at)
    }

    pub fn record_change(&mut self, timestamp: Timestamp, limit_delta: f64, price_delta: f64) {
        self.changes.push(OrderChange {
            timestamp,
            limit_delta,
            price_delta,
        });
    }

    /// Effective limit at `timestamp`, from changes strictly before it.
    pub fn limit_at(&self, timestamp: Timestamp) -> f64 {
        self.changes
            .iter()
            .filter(|c| c.limit_delta != 0.0 && c.timestamp < timestamp)
            .map(|c| self.policy.contribution(c.limit_delta, timestamp - c.timestamp))
            .sum()
    }

    /// Commanded limit as of `timestamp`: every limit delta recorded at or
    /// before it, without ramping. This is what the marketplace reports as
    /// the order's set limit, so a change is visible the instant it is made.
    pub fn requested_limit_through(&self, timestamp: Timestamp) -> f64 {
        self.changes
            .iter()
            .filter(|c| c.timestamp <= timestamp)
            .map(|c| c.limit_delta)
            .sum()
    }

    /// Effective price at `timestamp`. Price changes are not ramped.
    pub fn price_at(&self, timestamp: Timestamp) -> f64 {
        self.changes
            .iter()
            .filter(|c| c.timestamp < timestamp)
            .map(|c| c.price_delta)
            .sum()
    }
}
