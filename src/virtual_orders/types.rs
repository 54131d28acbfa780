use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

pub type VirtualOrderId = String;
pub type OrderId = String;

/// Outcome of the last reconciliation pass that saw a virtual order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VirtualOrderStatus {
    #[default]
    NotSet,
    Ok,
    OrderNotFound,
}

impl fmt::Display for VirtualOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSet => write!(f, "NOT_SET"),
            Self::Ok => write!(f, "OK"),
            Self::OrderNotFound => write!(f, "ORDER_NOT_FOUND"),
        }
    }
}

/// Which virtual orders count as live at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidityRule {
    /// Live while `expires_at >= as_of`.
    #[default]
    UntilExpiration,
    /// Live while `expires_at < as_of`. Reproduces registries persisted by
    /// older controllers that compared the other way around.
    LegacyInverted,
}

impl ValidityRule {
    pub fn is_live(&self, expires_at: Timestamp, as_of: Timestamp) -> bool {
        match self {
            Self::UntilExpiration => expires_at >= as_of,
            Self::LegacyInverted => expires_at < as_of,
        }
    }
}

impl FromStr for ValidityRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "until_expiration" => Ok(Self::UntilExpiration),
            "legacy_inverted" => Ok(Self::LegacyInverted),
            other => Err(format!("unknown validity rule: {}", other)),
        }
    }
}

/// A time-bounded claim on part of a physical order's limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualOrder {
    pub virtual_order_id: VirtualOrderId,
    pub target_order_id: OrderId,
    pub requested_limit: f64,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub status: VirtualOrderStatus,
}

impl VirtualOrder {
    pub fn new(
        virtual_order_id: impl Into<VirtualOrderId>,
        target_order_id: impl Into<OrderId>,
        requested_limit: f64,
        created_at: Timestamp,
        expires_at: Timestamp,
    ) -> Self {
        Self {
            virtual_order_id: virtual_order_id.into(),
            target_order_id: target_order_id.into(),
            requested_limit,
            created_at,
            expires_at,
            status: VirtualOrderStatus::NotSet,
        }
    }

    pub fn is_live_at(&self, as_of: Timestamp, rule: ValidityRule) -> bool {
        rule.is_live(self.expires_at, as_of)
    }
}

/// Live requests against one physical order, in virtual order id order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderBucket {
    pub requested_limits: Vec<f64>,
    pub virtual_order_ids: Vec<VirtualOrderId>,
}

impl OrderBucket {
    pub fn total(&self) -> f64 {
        self.requested_limits.iter().sum()
    }

    pub fn len(&self) -> usize {
        self.virtual_order_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.virtual_order_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity_rules() {
        assert!(ValidityRule::UntilExpiration.is_live(100, 40));
        assert!(ValidityRule::UntilExpiration.is_live(100, 100));
        assert!(!ValidityRule::UntilExpiration.is_live(100, 101));

        assert!(!ValidityRule::LegacyInverted.is_live(100, 40));
        assert!(!ValidityRule::LegacyInverted.is_live(100, 100));
        assert!(ValidityRule::LegacyInverted.is_live(100, 101));
    }

    #[test]
    fn test_status_serializes_in_stored_form() {
        let json = serde_json::to_string(&VirtualOrderStatus::OrderNotFound).unwrap();
        assert_eq!(json, "\"ORDER_NOT_FOUND\"");
        let back: VirtualOrderStatus = serde_json::from_str("\"NOT_SET\"").unwrap();
        assert_eq!(back, VirtualOrderStatus::NotSet);
        assert_eq!(VirtualOrderStatus::Ok.to_string(), "OK");
    }
}
