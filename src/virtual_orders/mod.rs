//! Virtual Orders
//!
//! Strategies do not touch physical orders directly. Each one files
//! expiring partial requests ("virtual orders") against a target order in
//! the [`VirtualOrderRegistry`]; the [`AggregationReconciler`] sums the live
//! requests per order and applies only the corrective delta. The
//! [`RegistryMaintainer`] expires stale requests and checkpoints the
//! registry to the key-value store.

mod maintainer;
mod reconciler;
mod registry;
mod types;

#[cfg(test)]
mod reconciler_tests;

pub use maintainer::RegistryMaintainer;
pub use reconciler::{
    AggregationReconciler, BucketOutcome, BucketReport, ReconcilePhase, ReconcileReport,
    ReportHandle,
};
pub use registry::{VirtualOrderRegistry, CHECKPOINT_KEY, CHECKPOINT_OWNER, VIRTUAL_ORDER_ID_LEN};
pub use types::{OrderBucket, OrderId, ValidityRule, VirtualOrder, VirtualOrderId, VirtualOrderStatus};
