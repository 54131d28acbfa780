//! Persistence
//!
//! Durable `(owner, key) -> string` storage used for checkpointing the
//! virtual order registry and for generic component state, plus a sink for
//! the simulation evaluator's order samples.
//!
//! - [`SqliteStore`]: WAL-mode SQLite file, one connection behind a lock.
//! - [`MemoryStore`]: process-local maps, for tests and throwaway runs.

mod memory;
mod sqlite;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Owner/key string store with upsert-on-conflict semantics.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, owner: &str, key: &str) -> Result<Option<String>>;

    /// Insert or replace the value at `(owner, key)`.
    fn put(&self, owner: &str, key: &str, value: &str) -> Result<()>;

    fn list_keys(&self, owner: &str) -> Result<Vec<String>>;

    /// Returns true if a record was deleted.
    fn delete(&self, owner: &str, key: &str) -> Result<bool>;
}

/// One observation of a physical order's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSample {
    pub simulation_id: String,
    pub sampled_at: Timestamp,
    pub order_id: String,
    pub limit: f64,
    pub price: f64,
}

/// Destination for [`OrderSample`]s.
pub trait OrderSampleSink: Send + Sync {
    fn record_samples(&self, samples: &[OrderSample]) -> Result<usize>;

    fn samples_for(&self, simulation_id: &str) -> Result<Vec<OrderSample>>;

    /// Drop the samples of every simulation not listed in `finished`.
    /// Returns how many samples were removed.
    fn purge_unfinished(&self, finished: &[String]) -> Result<usize>;
}
