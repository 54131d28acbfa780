use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use parking_lot::RwLock;

use super::{KeyValueStore, OrderSample, OrderSampleSink};

/// In-process store with the same semantics as [`super::SqliteStore`].
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, BTreeMap<String, String>>>,
    samples: RwLock<Vec<OrderSample>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, owner: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .values
            .read()
            .get(owner)
            .and_then(|keys| keys.get(key))
            .cloned())
    }

    fn put(&self, owner: &str, key: &str, value: &str) -> Result<()> {
        self.values
            .write()
            .entry(owner.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn list_keys(&self, owner: &str) -> Result<Vec<String>> {
        Ok(self
            .values
            .read()
            .get(owner)
            .map(|keys| keys.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn delete(&self, owner: &str, key: &str) -> Result<bool> {
        let mut values = self.values.write();
        let Some(keys) = values.get_mut(owner) else {
            return Ok(false);
        };
        let removed = keys.remove(key).is_some();
        if keys.is_empty() {
            values.remove(owner);
        }
        Ok(removed)
    }
}

impl OrderSampleSink for MemoryStore {
    fn record_samples(&self, samples: &[OrderSample]) -> Result<usize> {
        self.samples.write().extend_from_slice(samples);
        Ok(samples.len())
    }

    fn samples_for(&self, simulation_id: &str) -> Result<Vec<OrderSample>> {
        let mut out: Vec<OrderSample> = self
            .samples
            .read()
            .iter()
            .filter(|s| s.simulation_id == simulation_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.sampled_at
                .cmp(&b.sampled_at)
                .then_with(|| a.order_id.cmp(&b.order_id))
        });
        Ok(out)
    }

    fn purge_unfinished(&self, finished: &[String]) -> Result<usize> {
        let mut samples = self.samples.write();
        let before = samples.len();
        samples.retain(|s| finished.contains(&s.simulation_id));
        Ok(before - samples.len())
    }
}
