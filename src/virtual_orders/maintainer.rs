use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use super::registry::VirtualOrderRegistry;
use crate::clock::Timestamp;
use crate::worker::{Mailbox, TickFlow, TickResult, TickTask};

/// Keeps the registry tidy and durable: sweeps expired entries and
/// checkpoints every tick, and writes a final checkpoint on exit. Any mail
/// just triggers an early pass.
///
/// The registry must already be restored when this task starts, otherwise
/// its first checkpoint overwrites the stored one.
///
/// Non-background, so shutdown waits for the last checkpoint.
pub struct RegistryMaintainer {
    registry: Arc<VirtualOrderRegistry>,
    interval: Duration,
}

impl RegistryMaintainer {
    pub fn new(registry: Arc<VirtualOrderRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }
}

impl TickTask for RegistryMaintainer {
    fn name(&self) -> &str {
        "virtual-orders"
    }

    fn tick_interval(&self) -> Duration {
        self.interval
    }

    fn is_background(&self) -> bool {
        false
    }

    fn on_tick(&mut self, now: Timestamp, _messages: Mailbox) -> TickResult {
        let swept = self.registry.sweep_expired(now);
        if swept > 0 {
            info!(swept, remaining = self.registry.len(), now, "expired virtual orders removed");
        }
        self.registry.checkpoint()?;
        Ok(TickFlow::Continue)
    }

    fn on_exit(&mut self, now: Timestamp) {
        match self.registry.checkpoint() {
            Ok(count) => info!(count, now, "final virtual orders checkpoint written"),
            Err(e) => error!(error = %format!("{:#}", e), "final virtual orders checkpoint failed"),
        }
    }
}
