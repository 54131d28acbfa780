use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use super::{LogicalClock, Timestamp};
use crate::worker::{Mailbox, TickFlow, TickResult, TickTask};

/// Background task that moves an accelerated [`LogicalClock`] forward by the
/// simulated increment once per real tick.
pub struct ClockAdvancer {
    clock: Arc<LogicalClock>,
    real_tick: Duration,
    increment: Timestamp,
}

impl ClockAdvancer {
    /// `None` when the clock runs in realtime mode and needs no advancer.
    pub fn for_clock(clock: Arc<LogicalClock>) -> Option<Self> {
        let scale = clock.scale()?;
        Some(Self {
            clock,
            real_tick: scale.real_tick(),
            increment: scale.simulated_tick_secs(),
        })
    }
}

impl TickTask for ClockAdvancer {
    fn name(&self) -> &str {
        "clock"
    }

    fn tick_interval(&self) -> Duration {
        self.real_tick
    }

    fn on_tick(&mut self, _now: Timestamp, _messages: Mailbox) -> TickResult {
        let now = self.clock.advance(self.increment);
        trace!(now, "clock advanced");
        Ok(TickFlow::Continue)
    }
}
