//! Logical Clock
//!
//! Single source of truth for "what time is it" across every worker.
//!
//! Two modes:
//! - **Realtime**: `now()` is wall-clock UNIX seconds, no background thread.
//! - **Accelerated**: `now()` is a stored timestamp that a background
//!   [`ClockAdvancer`] bumps by a fixed simulated increment every real tick
//!   (e.g. 600 simulated seconds every 0.5 real seconds).
//!
//! Workers never sleep for a simulated duration directly; they ask the
//! clock's [`TickScale`] for the real sleep via `derive_tick_interval`.

mod advancer;
mod logical;

pub use advancer::ClockAdvancer;
pub use logical::{ClockError, LogicalClock, TickScale};

/// UNIX timestamp in whole seconds.
pub type Timestamp = i64;

pub const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Read-only view of the current logical time.
///
/// Everything that needs "now" takes an `Arc<dyn ClockReader>` so tests can
/// inject a fixed clock.
pub trait ClockReader: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Clock pinned to one timestamp. Useful for replaying a single instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub Timestamp);

impl ClockReader for FixedClock {
    fn now(&self) -> Timestamp {
        self.0
    }
}
