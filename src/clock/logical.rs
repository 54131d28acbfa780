use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use super::{ClockReader, Timestamp, NANOS_PER_SEC};

/// Errors raised while building a clock. Any of these must stop startup
/// before a single worker is spawned.
#[derive(Debug, Clone, PartialEq)]
pub enum ClockError {
    /// Real tick length was NaN or infinite.
    NonFiniteRealTick(f64),
    /// Real tick length was zero or negative.
    NonPositiveRealTick,
    /// Simulated increment per tick was zero or negative.
    NonPositiveSimulatedTick(i64),
}

impl fmt::Display for ClockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonFiniteRealTick(v) => write!(f, "real tick length is not finite: {}", v),
            Self::NonPositiveRealTick => write!(f, "real tick length must be positive"),
            Self::NonPositiveSimulatedTick(v) => {
                write!(f, "simulated tick length must be positive, got {}s", v)
            }
        }
    }
}

impl std::error::Error for ClockError {}

/// Ratio between real time and simulated time.
///
/// Every `real_tick` of wall time the clock moves `simulated_tick_secs`
/// forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickScale {
    real_tick: Duration,
    simulated_tick_secs: i64,
}

impl TickScale {
    pub fn new(real_tick: Duration, simulated_tick_secs: i64) -> Result<Self, ClockError> {
        if real_tick.is_zero() {
            return Err(ClockError::NonPositiveRealTick);
        }
        if simulated_tick_secs <= 0 {
            return Err(ClockError::NonPositiveSimulatedTick(simulated_tick_secs));
        }
        Ok(Self {
            real_tick,
            simulated_tick_secs,
        })
    }

    /// Build from a real tick length expressed in (possibly fractional) seconds.
    pub fn from_secs_f64(real_tick_secs: f64, simulated_tick_secs: i64) -> Result<Self, ClockError> {
        if !real_tick_secs.is_finite() {
            return Err(ClockError::NonFiniteRealTick(real_tick_secs));
        }
        if real_tick_secs <= 0.0 {
            return Err(ClockError::NonPositiveRealTick);
        }
        let real_tick = Duration::try_from_secs_f64(real_tick_secs)
            .map_err(|_| ClockError::NonFiniteRealTick(real_tick_secs))?;
        Self::new(real_tick, simulated_tick_secs)
    }

    #[inline]
    pub fn real_tick(&self) -> Duration {
        self.real_tick
    }

    #[inline]
    pub fn simulated_tick_secs(&self) -> i64 {
        self.simulated_tick_secs
    }

    /// Simulated seconds elapsed per real second.
    pub fn acceleration(&self) -> f64 {
        self.simulated_tick_secs as f64 / self.real_tick.as_secs_f64()
    }

    /// Real sleep for a worker that wants to run once per `simulated_period`.
    ///
    /// `simulated_period * real_tick / simulated_tick`, computed in integer
    /// nanoseconds so the result carries no floating point drift.
    pub fn derive_tick_interval(&self, simulated_period: Duration) -> Duration {
        let numerator = simulated_period.as_nanos() * self.real_tick.as_nanos();
        let denominator = self.simulated_tick_secs as u128 * NANOS_PER_SEC;
        let nanos = numerator / denominator;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}

/// Process-wide logical clock.
///
/// # Monotonicity
/// - Accelerated: only [`LogicalClock::advance`] writes, and only forward.
/// - Realtime: wall-clock reads are raised to a high-water mark, so a wall
///   clock step backwards is never observed.
#[derive(Debug)]
pub struct LogicalClock {
    now: AtomicI64,
    scale: Option<TickScale>,
}

impl LogicalClock {
    /// Pass-through to wall-clock time.
    pub fn realtime() -> Self {
        Self {
            now: AtomicI64::new(wall_clock_now()),
            scale: None,
        }
    }

    /// Simulated time starting at `start`, advanced by a [`super::ClockAdvancer`].
    pub fn accelerated(start: Timestamp, scale: TickScale) -> Self {
        Self {
            now: AtomicI64::new(start),
            scale: Some(scale),
        }
    }

    #[inline]
    pub fn scale(&self) -> Option<TickScale> {
        self.scale
    }

    #[inline]
    pub fn is_accelerated(&self) -> bool {
        self.scale.is_some()
    }

    /// Current logical time. Never blocks.
    pub fn now(&self) -> Timestamp {
        match self.scale {
            Some(_) => self.now.load(Ordering::Acquire),
            None => {
                let wall = wall_clock_now();
                let previous = self.now.fetch_max(wall, Ordering::AcqRel);
                previous.max(wall)
            }
        }
    }

    /// Move simulated time forward by `delta` seconds and return the new time.
    /// No-op in realtime mode.
    pub(crate) fn advance(&self, delta: Timestamp) -> Timestamp {
        debug_assert!(delta >= 0, "LogicalClock: delta must be non-negative");
        if self.scale.is_none() || delta <= 0 {
            return self.now();
        }
        self.now.fetch_add(delta, Ordering::AcqRel) + delta
    }

    /// Real sleep corresponding to `simulated_period`. Identity when
    /// acceleration is disabled.
    pub fn derive_tick_interval(&self, simulated_period: Duration) -> Duration {
        match self.scale {
            Some(scale) => scale.derive_tick_interval(simulated_period),
            None => simulated_period,
        }
    }
}

impl ClockReader for LogicalClock {
    fn now(&self) -> Timestamp {
        LogicalClock::now(self)
    }
}

impl fmt::Display for LogicalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let now = self.now();
        let rendered = timestamp_to_datetime(now)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| now.to_string());
        match self.scale {
            Some(scale) => write!(f, "{} (x{:.1})", rendered, scale.acceleration()),
            None => write!(f, "{} (realtime)", rendered),
        }
    }
}

#[inline]
fn wall_clock_now() -> Timestamp {
    chrono::Utc::now().timestamp()
}

/// Convert a logical timestamp to a UTC datetime, if representable.
pub fn timestamp_to_datetime(ts: Timestamp) -> Option<chrono::DateTime<chrono::Utc>> {
    use chrono::TimeZone;
    chrono::Utc.timestamp_opt(ts, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_tick_interval_exact() {
        let scale = TickScale::from_secs_f64(0.5, 600).unwrap();
        let sleep = scale.derive_tick_interval(Duration::from_secs(60));
        assert_eq!(sleep, Duration::from_millis(50));
    }

    #[test]
    fn test_derive_tick_interval_identity_in_realtime() {
        let clock = LogicalClock::realtime();
        let period = Duration::from_secs(90);
        assert_eq!(clock.derive_tick_interval(period), period);
    }

    #[test]
    fn test_derive_tick_interval_no_drift_over_many_periods() {
        let scale = TickScale::from_secs_f64(0.5, 600).unwrap();
        let one = scale.derive_tick_interval(Duration::from_secs(60));
        let many = scale.derive_tick_interval(Duration::from_secs(60 * 10_000));
        assert_eq!(one * 10_000, many);
    }

    #[test]
    fn test_clock_misconfiguration_rejected() {
        assert!(matches!(
            TickScale::from_secs_f64(f64::NAN, 600),
            Err(ClockError::NonFiniteRealTick(_))
        ));
        assert!(matches!(
            TickScale::from_secs_f64(f64::INFINITY, 600),
            Err(ClockError::NonFiniteRealTick(_))
        ));
        assert_eq!(
            TickScale::from_secs_f64(0.0, 600),
            Err(ClockError::NonPositiveRealTick)
        );
        assert_eq!(
            TickScale::from_secs_f64(0.5, 0),
            Err(ClockError::NonPositiveSimulatedTick(0))
        );
    }

    #[test]
    fn test_accelerated_clock_advances_monotonically() {
        let scale = TickScale::from_secs_f64(0.5, 600).unwrap();
        let clock = LogicalClock::accelerated(1_574_464_584, scale);
        assert_eq!(clock.now(), 1_574_464_584);

        assert_eq!(clock.advance(600), 1_574_465_184);
        assert_eq!(clock.now(), 1_574_465_184);

        // Reads are stable between advances
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn test_realtime_clock_ignores_advance() {
        let clock = LogicalClock::realtime();
        let before = clock.now();
        let after = clock.advance(3600);
        assert!(after >= before);
        assert!(after < before + 3600);
    }

    #[test]
    fn test_realtime_clock_never_moves_backward() {
        let clock = LogicalClock::realtime();
        let far_future = clock.now() + 10_000;
        clock.now.store(far_future, Ordering::Release);
        assert_eq!(clock.now(), far_future);
    }
}
