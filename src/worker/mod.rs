//! Periodic Workers
//!
//! Every long-running component (clock advancer, registry maintainer,
//! reconciler, simulation evaluator) is a [`TickTask`] driven by a
//! [`PeriodicWorker`]: one OS thread, one mailbox, cooperative stop.
//!
//! # Loop contract
//! 1. Block on the mailbox for at most `tick_interval`.
//! 2. Drain every pending message (last write per key wins).
//! 3. Read `now` from the clock and call [`TickTask::on_tick`].
//! 4. If stop was requested (or the task finished / failed fatally), run
//!    [`TickTask::on_exit`], mark the worker exited and return.

mod periodic;


use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::clock::Timestamp;

pub use periodic::PeriodicWorker;

/// Messages drained from a worker's mailbox in one wake-up.
/// Keyed, last-write-wins, cleared on every read.
pub type Mailbox = HashMap<String, String>;

/// What the loop should do after a successful tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickFlow {
    Continue,
    /// The task has nothing more to do; exit as if stopped.
    Finish,
}

/// Failure of a single tick.
#[derive(Debug)]
pub enum TickError {
    /// Logged, and the loop keeps going. Transient marketplace or store
    /// failures belong here.
    Recoverable(anyhow::Error),
    /// Ends this worker only. Used for broken invariants.
    Fatal(anyhow::Error),
}

impl TickError {
    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        Self::Recoverable(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl fmt::Display for TickError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recoverable(e) => write!(f, "recoverable tick failure: {:#}", e),
            Self::Fatal(e) => write!(f, "fatal tick failure: {:#}", e),
        }
    }
}

impl std::error::Error for TickError {}

impl From<anyhow::Error> for TickError {
    fn from(err: anyhow::Error) -> Self {
        Self::Recoverable(err)
    }
}

pub type TickResult = Result<TickFlow, TickError>;

/// Domain logic run by a [`PeriodicWorker`].
pub trait TickTask: Send + 'static {
    fn name(&self) -> &str;

    /// Real time to wait for mail before ticking anyway.
    fn tick_interval(&self) -> Duration;

    /// Background workers are not waited on by `join()` and may be
    /// abandoned at process exit.
    fn is_background(&self) -> bool {
        true
    }

    /// Runs once on the worker thread before the first wait.
    fn on_start(&mut self, _now: Timestamp) -> Result<(), TickError> {
        Ok(())
    }

    fn on_tick(&mut self, now: Timestamp, messages: Mailbox) -> TickResult;

    /// Finalization hook, run on the worker thread after the loop ends.
    fn on_exit(&mut self, _now: Timestamp) {}
}
