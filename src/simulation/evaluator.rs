use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Timestamp;
use crate::orders::MarketplaceDriver;
use crate::store::{KeyValueStore, OrderSample, OrderSampleSink};
use crate::worker::{Mailbox, TickError, TickFlow, TickResult, TickTask};

/// Store owner of the per-simulation completion records.
pub const SIMULATION_RUNS_OWNER: &str = "simulation_runs";

/// Written under [`SIMULATION_RUNS_OWNER`] once a run reaches its end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedRun {
    pub simulation_id: String,
    pub finished_at: Timestamp,
}

/// Identifiers of every simulation that ran to its end.
pub fn finished_simulations(runs: &dyn KeyValueStore) -> anyhow::Result<Vec<String>> {
    runs.list_keys(SIMULATION_RUNS_OWNER)
        .context("failed to list finished simulations")
}

/// Records every order's effective limit and price once per tick until the
/// simulated end time is reached. Then it writes a completion record and
/// raises the shared "ended" flag; stopping early leaves both unset.
///
/// On start it forgets any earlier run under the same id and purges the
/// samples of every run without a completion record.
pub struct SimulationEvaluator {
    simulation_id: String,
    driver: Arc<dyn MarketplaceDriver>,
    sink: Arc<dyn OrderSampleSink>,
    runs: Arc<dyn KeyValueStore>,
    interval: Duration,
    simulation_end: Timestamp,
    ended: Arc<AtomicBool>,
}

impl SimulationEvaluator {
    pub fn new(
        simulation_id: impl Into<String>,
        driver: Arc<dyn MarketplaceDriver>,
        sink: Arc<dyn OrderSampleSink>,
        runs: Arc<dyn KeyValueStore>,
        interval: Duration,
        simulation_end: Timestamp,
    ) -> Self {
        Self {
            simulation_id: simulation_id.into(),
            driver,
            sink,
            runs,
            interval,
            simulation_end,
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag raised once the evaluator is done, for whoever drives shutdown.
    pub fn ended_flag(&self) -> Arc<AtomicBool> {
        self.ended.clone()
    }

    /// Sample every open order at `now`. Returns how many samples were stored.
    pub fn sample(&self, now: Timestamp) -> anyhow::Result<usize> {
        let orders = self
            .driver
            .list_orders()
            .context("failed to list orders for sampling")?;
        let samples: Vec<OrderSample> = orders
            .into_iter()
            .map(|order| OrderSample {
                simulation_id: self.simulation_id.clone(),
                sampled_at: now,
                order_id: order.order_id,
                limit: order.effective_limit,
                price: order.price,
            })
            .collect();
        self.sink
            .record_samples(&samples)
            .context("failed to record order samples")
    }

    /// Clear out what earlier, unfinished runs left behind.
    pub fn prepare(&self) -> anyhow::Result<usize> {
        self.runs
            .delete(SIMULATION_RUNS_OWNER, &self.simulation_id)
            .context("failed to reset completion record")?;
        let finished = finished_simulations(self.runs.as_ref())?;
        self.sink
            .purge_unfinished(&finished)
            .context("failed to purge unfinished simulations")
    }

    fn mark_finished(&self, now: Timestamp) -> anyhow::Result<()> {
        let record = serde_json::to_string(&CompletedRun {
            simulation_id: self.simulation_id.clone(),
            finished_at: now,
        })
        .context("failed to serialize completion record")?;
        self.runs
            .put(SIMULATION_RUNS_OWNER, &self.simulation_id, &record)
            .context("failed to write completion record")
    }
}

impl TickTask for SimulationEvaluator {
    fn name(&self) -> &str {
        "simulation-evaluator"
    }

    fn tick_interval(&self) -> Duration {
        self.interval
    }

    fn is_background(&self) -> bool {
        false
    }

    fn on_start(&mut self, now: Timestamp) -> Result<(), TickError> {
        let purged = self.prepare().map_err(TickError::recoverable)?;
        if purged > 0 {
            warn!(purged, now, "dropped samples of unfinished simulations");
        }
        Ok(())
    }

    fn on_tick(&mut self, now: Timestamp, _messages: Mailbox) -> TickResult {
        let recorded = self.sample(now)?;
        debug!(now, recorded, "order samples recorded");

        if now >= self.simulation_end {
            info!(now, simulation_end = self.simulation_end, "simulation reached its end");
            self.mark_finished(now)?;
            self.ended.store(true, Ordering::Release);
            return Ok(TickFlow::Finish);
        }
        Ok(TickFlow::Continue)
    }

    fn on_exit(&mut self, now: Timestamp) {
        info!(
            simulation_id = %self.simulation_id,
            now,
            reached_end = self.ended.load(Ordering::Acquire),
            "simulation evaluator exited"
        );
    }
}
