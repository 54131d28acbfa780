//! Controller runtime.
//!
//! Wires the clock, registry, reconciler and (in simulation) the evaluator
//! into workers, starts them in dependency order and shuts them down so
//! the registry's last checkpoint reflects everything the reconciler did.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};

use crate::clock::{ClockAdvancer, ClockReader, LogicalClock};
use crate::config::{Config, RuntimeMode};
use crate::orders::{MarketplaceDriver, NiceHashCredentials, NiceHashDriver, SimulationDriver};
use crate::simulation::SimulationEvaluator;
use crate::store::{KeyValueStore, OrderSampleSink, SqliteStore};
use crate::virtual_orders::{
    AggregationReconciler, ReconcileReport, RegistryMaintainer, ReportHandle, VirtualOrderRegistry,
};
use crate::worker::PeriodicWorker;

pub struct ControllerRuntime {
    config: Config,
    clock: Arc<LogicalClock>,
    registry: Arc<VirtualOrderRegistry>,
    driver: Arc<dyn MarketplaceDriver>,
    reports: ReportHandle,
    simulation_ended: Option<Arc<AtomicBool>>,
    advancer: Option<PeriodicWorker>,
    maintainer: PeriodicWorker,
    reconciler: PeriodicWorker,
    evaluator: Option<PeriodicWorker>,
}

impl ControllerRuntime {
    /// Assemble a runtime from explicit collaborators. The evaluator is
    /// only built in simulation mode, and only when a sample sink is given.
    pub fn new(
        config: Config,
        clock: Arc<LogicalClock>,
        store: Arc<dyn KeyValueStore>,
        sink: Option<Arc<dyn OrderSampleSink>>,
        driver: Arc<dyn MarketplaceDriver>,
    ) -> Result<Self> {
        config.validate()?;

        let reader: Arc<dyn ClockReader> = clock.clone();
        let registry = Arc::new(VirtualOrderRegistry::new(store.clone(), config.validity));

        let advancer = ClockAdvancer::for_clock(clock.clone())
            .map(|task| PeriodicWorker::new(task, reader.clone()));

        let maintainer = PeriodicWorker::new(
            RegistryMaintainer::new(
                registry.clone(),
                clock.derive_tick_interval(config.registry_period()),
            ),
            reader.clone(),
        );

        let reconciler_task = AggregationReconciler::new(
            registry.clone(),
            driver.clone(),
            clock.derive_tick_interval(config.reconciler_period()),
        );
        let reports = reconciler_task.report_handle();
        let reconciler = PeriodicWorker::new(reconciler_task, reader.clone());

        let mut simulation_ended = None;
        let evaluator = match (config.mode, sink, config.simulation_end) {
            (RuntimeMode::Simulation, Some(sink), Some(end)) => {
                let task = SimulationEvaluator::new(
                    config.identifier.clone(),
                    driver.clone(),
                    sink,
                    store,
                    clock.derive_tick_interval(config.evaluator_period()),
                    end,
                );
                simulation_ended = Some(task.ended_flag());
                Some(PeriodicWorker::new(task, reader))
            }
            _ => None,
        };

        Ok(Self {
            config,
            clock,
            registry,
            driver,
            reports,
            simulation_ended,
            advancer,
            maintainer,
            reconciler,
            evaluator,
        })
    }

    /// Build every collaborator from the configuration alone: SQLite store
    /// at `database_path`, simulated marketplace in simulation mode and the
    /// NiceHash API (credentials from the environment) in realtime mode.
    pub fn from_config(config: Config) -> Result<Self> {
        let clock = Arc::new(config.build_clock()?);
        let store = Arc::new(
            SqliteStore::open(&config.database_path)
                .with_context(|| format!("failed to open store at {}", config.database_path))?,
        );

        let driver: Arc<dyn MarketplaceDriver> = match config.mode {
            RuntimeMode::Simulation => Arc::new(SimulationDriver::new(
                config.identifier.clone(),
                clock.clone(),
                config.ramp,
            )),
            RuntimeMode::Realtime => {
                let creds = NiceHashCredentials::from_env()
                    .ok_or_else(|| anyhow!("NiceHash credentials are not configured"))?;
                Arc::new(NiceHashDriver::new(config.nicehash_base_url.clone(), creds)?)
            }
        };

        let sink: Arc<dyn OrderSampleSink> = store.clone();
        Self::new(config, clock, store, Some(sink), driver)
    }

    /// Restore the registry, then start every worker, producers of time
    /// first. Restore finishes before `start` returns, so requests filed
    /// afterwards are never replaced by the checkpoint. An unreadable
    /// checkpoint fails `start` with nothing spawned. Calling `start` again
    /// is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.maintainer.is_started() {
            return Ok(());
        }
        info!(
            mode = ?self.config.mode,
            identifier = %self.config.identifier,
            clock = %self.clock,
            "starting controller runtime"
        );
        let restored = self
            .registry
            .restore()
            .context("failed to restore virtual orders")?;
        info!(restored, "virtual order registry ready");

        for worker in self.workers() {
            worker.start()?;
        }
        Ok(())
    }

    /// Stop everything, then wait for the non-background workers: the
    /// reconciler and evaluator first, the registry maintainer last so its
    /// final checkpoint sees their last writes. Optionally closes every
    /// order afterwards.
    pub fn shutdown(&self) -> Result<()> {
        info!("shutting down controller runtime");
        for worker in self.workers() {
            worker.stop();
        }

        self.reconciler.join();
        if let Some(evaluator) = &self.evaluator {
            evaluator.join();
        }
        self.maintainer.join();
        if let Some(advancer) = &self.advancer {
            advancer.join();
        }

        if self.config.close_orders_on_shutdown {
            let closed = self
                .driver
                .close_all_orders()
                .context("failed to close orders on shutdown")?;
            info!(closed, "orders closed before shutdown");
        }
        info!("controller runtime stopped");
        Ok(())
    }

    /// Block until the simulation evaluator is done. Returns false right
    /// away when no evaluator runs or it was never started.
    pub fn wait_for_simulation_end(&self, poll: Duration) -> bool {
        let (Some(ended), Some(evaluator)) = (&self.simulation_ended, &self.evaluator) else {
            return false;
        };
        if !evaluator.is_started() {
            return false;
        }
        while !ended.load(Ordering::Acquire) {
            if evaluator.has_exited() {
                let finished = ended.load(Ordering::Acquire);
                if !finished {
                    warn!("simulation evaluator exited without finishing");
                }
                return finished;
            }
            thread::sleep(poll);
        }
        true
    }

    /// Ask the reconciler for an early pass.
    pub fn wake_reconciler(&self) {
        self.reconciler.wake();
    }

    pub fn last_report(&self) -> Option<ReconcileReport> {
        self.reports.lock().clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> &Arc<LogicalClock> {
        &self.clock
    }

    pub fn registry(&self) -> &Arc<VirtualOrderRegistry> {
        &self.registry
    }

    pub fn driver(&self) -> &Arc<dyn MarketplaceDriver> {
        &self.driver
    }

    pub fn has_clock_advancer(&self) -> bool {
        self.advancer.is_some()
    }

    fn workers(&self) -> impl Iterator<Item = &PeriodicWorker> {
        self.advancer
            .iter()
            .chain([&self.maintainer, &self.reconciler])
            .chain(self.evaluator.iter())
    }
}
