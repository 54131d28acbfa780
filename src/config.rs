//! Controller configuration.
//!
//! Starts from one of two presets ([`Config::simulation`] or
//! [`Config::realtime`]) and overlays environment variables
//! (`SMARTMINER_*`, `.env` honored) or a TOML document. Every loader ends in
//! [`Config::validate`], so a clock that cannot run never reaches a worker.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::{ClockError, LogicalClock, TickScale, Timestamp};
use crate::orders::nicehash::DEFAULT_BASE_URL;
use crate::orders::{RampMode, RampPolicy, DEFAULT_MAX_RAMP_RATE};
use crate::virtual_orders::ValidityRule;

/// 2019-11-22 23:16:24 UTC, start of the reference simulation data set.
pub const SIMULATION_START: Timestamp = 1_574_464_584;

const DAY_SECONDS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    Simulation,
    Realtime,
}

impl FromStr for RuntimeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "simulation" => Ok(Self::Simulation),
            "realtime" => Ok(Self::Realtime),
            other => Err(format!("unknown runtime mode: {}", other)),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Clock(ClockError),
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    Invalid(String),
    Parse(String),
    Io(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clock(e) => write!(f, "clock misconfigured: {}", e),
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid value {:?} for {}: {}", value, key, reason)
            }
            Self::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
            Self::Parse(msg) => write!(f, "failed to parse configuration: {}", msg),
            Self::Io(msg) => write!(f, "failed to read configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Clock(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ClockError> for ConfigError {
    fn from(e: ClockError) -> Self {
        Self::Clock(e)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub mode: RuntimeMode,
    /// Names this run; prefixes simulated order ids and tags samples.
    pub identifier: String,
    pub database_path: String,
    /// First logical timestamp of an accelerated clock. `None` starts at
    /// the current wall-clock time.
    pub clock_start: Option<Timestamp>,
    pub accelerated: bool,
    pub real_tick_secs: f64,
    pub simulated_tick_secs: i64,
    /// Worker periods, in simulated seconds.
    pub registry_period_secs: u64,
    pub reconciler_period_secs: u64,
    pub evaluator_period_secs: u64,
    pub ramp: RampPolicy,
    pub validity: ValidityRule,
    pub simulation_end: Option<Timestamp>,
    pub close_orders_on_shutdown: bool,
    pub nicehash_base_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::simulation()
    }
}

impl Config {
    /// 600 simulated seconds per half real second, one simulated day from
    /// the reference start.
    pub fn simulation() -> Self {
        Self {
            mode: RuntimeMode::Simulation,
            identifier: "simulation".to_string(),
            database_path: "./smartminer.db".to_string(),
            clock_start: Some(SIMULATION_START),
            accelerated: true,
            real_tick_secs: 0.5,
            simulated_tick_secs: 600,
            registry_period_secs: 600,
            reconciler_period_secs: 600,
            evaluator_period_secs: 600,
            ramp: RampPolicy::default(),
            validity: ValidityRule::default(),
            simulation_end: Some(SIMULATION_START + DAY_SECONDS),
            close_orders_on_shutdown: false,
            nicehash_base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Wall-clock time, live marketplace.
    pub fn realtime() -> Self {
        Self {
            mode: RuntimeMode::Realtime,
            identifier: "realtime".to_string(),
            clock_start: None,
            accelerated: false,
            real_tick_secs: 600.0,
            registry_period_secs: 60,
            reconciler_period_secs: 60,
            simulation_end: None,
            ..Self::simulation()
        }
    }

    pub fn preset(mode: RuntimeMode) -> Self {
        match mode {
            RuntimeMode::Simulation => Self::simulation(),
            RuntimeMode::Realtime => Self::realtime(),
        }
    }

    pub fn is_simulation(&self) -> bool {
        self.mode == RuntimeMode::Simulation
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = EnvSource(lookup);
        let mode = env.parse("SMARTMINER_MODE")?.unwrap_or(RuntimeMode::Simulation);
        let mut config = Self::preset(mode);

        if let Some(v) = env.string("SMARTMINER_IDENTIFIER") {
            config.identifier = v;
        }
        if let Some(v) = env.string("SMARTMINER_DATABASE_PATH") {
            config.database_path = v;
        }
        if let Some(v) = env.parse("SMARTMINER_CLOCK_START")? {
            config.clock_start = Some(v);
        }
        if let Some(v) = env.flag("SMARTMINER_ACCELERATED")? {
            config.accelerated = v;
        }
        if let Some(v) = env.parse("SMARTMINER_REAL_TICK_SECS")? {
            config.real_tick_secs = v;
        }
        if let Some(v) = env.parse("SMARTMINER_SIMULATED_TICK_SECS")? {
            config.simulated_tick_secs = v;
        }
        if let Some(v) = env.parse("SMARTMINER_REGISTRY_PERIOD_SECS")? {
            config.registry_period_secs = v;
        }
        if let Some(v) = env.parse("SMARTMINER_RECONCILER_PERIOD_SECS")? {
            config.reconciler_period_secs = v;
        }
        if let Some(v) = env.parse("SMARTMINER_EVALUATOR_PERIOD_SECS")? {
            config.evaluator_period_secs = v;
        }
        if let Some(v) = env.parse("SMARTMINER_RAMP_MODE")? {
            config.ramp.mode = v;
        }
        if let Some(v) = env.parse("SMARTMINER_RAMP_RATE")? {
            config.ramp.max_rate_per_sec = v;
        }
        if let Some(v) = env.parse("SMARTMINER_VALIDITY_RULE")? {
            config.validity = v;
        }
        if let Some(v) = env.parse("SMARTMINER_SIMULATION_END")? {
            config.simulation_end = Some(v);
        }
        if let Some(v) = env.flag("SMARTMINER_CLOSE_ORDERS_ON_SHUTDOWN")? {
            config.close_orders_on_shutdown = v;
        }
        if let Some(v) = env.string("SMARTMINER_NICEHASH_BASE_URL") {
            config.nicehash_base_url = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Overlay a TOML document on the preset named by its `mode` key
    /// (simulation when absent).
    pub fn from_toml_str(doc: &str) -> Result<Self, ConfigError> {
        let overlay: ConfigOverlay =
            toml::from_str(doc).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mut config = Self::preset(overlay.mode.unwrap_or(RuntimeMode::Simulation));
        overlay.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let doc = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&doc)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identifier.trim().is_empty() {
            return Err(ConfigError::Invalid("identifier must not be empty".to_string()));
        }
        self.tick_scale()?;

        for (key, period) in [
            ("registry_period_secs", self.registry_period_secs),
            ("reconciler_period_secs", self.reconciler_period_secs),
            ("evaluator_period_secs", self.evaluator_period_secs),
        ] {
            if period == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", key)));
            }
        }

        if !self.ramp.max_rate_per_sec.is_finite() || self.ramp.max_rate_per_sec < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "ramp rate must be finite and non-negative, got {}",
                self.ramp.max_rate_per_sec
            )));
        }

        match self.mode {
            RuntimeMode::Realtime if self.accelerated => Err(ConfigError::Invalid(
                "realtime mode cannot run an accelerated clock".to_string(),
            )),
            RuntimeMode::Simulation => match (self.simulation_end, self.clock_start) {
                (None, _) => Err(ConfigError::Invalid(
                    "simulation mode needs simulation_end".to_string(),
                )),
                (Some(end), Some(start)) if end < start => Err(ConfigError::Invalid(format!(
                    "simulation_end {} is before clock_start {}",
                    end, start
                ))),
                _ => Ok(()),
            },
            RuntimeMode::Realtime => Ok(()),
        }
    }

    pub fn tick_scale(&self) -> Result<TickScale, ClockError> {
        TickScale::from_secs_f64(self.real_tick_secs, self.simulated_tick_secs)
    }

    pub fn build_clock(&self) -> Result<LogicalClock, ConfigError> {
        if !self.accelerated {
            return Ok(LogicalClock::realtime());
        }
        let start = self
            .clock_start
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        Ok(LogicalClock::accelerated(start, self.tick_scale()?))
    }

    pub fn registry_period(&self) -> Duration {
        Duration::from_secs(self.registry_period_secs)
    }

    pub fn reconciler_period(&self) -> Duration {
        Duration::from_secs(self.reconciler_period_secs)
    }

    pub fn evaluator_period(&self) -> Duration {
        Duration::from_secs(self.evaluator_period_secs)
    }
}

struct EnvSource<F>(F);

impl<F: Fn(&str) -> Option<String>> EnvSource<F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let Some(raw) = self.string(key) else {
            return Ok(None);
        };
        raw.parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            })
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        let Some(raw) = self.string(key) else {
            return Ok(None);
        };
        match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
                reason: "expected a boolean".to_string(),
            }),
        }
    }
}

/// TOML shape: every field optional, applied over a preset.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigOverlay {
    mode: Option<RuntimeMode>,
    identifier: Option<String>,
    database_path: Option<String>,
    clock_start: Option<Timestamp>,
    accelerated: Option<bool>,
    real_tick_secs: Option<f64>,
    simulated_tick_secs: Option<i64>,
    registry_period_secs: Option<u64>,
    reconciler_period_secs: Option<u64>,
    evaluator_period_secs: Option<u64>,
    ramp_mode: Option<RampMode>,
    ramp_rate: Option<f64>,
    validity_rule: Option<ValidityRule>,
    simulation_end: Option<Timestamp>,
    close_orders_on_shutdown: Option<bool>,
    nicehash_base_url: Option<String>,
}

impl ConfigOverlay {
    fn apply(self, config: &mut Config) {
        if let Some(v) = self.identifier {
            config.identifier = v;
        }
        if let Some(v) = self.database_path {
            config.database_path = v;
        }
        if self.clock_start.is_some() {
            config.clock_start = self.clock_start;
        }
        if let Some(v) = self.accelerated {
            config.accelerated = v;
        }
        if let Some(v) = self.real_tick_secs {
            config.real_tick_secs = v;
        }
        if let Some(v) = self.simulated_tick_secs {
            config.simulated_tick_secs = v;
        }
        if let Some(v) = self.registry_period_secs {
            config.registry_period_secs = v;
        }
        if let Some(v) = self.reconciler_period_secs {
            config.reconciler_period_secs = v;
        }
        if let Some(v) = self.evaluator_period_secs {
            config.evaluator_period_secs = v;
        }
        config.ramp = RampPolicy::new(
            self.ramp_mode.unwrap_or(config.ramp.mode),
            self.ramp_rate.unwrap_or(config.ramp.max_rate_per_sec),
        );
        if let Some(v) = self.validity_rule {
            config.validity = v;
        }
        if self.simulation_end.is_some() {
            config.simulation_end = self.simulation_end;
        }
        if let Some(v) = self.close_orders_on_shutdown {
            config.close_orders_on_shutdown = v;
        }
        if let Some(v) = self.nicehash_base_url {
            config.nicehash_base_url = v;
        }
    }
}
