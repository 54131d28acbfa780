//! SmartMiner Core Library
//!
//! Substrate for a hash-power rental controller: a logical clock that can
//! run accelerated, periodic workers built on it, and the virtual order
//! machinery that turns many expiring partial requests into one delta per
//! physical order.

pub mod clock;
pub mod config;
pub mod logging;
pub mod orders;
pub mod runtime;
pub mod simulation;
pub mod store;
pub mod virtual_orders;
pub mod worker;

pub use config::{Config, ConfigError, RuntimeMode};
pub use runtime::ControllerRuntime;
