//! Physical Orders
//!
//! - [`RateLimitedOrder`]: event-sourced order whose limit ramps over time
//! - [`MarketplaceDriver`]: narrow interface to the hash-power marketplace
//! - [`SimulationDriver`]: in-process marketplace over rate-limited orders
//! - [`NiceHashDriver`]: live marketplace over the NiceHash REST API

mod driver;
mod model;
pub mod nicehash;
mod simulation_driver;

pub use driver::{
    Algorithm, Market, MarketplaceDriver, NewOrder, OrderSnapshot, OrderType, DEFAULT_POOL_ID,
};
pub use model::{OrderChange, RampMode, RampPolicy, RateLimitedOrder, DEFAULT_MAX_RAMP_RATE};
pub use nicehash::{NiceHashCredentials, NiceHashDriver};
pub use simulation_driver::SimulationDriver;
