use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_FILTER: &str = "smartminer_core=info";

/// Install the global `tracing` subscriber. `RUST_LOG` wins over
/// `default_filter`. Safe to call more than once; later calls are ignored.
pub fn init_tracing(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init()
        .is_ok()
}
