//! Subscriber setup for applications embedding the optimizer

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install a fmt subscriber filtered by `RUST_LOG`, or by `level` when it
/// is unset or invalid.
///
/// Returns false when a global subscriber was already installed, so it is
/// safe to call more than once.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

/// [`init`] with the level from the logging section of `config`
pub fn init_from_config(config: &crate::config::Config) -> bool {
    init(&config.logging.level)
}
