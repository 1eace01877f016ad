//! Tracing subscriber setup
//!
//! `RUST_LOG`, when set, takes precedence over the configured level. Installing twice is
//! harmless: the second call leaves the existing global subscriber in place.

use crate::config::LoggingConfig;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Build the filter used by [`init_tracing`]
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Install the global fmt subscriber.
///
/// Returns `true` if the global subscriber is the one installed here.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    *LOGGER_INITIALIZED.get_or_init(|| {
        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .with_target(config.with_target)
                .with_level(true)
                .with_ansi(config.ansi)
                .with_filter(env_filter(config)),
        );

        match subscriber.try_init() {
            Ok(()) => {
                tracing::debug!(level = %config.level, "Tracing subscriber installed");
                true
            }
            // Someone else (test harness, embedding binary) already owns the global
            Err(_) => false,
        }
    })
}
