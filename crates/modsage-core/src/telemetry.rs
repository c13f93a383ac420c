//! Tracing setup for binaries embedding the analysis core.

use std::io;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Installs a global subscriber writing to stderr.
///
/// The filter comes from `RUST_LOG`, falling back to `default_directive`
/// (for example `"modsage_core=debug,info"`). Returns `false` if a global
/// subscriber was already installed.
pub fn init_tracing(default_directive: &str, format: LogFormat) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let pretty = (format == LogFormat::Pretty)
        .then(|| tracing_subscriber::fmt::layer().with_writer(io::stderr));
    let json = (format == LogFormat::Json)
        .then(|| tracing_subscriber::fmt::layer().json().with_writer(io::stderr));

    tracing_subscriber::registry().with(filter).with(pretty).with(json).try_init().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_not_an_error() {
        let _ = init_tracing("off", LogFormat::Pretty);
        assert!(!init_tracing("off", LogFormat::Json));
    }
}
