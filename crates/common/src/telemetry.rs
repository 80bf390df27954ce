//! Process-wide logging initialization (spec §1b). The reference
//! implementation wires every crate through its own structured-event crate
//! (`trc`), built around Stalwart's OpenTelemetry/Prometheus/webhook export
//! pipeline - all out of scope here. In its place this repository installs a
//! plain `tracing_subscriber::fmt` subscriber.

use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Call once, before any listener binds.
///
/// Honors `RUST_LOG` if set; otherwise falls back to `log_level` (the
/// `logLevel` config key).
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
