//! Logging setup for moltd.
//!
//! Environment variables:
//! - `RUST_LOG`: log filter (default: `info,molt=debug,moltd=debug`)
//! - `MOLT_LOG_FORMAT`: `json` for one JSON object per line, anything else
//!   for human-readable output

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,molt=debug,moltd=debug";

/// Install the global subscriber. Output goes to stderr. A detached
/// daemon's stderr is relayed into the configured log file, and is lost
/// when none is set.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let json = std::env::var("MOLT_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }

    tracing::debug!(pid = std::process::id(), json, "Telemetry initialized");
    Ok(())
}
