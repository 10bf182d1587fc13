//! Observability infrastructure: structured logging and metrics.
//!
//! Logging goes through `tracing`; metrics go through the `metrics` facade.
//! No exporter is installed for a one-shot run, so metrics are only collected
//! when the embedding process installs a recorder.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Initialize logging and describe the harness metrics.
///
/// `RUST_LOG` overrides the default `info` level. Must be called once at
/// startup; a second call returns an error.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true),
        )
        .try_init()?;

    metrics::register_core_metrics();

    tracing::debug!("Observability initialized");
    Ok(())
}
