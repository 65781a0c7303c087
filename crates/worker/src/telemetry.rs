// Logging setup for the worker host

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "docket=info";

/// Configuration for console logging
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Log filter (e.g., "info", "docket=debug")
    pub log_filter: Option<String>,
    /// Whether to include the event target
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: None,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `RUST_LOG`: Full filter directive
    /// - `LOG_LEVEL`: Level applied to the docket crates when `RUST_LOG` is unset
    pub fn from_env() -> Self {
        Self {
            log_filter: resolve_filter(
                std::env::var("RUST_LOG").ok(),
                std::env::var("LOG_LEVEL").ok(),
            ),
            ..Default::default()
        }
    }

    /// Filter to install, falling back to the default on a bad directive
    pub fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
    }
}

/// `RUST_LOG` wins; a bare `LOG_LEVEL` is scoped to the docket crates
fn resolve_filter(rust_log: Option<String>, log_level: Option<String>) -> Option<String> {
    rust_log.or_else(|| log_level.map(|level| format!("docket={level}")))
}

/// Install the global subscriber
pub fn init_telemetry(config: TelemetryConfig) -> Result<()> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(config.with_target)
        .with_filter(config.filter());

    tracing_subscriber::registry()
        .with(console_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}
