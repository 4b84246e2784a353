/*!
 * Logging functionality for Starflow.
 *
 * This module provides tracing setup and span helpers so every sync engine,
 * command queue and actuator loop logs under a consistent component name.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// `RUST_LOG` takes precedence over `filter` when it is set.
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "starflow_engine=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    install(filter, false)
}

/// Initialize the logging system from the `[logging]` configuration section
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    install(&config.level, config.json_format)
}

fn install(filter: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };

    result.map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a new span for a component
///
/// # Arguments
///
/// * `name` - The name of the component (`sync`, `queue`, `actuator`)
/// * `id` - The device instance, if any
pub fn component_span(name: &str, id: Option<&str>) -> Span {
    match id {
        Some(id) => tracing::info_span!("component", name = %name, id = %id),
        None => tracing::info_span!("component", name = %name),
    }
}

/// Create a new span for an operation
///
/// # Arguments
///
/// * `name` - The name of the operation
/// * `component` - The component performing the operation
pub fn operation_span(name: &str, component: &str) -> Span {
    tracing::info_span!("operation", name = %name, component = %component)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_reports_error() {
        // Only the first global subscriber wins in a test binary.
        let _ = init();
        assert!(init_with_filter("debug").is_err());
    }

    #[test]
    fn test_component_span() {
        let span = component_span("sync", Some("dome-0"));
        let _entered = span.enter();

        let span = component_span("scheduler", None);
        let _entered = span.enter();
    }

    #[test]
    fn test_operation_span() {
        let span = operation_span("fetch", "sync");
        let _entered = span.enter();
    }
}
