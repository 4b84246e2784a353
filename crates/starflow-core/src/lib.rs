/*!
 * Starflow Core
 *
 * This crate provides the shared foundation of Starflow: configuration,
 * logging, value types, bounded-wait utilities and the lifecycle handles
 * that own every background loop.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod runtime;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use chrono;
    pub use serde;
    pub use tokio;
    pub use tracing;
    pub use uuid;
}

/// Starflow core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization with the default log filter
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("Starflow Core {} initialized", VERSION);
    Ok(())
}
