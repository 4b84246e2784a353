/*!
 * Prelude module for Starflow Core.
 *
 * Commonly used types and functions of the core crate in one import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{Id, Value};

// Re-export runtime types
pub use crate::runtime::{build_runtime, ServiceHandle, ShutdownSignal, StopFlag, ThreadHandle};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, ExecutionModel, ReconnectPolicy, SharedConfig};

// Re-export utility functions
pub use crate::utils::{with_retry, with_retry_if, with_timeout};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};
