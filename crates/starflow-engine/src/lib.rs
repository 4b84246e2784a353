/*!
 * Starflow Engine
 *
 * This crate provides the moving parts of Starflow: the status sync engine
 * that keeps remote property caches fresh, the per-device command queues,
 * the actuator state machine for locally driven domes, task timing, and the
 * assembly that wires them together from a configuration.
 */

#![warn(missing_docs)]

// Re-export core types
pub use starflow_core::prelude;

// Re-export types from starflow_core for convenience
pub use starflow_core::types::{Id, Value};

pub mod actuator;
pub mod command_queue;
pub mod error;
pub mod observatory;
pub mod scheduler;
pub mod sync;

// Re-export main types for convenience
pub use actuator::{
    ActuatorHandle, ActuatorKind, ActuatorPhase, ActuatorService, ActuatorStateMachine, ActuatorStatus, Intent,
    LocalActuatorTransport,
};
pub use command_queue::{
    Command, CommandClass, CommandHandle, CommandStatus, DeviceCommandQueue, LinkState, PeriodicCommand, QueueSender,
};
pub use error::{Error, Result};
pub use observatory::{DomeController, MountController, Observatory, RemoteDeviceController, ShutterSource};
pub use scheduler::{CooperativeLoop, CooperativeTask, TaskGuard, TaskId, TaskReport, TaskScheduler};
pub use sync::{FetchStrategy, StatusSyncEngine, SyncHandle};

/// Starflow engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine
pub fn init() -> Result<()> {
    tracing::info!("Starflow Engine {} initialized", VERSION);
    Ok(())
}
