/*!
 * Error types for the Starflow engine crate.
 */
use thiserror::Error;

/// Error type for Starflow engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// Actuator state machine error
    #[error("State machine error: {0}")]
    StateMachine(String),

    /// Task scheduler error
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// An intent refused by a caller-level policy before it was queued
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Device error
    #[error("Device error: {0}")]
    Device(#[from] starflow_devices::DeviceError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] starflow_core::error::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Already exists error
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

/// Result type for Starflow engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new state machine error
    pub fn state_machine<S: AsRef<str>>(msg: S) -> Self {
        Error::StateMachine(msg.as_ref().to_string())
    }

    /// Create a new scheduler error
    pub fn scheduler<S: AsRef<str>>(msg: S) -> Self {
        Error::Scheduler(msg.as_ref().to_string())
    }

    /// Create a new rejection
    pub fn rejected<S: AsRef<str>>(msg: S) -> Self {
        Error::Rejected(msg.as_ref().to_string())
    }

    /// Create a new validation error
    pub fn validation<S: AsRef<str>>(msg: S) -> Self {
        Error::Validation(msg.as_ref().to_string())
    }

    /// Create a new not found error
    pub fn not_found<S: AsRef<str>>(msg: S) -> Self {
        Error::NotFound(msg.as_ref().to_string())
    }

    /// Create a new already exists error
    pub fn already_exists<S: AsRef<str>>(msg: S) -> Self {
        Error::AlreadyExists(msg.as_ref().to_string())
    }
}
