/*!
 * Error types for device communication and actuation.
 */
use thiserror::Error;

use starflow_core::error::Error as CoreError;

/// ASCOM error number for "property or method not implemented"
pub const ASCOM_NOT_IMPLEMENTED: i32 = 0x400;
/// ASCOM error number for "invalid value"
pub const ASCOM_INVALID_VALUE: i32 = 0x401;
/// ASCOM error number for "value not set"
pub const ASCOM_VALUE_NOT_SET: i32 = 0x402;
/// ASCOM error number for "not connected"
pub const ASCOM_NOT_CONNECTED: i32 = 0x407;
/// ASCOM error number for "invalid while parked"
pub const ASCOM_INVALID_WHILE_PARKED: i32 = 0x408;
/// ASCOM error number for "invalid operation"
pub const ASCOM_INVALID_OPERATION: i32 = 0x40B;
/// ASCOM error number for "action not implemented"
pub const ASCOM_ACTION_NOT_IMPLEMENTED: i32 = 0x40C;

/// Error type for device operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// Connection refused, reset, or a non-success HTTP status
    #[error("Transport error: {0}")]
    Transport(String),

    /// No answer within the allowed time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The answer did not have the expected shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The device answered with a nonzero error number
    #[error("Device error 0x{code:X}: {message}")]
    Device {
        /// ASCOM error number
        code: i32,
        /// Error message reported by the device
        message: String,
    },

    /// The actuator is in its fault state
    #[error("Actuator fault: {0}")]
    ActuatorFault(String),

    /// The command queue is at capacity
    #[error("Command queue full ({capacity} entries)")]
    QueueFull {
        /// Configured capacity
        capacity: usize,
    },

    /// The queue is not accepting commands right now
    #[error("Busy: {0}")]
    Busy(String),

    /// The transport is not connected
    #[error("Device not connected")]
    NotConnected,

    /// The intent is not valid in the current state
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// The command was cancelled before dispatch
    #[error("Command cancelled")]
    Cancelled,

    /// Invalid endpoint or transport configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(String),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a new transport error
    pub fn transport<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Transport(msg.as_ref().to_string())
    }

    /// Create a new timeout error
    pub fn timeout<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Timeout(msg.as_ref().to_string())
    }

    /// Create a new protocol error
    pub fn protocol<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Protocol(msg.as_ref().to_string())
    }

    /// Create a new device error from an ASCOM error number
    pub fn device<S: AsRef<str>>(code: i32, msg: S) -> Self {
        DeviceError::Device {
            code,
            message: msg.as_ref().to_string(),
        }
    }

    /// Create a new configuration error
    pub fn configuration<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Configuration(msg.as_ref().to_string())
    }

    /// Create a new invalid transition error
    pub fn invalid_transition<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::InvalidTransition(msg.as_ref().to_string())
    }

    /// The device reported that the property or method does not exist
    pub fn is_not_implemented(&self) -> bool {
        matches!(
            self,
            DeviceError::Device { code, .. }
                if *code == ASCOM_NOT_IMPLEMENTED || *code == ASCOM_ACTION_NOT_IMPLEMENTED
        )
    }

    /// Whether the link itself failed, as opposed to the device refusing
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            DeviceError::Transport(_) | DeviceError::Timeout(_) | DeviceError::NotConnected
        )
    }

    /// ASCOM error number, when the device supplied one
    pub fn code(&self) -> Option<i32> {
        match self {
            DeviceError::Device { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<CoreError> for DeviceError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Timeout(msg) => DeviceError::Timeout(msg),
            CoreError::Config(msg) => DeviceError::Configuration(msg),
            other => DeviceError::Core(other.to_string()),
        }
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                DeviceError::Timeout(err.to_string())
            }
            _ => DeviceError::Transport(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_display_uses_hex_code() {
        let err = DeviceError::device(ASCOM_NOT_CONNECTED, "Not connected");
        assert_eq!(err.to_string(), "Device error 0x407: Not connected");
        assert_eq!(err.code(), Some(0x407));
    }

    #[test]
    fn test_not_implemented_detection() {
        assert!(DeviceError::device(ASCOM_NOT_IMPLEMENTED, "no").is_not_implemented());
        assert!(DeviceError::device(ASCOM_ACTION_NOT_IMPLEMENTED, "no").is_not_implemented());
        assert!(!DeviceError::device(ASCOM_INVALID_VALUE, "bad").is_not_implemented());
        assert!(!DeviceError::timeout("slow").is_not_implemented());
    }

    #[test]
    fn test_core_timeout_maps_to_timeout() {
        let err: DeviceError = CoreError::timeout("late").into();
        assert_eq!(err, DeviceError::Timeout("late".to_string()));
        assert!(err.is_link_failure());
    }

    #[test]
    fn test_io_error_mapping() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(DeviceError::from(refused), DeviceError::Transport(_)));
        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(DeviceError::from(timed_out), DeviceError::Timeout(_)));
    }
}
