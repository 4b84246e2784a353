/*!
 * Starflow Devices
 *
 * This crate provides the device side of Starflow: remote endpoint
 * bookkeeping, the property cache, the Alpaca HTTP client, byte-stream and
 * serial transports, digital I/O for local actuators, and the registry of
 * attached devices.
 */

#![warn(missing_docs)]

pub mod cache;
pub mod device;
pub mod discovery;
pub mod error;
pub mod hardware;
pub mod protocol;
pub mod protocols;
pub mod registry;

#[cfg(feature = "gpio")]
pub mod gpio;

pub use cache::{CachedPropertySet, PropertyReading, SharedPropertyCache};
pub use device::{DeviceType, EndpointCapabilities, RemoteDeviceEndpoint};
pub use error::{DeviceError, Result};
pub use protocol::{CommandReply, CommandRequest, Framing, StatusFetcher, StatusRequest, Transport};
pub use registry::{DeviceRegistry, DeviceStatus, RegisteredDevice, RegistryEvent, SharedDeviceRegistry};

/// Starflow devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
