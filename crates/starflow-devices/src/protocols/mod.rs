/*!
 * Protocol implementations.
 */
use std::time::Duration;

use url::Url;

use crate::error::{DeviceError, Result};
use crate::protocol::Transport;

pub mod alpaca;
pub mod stream;

#[cfg(feature = "serial")]
pub mod serial;

pub use alpaca::{AlpacaClient, AlpacaTransport};
pub use stream::StreamTransport;

#[cfg(feature = "serial")]
pub use serial::SerialTransport;

/// Default baud rate for serial mounts
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Open a byte-stream transport from a connection string
///
/// Accepts `tcp://host:port` and `serial:///dev/ttyUSB0?baud=9600`. The
/// transport is returned unconnected.
pub fn open_transport(connection: &str, timeout: Duration) -> Result<Box<dyn Transport>> {
    let url = Url::parse(connection)
        .map_err(|e| DeviceError::configuration(format!("Invalid connection '{}': {}", connection, e)))?;

    match url.scheme() {
        "tcp" => {
            let host = url
                .host_str()
                .ok_or_else(|| DeviceError::configuration(format!("No host in '{}'", connection)))?;
            let port = url
                .port()
                .ok_or_else(|| DeviceError::configuration(format!("No port in '{}'", connection)))?;
            Ok(Box::new(StreamTransport::new(format!("{}:{}", host, port), timeout)))
        }
        "serial" => open_serial(&url, timeout),
        other => Err(DeviceError::configuration(format!(
            "Unsupported transport scheme '{}'",
            other
        ))),
    }
}

fn serial_baud(url: &Url) -> Result<u32> {
    match url.query_pairs().find(|(key, _)| key == "baud") {
        Some((_, value)) => value
            .parse()
            .map_err(|_| DeviceError::configuration(format!("Invalid baud rate '{}'", value))),
        None => Ok(DEFAULT_BAUD_RATE),
    }
}

#[cfg(feature = "serial")]
fn open_serial(url: &Url, timeout: Duration) -> Result<Box<dyn Transport>> {
    let baud = serial_baud(url)?;
    Ok(Box::new(SerialTransport::new(url.path(), baud, timeout)))
}

#[cfg(not(feature = "serial"))]
fn open_serial(url: &Url, _timeout: Duration) -> Result<Box<dyn Transport>> {
    serial_baud(url)?;
    Err(DeviceError::configuration(
        "Serial transport requires the `serial` feature",
    ))
}

/// Names of the transports compiled into this build
pub fn available_transports() -> Vec<&'static str> {
    let mut transports = vec!["alpaca", "tcp"];

    #[cfg(feature = "serial")]
    transports.push("serial");

    transports
}
