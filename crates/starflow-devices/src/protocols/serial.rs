/*!
 * Serial line command transport.
 *
 * The `serialport` crate is blocking, so every exchange runs on tokio's
 * blocking pool with the port behind a mutex.
 */
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use serialport::SerialPort;
use tracing::debug;

use starflow_core::types::Value;

use crate::error::{DeviceError, Result};
use crate::protocol::{CommandReply, CommandRequest, Framing, Transport};

/// Poll interval of the blocking read loop
const READ_SLICE: Duration = Duration::from_millis(50);

/// Serial port transport
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    reply_timeout: Duration,
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialTransport {
    /// Create a transport for the port at `path`
    pub fn new<S: Into<String>>(path: S, baud_rate: u32, reply_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            reply_timeout,
            port: None,
        }
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("path", &self.path)
            .field("baud_rate", &self.baud_rate)
            .field("open", &self.port.is_some())
            .finish()
    }
}

fn exchange_blocking(
    port: &mut dyn SerialPort,
    request: &CommandRequest,
    reply_timeout: Duration,
) -> Result<CommandReply> {
    port.clear(serialport::ClearBuffer::Input)
        .map_err(|e| DeviceError::transport(e.to_string()))?;
    port.write_all(request.name.as_bytes())?;
    port.flush()?;

    if request.framing == Framing::NoResponse {
        return Ok(CommandReply::empty());
    }

    let deadline = Instant::now() + reply_timeout;
    let mut buffer = BytesMut::new();
    let mut chunk = [0u8; 64];
    loop {
        if let Some(frame) = request.framing.extract(&mut buffer) {
            return Ok(CommandReply {
                value: Value::String(String::from_utf8_lossy(&frame).into_owned()),
            });
        }
        if Instant::now() >= deadline {
            return Err(DeviceError::timeout(format!("no reply to {}", request.name)));
        }
        match port.read(&mut chunk) {
            Ok(0) => {}
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &str {
        "serial"
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    async fn connect(&mut self) -> Result<()> {
        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(READ_SLICE)
            .open()
            .map_err(|e| {
                DeviceError::transport(format!(
                    "Failed to open serial port '{}' at {} baud: {}",
                    self.path, self.baud_rate, e
                ))
            })?;
        self.port = Some(Arc::new(Mutex::new(port)));
        debug!(path = %self.path, baud = self.baud_rate, "Serial port opened");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!(path = %self.path, "Serial port closed");
        }
        Ok(())
    }

    async fn exchange(&mut self, request: &CommandRequest) -> Result<CommandReply> {
        let port = self.port.clone().ok_or(DeviceError::NotConnected)?;
        let request = request.clone();
        let reply_timeout = self.reply_timeout;

        let result = tokio::task::spawn_blocking(move || {
            let mut guard = port.lock().unwrap_or_else(PoisonError::into_inner);
            exchange_blocking(guard.as_mut(), &request, reply_timeout)
        })
        .await
        .map_err(|e| DeviceError::transport(format!("Serial I/O task failed: {}", e)))?;

        if matches!(&result, Err(DeviceError::Transport(_))) {
            self.port = None;
        }
        result
    }
}
