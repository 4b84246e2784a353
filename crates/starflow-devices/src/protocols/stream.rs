/*!
 * Byte-stream command transport.
 *
 * Commands are written verbatim; the reply is read until the request's
 * [`Framing`] yields one complete frame. Used for LX200-style mounts on a
 * TCP socket.
 */
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use starflow_core::types::Value;
use starflow_core::utils::with_timeout;

use crate::error::{DeviceError, Result};
use crate::protocol::{CommandReply, CommandRequest, Framing, Transport};

/// Write `request` to `io` and read one framed reply into `buffer`
pub async fn exchange_framed<S>(io: &mut S, buffer: &mut BytesMut, request: &CommandRequest) -> Result<CommandReply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    io.write_all(request.name.as_bytes()).await?;
    io.flush().await?;
    trace!(command = %request.name, "sent");

    if request.framing == Framing::NoResponse {
        return Ok(CommandReply::empty());
    }

    loop {
        if let Some(frame) = request.framing.extract(buffer) {
            let text = String::from_utf8_lossy(&frame).into_owned();
            trace!(command = %request.name, reply = %text, "received");
            return Ok(CommandReply {
                value: Value::String(text),
            });
        }
        let read = io.read_buf(buffer).await?;
        if read == 0 {
            return Err(DeviceError::transport("connection closed by peer"));
        }
    }
}

/// TCP socket transport
#[derive(Debug)]
pub struct StreamTransport {
    address: String,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    buffer: BytesMut,
}

impl StreamTransport {
    /// Create a transport for `host:port`
    pub fn new<S: Into<String>>(address: S, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
            stream: None,
            buffer: BytesMut::with_capacity(256),
        }
    }

    /// The remote address
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn name(&self) -> &str {
        "tcp"
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn connect(&mut self) -> Result<()> {
        let address = self.address.clone();
        let stream = with_timeout(self.connect_timeout, async move {
            TcpStream::connect(&address).await.map_err(DeviceError::from)
        })
        .await?;
        stream.set_nodelay(true)?;
        self.buffer.clear();
        self.stream = Some(stream);
        debug!(address = %self.address, "Connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!(address = %self.address, "Disconnected");
        }
        Ok(())
    }

    async fn exchange(&mut self, request: &CommandRequest) -> Result<CommandReply> {
        let stream = self.stream.as_mut().ok_or(DeviceError::NotConnected)?;
        let result = exchange_framed(stream, &mut self.buffer, request).await;
        if matches!(&result, Err(e) if e.is_link_failure()) {
            self.stream = None;
        }
        result
    }

    async fn resync(&mut self) -> Result<()> {
        self.buffer.clear();
        if let Some(stream) = self.stream.as_mut() {
            loop {
                match stream.try_read_buf(&mut self.buffer) {
                    Ok(0) => {
                        self.stream = None;
                        break;
                    }
                    Ok(_) => self.buffer.clear(),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        self.stream = None;
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }
}
