/*!
 * Protocol seams between the engine and the wire.
 *
 * [`StatusFetcher`] is the read side used by the status sync engine;
 * [`Transport`] is the write side driven by a command queue. Both are
 * object safe so the engine can be tested against scripted fakes.
 */
use std::fmt::{self, Debug};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use starflow_core::types::Value;

use crate::error::{DeviceError, Result};

/// One status fetch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatusRequest {
    /// `GET devicestate`
    DeviceState,
    /// `GET readall`
    ReadAll,
    /// `GET <property>`
    Property(String),
}

impl StatusRequest {
    /// Fetch a single property
    pub fn property<S: Into<String>>(name: S) -> Self {
        StatusRequest::Property(name.into())
    }

    /// The URL segment for this request
    pub fn path_segment(&self) -> &str {
        match self {
            StatusRequest::DeviceState => "devicestate",
            StatusRequest::ReadAll => "readall",
            StatusRequest::Property(name) => name,
        }
    }
}

impl fmt::Display for StatusRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

/// Read side of a remote device
#[async_trait]
pub trait StatusFetcher: Send + Sync + Debug {
    /// Fetch and flatten one status request into `(name, value)` pairs
    ///
    /// A single-property request yields exactly one pair named after the
    /// property. Any nonzero device error number is an error.
    async fn fetch(&self, request: &StatusRequest) -> Result<Vec<(String, Value)>>;

    /// The device's `supportedactions` list
    async fn supported_actions(&self) -> Result<Vec<String>>;
}

/// How a response is delimited on a byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Bytes up to and excluding this terminator
    Terminated(u8),
    /// Exactly this many bytes
    FixedLength(usize),
    /// The device sends nothing back
    NoResponse,
}

impl Framing {
    /// LX200 style `#` terminated replies
    pub const HASH: Framing = Framing::Terminated(b'#');
    /// Newline terminated replies
    pub const LINE: Framing = Framing::Terminated(b'\n');

    /// Parse a framing name from configuration
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "hash" => Ok(Self::HASH),
            "line" => Ok(Self::LINE),
            "cr" => Ok(Framing::Terminated(b'\r')),
            "none" => Ok(Framing::NoResponse),
            other => match other.strip_prefix("fixed:").map(str::parse::<usize>) {
                Some(Ok(len)) if len > 0 => Ok(Framing::FixedLength(len)),
                _ => Err(DeviceError::configuration(format!("unknown framing '{}'", name))),
            },
        }
    }

    /// Split one complete frame off the front of `buffer`, if present
    pub fn extract(&self, buffer: &mut BytesMut) -> Option<Bytes> {
        match *self {
            Framing::Terminated(terminator) => {
                let end = buffer.iter().position(|&b| b == terminator)?;
                let mut frame = buffer.split_to(end + 1);
                frame.truncate(end);
                Some(frame.freeze())
            }
            Framing::FixedLength(len) if buffer.len() >= len => Some(buffer.split_to(len).freeze()),
            Framing::FixedLength(_) => None,
            Framing::NoResponse => Some(Bytes::new()),
        }
    }
}

/// One outgoing command
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    /// Alpaca method name or raw stream command
    pub name: String,
    /// Form parameters (ignored by byte-stream transports)
    pub parameters: Vec<(String, String)>,
    /// Reply framing (ignored by HTTP transports)
    pub framing: Framing,
}

impl CommandRequest {
    /// Create a command with no parameters expecting a `#` terminated reply
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
            framing: Framing::HASH,
        }
    }

    /// Add a form parameter
    pub fn with_parameter<K: Into<String>, V: ToString>(mut self, key: K, value: V) -> Self {
        self.parameters.push((key.into(), value.to_string()));
        self
    }

    /// Set the reply framing
    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }
}

/// What came back for a command
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    /// Decoded payload; `Null` when nothing was returned
    pub value: Value,
}

impl CommandReply {
    /// A reply with no payload
    pub fn empty() -> Self {
        Self { value: Value::Null }
    }
}

/// Write side of a device: one request, one matching reply
#[async_trait]
pub trait Transport: Send + Debug {
    /// Transport name for logs
    fn name(&self) -> &str;

    /// Whether the link is currently up
    fn is_connected(&self) -> bool;

    /// Establish the link
    async fn connect(&mut self) -> Result<()>;

    /// Tear the link down
    async fn disconnect(&mut self) -> Result<()>;

    /// Send `request` and wait for its reply
    async fn exchange(&mut self, request: &CommandRequest) -> Result<CommandReply>;

    /// Drop any partial or late reply after an abandoned exchange
    async fn resync(&mut self) -> Result<()> {
        Ok(())
    }
}
