pub mod frame;
pub mod interface;
pub mod packet;
pub mod transport;

pub use frame::FrameCodec;
pub use interface::{SerialInterface, SerialPortIO};
pub use packet::{NamedPayload, Packet, PacketType};
pub use transport::{
    PacketTransport, PendingResponse, ResponseMatcher, TransportConfig, TransportEvent,
    TransportMetrics,
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// Fatal framing errors. Any of these ends the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame declares {length} bytes, receive buffer holds {capacity}")]
    BufferOverflow { length: usize, capacity: usize },

    #[error("malformed header: length {length} is shorter than the 4 byte header")]
    MalformedHeader { length: usize },

    #[error("frame length mismatch: header says {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("payload truncated: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("name of {0} bytes does not fit a 1 byte length prefix")]
    NameTooLong(usize),

    #[error("invalid UTF-8 in name field")]
    InvalidName,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Communication timeout")]
    Timeout,

    #[error("Transport closed: {0}")]
    TransportClosed(String),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

impl SerialError {
    /// Whether the error ended the connection, as opposed to a single request.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SerialError::Timeout | SerialError::ProtocolError(_))
    }
}

pub type Result<T> = std::result::Result<T, SerialError>;
