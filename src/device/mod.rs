pub mod models;
pub mod session;
pub mod twin;

pub use models::*;
pub use session::{DeviceSession, SessionConfig};
pub use twin::{MethodDispatch, SessionObserver, TwinClient};

use crate::descriptor::{DescriptorError, SchemaError};
use crate::serial::SerialError;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Session is not operational (state: {state:?})")]
    NotOperational { state: SessionState },

    #[error("Session already started")]
    AlreadyStarted,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Unknown property: {0}")]
    UnknownProperty(String),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Property is not writeable: {0}")]
    NotWriteable(String),

    #[error("Malformed descriptor: {0}")]
    MalformedDescriptor(#[from] DescriptorError),

    #[error("Value conversion failed: {0}")]
    Schema(#[from] SchemaError),

    #[error("Serial communication error: {0}")]
    Serial(#[from] SerialError),

    #[error("Twin client error: {0}")]
    Twin(String),

    #[error("Interface index {0} does not fit the packet format")]
    InterfaceIndexOutOfRange(usize),

    #[error("Session faulted: {0}")]
    Faulted(String),
}

impl DeviceError {
    /// Whether the session can no longer be used after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            DeviceError::MalformedDescriptor(_) | DeviceError::Faulted(_) => true,
            DeviceError::Serial(e) => e.is_fatal(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;
