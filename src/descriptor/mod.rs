pub mod models;
pub mod parser;
pub mod schema;

pub use models::*;
pub use parser::parse;
pub use schema::{Schema, SchemaError};

use serde::{Deserialize, Serialize};

/// Descriptor wire revision. The two revisions disagree on the interface
/// marker and on field widths, so the revision is configured, never inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolRevision {
    /// Legacy firmware: marker `0x04`, 1 byte id length, 1 byte schema codes.
    V1,
    /// Marker `0x05`, 2 byte id length, 2 byte schema codes.
    #[default]
    V2,
}

impl ProtocolRevision {
    pub fn interface_marker(self) -> u8 {
        match self {
            ProtocolRevision::V1 => 0x04,
            ProtocolRevision::V2 => 0x05,
        }
    }

    /// Width in bytes of the interface id length prefix and of schema codes.
    pub fn wide_field_width(self) -> usize {
        match self {
            ProtocolRevision::V1 => 1,
            ProtocolRevision::V2 => 2,
        }
    }
}

impl std::fmt::Display for ProtocolRevision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolRevision::V1 => write!(f, "v1"),
            ProtocolRevision::V2 => write!(f, "v2"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("descriptor truncated: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("unrecognized descriptor record 0x{value:02X} at offset {offset}")]
    UnrecognizedDiscriminator { offset: usize, value: u8 },

    #[error("unknown field type 0x{value:02X} at offset {offset}")]
    UnknownFieldType { offset: usize, value: u8 },

    #[error("unknown schema code {code} at offset {offset}")]
    UnknownSchema { offset: usize, code: u16 },

    #[error("invalid UTF-8 string at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("duplicate {kind} '{name}' in interface '{interface}'")]
    DuplicateName {
        interface: String,
        kind: &'static str,
        name: String,
    },

    #[error("{field} of {length} bytes does not fit its length prefix")]
    FieldTooLong { field: &'static str, length: usize },
}

pub type Result<T> = std::result::Result<T, DescriptorError>;
