//! Wire value types and their text conversions.
//!
//! All multi-byte values are little-endian. Text is the representation
//! exchanged with the twin client.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Schema {
    /// No value. Used by commands without arguments or results.
    Invalid = 0,
    Byte = 1,
    Float = 2,
    Double = 3,
    Int = 4,
    Long = 5,
    Boolean = 6,
    String = 7,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("{schema:?} value needs {expected} bytes, got {actual}")]
    LengthMismatch {
        schema: Schema,
        expected: usize,
        actual: usize,
    },

    #[error("'{text}' is not a valid {schema:?} value")]
    InvalidText { schema: Schema, text: String },

    #[error("string value is not valid UTF-8")]
    InvalidUtf8,
}

impl Schema {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Schema::Invalid),
            1 => Some(Schema::Byte),
            2 => Some(Schema::Float),
            3 => Some(Schema::Double),
            4 => Some(Schema::Int),
            5 => Some(Schema::Long),
            6 => Some(Schema::Boolean),
            7 => Some(Schema::String),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    /// Fixed binary size, `None` for variable length strings.
    pub fn encoded_len(self) -> Option<usize> {
        match self {
            Schema::Invalid => Some(0),
            Schema::Byte | Schema::Boolean => Some(1),
            Schema::Float | Schema::Int => Some(4),
            Schema::Double | Schema::Long => Some(8),
            Schema::String => None,
        }
    }

    pub fn binary_to_text(self, data: &[u8]) -> Result<String, SchemaError> {
        if let Some(expected) = self.encoded_len() {
            if data.len() != expected {
                return Err(SchemaError::LengthMismatch {
                    schema: self,
                    expected,
                    actual: data.len(),
                });
            }
        }

        let text = match self {
            Schema::Invalid => String::new(),
            Schema::Byte => data[0].to_string(),
            Schema::Boolean => (data[0] != 0).to_string(),
            Schema::Float => f32::from_le_bytes(fixed(data)).to_string(),
            Schema::Int => i32::from_le_bytes(fixed(data)).to_string(),
            Schema::Double => f64::from_le_bytes(fixed(data)).to_string(),
            Schema::Long => i64::from_le_bytes(fixed(data)).to_string(),
            Schema::String => std::str::from_utf8(data)
                .map_err(|_| SchemaError::InvalidUtf8)?
                .to_string(),
        };
        Ok(text)
    }

    pub fn text_to_binary(self, text: &str) -> Result<Vec<u8>, SchemaError> {
        let invalid = || SchemaError::InvalidText {
            schema: self,
            text: text.to_string(),
        };
        let trimmed = text.trim();

        let bytes = match self {
            Schema::Invalid => Vec::new(),
            Schema::String => text.as_bytes().to_vec(),
            Schema::Byte => vec![trimmed.parse::<u8>().map_err(|_| invalid())?],
            Schema::Boolean => {
                let value = match trimmed.to_ascii_lowercase().as_str() {
                    "true" | "1" => true,
                    "false" | "0" => false,
                    _ => return Err(invalid()),
                };
                vec![value as u8]
            }
            Schema::Float => trimmed
                .parse::<f32>()
                .map_err(|_| invalid())?
                .to_le_bytes()
                .to_vec(),
            Schema::Int => trimmed
                .parse::<i32>()
                .map_err(|_| invalid())?
                .to_le_bytes()
                .to_vec(),
            Schema::Double => trimmed
                .parse::<f64>()
                .map_err(|_| invalid())?
                .to_le_bytes()
                .to_vec(),
            Schema::Long => trimmed
                .parse::<i64>()
                .map_err(|_| invalid())?
                .to_le_bytes()
                .to_vec(),
        };
        Ok(bytes)
    }
}

// Callers check the length first.
fn fixed<const N: usize>(data: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[..N]);
    out
}
