//! Descriptor wire format.
//!
//! ```text
//! version:u8  name_len:u8  name
//! repeat {
//!     marker  id_len:(u8|u16le)  id
//!     repeat while tag <= 0x03 {
//!         tag  name  display_name  description      (each u8 length + UTF-8)
//!         0x01 command:  request_schema  response_schema
//!         0x02 property: units  schema  flags (bit0 writeable, bit1 required)
//!         0x03 event:    units  schema
//!     }
//! }
//! ```
//!
//! Schema codes are u8 in [`ProtocolRevision::V1`] and u16le in
//! [`ProtocolRevision::V2`], as is the interface id length.

use std::collections::HashSet;

use super::models::*;
use super::{DescriptorError, ProtocolRevision, Result, Schema};

const FIELD_COMMAND: u8 = 0x01;
const FIELD_PROPERTY: u8 = 0x02;
const FIELD_EVENT: u8 = 0x03;

const FLAG_WRITEABLE: u8 = 0x01;
const FLAG_REQUIRED: u8 = 0x02;

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(DescriptorError::Truncated {
                offset: self.pos,
                needed: len,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_sized(&mut self, width: usize) -> Result<u16> {
        match width {
            1 => self.read_u8().map(u16::from),
            _ => self.read_u16_le(),
        }
    }

    fn read_string(&mut self, len: usize) -> Result<String> {
        let offset = self.pos;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| DescriptorError::InvalidUtf8 { offset })
    }

    fn read_short_string(&mut self) -> Result<String> {
        let len = self.read_u8()? as usize;
        self.read_string(len)
    }

    fn read_schema(&mut self, revision: ProtocolRevision) -> Result<Schema> {
        let offset = self.pos;
        let code = self.read_sized(revision.wide_field_width())?;
        Schema::from_code(code).ok_or(DescriptorError::UnknownSchema { offset, code })
    }
}

/// Parse a descriptor-response payload (the bytes after the packet header).
pub fn parse(payload: &[u8], revision: ProtocolRevision) -> Result<DeviceDescriptor> {
    let mut cursor = Cursor::new(payload);

    let version = cursor.read_u8()?;
    let display_name = cursor.read_short_string()?;
    let mut interfaces = Vec::new();

    while !cursor.is_empty() {
        let offset = cursor.pos;
        let marker = cursor.read_u8()?;
        if marker != revision.interface_marker() {
            return Err(DescriptorError::UnrecognizedDiscriminator {
                offset,
                value: marker,
            });
        }
        interfaces.push(parse_interface(&mut cursor, revision)?);
    }

    log::debug!(
        "Parsed descriptor '{}' v{} with {} interface(s)",
        display_name,
        version,
        interfaces.len()
    );

    Ok(DeviceDescriptor {
        version,
        display_name,
        interfaces,
    })
}

fn parse_interface(cursor: &mut Cursor<'_>, revision: ProtocolRevision) -> Result<InterfaceDefinition> {
    let id_len = cursor.read_sized(revision.wide_field_width())? as usize;
    let mut interface = InterfaceDefinition::new(cursor.read_string(id_len)?);
    let mut seen_commands = HashSet::new();
    let mut seen_properties = HashSet::new();
    let mut seen_events = HashSet::new();

    while let Some(tag) = cursor.peek_u8() {
        if tag > FIELD_EVENT {
            break;
        }
        let offset = cursor.pos;
        if tag < FIELD_COMMAND {
            return Err(DescriptorError::UnknownFieldType { offset, value: tag });
        }
        cursor.read_u8()?;
        let field = FieldDefinition {
            name: cursor.read_short_string()?,
            display_name: cursor.read_short_string()?,
            description: cursor.read_short_string()?,
        };

        match tag {
            FIELD_COMMAND => {
                claim(&mut seen_commands, &interface.id, "command", &field.name)?;
                let request_schema = cursor.read_schema(revision)?;
                let response_schema = cursor.read_schema(revision)?;
                interface.commands.push(CommandDefinition {
                    field,
                    request_schema,
                    response_schema,
                });
            }
            FIELD_PROPERTY => {
                claim(&mut seen_properties, &interface.id, "property", &field.name)?;
                let units = cursor.read_short_string()?;
                let data_schema = cursor.read_schema(revision)?;
                let flags = cursor.read_u8()?;
                interface.properties.push(PropertyDefinition {
                    field,
                    units,
                    writeable: flags & FLAG_WRITEABLE != 0,
                    required: flags & FLAG_REQUIRED != 0,
                    data_schema,
                });
            }
            _ => {
                claim(&mut seen_events, &interface.id, "event", &field.name)?;
                let units = cursor.read_short_string()?;
                let data_schema = cursor.read_schema(revision)?;
                interface.events.push(EventDefinition {
                    field,
                    units,
                    data_schema,
                });
            }
        }
    }

    Ok(interface)
}

/// Record `name` in the set of its field kind, rejecting repeats.
fn claim(seen: &mut HashSet<String>, interface: &str, kind: &'static str, name: &str) -> Result<()> {
    if !seen.insert(name.to_string()) {
        return Err(DescriptorError::DuplicateName {
            interface: interface.to_string(),
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

struct Writer {
    out: Vec<u8>,
    revision: ProtocolRevision,
}

impl Writer {
    fn short_string(&mut self, field: &'static str, value: &str) -> Result<()> {
        let bytes = value.as_bytes();
        let len = u8::try_from(bytes.len()).map_err(|_| DescriptorError::FieldTooLong {
            field,
            length: bytes.len(),
        })?;
        self.out.push(len);
        self.out.extend_from_slice(bytes);
        Ok(())
    }

    fn sized(&mut self, field: &'static str, value: usize) -> Result<()> {
        let too_long = || DescriptorError::FieldTooLong { field, length: value };
        match self.revision.wide_field_width() {
            1 => self.out.push(u8::try_from(value).map_err(|_| too_long())?),
            _ => {
                let value = u16::try_from(value).map_err(|_| too_long())?;
                self.out.extend_from_slice(&value.to_le_bytes());
            }
        }
        Ok(())
    }

    fn schema(&mut self, schema: Schema) -> Result<()> {
        self.sized("schema", schema.code() as usize)
    }

    fn field(&mut self, tag: u8, field: &FieldDefinition) -> Result<()> {
        self.out.push(tag);
        self.short_string("name", &field.name)?;
        self.short_string("display name", &field.display_name)?;
        self.short_string("description", &field.description)
    }
}

impl DeviceDescriptor {
    /// Encode in the given revision's wire format. Fields are written grouped
    /// by category (commands, properties, events) within each interface.
    pub fn to_bytes(&self, revision: ProtocolRevision) -> Result<Vec<u8>> {
        let mut w = Writer {
            out: Vec::new(),
            revision,
        };
        w.out.push(self.version);
        w.short_string("display name", &self.display_name)?;

        for interface in &self.interfaces {
            w.out.push(revision.interface_marker());
            w.sized("interface id", interface.id.len())?;
            w.out.extend_from_slice(interface.id.as_bytes());

            for command in &interface.commands {
                w.field(FIELD_COMMAND, &command.field)?;
                w.schema(command.request_schema)?;
                w.schema(command.response_schema)?;
            }
            for property in &interface.properties {
                w.field(FIELD_PROPERTY, &property.field)?;
                w.short_string("units", &property.units)?;
                w.schema(property.data_schema)?;
                let mut flags = 0;
                if property.writeable {
                    flags |= FLAG_WRITEABLE;
                }
                if property.required {
                    flags |= FLAG_REQUIRED;
                }
                w.out.push(flags);
            }
            for event in &interface.events {
                w.field(FIELD_EVENT, &event.field)?;
                w.short_string("units", &event.units)?;
                w.schema(event.data_schema)?;
            }
        }

        Ok(w.out)
    }
}
