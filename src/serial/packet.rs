//! Decoded Serial PnP packets: the 4 byte header and the named payload carried
//! by command, property and event packets.

use serde::{Deserialize, Serialize};

use super::frame::MIN_PACKET_LENGTH;
use super::FrameError;

/// Packet type byte at offset 2 of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    ResetRequest = 0x01,
    ResetResponse = 0x02,
    DescriptorRequest = 0x03,
    DescriptorResponse = 0x04,
    CommandRequest = 0x05,
    CommandResponse = 0x06,
    /// Property get (no value bytes) or set (value bytes follow the name).
    PropertyRequest = 0x07,
    /// Response to a property request, or an unsolicited property update.
    PropertyNotification = 0x08,
    EventNotification = 0x0A,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(PacketType::ResetRequest),
            0x02 => Some(PacketType::ResetResponse),
            0x03 => Some(PacketType::DescriptorRequest),
            0x04 => Some(PacketType::DescriptorResponse),
            0x05 => Some(PacketType::CommandRequest),
            0x06 => Some(PacketType::CommandResponse),
            0x07 => Some(PacketType::PropertyRequest),
            0x08 => Some(PacketType::PropertyNotification),
            0x0A => Some(PacketType::EventNotification),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(packet_type: PacketType, payload: Vec<u8>) -> Self {
        Self {
            packet_type: packet_type.as_u8(),
            payload,
        }
    }

    /// Header-only packet, used for reset and descriptor requests.
    pub fn empty(packet_type: PacketType) -> Self {
        Self::new(packet_type, Vec::new())
    }

    pub fn kind(&self) -> Option<PacketType> {
        PacketType::from_u8(self.packet_type)
    }

    pub fn total_length(&self) -> usize {
        MIN_PACKET_LENGTH + self.payload.len()
    }

    /// Serialize header and payload, unescaped.
    pub fn to_bytes(&self) -> Vec<u8> {
        let total = self.total_length() as u16;
        let mut raw = Vec::with_capacity(self.total_length());
        raw.extend_from_slice(&total.to_le_bytes());
        raw.push(self.packet_type);
        raw.push(0); // reserved
        raw.extend_from_slice(&self.payload);
        raw
    }

    /// Parse a complete unescaped frame as produced by the codec.
    pub fn from_frame(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() < MIN_PACKET_LENGTH {
            return Err(FrameError::MalformedHeader { length: frame.len() });
        }
        let declared = u16::from_le_bytes([frame[0], frame[1]]) as usize;
        if declared != frame.len() {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: frame.len(),
            });
        }
        Ok(Self {
            packet_type: frame[2],
            payload: frame[MIN_PACKET_LENGTH..].to_vec(),
        })
    }
}

/// `interface_index:u8, name_length:u8, name, data...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedPayload {
    pub interface_index: u8,
    pub name: String,
    pub data: Vec<u8>,
}

impl NamedPayload {
    pub fn new(interface_index: u8, name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            interface_index,
            name: name.into(),
            data,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let name = self.name.as_bytes();
        if name.len() > u8::MAX as usize {
            return Err(FrameError::NameTooLong(name.len()));
        }
        let mut out = Vec::with_capacity(2 + name.len() + self.data.len());
        out.push(self.interface_index);
        out.push(name.len() as u8);
        out.extend_from_slice(name);
        out.extend_from_slice(&self.data);
        Ok(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() < 2 {
            return Err(FrameError::Truncated {
                offset: 0,
                needed: 2,
                available: payload.len(),
            });
        }
        let interface_index = payload[0];
        let name_len = payload[1] as usize;
        let rest = &payload[2..];
        if rest.len() < name_len {
            return Err(FrameError::Truncated {
                offset: 2,
                needed: name_len,
                available: rest.len(),
            });
        }
        let name = std::str::from_utf8(&rest[..name_len])
            .map_err(|_| FrameError::InvalidName)?
            .to_string();
        Ok(Self {
            interface_index,
            name,
            data: rest[name_len..].to_vec(),
        })
    }

    pub fn into_packet(self, packet_type: PacketType) -> Result<Packet, FrameError> {
        Ok(Packet::new(packet_type, self.encode()?))
    }
}
