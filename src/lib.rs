//! Serial PnP bridge: talks the Serial PnP framing protocol to an embedded
//! device, discovers its interfaces and relays commands, properties and
//! events to a device-twin client.

pub mod config;
pub mod descriptor;
pub mod device;
pub mod serial;

pub use config::BridgeConfig;
pub use descriptor::{DeviceDescriptor, InterfaceDefinition, ProtocolRevision, Schema};
pub use device::{DeviceError, DeviceSession, SessionObserver, SessionState, TwinClient};
pub use serial::{PacketTransport, SerialError};
