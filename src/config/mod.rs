//! Bridge configuration, read from the adapter's JSON configuration object.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::descriptor::ProtocolRevision;
use crate::device::SessionConfig;
use crate::serial::frame::MIN_PACKET_LENGTH;
use crate::serial::interface::BAUD_RATE;
use crate::serial::{SerialError, SerialInterface, TransportConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub com_port: Option<String>,
    /// Use the first discovered serial port when `com_port` is not set.
    pub use_com_device_interface: bool,
    pub baud_rate: u32,
    pub protocol_revision: ProtocolRevision,
    pub request_timeout_ms: u64,
    pub handshake_retries: u32,
    pub retry_delay_ms: u64,
    pub max_frame_size: usize,
    pub event_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            com_port: None,
            use_com_device_interface: false,
            baud_rate: BAUD_RATE,
            protocol_revision: ProtocolRevision::V2,
            request_timeout_ms: 5000,
            handshake_retries: 3,
            retry_delay_ms: 5000,
            max_frame_size: 4096,
            event_capacity: 256,
        }
    }
}

impl BridgeConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("invalid bridge configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("failed to load {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.baud_rate == 0 {
            anyhow::bail!("baud_rate must be greater than zero");
        }
        if self.request_timeout_ms == 0 {
            anyhow::bail!("request_timeout_ms must be greater than zero");
        }
        if !(MIN_PACKET_LENGTH..=u16::MAX as usize).contains(&self.max_frame_size) {
            anyhow::bail!(
                "max_frame_size {} outside {}..={}",
                self.max_frame_size,
                MIN_PACKET_LENGTH,
                u16::MAX
            );
        }
        if self.event_capacity == 0 {
            anyhow::bail!("event_capacity must be greater than zero");
        }
        if self.com_port.is_none() && !self.use_com_device_interface {
            anyhow::bail!("set com_port or enable use_com_device_interface");
        }
        Ok(())
    }

    /// Port to open: the configured one, or the first discovered port when
    /// device-interface discovery is enabled.
    pub fn resolve_port(&self) -> Result<String, SerialError> {
        match &self.com_port {
            Some(port) => Ok(port.clone()),
            None if self.use_com_device_interface => SerialInterface::default_port(),
            None => Err(SerialError::PortNotFound("no com_port configured".to_string())),
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            max_frame_size: self.max_frame_size,
            event_capacity: self.event_capacity,
            ..TransportConfig::default()
        }
    }

    pub fn session_config(&self, port_name: impl Into<String>) -> SessionConfig {
        SessionConfig {
            port_name: port_name.into(),
            revision: self.protocol_revision,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            handshake_retries: self.handshake_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            transport: self.transport_config(),
        }
    }
}
