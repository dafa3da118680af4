use serialport::SerialPortType;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use super::{Result, SerialDeviceInfo, SerialError};

/// Baud rate fixed by the Serial PnP physical layer.
pub const BAUD_RATE: u32 = 115200;

/// Byte stream a [`PacketTransport`](super::PacketTransport) can run over.
///
/// Implemented for any async duplex stream, so a real port and an in-memory
/// `tokio::io::duplex` pipe are interchangeable.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> SerialPortIO for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub struct SerialInterface;

impl SerialInterface {
    /// List serial ports visible to the OS
    pub fn discover_ports() -> Result<Vec<SerialDeviceInfo>> {
        let ports = serialport::available_ports()?;
        let devices = ports
            .into_iter()
            .map(|port| match port.port_type {
                SerialPortType::UsbPort(usb_info) => SerialDeviceInfo {
                    port_name: port.port_name,
                    vid: Some(usb_info.vid),
                    pid: Some(usb_info.pid),
                    serial_number: usb_info.serial_number,
                    manufacturer: usb_info.manufacturer,
                    product: usb_info.product,
                },
                _ => SerialDeviceInfo {
                    port_name: port.port_name,
                    vid: None,
                    pid: None,
                    serial_number: None,
                    manufacturer: None,
                    product: None,
                },
            })
            .collect();

        Ok(devices)
    }

    /// First discovered port, used when no port is configured explicitly.
    pub fn default_port() -> Result<String> {
        Self::discover_ports()?
            .into_iter()
            .next()
            .map(|info| info.port_name)
            .ok_or_else(|| SerialError::PortNotFound("no serial ports available".to_string()))
    }

    /// Open a port at 8-N-1 without flow control.
    pub fn open(port_name: &str, baud_rate: u32) -> Result<SerialStream> {
        let stream = tokio_serial::new(port_name, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", port_name, e)))?;

        log::info!("Opened serial port {} at {} baud", port_name, baud_rate);
        Ok(stream)
    }
}
