#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use serialpnp_bridge::descriptor::{
    CommandDefinition, DeviceDescriptor, EventDefinition, FieldDefinition, InterfaceDefinition,
    PropertyDefinition, Schema,
};
use serialpnp_bridge::device::{DeviceSession, MethodDispatch, SessionConfig, SessionObserver, TwinClient};
use serialpnp_bridge::serial::{FrameCodec, NamedPayload, Packet, PacketType};

pub const THERMOSTAT_ID: &str = "urn:example:thermostat:1";

fn short(out: &mut Vec<u8>, s: &str) {
    out.push(s.len() as u8);
    out.extend_from_slice(s.as_bytes());
}

/// v2 descriptor: one interface with a writeable Float property, an Int/Int
/// command and a Float event, in that wire order.
pub fn thermostat_descriptor_bytes() -> Vec<u8> {
    let mut out = vec![0x01];
    short(&mut out, "Thermostat");

    out.push(0x05);
    out.extend_from_slice(&(THERMOSTAT_ID.len() as u16).to_le_bytes());
    out.extend_from_slice(THERMOSTAT_ID.as_bytes());

    out.push(0x02);
    short(&mut out, "target");
    short(&mut out, "Target temperature");
    short(&mut out, "");
    short(&mut out, "C");
    out.extend_from_slice(&2u16.to_le_bytes());
    out.push(0x01);

    out.push(0x01);
    short(&mut out, "scale");
    short(&mut out, "Scale");
    short(&mut out, "Multiply by two");
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&4u16.to_le_bytes());

    out.push(0x03);
    short(&mut out, "temperature");
    short(&mut out, "Temperature");
    short(&mut out, "");
    short(&mut out, "C");
    out.extend_from_slice(&2u16.to_le_bytes());

    out
}

/// The thermostat plus a read-only humidity property.
pub fn thermostat_with_humidity() -> DeviceDescriptor {
    let mut interface = InterfaceDefinition::new(THERMOSTAT_ID);
    interface.properties.push(PropertyDefinition {
        field: FieldDefinition::new("target", "Target temperature", ""),
        units: "C".into(),
        required: false,
        writeable: true,
        data_schema: Schema::Float,
    });
    interface.properties.push(PropertyDefinition {
        field: FieldDefinition::new("humidity", "Humidity", ""),
        units: "%".into(),
        required: true,
        writeable: false,
        data_schema: Schema::Int,
    });
    interface.commands.push(CommandDefinition {
        field: FieldDefinition::new("scale", "Scale", "Multiply by two"),
        request_schema: Schema::Int,
        response_schema: Schema::Int,
    });
    interface.events.push(EventDefinition {
        field: FieldDefinition::new("temperature", "Temperature", ""),
        units: "C".into(),
        data_schema: Schema::Float,
    });
    DeviceDescriptor {
        version: 1,
        display_name: "Thermostat".into(),
        interfaces: vec![interface],
    }
}

pub const LED_ID: &str = "urn:example:led:1";

/// The thermostat followed by an LED interface with its own command and
/// writeable property.
pub fn thermostat_and_led() -> DeviceDescriptor {
    let mut descriptor = thermostat_with_humidity();
    let mut led = InterfaceDefinition::new(LED_ID);
    led.properties.push(PropertyDefinition {
        field: FieldDefinition::new("brightness", "Brightness", ""),
        units: "%".into(),
        required: false,
        writeable: true,
        data_schema: Schema::Int,
    });
    led.commands.push(CommandDefinition {
        field: FieldDefinition::new("blink", "Blink", "Blink n times"),
        request_schema: Schema::Int,
        response_schema: Schema::Int,
    });
    descriptor.interfaces.push(led);
    descriptor
}

/// Far end of the serial link, scripted by the test.
pub struct FakeDevice {
    pub stream: DuplexStream,
    codec: FrameCodec,
}

impl FakeDevice {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            codec: FrameCodec::new(),
        }
    }

    pub async fn read_packet(&mut self) -> Packet {
        loop {
            let mut byte = [0u8; 1];
            self.stream.read_exact(&mut byte).await.expect("link closed");
            if let Some(frame) = self.codec.feed(byte[0]).expect("bad frame from host") {
                return Packet::from_frame(&frame).expect("bad packet from host");
            }
        }
    }

    pub async fn try_read_packet(&mut self, wait: Duration) -> Option<Packet> {
        tokio::time::timeout(wait, self.read_packet()).await.ok()
    }

    pub async fn expect(&mut self, packet_type: PacketType) -> Packet {
        let packet = tokio::time::timeout(Duration::from_secs(2), self.read_packet())
            .await
            .expect("no packet from host");
        assert_eq!(packet.kind(), Some(packet_type));
        packet
    }

    pub async fn send(&mut self, packet: &Packet) {
        self.send_raw(&FrameCodec::encode(&packet.to_bytes())).await;
    }

    /// Replies always carry interface index 0, as device firmware does.
    pub async fn send_named(&mut self, packet_type: PacketType, name: &str, data: Vec<u8>) {
        let packet = NamedPayload::new(0, name, data)
            .into_packet(packet_type)
            .unwrap();
        self.send(&packet).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    pub async fn complete_handshake(&mut self, descriptor: Vec<u8>) {
        self.expect(PacketType::ResetRequest).await;
        self.send(&Packet::empty(PacketType::ResetResponse)).await;
        self.expect(PacketType::DescriptorRequest).await;
        self.send(&Packet::new(PacketType::DescriptorResponse, descriptor))
            .await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TwinCall {
    Published(String),
    Bound(String),
    Event(String, String, String),
    Property(String, String, String),
}

#[derive(Default)]
pub struct RecordingTwin {
    pub calls: Mutex<Vec<TwinCall>>,
    pub dispatch: Mutex<Option<Arc<dyn MethodDispatch>>>,
}

impl RecordingTwin {
    pub fn calls(&self) -> Vec<TwinCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn dispatch(&self) -> Arc<dyn MethodDispatch> {
        self.dispatch.lock().unwrap().clone().expect("methods not bound")
    }

    fn record(&self, call: TwinCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl TwinClient for RecordingTwin {
    async fn publish_interface(&self, interface: &InterfaceDefinition) -> anyhow::Result<()> {
        let already = self
            .calls()
            .contains(&TwinCall::Published(interface.id.clone()));
        if already {
            anyhow::bail!("interface {} already published", interface.id);
        }
        self.record(TwinCall::Published(interface.id.clone()));
        Ok(())
    }

    async fn send_event(&self, interface_id: &str, event_name: &str, value: &str) -> anyhow::Result<()> {
        self.record(TwinCall::Event(interface_id.into(), event_name.into(), value.into()));
        Ok(())
    }

    async fn update_property(&self, interface_id: &str, property_name: &str, value: &str) -> anyhow::Result<()> {
        self.record(TwinCall::Property(interface_id.into(), property_name.into(), value.into()));
        Ok(())
    }

    async fn bind_methods(&self, interface_id: &str, dispatch: Arc<dyn MethodDispatch>) -> anyhow::Result<()> {
        self.record(TwinCall::Bound(interface_id.into()));
        *self.dispatch.lock().unwrap() = Some(dispatch);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    pub discovered: Mutex<usize>,
    pub events: Mutex<Vec<(String, String)>>,
    pub properties: Mutex<Vec<(String, String)>>,
}

impl SessionObserver for RecordingObserver {
    fn on_interfaces_discovered(&self, _descriptor: &DeviceDescriptor) {
        *self.discovered.lock().unwrap() += 1;
    }

    fn on_event(&self, _interface_id: &str, event_name: &str, value: &str) {
        self.events.lock().unwrap().push((event_name.into(), value.into()));
    }

    fn on_property_update(&self, _interface_id: &str, property_name: &str, value: &str) {
        self.properties.lock().unwrap().push((property_name.into(), value.into()));
    }
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        port_name: "duplex".into(),
        request_timeout: Duration::from_millis(300),
        handshake_retries: 0,
        retry_delay: Duration::from_millis(10),
        ..Default::default()
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A session that completed the handshake against `descriptor`.
pub async fn operational_session(
    descriptor: Vec<u8>,
) -> (DeviceSession, FakeDevice, Arc<RecordingTwin>, Arc<RecordingObserver>) {
    let (host, far) = tokio::io::duplex(4096);
    let twin = Arc::new(RecordingTwin::default());
    let observer = Arc::new(RecordingObserver::default());
    let session = DeviceSession::new(host, test_config(), twin.clone());
    session.add_observer(observer.clone());

    let mut device = FakeDevice::new(far);
    let starter = {
        let session = session.clone();
        tokio::spawn(async move { session.start().await })
    };
    device.complete_handshake(descriptor).await;
    starter.await.unwrap().expect("handshake failed");

    (session, device, twin, observer)
}
