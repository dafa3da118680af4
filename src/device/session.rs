//! Device session: runs the reset/descriptor handshake, publishes the device's
//! interfaces to the twin and serves commands and property access afterwards.
//!
//! The wire protocol has no request ids. Replies are paired by packet type
//! and field name, so the session keeps at most one command and one property
//! request in flight at a time.

use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use uuid::Uuid;

use super::twin::{MethodDispatch, SessionObserver, TwinClient};
use super::{DeviceError, Result, SessionInfo, SessionState};
use crate::config::BridgeConfig;
use crate::descriptor::{self, DeviceDescriptor, ProtocolRevision};
use crate::serial::{
    NamedPayload, Packet, PacketTransport, PacketType, ResponseMatcher, SerialError,
    SerialInterface, SerialPortIO, TransportConfig, TransportEvent,
};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Reported in [`SessionInfo`] only.
    pub port_name: String,
    pub revision: ProtocolRevision,
    pub request_timeout: Duration,
    pub handshake_retries: u32,
    pub retry_delay: Duration,
    pub transport: TransportConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            revision: ProtocolRevision::default(),
            request_timeout: Duration::from_millis(5000),
            handshake_retries: 3,
            retry_delay: Duration::from_millis(5000),
            transport: TransportConfig::default(),
        }
    }
}

struct SessionInner {
    id: Uuid,
    config: SessionConfig,
    stream: StdMutex<Option<Box<dyn SerialPortIO>>>,
    transport: OnceCell<PacketTransport>,
    state_tx: watch::Sender<SessionState>,
    descriptor: RwLock<Option<Arc<DeviceDescriptor>>>,
    twin: Arc<dyn TwinClient>,
    observers: StdRwLock<Vec<Arc<dyn SessionObserver>>>,
    command_lock: Mutex<()>,
    property_lock: Mutex<()>,
    started_at: StdMutex<Option<DateTime<Utc>>>,
}

/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

impl DeviceSession {
    pub fn new<S: SerialPortIO>(stream: S, config: SessionConfig, twin: Arc<dyn TwinClient>) -> Self {
        let (state_tx, _state_rx) = watch::channel(SessionState::Disconnected);
        let stream: Box<dyn SerialPortIO> = Box::new(stream);
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                config,
                stream: StdMutex::new(Some(stream)),
                transport: OnceCell::new(),
                state_tx,
                descriptor: RwLock::new(None),
                twin,
                observers: StdRwLock::new(Vec::new()),
                command_lock: Mutex::new(()),
                property_lock: Mutex::new(()),
                started_at: StdMutex::new(None),
            }),
        }
    }

    /// Open the configured serial port and wrap it in a new session.
    pub fn connect(config: &BridgeConfig, twin: Arc<dyn TwinClient>) -> Result<Self> {
        let port_name = config.resolve_port()?;
        let stream = SerialInterface::open(&port_name, config.baud_rate)?;
        Ok(Self::new(stream, config.session_config(port_name), twin))
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }

    pub async fn descriptor(&self) -> Option<Arc<DeviceDescriptor>> {
        self.inner.descriptor.read().await.clone()
    }

    pub fn transport(&self) -> Option<&PacketTransport> {
        self.inner.transport.get()
    }

    pub async fn info(&self) -> SessionInfo {
        let descriptor = self.descriptor().await;
        SessionInfo {
            id: self.inner.id,
            port_name: self.inner.config.port_name.clone(),
            state: self.state(),
            device_name: descriptor.as_ref().map(|d| d.display_name.clone()),
            descriptor_version: descriptor.as_ref().map(|d| d.version),
            interface_ids: descriptor.map(|d| d.interface_ids()).unwrap_or_default(),
            started_at: *self
                .inner
                .started_at
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }

    /// Run the handshake. On success the session is `Operational`; on any
    /// failure it is `Faulted` and the transport is closed.
    pub async fn start(&self) -> Result<Arc<DeviceDescriptor>> {
        if self.state() == SessionState::Faulted {
            return Err(DeviceError::Faulted("session was closed".to_string()));
        }
        let stream = self
            .inner
            .stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(DeviceError::AlreadyStarted)?;

        // Unsolicited traffic is not trusted until the handshake completes.
        let transport_config = TransportConfig {
            forward_unsolicited: false,
            ..self.inner.config.transport.clone()
        };
        let (transport, events) = PacketTransport::spawn(stream, transport_config);
        let transport = self.inner.transport.get_or_init(|| transport).clone();
        tokio::spawn(dispatch_loop(Arc::downgrade(&self.inner), events));

        match self.handshake(&transport).await {
            Ok(descriptor) => Ok(descriptor),
            Err(e) => {
                log::error!("Handshake failed: {}", e);
                self.set_state(SessionState::Faulted);
                transport.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self, transport: &PacketTransport) -> Result<Arc<DeviceDescriptor>> {
        self.set_state(SessionState::Resetting);
        self.request_with_retry(transport, PacketType::ResetRequest, PacketType::ResetResponse)
            .await?;
        log::info!("Device acknowledged reset");

        self.set_state(SessionState::AwaitingDescriptor);
        let response = self
            .request_with_retry(
                transport,
                PacketType::DescriptorRequest,
                PacketType::DescriptorResponse,
            )
            .await?;

        let descriptor = Arc::new(descriptor::parse(&response.payload, self.inner.config.revision)?);
        log::info!(
            "Device '{}' reported {} interface(s)",
            descriptor.display_name,
            descriptor.interfaces.len()
        );

        self.set_state(SessionState::Registering);
        *self.inner.descriptor.write().await = Some(descriptor.clone());

        let dispatch: Arc<dyn MethodDispatch> = Arc::new(SessionDispatcher {
            inner: Arc::downgrade(&self.inner),
        });
        for interface in &descriptor.interfaces {
            self.inner
                .twin
                .publish_interface(interface)
                .await
                .map_err(|e| DeviceError::Twin(format!("publish {}: {}", interface.id, e)))?;
            self.inner
                .twin
                .bind_methods(&interface.id, dispatch.clone())
                .await
                .map_err(|e| DeviceError::Twin(format!("bind {}: {}", interface.id, e)))?;
            log::debug!("Published interface {}", interface.id);
        }

        for observer in self.observers() {
            observer.on_interfaces_discovered(&descriptor);
        }

        *self
            .inner
            .started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Utc::now());
        self.set_state(SessionState::Operational);
        transport.set_forward_unsolicited(true);
        Ok(descriptor)
    }

    /// Handshake request; only timeouts are retried.
    async fn request_with_retry(
        &self,
        transport: &PacketTransport,
        request: PacketType,
        response: PacketType,
    ) -> Result<Packet> {
        let config = &self.inner.config;
        let packet = Packet::empty(request);
        let mut attempt = 0;
        loop {
            match transport
                .request(&packet, response.as_u8(), Some(config.request_timeout))
                .await
            {
                Ok(reply) => return Ok(reply),
                Err(SerialError::Timeout) if attempt < config.handshake_retries => {
                    attempt += 1;
                    log::warn!(
                        "{:?} timed out, retry {}/{} in {:?}",
                        request,
                        attempt,
                        config.handshake_retries,
                        config.retry_delay
                    );
                    tokio::time::sleep(config.retry_delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn invoke_command(&self, name: &str, input: &str) -> Result<String> {
        let transport = self.operational_transport()?;
        let descriptor = self.loaded_descriptor().await?;
        let found = descriptor
            .find_command(name)
            .ok_or_else(|| DeviceError::UnknownCommand(name.to_string()))?;
        let index = packet_index(found.interface_index)?;
        let data = found.definition.request_schema.text_to_binary(input)?;
        let packet = NamedPayload::new(index, name, data)
            .into_packet(PacketType::CommandRequest)
            .map_err(SerialError::from)?;

        let _guard = self.inner.command_lock.lock().await;
        log::debug!("Invoking command {} on {}", name, found.interface.id);
        let reply = self
            .exchange(&transport, &packet, PacketType::CommandResponse, name)
            .await?;
        Ok(found.definition.response_schema.binary_to_text(&reply.data)?)
    }

    pub async fn read_property(&self, name: &str) -> Result<String> {
        let transport = self.operational_transport()?;
        let descriptor = self.loaded_descriptor().await?;
        let found = descriptor
            .find_property(name)
            .ok_or_else(|| DeviceError::UnknownProperty(name.to_string()))?;
        let index = packet_index(found.interface_index)?;
        let packet = NamedPayload::new(index, name, Vec::new())
            .into_packet(PacketType::PropertyRequest)
            .map_err(SerialError::from)?;

        let _guard = self.inner.property_lock.lock().await;
        let reply = self
            .exchange(&transport, &packet, PacketType::PropertyNotification, name)
            .await?;
        Ok(found.definition.data_schema.binary_to_text(&reply.data)?)
    }

    /// Write a property and return the value the device reports back. The
    /// reported value is also pushed to the twin.
    pub async fn write_property(&self, name: &str, value: &str) -> Result<String> {
        let transport = self.operational_transport()?;
        let descriptor = self.loaded_descriptor().await?;
        let found = descriptor
            .find_property(name)
            .ok_or_else(|| DeviceError::UnknownProperty(name.to_string()))?;
        if !found.definition.writeable {
            return Err(DeviceError::NotWriteable(name.to_string()));
        }
        let index = packet_index(found.interface_index)?;
        let data = found.definition.data_schema.text_to_binary(value)?;
        let packet = NamedPayload::new(index, name, data)
            .into_packet(PacketType::PropertyRequest)
            .map_err(SerialError::from)?;

        let _guard = self.inner.property_lock.lock().await;
        let reply = self
            .exchange(&transport, &packet, PacketType::PropertyNotification, name)
            .await?;
        let reported = found.definition.data_schema.binary_to_text(&reply.data)?;

        if let Err(e) = self
            .inner
            .twin
            .update_property(&found.interface.id, name, &reported)
            .await
        {
            log::warn!("Twin rejected update of {}: {}", name, e);
        }
        Ok(reported)
    }

    /// Stop the transport and fault the session. Pending calls fail with
    /// `TransportClosed`.
    pub async fn close(&self) {
        self.set_state(SessionState::Faulted);
        // Release the port if the session never started.
        drop(
            self.inner
                .stream
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take(),
        );
        if let Some(transport) = self.inner.transport.get() {
            transport.close().await;
        }
    }

    /// Send a named request and wait for the reply carrying the same name.
    /// Devices answer with interface index 0 whatever was asked, so only the
    /// name is checked. Other replies of the response type reach the
    /// dispatcher as unsolicited updates.
    async fn exchange(
        &self,
        transport: &PacketTransport,
        packet: &Packet,
        response: PacketType,
        name: &str,
    ) -> Result<NamedPayload> {
        let matcher = ResponseMatcher::Named {
            name: name.to_string(),
        };
        let pending = transport.register_with(response.as_u8(), matcher)?;
        transport.send(packet).await?;
        let reply = pending.wait(Some(self.inner.config.request_timeout)).await?;
        Ok(NamedPayload::decode(&reply.payload).map_err(SerialError::from)?)
    }

    async fn handle_unsolicited(&self, packet: Packet) {
        let state = self.state();
        if !state.is_operational() {
            log::warn!(
                "Dropping packet type 0x{:02X} received while {:?}",
                packet.packet_type,
                state
            );
            return;
        }
        let Some(descriptor) = self.descriptor().await else {
            return;
        };

        match packet.kind() {
            Some(PacketType::EventNotification) => {
                let named = match NamedPayload::decode(&packet.payload) {
                    Ok(named) => named,
                    Err(e) => {
                        log::warn!("Malformed event notification: {}", e);
                        return;
                    }
                };
                let found = descriptor
                    .interfaces
                    .get(named.interface_index as usize)
                    .and_then(|iface| iface.event(&named.name).map(|def| (iface, def)))
                    .or_else(|| {
                        descriptor
                            .find_event(&named.name)
                            .map(|l| (l.interface, l.definition))
                    });
                let Some((interface, event)) = found else {
                    log::warn!("{}", DeviceError::UnknownEvent(named.name));
                    return;
                };
                let value = match event.data_schema.binary_to_text(&named.data) {
                    Ok(value) => value,
                    Err(e) => {
                        log::warn!("Event {} has an unreadable value: {}", named.name, e);
                        return;
                    }
                };

                log::debug!("Event {}.{} = {}", interface.id, named.name, value);
                for observer in self.observers() {
                    observer.on_event(&interface.id, &named.name, &value);
                }
                if let Err(e) = self
                    .inner
                    .twin
                    .send_event(&interface.id, &named.name, &value)
                    .await
                {
                    log::warn!("Twin rejected event {}: {}", named.name, e);
                }
            }
            Some(PacketType::PropertyNotification) => {
                let named = match NamedPayload::decode(&packet.payload) {
                    Ok(named) => named,
                    Err(e) => {
                        log::warn!("Malformed property notification: {}", e);
                        return;
                    }
                };
                let found = descriptor
                    .interfaces
                    .get(named.interface_index as usize)
                    .and_then(|iface| iface.property(&named.name).map(|def| (iface, def)))
                    .or_else(|| {
                        descriptor
                            .find_property(&named.name)
                            .map(|l| (l.interface, l.definition))
                    });
                let Some((interface, property)) = found else {
                    log::warn!("{}", DeviceError::UnknownProperty(named.name));
                    return;
                };
                let value = match property.data_schema.binary_to_text(&named.data) {
                    Ok(value) => value,
                    Err(e) => {
                        log::warn!("Property {} has an unreadable value: {}", named.name, e);
                        return;
                    }
                };

                log::debug!("Property {}.{} = {}", interface.id, named.name, value);
                for observer in self.observers() {
                    observer.on_property_update(&interface.id, &named.name, &value);
                }
                if let Err(e) = self
                    .inner
                    .twin
                    .update_property(&interface.id, &named.name, &value)
                    .await
                {
                    log::warn!("Twin rejected update of {}: {}", named.name, e);
                }
            }
            _ => log::warn!(
                "Ignoring unsolicited packet type 0x{:02X}",
                packet.packet_type
            ),
        }
    }

    fn operational_transport(&self) -> Result<PacketTransport> {
        let state = self.state();
        if state == SessionState::Faulted {
            return Err(DeviceError::Faulted("session is faulted".to_string()));
        }
        if !state.is_operational() {
            return Err(DeviceError::NotOperational { state });
        }
        self.inner
            .transport
            .get()
            .cloned()
            .ok_or(DeviceError::NotOperational { state })
    }

    async fn loaded_descriptor(&self) -> Result<Arc<DeviceDescriptor>> {
        self.descriptor().await.ok_or(DeviceError::NotOperational {
            state: self.state(),
        })
    }

    fn observers(&self) -> Vec<Arc<dyn SessionObserver>> {
        self.inner
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.inner.state_tx.send_replace(state);
        if previous != state {
            log::info!("Session {} state {:?} -> {:?}", self.inner.id, previous, state);
        }
    }
}

fn packet_index(interface_index: usize) -> Result<u8> {
    u8::try_from(interface_index).map_err(|_| DeviceError::InterfaceIndexOutOfRange(interface_index))
}

async fn dispatch_loop(inner: Weak<SessionInner>, mut events: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let session = DeviceSession { inner };
        match event {
            TransportEvent::Unsolicited(packet) => session.handle_unsolicited(packet).await,
            TransportEvent::Closed { reason } => {
                if session.state() != SessionState::Faulted {
                    log::error!("Connection lost: {}", reason);
                    session.set_state(SessionState::Faulted);
                }
                break;
            }
        }
    }
}

/// Handed to the twin; holds the session weakly so the twin never keeps a
/// dropped session alive.
struct SessionDispatcher {
    inner: Weak<SessionInner>,
}

impl SessionDispatcher {
    fn session(&self) -> Result<DeviceSession> {
        self.inner
            .upgrade()
            .map(|inner| DeviceSession { inner })
            .ok_or_else(|| DeviceError::Faulted("session dropped".to_string()))
    }
}

#[async_trait]
impl MethodDispatch for SessionDispatcher {
    async fn invoke_command(&self, name: &str, input: &str) -> Result<String> {
        self.session()?.invoke_command(name, input).await
    }

    async fn write_property(&self, name: &str, value: &str) -> Result<String> {
        self.session()?.write_property(name, value).await
    }
}
