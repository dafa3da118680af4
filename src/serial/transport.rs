//! Packet transport: owns the serial stream, runs the receive loop and pairs
//! incoming packets with outstanding requests.
//!
//! Requests are correlated by packet type, optionally narrowed by a
//! [`ResponseMatcher`]. A waiter registered for type `T` receives the next
//! frame of type `T` its matcher accepts; frames nobody waits for are handed
//! to the unsolicited channel in arrival order. Two waiters for the same type
//! are served in registration order, so callers must keep at most one request
//! per response type in flight if they need exact pairing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};

use super::frame::{FrameCodec, DEFAULT_MAX_FRAME_SIZE};
use super::interface::SerialPortIO;
use super::packet::{NamedPayload, Packet};
use super::{Result, SerialError};

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_frame_size: usize,
    pub event_capacity: usize,
    pub command_capacity: usize,
    pub read_chunk: usize,
    /// Initial state of unsolicited forwarding. When off, unmatched packets
    /// are logged and dropped in the receive loop.
    pub forward_unsolicited: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            event_capacity: 256,
            command_capacity: 64,
            read_chunk: 512,
            forward_unsolicited: true,
        }
    }
}

/// Traffic the transport could not pair with a waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Unsolicited(Packet),
    /// Emitted once when the receive loop stops. No further events follow.
    Closed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransportMetrics {
    pub bytes_read: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub matched_responses: u64,
    pub unsolicited_packets: u64,
    pub timeouts: u64,
    pub last_error: Option<String>,
    pub last_frame_at: Option<DateTime<Utc>>,
}

/// Extra condition a response must meet besides its packet type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseMatcher {
    Any,
    /// Named payload carrying this field name. Devices do not echo the
    /// interface index, so it takes no part in matching.
    Named { name: String },
}

impl ResponseMatcher {
    pub fn matches(&self, packet: &Packet) -> bool {
        match self {
            ResponseMatcher::Any => true,
            ResponseMatcher::Named { name } => NamedPayload::decode(&packet.payload)
                .map(|named| named.name == *name)
                .unwrap_or(false),
        }
    }
}

struct PendingEntry {
    id: u64,
    expected_type: u8,
    matcher: ResponseMatcher,
    responder: oneshot::Sender<Result<Packet>>,
}

#[derive(Default)]
struct PendingTable {
    entries: Vec<PendingEntry>,
    next_id: u64,
    closed: Option<String>,
}

impl PendingTable {
    fn register(
        &mut self,
        expected_type: u8,
        matcher: ResponseMatcher,
    ) -> Result<(u64, oneshot::Receiver<Result<Packet>>)> {
        if let Some(reason) = &self.closed {
            return Err(SerialError::TransportClosed(reason.clone()));
        }
        let (tx, rx) = oneshot::channel();
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(PendingEntry {
            id,
            expected_type,
            matcher,
            responder: tx,
        });
        Ok((id, rx))
    }

    /// First accepting waiter, in registration order.
    fn take_match(&mut self, packet: &Packet) -> Option<PendingEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.expected_type == packet.packet_type && e.matcher.matches(packet))?;
        Some(self.entries.remove(pos))
    }

    fn cancel(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        before != self.entries.len()
    }

    fn close(&mut self, reason: &str) {
        if self.closed.is_none() {
            self.closed = Some(reason.to_string());
        }
        for entry in self.entries.drain(..) {
            let _ = entry
                .responder
                .send(Err(SerialError::TransportClosed(reason.to_string())));
        }
    }
}

fn lock_table(table: &StdMutex<PendingTable>) -> MutexGuard<'_, PendingTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum TransportCommand {
    Write {
        bytes: Vec<u8>,
        responder: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// A registered wait for one packet type. Dropping it withdraws the
/// registration, so a response arriving later is treated as unsolicited.
pub struct PendingResponse {
    id: u64,
    expected_type: u8,
    rx: oneshot::Receiver<Result<Packet>>,
    pending: Arc<StdMutex<PendingTable>>,
    metrics_tx: Arc<watch::Sender<TransportMetrics>>,
}

impl PendingResponse {
    pub fn expected_type(&self) -> u8 {
        self.expected_type
    }

    /// Wait for the matching packet. `None` waits until the transport closes.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<Packet> {
        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut self.rx).await {
                Ok(received) => received,
                Err(_) => {
                    lock_table(&self.pending).cancel(self.id);
                    // Delivered between the deadline and the cancel
                    if let Ok(result) = self.rx.try_recv() {
                        return result;
                    }
                    self.metrics_tx.send_modify(|m| m.timeouts += 1);
                    log::warn!(
                        "No packet of type 0x{:02X} within {:?}",
                        self.expected_type,
                        limit
                    );
                    return Err(SerialError::Timeout);
                }
            },
            None => (&mut self.rx).await,
        };

        received.map_err(|_| SerialError::TransportClosed("response dropped".into()))?
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        lock_table(&self.pending).cancel(self.id);
    }
}

#[derive(Clone)]
pub struct PacketTransport {
    cmd_tx: mpsc::Sender<TransportCommand>,
    pending: Arc<StdMutex<PendingTable>>,
    metrics_tx: Arc<watch::Sender<TransportMetrics>>,
    forward_unsolicited: Arc<AtomicBool>,
}

impl PacketTransport {
    /// Start the receive loop on `stream`. Must be called inside a tokio runtime.
    ///
    /// The returned receiver yields unsolicited packets and a final
    /// [`TransportEvent::Closed`].
    pub fn spawn<S: SerialPortIO>(
        stream: S,
        config: TransportConfig,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_capacity.max(1));
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let (metrics_tx, _metrics_rx) = watch::channel(TransportMetrics::default());
        let pending = Arc::new(StdMutex::new(PendingTable::default()));
        let metrics_tx = Arc::new(metrics_tx);
        let forward_unsolicited = Arc::new(AtomicBool::new(config.forward_unsolicited));

        tokio::spawn(receive_loop(
            stream,
            config,
            cmd_rx,
            pending.clone(),
            Dispatch {
                events_tx,
                metrics_tx: metrics_tx.clone(),
                forward_unsolicited: forward_unsolicited.clone(),
            },
        ));

        let transport = Self {
            cmd_tx,
            pending,
            metrics_tx,
            forward_unsolicited,
        };
        (transport, events_rx)
    }

    /// Frame and write one packet. No response correlation happens here.
    pub async fn send(&self, packet: &Packet) -> Result<()> {
        let bytes = FrameCodec::encode(&packet.to_bytes());
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(TransportCommand::Write { bytes, responder: tx })
            .await
            .map_err(|_| self.closed_error())?;
        rx.await.map_err(|_| self.closed_error())?
    }

    /// Reserve the next packet of `expected_type`. Register before sending the
    /// request so a fast reply cannot slip past as unsolicited.
    pub fn register(&self, expected_type: u8) -> Result<PendingResponse> {
        self.register_with(expected_type, ResponseMatcher::Any)
    }

    /// Like [`register`](Self::register), but only frames accepted by
    /// `matcher` complete the wait. Rejected frames of the same type are
    /// treated as unsolicited.
    pub fn register_with(&self, expected_type: u8, matcher: ResponseMatcher) -> Result<PendingResponse> {
        let (id, rx) = lock_table(&self.pending).register(expected_type, matcher)?;
        Ok(PendingResponse {
            id,
            expected_type,
            rx,
            pending: self.pending.clone(),
            metrics_tx: self.metrics_tx.clone(),
        })
    }

    /// Wait for the next packet whose type equals `expected_type`.
    pub async fn receive_matching(
        &self,
        expected_type: u8,
        timeout: Option<Duration>,
    ) -> Result<Packet> {
        self.register(expected_type)?.wait(timeout).await
    }

    /// Send `packet` and wait for the first reply of `expected_type`.
    pub async fn request(
        &self,
        packet: &Packet,
        expected_type: u8,
        timeout: Option<Duration>,
    ) -> Result<Packet> {
        let pending = self.register(expected_type)?;
        self.send(packet).await?;
        pending.wait(timeout).await
    }

    /// Stop the receive loop and fail every waiter with `TransportClosed`.
    pub async fn close(&self) {
        lock_table(&self.pending).close("transport closed by host");
        let _ = self.cmd_tx.send(TransportCommand::Shutdown).await;
    }

    /// Start or stop handing unmatched packets to the event channel. Takes
    /// effect for the next frame the receive loop decodes.
    pub fn set_forward_unsolicited(&self, enabled: bool) {
        self.forward_unsolicited.store(enabled, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        lock_table(&self.pending).closed.is_some()
    }

    pub fn pending_count(&self) -> usize {
        lock_table(&self.pending).entries.len()
    }

    pub fn metrics(&self) -> TransportMetrics {
        self.metrics_tx.borrow().clone()
    }

    pub fn metrics_receiver(&self) -> watch::Receiver<TransportMetrics> {
        self.metrics_tx.subscribe()
    }

    fn closed_error(&self) -> SerialError {
        let reason = lock_table(&self.pending)
            .closed
            .clone()
            .unwrap_or_else(|| "receive loop terminated".to_string());
        SerialError::TransportClosed(reason)
    }
}

async fn receive_loop<S: SerialPortIO>(
    stream: S,
    config: TransportConfig,
    mut cmd_rx: mpsc::Receiver<TransportCommand>,
    pending: Arc<StdMutex<PendingTable>>,
    dispatch: Dispatch,
) {
    let metrics_tx = dispatch.metrics_tx.clone();
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut codec = FrameCodec::with_capacity(config.max_frame_size);
    let mut buf = vec![0u8; config.read_chunk.max(1)];

    let reason = loop {
        tokio::select! {
            maybe_cmd = cmd_rx.recv() => {
                match maybe_cmd {
                    Some(TransportCommand::Write { bytes, responder }) => {
                        log::trace!("TX {}", hex::encode(&bytes));
                        let written = async {
                            writer.write_all(&bytes).await?;
                            writer.flush().await
                        }.await;
                        match written {
                            Ok(()) => {
                                metrics_tx.send_modify(|m| m.frames_sent += 1);
                                let _ = responder.send(Ok(()));
                            }
                            Err(e) => {
                                let reason = format!("write failed: {}", e);
                                let _ = responder.send(Err(SerialError::IoError(e)));
                                break reason;
                            }
                        }
                    }
                    Some(TransportCommand::Shutdown) | None => break "transport closed by host".to_string(),
                }
            },
            read_res = reader.read(&mut buf) => {
                match read_res {
                    Ok(0) => break "serial stream closed".to_string(),
                    Ok(n) => {
                        metrics_tx.send_modify(|m| m.bytes_read += n as u64);
                        let mut frames = Vec::new();
                        let mut fatal = None;
                        for &byte in &buf[..n] {
                            match codec.feed(byte) {
                                Ok(Some(frame)) => frames.push(frame),
                                Ok(None) => {}
                                Err(e) => {
                                    fatal = Some(e);
                                    break;
                                }
                            }
                        }
                        for frame in frames {
                            dispatch.frame(&frame, &pending).await;
                        }
                        if let Some(e) = fatal {
                            log::error!("Fatal framing error: {}", e);
                            break format!("frame error: {}", e);
                        }
                    }
                    Err(e) => break format!("read failed: {}", e),
                }
            }
        }
    };

    log::info!("Packet transport stopped: {}", reason);
    lock_table(&pending).close(&reason);
    metrics_tx.send_modify(|m| m.last_error = Some(reason.clone()));

    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        if let TransportCommand::Write { responder, .. } = cmd {
            let _ = responder.send(Err(SerialError::TransportClosed(reason.clone())));
        }
    }

    let _ = dispatch.events_tx.send(TransportEvent::Closed { reason }).await;
}

struct Dispatch {
    events_tx: mpsc::Sender<TransportEvent>,
    metrics_tx: Arc<watch::Sender<TransportMetrics>>,
    forward_unsolicited: Arc<AtomicBool>,
}

impl Dispatch {
    async fn frame(&self, frame: &[u8], pending: &StdMutex<PendingTable>) {
        let metrics_tx = &self.metrics_tx;
        log::trace!("RX {}", hex::encode(frame));
        let packet = match Packet::from_frame(frame) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("Discarding undecodable frame: {}", e);
                return;
            }
        };
        metrics_tx.send_modify(|m| {
            m.frames_received += 1;
            m.last_frame_at = Some(Utc::now());
        });

        let waiter = lock_table(pending).take_match(&packet);
        let packet = match waiter {
            Some(entry) => match entry.responder.send(Ok(packet)) {
                Ok(()) => {
                    metrics_tx.send_modify(|m| m.matched_responses += 1);
                    return;
                }
                // Waiter gave up between lookup and delivery
                Err(Ok(packet)) => packet,
                Err(Err(_)) => return,
            },
            None => packet,
        };

        metrics_tx.send_modify(|m| m.unsolicited_packets += 1);
        if !self.forward_unsolicited.load(Ordering::SeqCst) {
            log::warn!(
                "Dropping unsolicited packet type 0x{:02X}, forwarding disabled",
                packet.packet_type
            );
            return;
        }
        if self.events_tx.send(TransportEvent::Unsolicited(packet)).await.is_err() {
            log::debug!("Unsolicited packet dropped, no listener");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::packet::PacketType;

    #[test]
    fn test_pending_table_first_registered_wins() {
        let mut table = PendingTable::default();
        let (first, _rx1) = table.register(0x06, ResponseMatcher::Any).unwrap();
        let (_second, _rx2) = table.register(0x06, ResponseMatcher::Any).unwrap();
        let entry = table.take_match(&Packet::empty(PacketType::CommandResponse)).unwrap();
        assert_eq!(entry.id, first);
        assert_eq!(table.entries.len(), 1);
        assert!(table.take_match(&Packet::empty(PacketType::PropertyNotification)).is_none());
    }

    #[test]
    fn test_named_matcher_skips_other_names() {
        let mut table = PendingTable::default();
        let matcher = ResponseMatcher::Named {
            name: "target".into(),
        };
        let (_id, _rx) = table.register(0x08, matcher).unwrap();

        let other = NamedPayload::new(2, "humidity", vec![1])
            .into_packet(PacketType::PropertyNotification)
            .unwrap();
        assert!(table.take_match(&other).is_none());

        let wanted = NamedPayload::new(3, "target", vec![1])
            .into_packet(PacketType::PropertyNotification)
            .unwrap();
        assert!(table.take_match(&wanted).is_some());
    }

    #[test]
    fn test_pending_table_close_rejects_registration() {
        let mut table = PendingTable::default();
        let (_id, mut rx) = table.register(0x02, ResponseMatcher::Any).unwrap();
        table.close("gone");
        assert!(matches!(rx.try_recv(), Ok(Err(SerialError::TransportClosed(_)))));
        assert!(matches!(
            table.register(0x02, ResponseMatcher::Any),
            Err(SerialError::TransportClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_request_round_trip_over_duplex() {
        let (host, mut device) = tokio::io::duplex(256);
        let (transport, _events) = PacketTransport::spawn(host, TransportConfig::default());

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 5];
            device.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, [0x5A, 0x04, 0x00, 0x01, 0x00]);
            device.write_all(&[0x5A, 0x04, 0x00, 0x02, 0x00]).await.unwrap();
            device
        });

        let reply = transport
            .request(
                &Packet::empty(PacketType::ResetRequest),
                PacketType::ResetResponse.as_u8(),
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        assert_eq!(reply.kind(), Some(PacketType::ResetResponse));
        let _device = responder.await.unwrap();

        let metrics = transport.metrics();
        assert_eq!(metrics.frames_sent, 1);
        assert_eq!(metrics.matched_responses, 1);
    }

    #[tokio::test]
    async fn test_timeout_withdraws_registration() {
        let (host, _device) = tokio::io::duplex(64);
        let (transport, _events) = PacketTransport::spawn(host, TransportConfig::default());
        let result = transport
            .receive_matching(0x02, Some(Duration::from_millis(20)))
            .await;
        assert!(matches!(result, Err(SerialError::Timeout)));
        assert_eq!(transport.pending_count(), 0);
        assert_eq!(transport.metrics().timeouts, 1);
        assert!(!transport.is_closed());
    }
}
