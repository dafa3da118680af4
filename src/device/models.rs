use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session lifecycle. `Faulted` is terminal; recovery means a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Resetting,
    AwaitingDescriptor,
    Registering,
    Operational,
    Faulted,
}

impl SessionState {
    pub fn is_operational(self) -> bool {
        self == SessionState::Operational
    }
}

/// Snapshot of a session for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub port_name: String,
    pub state: SessionState,
    pub device_name: Option<String>,
    pub descriptor_version: Option<u8>,
    pub interface_ids: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
}
