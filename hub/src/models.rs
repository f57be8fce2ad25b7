use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

pub type DeviceId = String;
pub type SessionId = String;
pub type GroupId = String;
pub type ConnectionId = Uuid;

/// Sender half of a connection's outbound queue. Pushing never blocks; the
/// forwarder task drains the queue into the socket.
pub type ConnectionTx = UnboundedSender<Message>;

/// Palette used when `group_create` omits a color, assigned round-robin.
pub const GROUP_COLORS: &[&str] = &[
    "#6366f1", "#ec4899", "#f59e0b", "#10b981", "#3b82f6", "#8b5cf6", "#ef4444", "#14b8a6",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Phone,
    Laptop,
    Desktop,
    Tablet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default = "default_true")]
    pub files: bool,
    #[serde(default = "default_true")]
    pub media: bool,
    #[serde(default = "default_true")]
    pub prompts: bool,
    #[serde(default = "default_true")]
    pub clipboard: bool,
    #[serde(default)]
    pub remote_browse: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Permissions {
    fn default() -> Self {
        Permissions {
            files: true,
            media: true,
            prompts: true,
            clipboard: true,
            remote_browse: false,
        }
    }
}

/// A device's state within one session. Serialized form is what peer UIs
/// render as tiles (`session_joined` device lists, `device_connected`).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMembership {
    pub id: DeviceId,
    pub name: String,
    pub username: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    pub online: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub joined_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_seen: DateTime<Utc>,
    pub permissions: Permissions,
}

impl DeviceMembership {
    pub fn new(
        id: impl Into<DeviceId>,
        name: impl Into<String>,
        username: impl Into<String>,
        kind: DeviceKind,
        now: DateTime<Utc>,
    ) -> Self {
        DeviceMembership {
            id: id.into(),
            name: name.into(),
            username: username.into(),
            kind,
            online: true,
            joined_at: now,
            last_seen: now,
            permissions: Permissions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub created_by: DeviceId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    pub color: String,
    pub device_ids: Vec<DeviceId>,
}

/// A short-lived grouping of devices, shareable via a 6-digit code.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub code: String,
    pub created_by: DeviceId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub devices: HashMap<DeviceId, DeviceMembership>,
    pub groups: HashMap<GroupId, Group>,
}

impl Session {
    /// Members currently marked online, optionally skipping one device.
    pub fn online_members(&self, exclude: Option<&str>) -> Vec<DeviceId> {
        self.devices
            .values()
            .filter(|m| m.online && exclude != Some(m.id.as_str()))
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn online_count(&self) -> usize {
        self.devices.values().filter(|m| m.online).count()
    }
}

/// A device's global presence, independent of any session. Survives
/// reconnects; reaped by the sweeper 30 s after the last connection drops.
#[derive(Debug)]
pub struct DeviceEntry {
    pub device_id: DeviceId,
    pub username: String,
    pub name: String,
    pub kind: DeviceKind,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    pub connections: HashMap<ConnectionId, ConnectionTx>,
    pub session_id: Option<SessionId>,
}

impl DeviceEntry {
    /// Deliver one text frame to any single open connection, pruning
    /// connections whose receiving task is gone. Marks the entry offline
    /// when no connection remains.
    pub fn send_text(&mut self, text: &str) -> bool {
        let mut dead = Vec::new();
        let mut sent = false;
        for (id, tx) in self.connections.iter() {
            if tx.send(Message::Text(text.to_owned())).is_ok() {
                sent = true;
                break;
            }
            dead.push(*id);
        }
        for id in dead {
            self.connections.remove(&id);
        }
        if self.connections.is_empty() {
            self.online = false;
        }
        sent
    }

    /// Queue a close frame on every open connection of this device.
    pub fn close_all(&self, frame: Message) {
        for tx in self.connections.values() {
            let _ = tx.send(frame.clone());
        }
    }
}
