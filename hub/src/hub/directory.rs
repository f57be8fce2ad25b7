use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::models::{ConnectionId, ConnectionTx, DeviceEntry, DeviceId, DeviceKind, SessionId};

/// Global device-discovery directory, independent of sessions. Entries are
/// keyed by `deviceId` with a secondary `username` index (several devices may
/// share one username) and hold the full set of that device's open
/// connections. Entries outlive their last connection by the grace period;
/// only the sweeper deletes them.
#[derive(Debug, Default)]
pub struct DeviceDirectory {
    entries: HashMap<DeviceId, DeviceEntry>,
    by_username: HashMap<String, HashSet<DeviceId>>,
}

impl DeviceDirectory {
    pub fn new() -> Self {
        DeviceDirectory::default()
    }

    /// Upsert an entry and attach the registering connection. Repeated
    /// registrations from the same connection are a no-op apart from the
    /// refreshed metadata.
    pub fn register(
        &mut self,
        device_id: &str,
        name: &str,
        username: &str,
        kind: DeviceKind,
        conn_id: ConnectionId,
        tx: ConnectionTx,
        now: DateTime<Utc>,
    ) -> &mut DeviceEntry {
        match self.entries.entry(device_id.to_string()) {
            std::collections::hash_map::Entry::Occupied(slot) => {
                let entry = slot.into_mut();
                if entry.username != username {
                    if let Some(ids) = self.by_username.get_mut(&entry.username) {
                        ids.remove(device_id);
                        if ids.is_empty() {
                            self.by_username.remove(&entry.username);
                        }
                    }
                    self.by_username
                        .entry(username.to_string())
                        .or_default()
                        .insert(device_id.to_string());
                    entry.username = username.to_string();
                }
                entry.name = name.to_string();
                entry.kind = kind;
                entry.online = true;
                entry.last_seen = now;
                entry.connections.insert(conn_id, tx);
                debug!(device_id, username, "device entry refreshed");
                entry
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                self.by_username
                    .entry(username.to_string())
                    .or_default()
                    .insert(device_id.to_string());
                info!(device_id, username, "device registered");
                slot.insert(DeviceEntry {
                    device_id: device_id.to_string(),
                    username: username.to_string(),
                    name: name.to_string(),
                    kind,
                    online: true,
                    last_seen: now,
                    connections: HashMap::from([(conn_id, tx)]),
                    session_id: None,
                })
            }
        }
    }

    pub fn attach_connection(&mut self, device_id: &str, conn_id: ConnectionId, tx: ConnectionTx) {
        if let Some(entry) = self.entries.get_mut(device_id) {
            entry.connections.insert(conn_id, tx);
            entry.online = true;
        }
    }

    /// Drop one connection from an entry; returns how many remain. When the
    /// last one goes the entry is marked offline and its grace window starts.
    pub fn detach_connection(
        &mut self,
        device_id: &str,
        conn_id: ConnectionId,
        now: DateTime<Utc>,
    ) -> usize {
        let Some(entry) = self.entries.get_mut(device_id) else {
            return 0;
        };
        entry.connections.remove(&conn_id);
        entry.last_seen = now;
        if entry.connections.is_empty() {
            entry.online = false;
            debug!(device_id, "last connection detached, grace window open");
        }
        entry.connections.len()
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceEntry> {
        self.entries.get(device_id)
    }

    pub fn get_mut(&mut self, device_id: &str) -> Option<&mut DeviceEntry> {
        self.entries.get_mut(device_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn connection_count(&self) -> usize {
        self.entries.values().map(|e| e.connections.len()).sum()
    }

    /// Resolve an invitation target: any device with a matching username
    /// (other than the asking device) that has an open connection wins;
    /// otherwise the identifier is tried as a literal device id. Which of
    /// several matching devices is picked is unspecified.
    pub fn find_by_username_or_id(&self, identifier: &str, exclude: &str) -> Option<&DeviceEntry> {
        if let Some(ids) = self.by_username.get(identifier) {
            if let Some(entry) = ids
                .iter()
                .filter(|id| id.as_str() != exclude)
                .filter_map(|id| self.entries.get(id))
                .find(|e| !e.connections.is_empty())
            {
                return Some(entry);
            }
        }
        self.entries
            .get(identifier)
            .filter(|e| !e.connections.is_empty())
    }

    /// Remove an entry outright (sweeper only), fixing the username index.
    pub fn remove(&mut self, device_id: &str) -> Option<DeviceEntry> {
        let entry = self.entries.remove(device_id)?;
        if let Some(ids) = self.by_username.get_mut(&entry.username) {
            ids.remove(device_id);
            if ids.is_empty() {
                self.by_username.remove(&entry.username);
            }
        }
        info!(device_id, username = %entry.username, "device entry removed");
        Some(entry)
    }

    /// Clear `session_id` on every entry pointing at a dead session.
    pub fn clear_session(&mut self, session_id: &SessionId, device_ids: &[DeviceId]) {
        for id in device_ids {
            if let Some(entry) = self.entries.get_mut(id) {
                if entry.session_id.as_ref() == Some(session_id) {
                    entry.session_id = None;
                }
            }
        }
    }
}
