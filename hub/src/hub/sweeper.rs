//! Out-of-band expiry. The sweep owns both time-based deletions: expired
//! sessions and device entries whose grace window has lapsed. Handlers never
//! delete a `DeviceEntry` themselves.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::info;

use super::{Hub, HubState};
use crate::protocol;

/// One pass over the shared state at time `now`.
pub fn sweep(state: &mut HubState, now: DateTime<Utc>, grace: Duration) {
    let expired: Vec<String> = state
        .sessions
        .iter()
        .filter(|s| s.expires_at <= now)
        .map(|s| s.id.clone())
        .collect();
    for session_id in expired {
        let notice = protocol::session_expired(&session_id);
        state.fan_out_session(&session_id, None, &notice);
        if let Some(session) = state.sessions.remove(&session_id) {
            info!(session_id = %session.id, code = %session.code, "session expired");
            let member_ids: Vec<String> = session.devices.keys().cloned().collect();
            state.directory.clear_session(&session.id, &member_ids);
        }
    }

    let stale: Vec<String> = state
        .directory
        .iter()
        .filter(|e| e.connections.is_empty() && e.last_seen + grace < now)
        .map(|e| e.device_id.clone())
        .collect();
    for device_id in stale {
        state.directory.remove(&device_id);
    }
}

/// Periodic sweep task, one tick per configured interval.
pub fn spawn(hub: Arc<Hub>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(hub.config().sweep_interval());
        loop {
            interval.tick().await;
            hub.sweep().await;
        }
    })
}
