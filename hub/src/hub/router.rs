//! Delivery rules. Every rule resolves a targeting expression to zero or
//! more device entries and queues the frame on one open connection per
//! device. Fan-out failures are per-recipient: logged, skipped, never
//! propagated to the sender.

use std::collections::HashSet;
use tracing::{debug, warn};

use super::HubState;
use crate::error::HubError;
use crate::protocol::Envelope;

impl HubState {
    /// Deliver to a single device over any one of its open connections.
    pub fn unicast(&mut self, device_id: &str, envelope: &Envelope) -> Result<(), HubError> {
        if self.deliver(device_id, envelope) {
            Ok(())
        } else {
            Err(HubError::TargetNotConnected)
        }
    }

    /// Resolve a username (excluding the asking device) or literal device id,
    /// then deliver as `unicast`. Returns which device was picked; any
    /// failure reads as the user being unreachable.
    pub fn unicast_by_username(
        &mut self,
        identifier: &str,
        exclude: &str,
        envelope: &Envelope,
    ) -> Result<String, HubError> {
        let target = self
            .directory
            .find_by_username_or_id(identifier, exclude)
            .map(|e| e.device_id.clone())
            .ok_or_else(|| HubError::UserNotFound(identifier.to_string()))?;
        self.unicast(&target, envelope)
            .map_err(|_| HubError::UserNotFound(identifier.to_string()))?;
        Ok(target)
    }

    /// Best-effort fan-out to every online member of a session, optionally
    /// excluding one device. Returns how many deliveries succeeded.
    pub fn fan_out_session(
        &mut self,
        session_id: &str,
        exclude: Option<&str>,
        envelope: &Envelope,
    ) -> usize {
        let Some(session) = self.sessions.get(session_id) else {
            return 0;
        };
        let targets = session.online_members(exclude);
        self.deliver_each(&targets, envelope)
    }

    /// Best-effort fan-out to every online device in the directory that is
    /// neither the sender nor already a member of the session.
    pub fn fan_out_nearby(
        &mut self,
        exclude: &str,
        exclude_members_of: &str,
        envelope: &Envelope,
    ) -> usize {
        let members: HashSet<String> = self
            .sessions
            .get(exclude_members_of)
            .map(|s| s.devices.keys().cloned().collect())
            .unwrap_or_default();
        let targets: Vec<String> = self
            .directory
            .iter()
            .filter(|e| e.online && e.device_id != exclude && !members.contains(&e.device_id))
            .map(|e| e.device_id.clone())
            .collect();
        self.deliver_each(&targets, envelope)
    }

    fn deliver_each(&mut self, targets: &[String], envelope: &Envelope) -> usize {
        let mut delivered = 0;
        for device_id in targets {
            if self.deliver(device_id, envelope) {
                delivered += 1;
            } else {
                warn!(device_id = %device_id, kind = ?envelope.kind, "fan-out skipped offline device");
            }
        }
        delivered
    }

    /// Queue one frame for one device; `false` when no open connection took
    /// it, which also flips the entry offline.
    pub fn deliver(&mut self, device_id: &str, envelope: &Envelope) -> bool {
        let Ok(text) = serde_json::to_string(envelope) else {
            return false;
        };
        match self.directory.get_mut(device_id) {
            Some(entry) => {
                let sent = entry.send_text(&text);
                if sent {
                    debug!(device_id, kind = ?envelope.kind, "frame delivered");
                }
                sent
            }
            None => false,
        }
    }
}
