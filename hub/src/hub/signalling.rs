//! WebRTC signalling relay. Offers, answers, and ICE candidates are
//! independent frames; the hub validates session and target, rewraps the
//! payload as `{fromDevice, toDevice, data}`, and never parses `data`.

use tracing::debug;

use super::{require_device, require_session, ConnCtx, HubState};
use crate::error::HubError;
use crate::protocol::{self, parse_payload, Envelope, SignalPayload};

pub fn relay(state: &mut HubState, ctx: &ConnCtx, envelope: &Envelope) -> Result<(), HubError> {
    let session_id = require_session(envelope)?.to_string();
    let from_device = require_device(ctx, envelope)?;
    let p: SignalPayload = parse_payload(&envelope.payload)?;

    if state.sessions.get(&session_id).is_none() {
        return Err(HubError::InvalidSessionCode);
    }
    let target_connected = state
        .directory
        .get(&p.to_device)
        .map(|e| !e.connections.is_empty())
        .unwrap_or(false);
    if !target_connected {
        return Err(HubError::TargetNotConnected);
    }

    debug!(kind = ?envelope.kind, from = %from_device, to = %p.to_device, "relaying signal");
    let out = protocol::signal_relay(envelope.kind, &session_id, &from_device, &p.to_device, p.data);
    state.unicast(&p.to_device, &out)
}
