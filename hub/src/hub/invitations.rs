//! Invitations and nearby-session discovery. Single hop, no pending state:
//! the hub forwards an invitation to one open connection of the target and
//! lets the invitee join through a normal `session_join` later.

use tracing::{debug, info};

use super::{require_device, require_session, ConnCtx, HubState};
use crate::error::HubError;
use crate::protocol::{self, parse_payload, Envelope, InvitationPayload};

/// `session_invitation`: resolve the target as a username first (never the
/// sender's own device), falling back to a literal device id.
pub fn session_invitation(
    state: &mut HubState,
    ctx: &ConnCtx,
    envelope: &Envelope,
) -> Result<(), HubError> {
    let sender = require_device(ctx, envelope)?;
    let p: InvitationPayload = parse_payload(&envelope.payload)?;

    let mut invite = protocol::session_invitation(p.invitation);
    invite.session_id = envelope.session_id.clone();
    let target_id = state.unicast_by_username(&p.target_identifier, &sender, &invite)?;

    let (target_username, target_name) = state
        .directory
        .get(&target_id)
        .map(|e| (e.username.clone(), e.name.clone()))
        .unwrap_or_default();
    info!(from = %sender, to = %target_id, "invitation delivered");
    ctx.send(&protocol::invitation_sent(
        &p.target_identifier,
        &target_username,
        &target_name,
    ));
    Ok(())
}

/// `invitation_response`: forwarded verbatim to the session's owner. The hub
/// never auto-joins the invitee.
pub fn invitation_response(state: &mut HubState, envelope: &Envelope) -> Result<(), HubError> {
    let session_id = require_session(envelope)?.to_string();
    let owner = state
        .sessions
        .get(&session_id)
        .map(|s| s.created_by.clone())
        .ok_or(HubError::InvalidSessionCode)?;

    let forward = protocol::invitation_response(&session_id, envelope.payload.clone());
    state.unicast(&owner, &forward)
}

/// Client-requested `nearby_session_broadcast`; acks with how many devices
/// were notified.
pub fn nearby_request(
    state: &mut HubState,
    ctx: &ConnCtx,
    envelope: &Envelope,
) -> Result<(), HubError> {
    let session_id = require_session(envelope)?.to_string();
    let sender = require_device(ctx, envelope)?;
    let notifications_sent = broadcast_nearby(state, &session_id, Some(&sender))?;
    ctx.send(&protocol::nearby_broadcast_sent(notifications_sent));
    Ok(())
}

/// Announce a session to every online device that is neither the sender nor
/// already a member. Also runs ~1 s after `session_create` (sender defaults
/// to the owner then).
pub fn broadcast_nearby(
    state: &mut HubState,
    session_id: &str,
    sender: Option<&str>,
) -> Result<usize, HubError> {
    let session = state
        .sessions
        .get(session_id)
        .ok_or(HubError::InvalidSessionCode)?;
    let exclude = sender
        .map(str::to_string)
        .unwrap_or_else(|| session.created_by.clone());
    let announce = protocol::nearby_session_broadcast(session, session.online_count());
    let sent = state.fan_out_nearby(&exclude, session_id, &announce);
    debug!(session_id, sent, "nearby session broadcast");
    Ok(sent)
}
