//! Session control: registration, create/join/leave, and the disconnect
//! flow shared by socket closes and explicit leaves.

use axum::extract::ws::{close_code, CloseFrame, Message};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{ConnCtx, HubState};
use crate::error::HubError;
use crate::models::{DeviceMembership, SessionId};
use crate::protocol::{self, parse_payload, Envelope, JoinPayload, RegisterPayload};

pub const OWNER_LEFT_REASON: &str = "Session owner left";

/// `device_register`: upsert a directory entry with no session association
/// and bind this connection to it. Clients do this on the home screen so
/// invitations and nearby broadcasts can reach them.
pub fn device_register(
    state: &mut HubState,
    ctx: &mut ConnCtx,
    envelope: &Envelope,
    now: DateTime<Utc>,
) -> Result<(), HubError> {
    let p: RegisterPayload = parse_payload(&envelope.payload)?;
    state.directory.register(
        &p.device_id,
        &p.device_name,
        &p.username,
        p.device_type,
        ctx.id,
        ctx.tx.clone(),
        now,
    );
    ctx.device_id = Some(p.device_id.clone());
    ctx.send(&protocol::device_registered(&p.device_id, &p.username));
    Ok(())
}

/// `session_create`: new session with the caller as owner and only member.
/// Replies `session_created`; the caller schedules the delayed nearby
/// broadcast so that reply is on the wire first.
pub fn session_create(
    state: &mut HubState,
    ctx: &mut ConnCtx,
    envelope: &Envelope,
    now: DateTime<Utc>,
    ttl: chrono::Duration,
) -> Result<SessionId, HubError> {
    let p: RegisterPayload = parse_payload(&envelope.payload)?;
    state.directory.register(
        &p.device_id,
        &p.device_name,
        &p.username,
        p.device_type,
        ctx.id,
        ctx.tx.clone(),
        now,
    );

    leave_current_session(state, &p.device_id, None, now);

    let owner = DeviceMembership::new(
        p.device_id.clone(),
        p.device_name,
        p.username,
        p.device_type,
        now,
    );
    let session = state.sessions.create(owner, now, ttl);
    let session_id = session.id.clone();
    let reply = protocol::session_created(session);

    if let Some(entry) = state.directory.get_mut(&p.device_id) {
        entry.session_id = Some(session_id.clone());
    }
    ctx.device_id = Some(p.device_id);
    ctx.send(&reply);
    Ok(session_id)
}

/// `session_join`: resolve the code, upsert membership (idempotent for
/// re-joins), reply `session_joined`, then fan out `device_connected` to the
/// other online members. Unknown and expired codes answer identically.
pub fn session_join(
    state: &mut HubState,
    ctx: &mut ConnCtx,
    envelope: &Envelope,
    now: DateTime<Utc>,
) -> Result<(), HubError> {
    let p: JoinPayload = parse_payload(&envelope.payload)?;

    let session_id = state
        .sessions
        .find_by_code(&p.code)
        .filter(|s| s.expires_at > now)
        .map(|s| s.id.clone())
        .ok_or(HubError::InvalidSessionCode)?;

    state.directory.register(
        &p.device_id,
        &p.device_name,
        &p.username,
        p.device_type,
        ctx.id,
        ctx.tx.clone(),
        now,
    );
    leave_current_session(state, &p.device_id, Some(&session_id), now);
    if let Some(entry) = state.directory.get_mut(&p.device_id) {
        entry.session_id = Some(session_id.clone());
    }

    let member = DeviceMembership::new(
        p.device_id.clone(),
        p.device_name,
        p.username,
        p.device_type,
        now,
    );
    state.sessions.add_member(&session_id, member);
    ctx.device_id = Some(p.device_id.clone());

    let Some(session) = state.sessions.get(&session_id) else {
        return Err(HubError::InvalidSessionCode);
    };
    let reply = protocol::session_joined(session);
    let connected = session
        .devices
        .get(&p.device_id)
        .map(|m| protocol::device_connected(&session_id, m));

    // Reply before the fan-out so the joiner's `session_joined` logically
    // precedes everyone else's `device_connected`.
    ctx.send(&reply);
    if let Some(connected) = connected {
        state.fan_out_session(&session_id, Some(&p.device_id), &connected);
    }
    info!(session_id = %session_id, device_id = %p.device_id, "device joined session");
    Ok(())
}

/// `session_leave`: graceful departure. The connection and the directory
/// entry stay; only the session association goes away. An owner leaving ends
/// the session for everyone.
pub fn session_leave(
    state: &mut HubState,
    envelope: &Envelope,
    now: DateTime<Utc>,
) -> Result<(), HubError> {
    let session_id = envelope
        .session_id
        .as_deref()
        .ok_or_else(|| HubError::BadPayload("missing field `sessionId`".to_string()))?;
    let device_id = envelope
        .device_id
        .as_deref()
        .ok_or_else(|| HubError::BadPayload("missing field `deviceId`".to_string()))?;

    let session = state
        .sessions
        .get(session_id)
        .ok_or(HubError::InvalidSessionCode)?;

    if session.created_by == device_id {
        owner_quit(state, session_id, now);
    } else {
        member_detach(state, session_id, device_id, now, true);
    }
    Ok(())
}

/// Socket-close path, invoked by the transport listener. Only the last
/// connection of a device has session-level consequences; the entry itself
/// is never deleted here (the sweeper owns the grace period).
pub fn disconnect(state: &mut HubState, ctx: &ConnCtx, now: DateTime<Utc>) {
    let Some(device_id) = ctx.device_id.as_deref() else {
        return;
    };
    let remaining = state.directory.detach_connection(device_id, ctx.id, now);
    if remaining > 0 {
        debug!(device_id, remaining, "connection closed, device still online");
        return;
    }

    let Some(session_id) = state
        .directory
        .get(device_id)
        .and_then(|e| e.session_id.clone())
    else {
        return;
    };
    let Some(session) = state.sessions.get(&session_id) else {
        return;
    };

    if session.created_by == device_id {
        info!(session_id = %session_id, device_id, "owner disconnected, ending session");
        owner_quit(state, &session_id, now);
    } else {
        // Membership survives offline so a quick reconnect restores it.
        member_detach(state, &session_id, device_id, now, false);
    }
}

/// Owner-quits semantics: `session_expired` to the remaining members, close
/// their connections with the eviction reason, drop the session, and detach
/// every member's directory entry from it. Entries themselves stay.
pub fn owner_quit(state: &mut HubState, session_id: &str, _now: DateTime<Utc>) {
    let Some(owner) = state.sessions.get(session_id).map(|s| s.created_by.clone()) else {
        return;
    };

    let expired = protocol::session_expired(session_id);
    state.fan_out_session(session_id, Some(&owner), &expired);

    let Some(session) = state.sessions.remove(session_id) else {
        return;
    };
    let close = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: OWNER_LEFT_REASON.into(),
    }));
    for device_id in session.devices.keys().filter(|id| *id != &owner) {
        if let Some(entry) = state.directory.get(device_id) {
            entry.close_all(close.clone());
        }
    }
    let member_ids: Vec<String> = session.devices.keys().cloned().collect();
    state.directory.clear_session(&session.id, &member_ids);
}

/// A device may only be in one session at a time: creating or joining a new
/// one first detaches it from whatever session its entry still points at,
/// through the same path an explicit leave takes. `except` skips the detach
/// when the device is re-joining that same session.
fn leave_current_session(
    state: &mut HubState,
    device_id: &str,
    except: Option<&str>,
    now: DateTime<Utc>,
) {
    let Some(previous) = state
        .directory
        .get(device_id)
        .and_then(|e| e.session_id.clone())
    else {
        return;
    };
    if except == Some(previous.as_str()) {
        return;
    }

    let Some(session) = state.sessions.get(&previous) else {
        // Stale pointer to a session that is already gone.
        if let Some(entry) = state.directory.get_mut(device_id) {
            entry.session_id = None;
        }
        return;
    };
    debug!(device_id, previous = %previous, "detaching from previous session");
    if session.created_by == device_id {
        owner_quit(state, &previous, now);
    } else {
        member_detach(state, &previous, device_id, now, true);
    }
}

/// Non-owner departure: mark offline, tell the peers, and drop the session
/// once nobody is left online.
fn member_detach(
    state: &mut HubState,
    session_id: &str,
    device_id: &str,
    now: DateTime<Utc>,
    clear_entry_session: bool,
) {
    state.sessions.mark_offline(session_id, device_id, now);
    let gone = protocol::device_disconnected(session_id, device_id);
    state.fan_out_session(session_id, Some(device_id), &gone);

    if clear_entry_session {
        if let Some(entry) = state.directory.get_mut(device_id) {
            if entry.session_id.as_deref() == Some(session_id) {
                entry.session_id = None;
            }
        }
    }

    let deserted = state
        .sessions
        .get(session_id)
        .map(|s| s.online_count() == 0)
        .unwrap_or(false);
    if deserted {
        if let Some(session) = state.sessions.remove(session_id) {
            let member_ids: Vec<String> = session.devices.keys().cloned().collect();
            state.directory.clear_session(&session.id, &member_ids);
        }
    }
}
