//! Intent relay: device-to-device intents, clipboard sync, membership
//! status updates, and group operations. Intent bodies are opaque; the only
//! rewrite the hub ever performs is retargeting `target_device` during a
//! group broadcast.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use super::{require_device, require_session, ConnCtx, HubState};
use crate::error::HubError;
use crate::protocol::{
    self, parse_payload, ClipboardPayload, Envelope, GroupBroadcastPayload, GroupCreatePayload,
    GroupDeletePayload, GroupUpdatePayload, IntentSendPayload, StatusUpdatePayload,
};

/// `intent_send`: unicast an intent to one online session member, then ack
/// the sender.
pub fn intent_send(state: &mut HubState, ctx: &ConnCtx, envelope: &Envelope) -> Result<(), HubError> {
    let session_id = require_session(envelope)?.to_string();
    let sender = require_device(ctx, envelope)?;
    let p: IntentSendPayload = parse_payload(&envelope.payload)?;

    let session = state
        .sessions
        .get(&session_id)
        .ok_or(HubError::InvalidSessionCode)?;
    let target_online = session
        .devices
        .get(&p.target_device)
        .map(|m| m.online)
        .unwrap_or(false);
    if !target_online {
        return Err(HubError::TargetNotConnected);
    }

    let deliver = protocol::intent_received(&session_id, p.intent, &sender);
    state.unicast(&p.target_device, &deliver)?;
    ctx.send(&protocol::intent_sent(&session_id, &p.target_device));
    debug!(session_id = %session_id, from = %sender, to = %p.target_device, "intent relayed");
    Ok(())
}

/// `clipboard_broadcast`: fan the clipboard out to every other online member.
pub fn clipboard_broadcast(
    state: &mut HubState,
    ctx: &ConnCtx,
    envelope: &Envelope,
) -> Result<(), HubError> {
    let session_id = require_session(envelope)?.to_string();
    let sender = require_device(ctx, envelope)?;
    let p: ClipboardPayload = parse_payload(&envelope.payload)?;

    if state.sessions.get(&session_id).is_none() {
        return Err(HubError::InvalidSessionCode);
    }
    let sync = protocol::clipboard_sync(&session_id, p.clipboard);
    state.fan_out_session(&session_id, Some(&sender), &sync);
    Ok(())
}

/// `device_status_update`: merge `online`/`permissions` into the sender's own
/// membership and fan the updated snapshot out to the other members.
pub fn device_status_update(
    state: &mut HubState,
    ctx: &ConnCtx,
    envelope: &Envelope,
    now: DateTime<Utc>,
) -> Result<(), HubError> {
    let session_id = require_session(envelope)?.to_string();
    let sender = require_device(ctx, envelope)?;
    let p: StatusUpdatePayload = parse_payload(&envelope.payload)?;

    let member = state
        .sessions
        .get_mut(&session_id)
        .ok_or(HubError::InvalidSessionCode)?
        .devices
        .get_mut(&sender)
        .ok_or_else(|| HubError::NotSessionMember(sender.clone()))?;

    if let Some(online) = p.online {
        member.online = online;
    }
    if let Some(patch) = p.permissions {
        if let Some(v) = patch.files {
            member.permissions.files = v;
        }
        if let Some(v) = patch.media {
            member.permissions.media = v;
        }
        if let Some(v) = patch.prompts {
            member.permissions.prompts = v;
        }
        if let Some(v) = patch.clipboard {
            member.permissions.clipboard = v;
        }
        if let Some(v) = patch.remote_browse {
            member.permissions.remote_browse = v;
        }
    }
    member.last_seen = now;
    let snapshot = member.clone();

    let update = protocol::device_status_update(&session_id, &snapshot);
    state.fan_out_session(&session_id, Some(&sender), &update);
    Ok(())
}

/// `group_create`: all listed devices must be current members. The whole
/// session, sender included, hears `group_created`.
pub fn group_create(
    state: &mut HubState,
    ctx: &ConnCtx,
    envelope: &Envelope,
    now: DateTime<Utc>,
) -> Result<(), HubError> {
    let session_id = require_session(envelope)?.to_string();
    let sender = require_device(ctx, envelope)?;
    let p: GroupCreatePayload = parse_payload(&envelope.payload)?;

    let session = state
        .sessions
        .get(&session_id)
        .ok_or(HubError::InvalidSessionCode)?;
    for device_id in &p.device_ids {
        if !session.devices.contains_key(device_id) {
            return Err(HubError::NotSessionMember(device_id.clone()));
        }
    }

    let group = state
        .sessions
        .add_group(&session_id, p.name, sender, p.device_ids, p.color, now)
        .ok_or(HubError::InvalidSessionCode)?;
    info!(session_id = %session_id, group_id = %group.id, "group created");
    let created = protocol::group_created(&session_id, group);
    state.fan_out_session(&session_id, None, &created);
    Ok(())
}

/// `group_update`: partial update with the same membership validation.
pub fn group_update(state: &mut HubState, ctx: &ConnCtx, envelope: &Envelope) -> Result<(), HubError> {
    let session_id = require_session(envelope)?.to_string();
    require_device(ctx, envelope)?;
    let p: GroupUpdatePayload = parse_payload(&envelope.payload)?;

    let session = state
        .sessions
        .get_mut(&session_id)
        .ok_or(HubError::InvalidSessionCode)?;
    if let Some(device_ids) = &p.device_ids {
        for device_id in device_ids {
            if !session.devices.contains_key(device_id) {
                return Err(HubError::NotSessionMember(device_id.clone()));
            }
        }
    }
    let group = session
        .groups
        .get_mut(&p.group_id)
        .ok_or(HubError::GroupNotFound)?;
    if let Some(name) = p.name {
        group.name = name;
    }
    if let Some(device_ids) = p.device_ids {
        group.device_ids = device_ids;
    }
    if let Some(color) = p.color {
        group.color = color;
    }

    let updated = protocol::group_updated(&session_id, group);
    state.fan_out_session(&session_id, None, &updated);
    Ok(())
}

/// `group_delete`: drop the group and tell the session.
pub fn group_delete(state: &mut HubState, ctx: &ConnCtx, envelope: &Envelope) -> Result<(), HubError> {
    let session_id = require_session(envelope)?.to_string();
    require_device(ctx, envelope)?;
    let p: GroupDeletePayload = parse_payload(&envelope.payload)?;

    let session = state
        .sessions
        .get_mut(&session_id)
        .ok_or(HubError::InvalidSessionCode)?;
    if session.groups.remove(&p.group_id).is_none() {
        return Err(HubError::GroupNotFound);
    }
    let deleted = protocol::group_deleted(&session_id, &p.group_id);
    state.fan_out_session(&session_id, None, &deleted);
    Ok(())
}

/// `group_broadcast`: deliver the intent to each online group member with
/// `target_device` rewritten per recipient. The sender only ever gets the
/// ack, even when listed in its own group.
pub fn group_broadcast(
    state: &mut HubState,
    ctx: &ConnCtx,
    envelope: &Envelope,
) -> Result<(), HubError> {
    let session_id = require_session(envelope)?.to_string();
    let sender = require_device(ctx, envelope)?;
    let p: GroupBroadcastPayload = parse_payload(&envelope.payload)?;

    let session = state
        .sessions
        .get(&session_id)
        .ok_or(HubError::InvalidSessionCode)?;
    let group = session
        .groups
        .get(&p.group_id)
        .ok_or(HubError::GroupNotFound)?;
    let targets: Vec<(String, bool)> = group
        .device_ids
        .iter()
        .filter(|id| id.as_str() != sender)
        .map(|id| {
            let online = session.devices.get(id).map(|m| m.online).unwrap_or(false);
            (id.clone(), online)
        })
        .collect();

    let total_devices = targets.len();
    let mut devices_reached = 0;
    for (device_id, online) in targets {
        if !online {
            continue;
        }
        let mut intent = p.intent.clone();
        if let Some(obj) = intent.as_object_mut() {
            obj.insert("target_device".to_string(), Value::String(device_id.clone()));
        }
        let deliver = protocol::intent_received(&session_id, intent, &sender);
        if state.deliver(&device_id, &deliver) {
            devices_reached += 1;
        }
    }

    ctx.send(&protocol::group_broadcast_sent(
        &session_id,
        &p.group_id,
        devices_reached,
        total_devices,
    ));
    debug!(session_id = %session_id, group_id = %p.group_id, devices_reached, total_devices, "group broadcast");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::test_support::{attach_device, connect, drain, make_session, state};
    use crate::protocol::MessageKind;
    use serde_json::json;

    #[test]
    fn test_intent_round_trip_preserves_body() {
        let mut st = state();
        attach_device(&mut st, "dev-a", "alice");
        let (mut rx_b, _) = attach_device(&mut st, "dev-b", "bob");
        let session_id = make_session(&mut st, "dev-a", &["dev-b"]);
        let (mut ctx_a, mut rx_ack) = connect();
        ctx_a.device_id = Some("dev-a".to_string());

        let intent = json!({
            "intent_type": "link_open",
            "payload": {"link": {"url": "https://example.com", "title": "Example"}},
            "source_device": "dev-a",
        });
        let env = Envelope::new(
            MessageKind::IntentSend,
            json!({ "targetDevice": "dev-b", "intent": intent }),
        )
        .with_session(&session_id);
        intent_send(&mut st, &ctx_a, &env).unwrap();

        let received = drain(&mut rx_b);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind, MessageKind::IntentReceived);
        assert_eq!(received[0].payload["intent"], intent);
        assert_eq!(received[0].payload["sourceDevice"], "dev-a");

        let acks = drain(&mut rx_ack);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].kind, MessageKind::IntentSent);
        assert_eq!(acks[0].payload["targetDevice"], "dev-b");
    }

    #[test]
    fn test_intent_to_offline_member_errors() {
        let mut st = state();
        attach_device(&mut st, "dev-a", "alice");
        let (_rx_b, conn_b) = attach_device(&mut st, "dev-b", "bob");
        let session_id = make_session(&mut st, "dev-a", &["dev-b"]);
        let now = Utc::now();
        st.directory.detach_connection("dev-b", conn_b, now);
        st.sessions.mark_offline(&session_id, "dev-b", now);

        let (mut ctx, _rx) = connect();
        ctx.device_id = Some("dev-a".to_string());
        let env = Envelope::new(
            MessageKind::IntentSend,
            json!({ "targetDevice": "dev-b", "intent": {"intent_type": "ping"} }),
        )
        .with_session(&session_id);
        let err = intent_send(&mut st, &ctx, &env).unwrap_err();
        assert_eq!(err.to_string(), "Target device not connected");
    }

    #[test]
    fn test_clipboard_reaches_everyone_but_sender() {
        let mut st = state();
        let (mut rx_a, _) = attach_device(&mut st, "dev-a", "alice");
        let (mut rx_b, _) = attach_device(&mut st, "dev-b", "bob");
        let session_id = make_session(&mut st, "dev-a", &["dev-b"]);
        let (ctx, _rx) = connect();

        let env = Envelope::new(
            MessageKind::ClipboardBroadcast,
            json!({ "clipboard": {"text": "secret launch codes"} }),
        )
        .with_session(&session_id)
        .with_device("dev-a");
        clipboard_broadcast(&mut st, &ctx, &env).unwrap();

        assert!(drain(&mut rx_a).is_empty());
        let frames = drain(&mut rx_b);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, MessageKind::ClipboardSync);
        assert_eq!(frames[0].payload["clipboard"]["text"], "secret launch codes");
    }

    #[test]
    fn test_status_update_merges_and_fans_out() {
        let mut st = state();
        attach_device(&mut st, "dev-a", "alice");
        let (mut rx_b, _) = attach_device(&mut st, "dev-b", "bob");
        let session_id = make_session(&mut st, "dev-a", &["dev-b"]);
        let (ctx, _rx) = connect();

        let env = Envelope::new(
            MessageKind::DeviceStatusUpdate,
            json!({ "permissions": {"clipboard": false} }),
        )
        .with_session(&session_id)
        .with_device("dev-a");
        device_status_update(&mut st, &ctx, &env, Utc::now()).unwrap();

        let member = &st.sessions.get(&session_id).unwrap().devices["dev-a"];
        assert!(!member.permissions.clipboard);
        assert!(member.permissions.files, "untouched permissions survive");

        let frames = drain(&mut rx_b);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, MessageKind::DeviceStatusUpdate);
        assert_eq!(frames[0].payload["deviceId"], "dev-a");
        assert_eq!(frames[0].payload["device"]["permissions"]["clipboard"], false);
    }

    #[test]
    fn test_group_create_validates_membership() {
        let mut st = state();
        attach_device(&mut st, "dev-a", "alice");
        let session_id = make_session(&mut st, "dev-a", &[]);
        let (ctx, _rx) = connect();

        let env = Envelope::new(
            MessageKind::GroupCreate,
            json!({ "name": "work", "deviceIds": ["dev-stranger"] }),
        )
        .with_session(&session_id)
        .with_device("dev-a");
        let err = group_create(&mut st, &ctx, &env, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("dev-stranger"));
        assert!(st.sessions.get(&session_id).unwrap().groups.is_empty());
    }

    #[test]
    fn test_group_lifecycle_fans_out_to_whole_session() {
        let mut st = state();
        let (mut rx_a, _) = attach_device(&mut st, "dev-a", "alice");
        let (mut rx_b, _) = attach_device(&mut st, "dev-b", "bob");
        let session_id = make_session(&mut st, "dev-a", &["dev-b"]);
        let (ctx, _rx) = connect();

        let env = Envelope::new(
            MessageKind::GroupCreate,
            json!({ "name": "work", "deviceIds": ["dev-b"] }),
        )
        .with_session(&session_id)
        .with_device("dev-a");
        group_create(&mut st, &ctx, &env, Utc::now()).unwrap();

        let a_frames = drain(&mut rx_a);
        assert_eq!(a_frames.len(), 1, "sender hears group_created too");
        assert_eq!(a_frames[0].kind, MessageKind::GroupCreated);
        let group_id = a_frames[0].payload["group"]["id"].as_str().unwrap().to_string();
        assert!(!a_frames[0].payload["group"]["color"].as_str().unwrap().is_empty());
        drain(&mut rx_b);

        let env = Envelope::new(
            MessageKind::GroupUpdate,
            json!({ "groupId": group_id, "name": "play" }),
        )
        .with_session(&session_id)
        .with_device("dev-a");
        group_update(&mut st, &ctx, &env).unwrap();
        let updated = drain(&mut rx_b);
        assert_eq!(updated[0].payload["group"]["name"], "play");
        assert_eq!(updated[0].payload["group"]["deviceIds"], json!(["dev-b"]));
        drain(&mut rx_a);

        let env = Envelope::new(MessageKind::GroupDelete, json!({ "groupId": group_id }))
            .with_session(&session_id)
            .with_device("dev-a");
        group_delete(&mut st, &ctx, &env).unwrap();
        assert_eq!(drain(&mut rx_a)[0].kind, MessageKind::GroupDeleted);
        assert!(st.sessions.get(&session_id).unwrap().groups.is_empty());

        let env = Envelope::new(MessageKind::GroupDelete, json!({ "groupId": "gone" }))
            .with_session(&session_id)
            .with_device("dev-a");
        assert!(matches!(
            group_delete(&mut st, &ctx, &env),
            Err(HubError::GroupNotFound)
        ));
    }

    #[test]
    fn test_group_broadcast_counts_offline_members() {
        let mut st = state();
        attach_device(&mut st, "dev-a", "alice");
        let (mut rx_b, _) = attach_device(&mut st, "dev-b", "bob");
        let (_rx_c, conn_c) = attach_device(&mut st, "dev-c", "cara");
        let session_id = make_session(&mut st, "dev-a", &["dev-b", "dev-c"]);
        let (mut ctx_a, mut rx_ack) = connect();
        ctx_a.device_id = Some("dev-a".to_string());

        let env = Envelope::new(
            MessageKind::GroupCreate,
            json!({ "name": "pair", "deviceIds": ["dev-b", "dev-c"] }),
        )
        .with_session(&session_id)
        .with_device("dev-a");
        group_create(&mut st, &ctx_a, &env, Utc::now()).unwrap();
        let group_id = drain(&mut rx_b)[0].payload["group"]["id"]
            .as_str()
            .unwrap()
            .to_string();

        let now = Utc::now();
        st.directory.detach_connection("dev-c", conn_c, now);
        st.sessions.mark_offline(&session_id, "dev-c", now);

        let intent = json!({"intent_type": "file_share", "target_device": "placeholder"});
        let env = Envelope::new(
            MessageKind::GroupBroadcast,
            json!({ "groupId": group_id, "intent": intent }),
        )
        .with_session(&session_id);
        group_broadcast(&mut st, &ctx_a, &env).unwrap();

        let b_frames = drain(&mut rx_b);
        assert_eq!(b_frames.len(), 1);
        assert_eq!(b_frames[0].kind, MessageKind::IntentReceived);
        assert_eq!(
            b_frames[0].payload["intent"]["target_device"], "dev-b",
            "intent is retargeted per recipient"
        );
        assert_eq!(b_frames[0].payload["sourceDevice"], "dev-a");

        let acks = drain(&mut rx_ack);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].kind, MessageKind::GroupBroadcastSent);
        assert_eq!(acks[0].payload["devicesReached"], 1);
        assert_eq!(acks[0].payload["totalDevices"], 2);
    }

    #[test]
    fn test_group_broadcast_never_reflects_to_sender() {
        let mut st = state();
        let (mut rx_a, _) = attach_device(&mut st, "dev-a", "alice");
        let (mut rx_b, _) = attach_device(&mut st, "dev-b", "bob");
        let session_id = make_session(&mut st, "dev-a", &["dev-b"]);
        let (mut ctx_a, mut rx_ack) = connect();
        ctx_a.device_id = Some("dev-a".to_string());

        // dev-a puts itself in its own group.
        let env = Envelope::new(
            MessageKind::GroupCreate,
            json!({ "name": "all", "deviceIds": ["dev-a", "dev-b"] }),
        )
        .with_session(&session_id)
        .with_device("dev-a");
        group_create(&mut st, &ctx_a, &env, Utc::now()).unwrap();
        let group_id = drain(&mut rx_a)[0].payload["group"]["id"]
            .as_str()
            .unwrap()
            .to_string();
        drain(&mut rx_b);

        let env = Envelope::new(
            MessageKind::GroupBroadcast,
            json!({ "groupId": group_id, "intent": {"intent_type": "ping"} }),
        )
        .with_session(&session_id);
        group_broadcast(&mut st, &ctx_a, &env).unwrap();

        assert!(
            drain(&mut rx_a).is_empty(),
            "sender never receives its own broadcast intent"
        );
        assert_eq!(drain(&mut rx_b).len(), 1);
        let acks = drain(&mut rx_ack);
        assert_eq!(acks[0].payload["devicesReached"], 1);
        assert_eq!(acks[0].payload["totalDevices"], 1);
    }
}
