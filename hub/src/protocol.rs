//! Wire protocol for the hub: one UTF-8 JSON envelope per WebSocket text
//! frame. Dispatch is a flat match on `type`; intent bodies, WebRTC `data`,
//! and clipboard contents are carried as raw [`serde_json::Value`] and never
//! inspected or reshaped.

use axum::extract::ws::Message;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::HubError;
use crate::models::{DeviceKind, DeviceMembership, Group, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    // Registration and session control
    DeviceRegister,
    DeviceRegistered,
    SessionCreate,
    SessionCreated,
    SessionJoin,
    SessionJoined,
    SessionLeave,
    SessionExpired,
    DeviceConnected,
    DeviceDisconnected,
    DeviceStatusUpdate,
    // WebRTC signalling (relayed opaque)
    WebrtcOffer,
    WebrtcAnswer,
    WebrtcIceCandidate,
    // Intents and clipboard
    IntentSend,
    IntentReceived,
    IntentSent,
    ClipboardBroadcast,
    ClipboardSync,
    // Groups
    GroupCreate,
    GroupCreated,
    GroupUpdate,
    GroupUpdated,
    GroupDelete,
    GroupDeleted,
    GroupBroadcast,
    GroupBroadcastSent,
    // Invitations and discovery
    SessionInvitation,
    InvitationSent,
    InvitationResponse,
    NearbySessionBroadcast,
    NearbyBroadcastSent,
    Error,
}

/// The outer frame every message uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(
        rename = "sessionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<String>,
    #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    pub fn new(kind: MessageKind, payload: Value) -> Self {
        Envelope {
            kind,
            session_id: None,
            device_id: None,
            payload,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn decode(text: &str) -> Result<Self, HubError> {
        serde_json::from_str(text).map_err(|_| HubError::InvalidFormat)
    }

    pub fn encode(&self) -> Message {
        Message::Text(serde_json::to_string(self).unwrap_or_default())
    }
}

/// Deserialize a handler payload, surfacing the serde message (which names
/// the missing or mistyped field) back to the client.
pub fn parse_payload<T: DeserializeOwned>(payload: &Value) -> Result<T, HubError> {
    serde_json::from_value(payload.clone()).map_err(|e| HubError::BadPayload(e.to_string()))
}

// ============================================================================
// Client → server payloads
// ============================================================================

/// Shared by `device_register` and `session_create`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceKind,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub code: String,
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceKind,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    pub to_device: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentSendPayload {
    pub target_device: String,
    pub intent: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClipboardPayload {
    pub clipboard: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusUpdatePayload {
    #[serde(default)]
    pub online: Option<bool>,
    #[serde(default)]
    pub permissions: Option<PermissionsPatch>,
}

/// Partial permissions update; absent fields are left untouched.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PermissionsPatch {
    pub files: Option<bool>,
    pub media: Option<bool>,
    pub prompts: Option<bool>,
    pub clipboard: Option<bool>,
    pub remote_browse: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupCreatePayload {
    pub name: String,
    pub device_ids: Vec<String>,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupUpdatePayload {
    pub group_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub device_ids: Option<Vec<String>>,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDeletePayload {
    pub group_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupBroadcastPayload {
    pub group_id: String,
    pub intent: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationPayload {
    pub target_identifier: String,
    pub invitation: Value,
}

// ============================================================================
// Server → client frames
// ============================================================================

pub fn device_registered(device_id: &str, username: &str) -> Envelope {
    Envelope::new(
        MessageKind::DeviceRegistered,
        json!({ "deviceId": device_id, "username": username, "registered": true }),
    )
    .with_device(device_id)
}

pub fn session_created(session: &Session) -> Envelope {
    Envelope::new(
        MessageKind::SessionCreated,
        json!({
            "sessionId": session.id,
            "code": session.code,
            "expiresAt": session.expires_at.timestamp_millis(),
        }),
    )
    .with_session(&session.id)
}

pub fn session_joined(session: &Session) -> Envelope {
    let devices: Vec<&DeviceMembership> = session.devices.values().collect();
    let groups: Vec<&Group> = session.groups.values().collect();
    Envelope::new(
        MessageKind::SessionJoined,
        json!({
            "sessionId": session.id,
            "devices": devices,
            "groups": groups,
        }),
    )
    .with_session(&session.id)
}

pub fn session_expired(session_id: &str) -> Envelope {
    Envelope::new(MessageKind::SessionExpired, json!({})).with_session(session_id)
}

pub fn device_connected(session_id: &str, member: &DeviceMembership) -> Envelope {
    Envelope::new(MessageKind::DeviceConnected, json!({ "device": member }))
        .with_session(session_id)
}

pub fn device_disconnected(session_id: &str, device_id: &str) -> Envelope {
    Envelope::new(MessageKind::DeviceDisconnected, json!({ "deviceId": device_id }))
        .with_session(session_id)
}

pub fn device_status_update(session_id: &str, member: &DeviceMembership) -> Envelope {
    Envelope::new(
        MessageKind::DeviceStatusUpdate,
        json!({ "deviceId": member.id, "device": member }),
    )
    .with_session(session_id)
}

pub fn signal_relay(
    kind: MessageKind,
    session_id: &str,
    from_device: &str,
    to_device: &str,
    data: Value,
) -> Envelope {
    Envelope::new(
        kind,
        json!({ "fromDevice": from_device, "toDevice": to_device, "data": data }),
    )
    .with_session(session_id)
}

pub fn intent_received(session_id: &str, intent: Value, source_device: &str) -> Envelope {
    Envelope::new(
        MessageKind::IntentReceived,
        json!({ "intent": intent, "sourceDevice": source_device }),
    )
    .with_session(session_id)
}

pub fn intent_sent(session_id: &str, target_device: &str) -> Envelope {
    Envelope::new(MessageKind::IntentSent, json!({ "targetDevice": target_device }))
        .with_session(session_id)
}

pub fn clipboard_sync(session_id: &str, clipboard: Value) -> Envelope {
    Envelope::new(MessageKind::ClipboardSync, json!({ "clipboard": clipboard }))
        .with_session(session_id)
}

pub fn group_created(session_id: &str, group: &Group) -> Envelope {
    Envelope::new(MessageKind::GroupCreated, json!({ "group": group })).with_session(session_id)
}

pub fn group_updated(session_id: &str, group: &Group) -> Envelope {
    Envelope::new(MessageKind::GroupUpdated, json!({ "group": group })).with_session(session_id)
}

pub fn group_deleted(session_id: &str, group_id: &str) -> Envelope {
    Envelope::new(MessageKind::GroupDeleted, json!({ "groupId": group_id }))
        .with_session(session_id)
}

pub fn group_broadcast_sent(
    session_id: &str,
    group_id: &str,
    devices_reached: usize,
    total_devices: usize,
) -> Envelope {
    Envelope::new(
        MessageKind::GroupBroadcastSent,
        json!({
            "groupId": group_id,
            "devicesReached": devices_reached,
            "totalDevices": total_devices,
        }),
    )
    .with_session(session_id)
}

pub fn session_invitation(invitation: Value) -> Envelope {
    Envelope::new(MessageKind::SessionInvitation, json!({ "invitation": invitation }))
}

pub fn invitation_sent(
    target_identifier: &str,
    target_username: &str,
    target_device_name: &str,
) -> Envelope {
    Envelope::new(
        MessageKind::InvitationSent,
        json!({
            "targetIdentifier": target_identifier,
            "targetUsername": target_username,
            "targetDeviceName": target_device_name,
        }),
    )
}

pub fn invitation_response(session_id: &str, payload: Value) -> Envelope {
    Envelope::new(MessageKind::InvitationResponse, payload).with_session(session_id)
}

pub fn nearby_session_broadcast(session: &Session, online_count: usize) -> Envelope {
    let creator = session.devices.get(&session.created_by);
    Envelope::new(
        MessageKind::NearbySessionBroadcast,
        json!({
            "nearbySession": {
                "sessionId": session.id,
                "sessionCode": session.code,
                "creatorUsername": creator.map(|m| m.username.as_str()).unwrap_or_default(),
                "creatorDeviceName": creator.map(|m| m.name.as_str()).unwrap_or_default(),
                "deviceCount": online_count,
            }
        }),
    )
    .with_session(&session.id)
}

pub fn nearby_broadcast_sent(notifications_sent: usize) -> Envelope {
    Envelope::new(
        MessageKind::NearbyBroadcastSent,
        json!({ "notificationsSent": notifications_sent }),
    )
}

pub fn error_frame(message: &str) -> Envelope {
    Envelope::new(MessageKind::Error, json!({ "message": message }))
}
