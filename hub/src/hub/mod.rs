//! The signaling and relay hub. One `Hub` instance owns all in-memory state
//! behind a single coarse lock; connections feed it frames and receive their
//! outbound traffic through per-connection unbounded queues, so no handler
//! ever blocks on a slow peer socket.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures_util::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::error::HubError;
use crate::protocol::{self, Envelope, MessageKind};

pub mod control;
pub mod directory;
pub mod intents;
pub mod invitations;
pub mod router;
pub mod sessions;
pub mod signalling;
pub mod sweeper;

use crate::models::{ConnectionId, ConnectionTx};
use directory::DeviceDirectory;
use sessions::SessionStore;

/// Everything mutable, guarded together. Handlers take the write guard,
/// mutate, and queue outbound frames before releasing it; queueing is a
/// non-blocking push.
#[derive(Debug, Default)]
pub struct HubState {
    pub sessions: SessionStore,
    pub directory: DeviceDirectory,
}

impl HubState {
    pub fn new() -> Self {
        HubState::default()
    }
}

/// Per-connection context threaded through dispatch. `device_id` is bound by
/// the first register/create/join this connection performs.
pub struct ConnCtx {
    pub id: ConnectionId,
    pub tx: ConnectionTx,
    pub device_id: Option<String>,
}

impl ConnCtx {
    pub fn send(&self, envelope: &Envelope) {
        let _ = self.tx.send(envelope.encode());
    }
}

pub(crate) fn require_session(envelope: &Envelope) -> Result<&str, HubError> {
    envelope
        .session_id
        .as_deref()
        .ok_or_else(|| HubError::BadPayload("missing field `sessionId`".to_string()))
}

pub(crate) fn require_device(ctx: &ConnCtx, envelope: &Envelope) -> Result<String, HubError> {
    envelope
        .device_id
        .clone()
        .or_else(|| ctx.device_id.clone())
        .ok_or_else(|| HubError::BadPayload("missing field `deviceId`".to_string()))
}

pub struct Hub {
    state: RwLock<HubState>,
    config: HubConfig,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Hub {
            state: RwLock::new(HubState::new()),
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, HubState> {
        self.state.read().await
    }

    /// Run one expiry/grace sweep against the current wall clock.
    pub async fn sweep(&self) {
        let mut state = self.state.write().await;
        sweeper::sweep(&mut state, Utc::now(), self.config.entry_grace());
    }

    /// Drive one accepted WebSocket for its whole life: forwarder task for
    /// the outbound queue, heartbeat, frame dispatch, then the disconnect
    /// flow once the socket goes away.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let mut send_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let mut ctx = ConnCtx {
            id: Uuid::new_v4(),
            tx,
            device_id: None,
        };
        debug!(conn = %ctx.id, "connection open");

        let period = self.config.heartbeat_interval();
        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut missed: u8 = 0;

        loop {
            tokio::select! {
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            missed = 0;
                            if let Some(session_id) = self.dispatch(&mut ctx, &text).await {
                                Hub::schedule_nearby_broadcast(Arc::clone(&self), session_id);
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                            missed = 0;
                        }
                        Some(Ok(Message::Binary(_))) => {
                            missed = 0;
                            ctx.send(&protocol::error_frame("Invalid message format"));
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            error!(conn = %ctx.id, "websocket error: {e}");
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if missed >= 2 {
                        info!(conn = %ctx.id, device = ?ctx.device_id, "two heartbeats missed, closing");
                        let _ = ctx.tx.send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "".into(),
                        })));
                        break;
                    }
                    missed += 1;
                    let _ = ctx.tx.send(Message::Ping(Vec::new()));
                }
                _ = &mut send_task => break,
            }
        }

        {
            let mut state = self.state.write().await;
            control::disconnect(&mut state, &ctx, Utc::now());
        }
        send_task.abort();
        debug!(conn = %ctx.id, device = ?ctx.device_id, "connection closed");
    }

    /// Flat dispatch on the envelope `type`. Validation failures become an
    /// `error` frame back on the same connection; the connection stays open.
    /// Returns the session id when a create succeeded, so the caller can
    /// schedule the delayed nearby announcement.
    async fn dispatch(&self, ctx: &mut ConnCtx, text: &str) -> Option<String> {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(conn = %ctx.id, "undecodable frame");
                ctx.send(&protocol::error_frame(&e.to_string()));
                return None;
            }
        };
        let now = Utc::now();
        let mut created_session = None;

        let result = match envelope.kind {
            MessageKind::DeviceRegister => {
                let mut state = self.state.write().await;
                control::device_register(&mut state, ctx, &envelope, now)
            }
            MessageKind::SessionCreate => {
                let mut state = self.state.write().await;
                control::session_create(&mut state, ctx, &envelope, now, self.config.session_ttl())
                    .map(|session_id| created_session = Some(session_id))
            }
            MessageKind::SessionJoin => {
                let mut state = self.state.write().await;
                control::session_join(&mut state, ctx, &envelope, now)
            }
            MessageKind::SessionLeave => {
                let mut state = self.state.write().await;
                control::session_leave(&mut state, &envelope, now)
            }
            MessageKind::WebrtcOffer
            | MessageKind::WebrtcAnswer
            | MessageKind::WebrtcIceCandidate => {
                let mut state = self.state.write().await;
                signalling::relay(&mut state, ctx, &envelope)
            }
            MessageKind::IntentSend => {
                let mut state = self.state.write().await;
                intents::intent_send(&mut state, ctx, &envelope)
            }
            MessageKind::ClipboardBroadcast => {
                let mut state = self.state.write().await;
                intents::clipboard_broadcast(&mut state, ctx, &envelope)
            }
            MessageKind::DeviceStatusUpdate => {
                let mut state = self.state.write().await;
                intents::device_status_update(&mut state, ctx, &envelope, now)
            }
            MessageKind::GroupCreate => {
                let mut state = self.state.write().await;
                intents::group_create(&mut state, ctx, &envelope, now)
            }
            MessageKind::GroupUpdate => {
                let mut state = self.state.write().await;
                intents::group_update(&mut state, ctx, &envelope)
            }
            MessageKind::GroupDelete => {
                let mut state = self.state.write().await;
                intents::group_delete(&mut state, ctx, &envelope)
            }
            MessageKind::GroupBroadcast => {
                let mut state = self.state.write().await;
                intents::group_broadcast(&mut state, ctx, &envelope)
            }
            MessageKind::SessionInvitation => {
                let mut state = self.state.write().await;
                invitations::session_invitation(&mut state, ctx, &envelope)
            }
            MessageKind::InvitationResponse => {
                let mut state = self.state.write().await;
                invitations::invitation_response(&mut state, &envelope)
            }
            MessageKind::NearbySessionBroadcast => {
                let mut state = self.state.write().await;
                invitations::nearby_request(&mut state, ctx, &envelope)
            }
            // Server-to-client kinds arriving inbound are protocol misuse.
            _ => Err(HubError::InvalidFormat),
        };

        if let Err(e) = result {
            debug!(conn = %ctx.id, kind = ?envelope.kind, "handler rejected frame: {e}");
            ctx.send(&protocol::error_frame(&e.to_string()));
        }
        created_session
    }

    /// Late listeners still hear about a brand-new session: re-announce it
    /// roughly a second after `session_created` went out.
    fn schedule_nearby_broadcast(hub: Arc<Hub>, session_id: String) {
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            let mut state = hub.state.write().await;
            match invitations::broadcast_nearby(&mut state, &session_id, None) {
                Ok(count) => {
                    debug!(session_id = %session_id, count, "auto nearby broadcast")
                }
                Err(_) => debug!(session_id = %session_id, "session gone before auto broadcast"),
            }
        });
    }
}


#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::models::{DeviceKind, DeviceMembership, SessionId};

    pub struct TestRx {
        pub raw: mpsc::UnboundedReceiver<Message>,
    }

    pub fn state() -> HubState {
        HubState::new()
    }

    pub fn connect() -> (ConnCtx, TestRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnCtx {
                id: Uuid::new_v4(),
                tx,
                device_id: None,
            },
            TestRx { raw: rx },
        )
    }

    /// Decoded text frames currently queued on a connection.
    pub fn drain(rx: &mut TestRx) -> Vec<Envelope> {
        drain_raw(rx)
            .into_iter()
            .filter_map(|msg| match msg {
                Message::Text(text) => Envelope::decode(&text).ok(),
                _ => None,
            })
            .collect()
    }

    pub fn drain_raw(rx: &mut TestRx) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.raw.try_recv() {
            out.push(msg);
        }
        out
    }

    pub fn register_frame(device_id: &str, username: &str) -> Envelope {
        Envelope::new(
            MessageKind::DeviceRegister,
            serde_json::json!({
                "deviceId": device_id,
                "deviceName": format!("{device_id}-name"),
                "deviceType": "laptop",
                "username": username,
            }),
        )
    }

    /// Register a device in the directory with one live fake connection.
    pub fn attach_device(
        state: &mut HubState,
        device_id: &str,
        username: &str,
    ) -> (TestRx, ConnectionId) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = Uuid::new_v4();
        state.directory.register(
            device_id,
            &format!("{device_id}-name"),
            username,
            DeviceKind::Laptop,
            conn_id,
            tx,
            Utc::now(),
        );
        (TestRx { raw: rx }, conn_id)
    }

    /// Create a session owned by `owner` with the given extra members, all
    /// online. Devices must already be in the directory.
    pub fn make_session(state: &mut HubState, owner: &str, members: &[&str]) -> SessionId {
        let now = Utc::now();
        let owner_member =
            DeviceMembership::new(owner, format!("{owner}-name"), "owner", DeviceKind::Laptop, now);
        let session_id = state
            .sessions
            .create(owner_member, now, chrono::Duration::hours(1))
            .id
            .clone();
        for member in members {
            let m = DeviceMembership::new(
                *member,
                format!("{member}-name"),
                "member",
                DeviceKind::Phone,
                now,
            );
            state.sessions.add_member(&session_id, m);
        }
        for device in std::iter::once(owner).chain(members.iter().copied()) {
            if let Some(entry) = state.directory.get_mut(device) {
                entry.session_id = Some(session_id.clone());
            }
        }
        session_id
    }
}
