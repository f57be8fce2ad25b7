use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use crate::models::{DeviceId, DeviceMembership, Group, Session, SessionId, GROUP_COLORS};

/// Owns all live [`Session`] records plus the code→id index. Codes are only
/// indexed while the session lives; an expired session's code is purged the
/// moment the session is removed, so expired and never-issued codes are
/// indistinguishable to clients.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<SessionId, Session>,
    codes: HashMap<String, SessionId>,
}

impl SessionStore {
    pub fn new() -> Self {
        SessionStore::default()
    }

    /// Create a session owned by `owner`, with a fresh unguessable id and a
    /// 6-digit code checked for collision against every live session.
    pub fn create(
        &mut self,
        owner: DeviceMembership,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> &Session {
        let id = Uuid::new_v4().to_string();
        let code = self.fresh_code();
        let owner_id = owner.id.clone();

        let session = Session {
            id: id.clone(),
            code: code.clone(),
            created_by: owner_id.clone(),
            created_at: now,
            expires_at: now + ttl,
            devices: HashMap::from([(owner_id.clone(), owner)]),
            groups: HashMap::new(),
        };

        self.codes.insert(code.clone(), id.clone());
        info!(session_id = %id, %code, owner = %owner_id, "session created");
        self.sessions.entry(id).or_insert(session)
    }

    fn fresh_code(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let code = format!("{:06}", rng.gen_range(0..1_000_000));
            if !self.codes.contains_key(&code) {
                return code;
            }
        }
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(session_id)
    }

    pub fn find_by_code(&self, code: &str) -> Option<&Session> {
        self.codes.get(code).and_then(|id| self.sessions.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Add or refresh a membership. Re-joining with a known `deviceId` marks
    /// the member online and refreshes `lastSeen` but keeps the original
    /// `joinedAt`.
    pub fn add_member(&mut self, session_id: &str, member: DeviceMembership) {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };
        match session.devices.entry(member.id.clone()) {
            Entry::Occupied(mut existing) => {
                let current = existing.get_mut();
                current.online = true;
                current.last_seen = member.last_seen;
                current.name = member.name;
                current.username = member.username;
                current.kind = member.kind;
            }
            Entry::Vacant(slot) => {
                slot.insert(member);
            }
        }
    }

    /// Mark a member offline but keep the record so a quick reconnect
    /// restores its state.
    pub fn mark_offline(&mut self, session_id: &str, device_id: &str, now: DateTime<Utc>) {
        if let Some(member) = self
            .sessions
            .get_mut(session_id)
            .and_then(|s| s.devices.get_mut(device_id))
        {
            member.online = false;
            member.last_seen = now;
        }
    }

    /// Delete a session, returning it so the caller can notify members and
    /// detach their directory entries. Purges the code index immediately.
    pub fn remove(&mut self, session_id: &str) -> Option<Session> {
        let session = self.sessions.remove(session_id)?;
        self.codes.remove(&session.code);
        info!(session_id = %session.id, code = %session.code, "session removed");
        Some(session)
    }

    /// Insert a new group, assigning a palette color when none was given.
    pub fn add_group(
        &mut self,
        session_id: &str,
        name: String,
        created_by: DeviceId,
        device_ids: Vec<DeviceId>,
        color: Option<String>,
        now: DateTime<Utc>,
    ) -> Option<&Group> {
        let session = self.sessions.get_mut(session_id)?;
        let id = Uuid::new_v4().to_string();
        let color = color
            .unwrap_or_else(|| GROUP_COLORS[session.groups.len() % GROUP_COLORS.len()].to_string());
        let group = Group {
            id: id.clone(),
            name,
            created_by,
            created_at: now,
            color,
            device_ids,
        };
        session.groups.insert(id.clone(), group);
        session.groups.get(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceKind;

    fn member(id: &str, now: DateTime<Utc>) -> DeviceMembership {
        DeviceMembership::new(id, format!("{id}-name"), "alice", DeviceKind::Laptop, now)
    }

    #[test]
    fn test_codes_unique_across_live_sessions() {
        let mut store = SessionStore::new();
        let now = Utc::now();
        let ttl = Duration::hours(1);
        let mut codes = std::collections::HashSet::new();
        for i in 0..50 {
            let s = store.create(member(&format!("dev-{i}"), now), now, ttl);
            assert_eq!(s.code.len(), 6);
            assert!(s.code.chars().all(|c| c.is_ascii_digit()));
            assert!(codes.insert(s.code.clone()), "duplicate code issued");
        }
    }

    #[test]
    fn test_create_sets_expiry_and_owner() {
        let mut store = SessionStore::new();
        let now = Utc::now();
        let session = store.create(member("dev-a", now), now, Duration::hours(1));
        assert_eq!(session.created_by, "dev-a");
        assert_eq!(session.expires_at, now + Duration::hours(1));
        assert_eq!(session.devices.len(), 1);
    }

    #[test]
    fn test_add_member_is_idempotent() {
        let mut store = SessionStore::new();
        let joined = Utc::now();
        let session_id = store
            .create(member("dev-a", joined), joined, Duration::hours(1))
            .id
            .clone();

        store.add_member(&session_id, member("dev-b", joined));
        store.mark_offline(&session_id, "dev-b", joined);

        let rejoined = joined + Duration::seconds(90);
        store.add_member(&session_id, member("dev-b", rejoined));

        let session = store.get(&session_id).unwrap();
        assert_eq!(session.devices.len(), 2);
        let b = &session.devices["dev-b"];
        assert!(b.online);
        assert_eq!(b.joined_at, joined, "joinedAt must survive a re-join");
        assert_eq!(b.last_seen, rejoined);
    }

    #[test]
    fn test_remove_purges_code_index() {
        let mut store = SessionStore::new();
        let now = Utc::now();
        let session = store.create(member("dev-a", now), now, Duration::hours(1));
        let (id, code) = (session.id.clone(), session.code.clone());

        assert!(store.find_by_code(&code).is_some());
        store.remove(&id).unwrap();
        assert!(store.find_by_code(&code).is_none());
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn test_group_palette_assignment() {
        let mut store = SessionStore::new();
        let now = Utc::now();
        let session_id = store
            .create(member("dev-a", now), now, Duration::hours(1))
            .id
            .clone();

        let first = store
            .add_group(&session_id, "g1".into(), "dev-a".into(), vec![], None, now)
            .unwrap()
            .color
            .clone();
        let second = store
            .add_group(&session_id, "g2".into(), "dev-a".into(), vec![], None, now)
            .unwrap()
            .color
            .clone();
        assert_eq!(first, GROUP_COLORS[0]);
        assert_eq!(second, GROUP_COLORS[1]);

        let explicit = store
            .add_group(
                &session_id,
                "g3".into(),
                "dev-a".into(),
                vec![],
                Some("#000000".into()),
                now,
            )
            .unwrap();
        assert_eq!(explicit.color, "#000000");
    }
}
