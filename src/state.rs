use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::info;

use crate::{
    error::{AppErr, AppResult},
    protocol::Outbound,
    room::{MemberId, Room},
    utils::token,
};

pub const NAME_TAKEN: &str = "Sorry, that username is already taken";

/* ------------ issued, not yet redeemed ------------ */
#[derive(Debug)]
pub struct PendingSession {
    pub room:     Arc<Room>,
    pub member:   MemberId,
    pub username: String,
    pub outbound: mpsc::Receiver<Outbound>,
    pub shutdown: oneshot::Receiver<()>,
    issued_at:    Instant,
}

#[cfg(test)]
impl PendingSession {
    pub(crate) fn for_test(
        room: Arc<Room>,
        member: MemberId,
        username: &str,
        outbound: mpsc::Receiver<Outbound>,
        shutdown: oneshot::Receiver<()>,
    ) -> Self {
        let username = username.to_owned();
        Self { room, member, username, outbound, shutdown, issued_at: Instant::now() }
    }
}

/* ------------ rooms + tokens ------------ */
pub struct RoomRegistry {
    rooms:             RwLock<HashMap<String, Arc<Room>>>,
    sessions:          Mutex<HashMap<String, PendingSession>>,
    outbound_capacity: usize,
}
pub type SharedRegistry = Arc<RoomRegistry>;

impl RoomRegistry {
    pub fn new(outbound_capacity: usize) -> Self {
        Self {
            rooms: RwLock::default(),
            sessions: Mutex::default(),
            outbound_capacity,
        }
    }

    pub async fn create_or_fetch_room(&self, name: &str) -> Arc<Room> {
        if let Some(room) = self.rooms.read().await.get(name) {
            return room.clone();
        }
        self.rooms
            .write()
            .await
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(Room::new(name, self.outbound_capacity)))
            .clone()
    }

    pub async fn room_has_member(&self, name: &str, username: &str) -> bool {
        let room = self.rooms.read().await.get(name).cloned();
        match room {
            Some(room) => room.has_member(username).await,
            None => false,
        }
    }

    /// Reserves `username` in `room` and returns a single-use token.
    pub async fn issue_token(&self, room: &str, username: &str) -> AppResult<String> {
        let room = self.create_or_fetch_room(room).await;
        let reservation = room
            .reserve(username)
            .await
            .ok_or_else(|| AppErr::Conflict(NAME_TAKEN.into()))?;

        let token = token::mint();
        info!(room = %room.name(), user = %username, "token issued");
        self.sessions.lock().await.insert(
            token.clone(),
            PendingSession {
                room,
                member: reservation.member,
                username: username.to_owned(),
                outbound: reservation.outbound,
                shutdown: reservation.shutdown,
                issued_at: Instant::now(),
            },
        );
        Ok(token)
    }

    pub async fn knows_token(&self, token: &str) -> bool {
        self.sessions.lock().await.contains_key(token)
    }

    pub async fn redeem(&self, token: &str) -> AppResult<PendingSession> {
        self.sessions.lock().await.remove(token).ok_or(AppErr::Unauthorized)
    }

    /// Drops tokens older than `ttl` and releases their names.
    pub async fn purge_expired(&self, ttl: Duration) -> usize {
        let expired: Vec<PendingSession> = {
            let mut sessions = self.sessions.lock().await;
            let stale: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.issued_at.elapsed() >= ttl)
                .map(|(t, _)| t.clone())
                .collect();
            stale.iter().filter_map(|t| sessions.remove(t)).collect()
        };
        for s in &expired {
            s.room.detach(s.member).await;
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rooms_are_created_once() {
        let reg = RoomRegistry::new(8);
        let a = reg.create_or_fetch_room("standup").await;
        let b = reg.create_or_fetch_room("standup").await;
        let c = reg.create_or_fetch_room("retro").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.name(), "retro");
    }

    #[tokio::test]
    async fn duplicate_name_is_a_conflict() {
        let reg = RoomRegistry::new(8);
        assert!(!reg.room_has_member("standup", "alice").await);
        reg.issue_token("standup", "alice").await.unwrap();
        assert!(reg.room_has_member("standup", "alice").await);

        let err = reg.issue_token("standup", "alice").await.unwrap_err();
        assert!(matches!(err, AppErr::Conflict(ref m) if m == NAME_TAKEN));
        assert_eq!(reg.sessions.lock().await.len(), 1);

        // other rooms are independent
        reg.issue_token("retro", "alice").await.unwrap();
    }

    #[tokio::test]
    async fn tokens_redeem_once() {
        let reg = RoomRegistry::new(8);
        let token = reg.issue_token("standup", "alice").await.unwrap();
        assert!(reg.knows_token(&token).await);
        let session = reg.redeem(&token).await.unwrap();
        assert!(!reg.knows_token(&token).await);
        assert_eq!(session.username, "alice");
        assert_eq!(session.room.name(), "standup");
        assert!(matches!(reg.redeem(&token).await, Err(AppErr::Unauthorized)));
        assert!(matches!(reg.redeem("nope").await, Err(AppErr::Unauthorized)));
    }

    #[tokio::test]
    async fn expired_tokens_release_the_name() {
        let reg = RoomRegistry::new(8);
        let token = reg.issue_token("standup", "alice").await.unwrap();
        assert_eq!(reg.purge_expired(Duration::from_secs(3600)).await, 0);
        assert_eq!(reg.purge_expired(Duration::ZERO).await, 1);
        assert!(!reg.room_has_member("standup", "alice").await);
        assert!(matches!(reg.redeem(&token).await, Err(AppErr::Unauthorized)));
        reg.issue_token("standup", "alice").await.unwrap();
    }
}
