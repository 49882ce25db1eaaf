//! Room engine: per-priority queues, member set and broadcast fan-out.
//!
//! All state lives in [`RoomState`] behind one mutex. Fan-out only ever uses
//! `try_send`, so the lock is never held across a wait on a peer. Members
//! whose buffer is full are collected during a broadcast and detached after
//! the lock is released (see [`Room::reap`]).
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{AppErr, AppResult},
    protocol::{BroadcastMessage, Intent, Outbound},
};

pub const MIN_PRIORITY: u8 = 0;
pub const MAX_PRIORITY: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberId(Uuid);

impl MemberId {
    fn new() -> Self { Self(Uuid::new_v4()) }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}

/* ------------ PriorityQueue ------------ */

/// FIFO of members waiting at one priority. No duplicates.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    entries: Vec<MemberId>,
}

impl PriorityQueue {
    pub fn contains(&self, id: MemberId) -> bool {
        self.entries.contains(&id)
    }

    /// Appends at the tail; `false` if already queued.
    pub fn push(&mut self, id: MemberId) -> bool {
        if self.contains(id) {
            return false;
        }
        self.entries.push(id);
        true
    }

    /// Removes keeping the order of the others; `false` if absent.
    pub fn remove(&mut self, id: MemberId) -> bool {
        match self.entries.iter().position(|e| *e == id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemberId> {
        self.entries.iter()
    }
}

/* ------------ Member ------------ */

/// Pending: token issued, no socket. Live: pumps running.
/// A detached member is simply gone from the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Pending,
    Live,
}

#[derive(Debug)]
struct Member {
    name: String,
    state: MemberState,
    outbound: mpsc::Sender<Outbound>,
    // Fired on detach; the writer closes the socket without draining.
    shutdown: oneshot::Sender<()>,
}

impl Member {
    fn deliver(&self, payload: &Outbound) -> bool {
        match self.outbound.try_send(payload.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(user = %self.name, "outbound buffer full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(user = %self.name, "outbound buffer closed");
                false
            }
        }
    }
}

/// Handed to whoever will drive the member's connection.
#[derive(Debug)]
pub struct Reservation {
    pub member: MemberId,
    pub outbound: mpsc::Receiver<Outbound>,
    pub shutdown: oneshot::Receiver<()>,
}

/// Result of tearing a member out of the room.
#[derive(Debug)]
struct Detached {
    name: String,
    priorities: Vec<u8>,
    overflowed: Vec<MemberId>,
}

/* ------------ RoomState ------------ */

#[derive(Debug)]
struct RoomState {
    members: HashMap<MemberId, Member>,
    queues: BTreeMap<u8, PriorityQueue>,
}

impl RoomState {
    fn new() -> Self {
        Self {
            members: HashMap::new(),
            queues: (MIN_PRIORITY..=MAX_PRIORITY)
                .map(|p| (p, PriorityQueue::default()))
                .collect(),
        }
    }

    fn has_member(&self, username: &str) -> bool {
        self.members.values().any(|m| m.name == username)
    }

    fn reserve(&mut self, username: &str, capacity: usize) -> Option<Reservation> {
        if self.has_member(username) {
            return None;
        }
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (stop, shutdown) = oneshot::channel();
        let id = MemberId::new();
        self.members.insert(
            id,
            Member {
                name: username.to_owned(),
                state: MemberState::Pending,
                outbound: tx,
                shutdown: stop,
            },
        );
        Some(Reservation { member: id, outbound: rx, shutdown })
    }

    fn add_to_priority(&mut self, id: MemberId, priority: u8) -> bool {
        self.queues.get_mut(&priority).is_some_and(|q| q.push(id))
    }

    fn remove_from_priority(&mut self, id: MemberId, priority: u8) -> bool {
        self.queues.get_mut(&priority).is_some_and(|q| q.remove(id))
    }

    /// Returns the members whose buffer could not take the event.
    fn broadcast(&self, event: &BroadcastMessage) -> Vec<MemberId> {
        let payload = match event.encode() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to encode broadcast");
                return Vec::new();
            }
        };
        self.members
            .iter()
            .filter(|(_, m)| m.state == MemberState::Live)
            .filter(|(_, m)| !m.deliver(&payload))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Sends `target` one join event per queued (priority, member) pair.
    /// `false` if the target's buffer overflowed.
    fn replay_state(&self, target: MemberId) -> bool {
        let Some(viewer) = self.members.get(&target) else {
            return false;
        };
        for (&priority, queue) in &self.queues {
            for queued in queue.iter() {
                let Some(author) = self.members.get(queued) else { continue };
                let payload = match BroadcastMessage::joined(&author.name, priority).encode() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "failed to encode replay");
                        continue;
                    }
                };
                if !viewer.deliver(&payload) {
                    return false;
                }
            }
        }
        true
    }

    fn attach(&mut self, id: MemberId) -> AppResult<Vec<MemberId>> {
        let member = self.members.get_mut(&id).ok_or(AppErr::Unauthorized)?;
        if member.state != MemberState::Pending {
            return Err(AppErr::Unauthorized);
        }
        member.state = MemberState::Live;
        Ok(if self.replay_state(id) { Vec::new() } else { vec![id] })
    }

    fn apply(&mut self, id: MemberId, intent: Intent) -> Vec<MemberId> {
        let Some(member) = self.members.get(&id).filter(|m| m.state == MemberState::Live) else {
            return Vec::new();
        };
        let username = member.name.clone();
        let changed = if intent.cancel {
            self.remove_from_priority(id, intent.priority)
        } else {
            self.add_to_priority(id, intent.priority)
        };
        if !changed {
            debug!(user = %username, priority = intent.priority, cancel = intent.cancel, "no-op intent");
            return Vec::new();
        }
        self.broadcast(&BroadcastMessage { username, priority: intent.priority, cancel: intent.cancel })
    }

    fn detach(&mut self, id: MemberId) -> Option<Detached> {
        let mut priorities = Vec::new();
        for (&priority, queue) in self.queues.iter_mut() {
            if queue.remove(id) {
                priorities.push(priority);
            }
        }
        let member = self.members.remove(&id)?;
        let _ = member.shutdown.send(());
        let mut overflowed = Vec::new();
        for &priority in &priorities {
            overflowed.extend(self.broadcast(&BroadcastMessage::left(&member.name, priority)));
        }
        Some(Detached { name: member.name, priorities, overflowed })
    }
}

/* ------------ Room ------------ */

#[derive(Debug)]
pub struct Room {
    name: String,
    outbound_capacity: usize,
    state: Mutex<RoomState>,
}

impl Room {
    pub fn new(name: impl Into<String>, outbound_capacity: usize) -> Self {
        Self { name: name.into(), outbound_capacity, state: Mutex::new(RoomState::new()) }
    }

    pub fn name(&self) -> &str { &self.name }

    pub async fn has_member(&self, username: &str) -> bool {
        self.state.lock().await.has_member(username)
    }

    /// Checks the name and creates a pending member in one critical section.
    pub async fn reserve(&self, username: &str) -> Option<Reservation> {
        self.state.lock().await.reserve(username, self.outbound_capacity)
    }

    /// Marks the member live and replays the current queues to it alone.
    pub async fn attach(&self, id: MemberId) -> AppResult<()> {
        let dead = self.state.lock().await.attach(id)?;
        self.reap(dead).await;
        Ok(())
    }

    /// Applies a join/leave and broadcasts it if anything changed.
    pub async fn submit(&self, id: MemberId, intent: Intent) {
        let dead = self.state.lock().await.apply(id, intent);
        self.reap(dead).await;
    }

    /// Terminal removal. Safe to call more than once.
    pub async fn detach(&self, id: MemberId) {
        self.reap(vec![id]).await;
    }

    // Detaches run one at a time, each under its own lock acquisition, never
    // from inside the section that found the overflow.
    async fn reap(&self, mut dead: Vec<MemberId>) {
        while let Some(id) = dead.pop() {
            let Some(gone) = self.state.lock().await.detach(id) else { continue };
            info!(room = %self.name, user = %gone.name, priorities = ?gone.priorities, "member detached");
            dead.extend(gone.overflowed);
        }
    }

    #[cfg(test)]
    pub(crate) async fn queue(&self, priority: u8) -> Vec<String> {
        let st = self.state.lock().await;
        st.queues
            .get(&priority)
            .map(|q| q.iter().filter_map(|id| st.members.get(id)).map(|m| m.name.clone()).collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) async fn member_state(&self, id: MemberId) -> Option<MemberState> {
        self.state.lock().await.members.get(&id).map(|m| m.state)
    }
}
