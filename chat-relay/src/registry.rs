use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::{
    error::{ConnectError, RouteError},
    protocol::{Action, SystemMessage},
    session::{Session, SessionId},
};

/// Session table and room table behind a single lock, so a move between
/// rooms is never observable half-done.
pub struct Registry {
    tables: Mutex<Tables>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<SessionId, Session>,
    // Invariant: no empty member sets.
    rooms: BTreeMap<String, BTreeSet<SessionId>>,
    closed: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers a session with no room and queues its `connection` message.
    /// Refused once [`Registry::shutdown`] has run.
    pub async fn connect(
        &self,
        outbound: mpsc::Sender<SystemMessage>,
    ) -> Result<SessionId, ConnectError> {
        let mut tables = self.tables.lock().await;
        if tables.closed {
            return Err(ConnectError::ShuttingDown);
        }

        let id = SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut session = Session::new(outbound);
        session.deliver(id, SystemMessage::new(Action::Connection).with_user(id));
        tables.sessions.insert(id, session);
        Ok(id)
    }

    /// Leaves the current room (notifying the rest of it) and drops the
    /// session's outbound handle. Returns `false` if the session was already
    /// gone.
    pub async fn disconnect(&self, id: SessionId) -> bool {
        let mut tables = self.tables.lock().await;
        if !tables.sessions.contains_key(&id) {
            return false;
        }
        if let Some((room, remaining)) = tables.remove_from_room(id) {
            tables.announce_departure(id, &room, &remaining);
        }
        if let Some(session) = tables.sessions.remove(&id) {
            if session.dropped() > 0 {
                warn!(
                    session = %id,
                    dropped = session.dropped(),
                    "session lost outbound messages"
                );
            }
        }
        true
    }

    /// Moves the session into `room`, creating it if needed. Returns the
    /// member list after the join.
    pub async fn join(&self, id: SessionId, room: &str) -> Result<Vec<SessionId>, RouteError> {
        let mut tables = self.tables.lock().await;

        if tables.room_of(id)?.as_deref() == Some(room) {
            let members = tables.members(room);
            tables.deliver(id, join_notice(room, id, &members));
            return Ok(members);
        }

        if let Some((previous, remaining)) = tables.remove_from_room(id) {
            tables.announce_departure(id, &previous, &remaining);
        }

        let members = tables.rooms.entry(room.to_string()).or_default();
        if members.is_empty() {
            debug!(%room, "room created");
        }
        members.insert(id);
        if let Some(session) = tables.sessions.get_mut(&id) {
            session.room = Some(room.to_string());
        }

        let members = tables.members(room);
        let notice = join_notice(room, id, &members);
        for member in &members {
            tables.deliver(*member, notice.clone());
        }
        Ok(members)
    }

    /// Removes the session from its room. Returns the room it left.
    pub async fn leave(&self, id: SessionId) -> Result<String, RouteError> {
        let mut tables = self.tables.lock().await;
        tables.ensure(id)?;
        let (room, remaining) = tables.remove_from_room(id).ok_or(RouteError::NotInRoom)?;

        tables.deliver(id, leave_notice(&room, id, &remaining));
        tables.announce_departure(id, &room, &remaining);
        Ok(room)
    }

    /// Delivers `body` to `target` and echoes it back to the sender. The two
    /// sessions need not share a room.
    pub async fn direct_message(
        &self,
        sender: SessionId,
        target: &str,
        body: String,
    ) -> Result<SessionId, RouteError> {
        let mut tables = self.tables.lock().await;
        tables.ensure(sender)?;

        let target_id = target
            .parse::<SessionId>()
            .ok()
            // Only the canonical rendering names a session ("07" does not).
            .filter(|id| id.to_string() == target && tables.sessions.contains_key(id))
            .ok_or_else(|| RouteError::TargetNotFound(target.to_string()))?;

        let delivery = SystemMessage::new(Action::PrivateMessage)
            .with_user(sender)
            .with_message(body.clone());
        tables.deliver(target_id, delivery);

        let echo = SystemMessage::new(Action::PrivateMessage)
            .with_user(target_id)
            .with_message(body);
        tables.deliver(sender, echo);

        Ok(target_id)
    }

    /// Fans `body` out to everyone else in the sender's room, then confirms
    /// to the sender. Returns the room the message went to.
    pub async fn room_message(
        &self,
        sender: SessionId,
        body: String,
    ) -> Result<String, RouteError> {
        let mut tables = self.tables.lock().await;
        let room = tables.room_of(sender)?.ok_or(RouteError::NotInRoom)?;

        let broadcast = SystemMessage::new(Action::RoomMessage)
            .with_room(&room)
            .with_user(sender)
            .with_message(body.clone());
        let delivered = tables.fan_out(&room, sender, &broadcast);

        let confirmation = SystemMessage::new(Action::RoomMessage)
            .with_room(&room)
            .with_message(body);
        tables.deliver(sender, confirmation);

        debug!(%sender, %room, delivered, "room message delivered");
        Ok(room)
    }

    pub async fn rooms(&self) -> Vec<String> {
        self.tables.lock().await.rooms.keys().cloned().collect()
    }

    pub async fn participants(&self, room: &str) -> Result<Vec<SessionId>, RouteError> {
        let tables = self.tables.lock().await;
        if !tables.rooms.contains_key(room) {
            return Err(RouteError::RoomNotFound(room.to_string()));
        }
        Ok(tables.members(room))
    }

    pub async fn room_of(&self, id: SessionId) -> Option<String> {
        self.tables.lock().await.room_of(id).ok().flatten()
    }

    pub async fn is_connected(&self, id: SessionId) -> bool {
        self.tables.lock().await.sessions.contains_key(&id)
    }

    pub async fn session_count(&self) -> usize {
        self.tables.lock().await.sessions.len()
    }

    /// Queues one message for a session. Returns `false` if the session is
    /// unknown or its queue refused the message.
    pub async fn send(&self, id: SessionId, message: SystemMessage) -> bool {
        self.tables.lock().await.deliver(id, message)
    }

    /// Sends `notice` to every session, empties both tables, and refuses
    /// further connects. Session tasks that disconnect afterwards find
    /// nothing left to clean up.
    pub async fn shutdown(&self, notice: &str) -> usize {
        let mut tables = self.tables.lock().await;
        tables.closed = true;
        tables.rooms.clear();
        let sessions = std::mem::take(&mut tables.sessions);
        let count = sessions.len();
        for (id, mut session) in sessions {
            session.deliver(id, SystemMessage::error(notice));
        }
        count
    }

    #[cfg(test)]
    async fn assert_consistent(&self) {
        self.tables.lock().await.assert_consistent();
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Tables {
    fn ensure(&self, id: SessionId) -> Result<(), RouteError> {
        if self.sessions.contains_key(&id) {
            Ok(())
        } else {
            Err(RouteError::UnknownSession(id))
        }
    }

    fn room_of(&self, id: SessionId) -> Result<Option<String>, RouteError> {
        self.sessions
            .get(&id)
            .map(|session| session.room.clone())
            .ok_or(RouteError::UnknownSession(id))
    }

    /// Members in connection order. Empty if the room does not exist.
    fn members(&self, room: &str) -> Vec<SessionId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    fn deliver(&mut self, to: SessionId, message: SystemMessage) -> bool {
        match self.sessions.get_mut(&to) {
            Some(session) => session.deliver(to, message),
            None => false,
        }
    }

    /// Delivers `message` to every member of `room` except `sender`. A full
    /// queue only costs its own recipient the message. Returns how many
    /// recipients accepted it.
    fn fan_out(&mut self, room: &str, sender: SessionId, message: &SystemMessage) -> usize {
        let recipients = self.members(room);
        recipients
            .into_iter()
            .filter(|member| *member != sender)
            .filter(|member| self.deliver(*member, message.clone()))
            .count()
    }

    fn remove_from_room(&mut self, id: SessionId) -> Option<(String, Vec<SessionId>)> {
        let room = self.sessions.get_mut(&id)?.room.take()?;
        let remaining: Vec<SessionId> = match self.rooms.get_mut(&room) {
            Some(members) => {
                members.remove(&id);
                members.iter().copied().collect()
            }
            None => Vec::new(),
        };
        if remaining.is_empty() {
            self.rooms.remove(&room);
            debug!(%room, "room removed");
        }
        Some((room, remaining))
    }

    fn announce_departure(&mut self, id: SessionId, room: &str, remaining: &[SessionId]) {
        let notice = leave_notice(room, id, remaining);
        for member in remaining {
            self.deliver(*member, notice.clone());
        }
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        for (room, members) in &self.rooms {
            assert!(!members.is_empty(), "room {room} has no members");
            for member in members {
                let session = self.sessions.get(member).expect("member is registered");
                assert_eq!(session.room.as_deref(), Some(room.as_str()));
            }
        }
        for (id, session) in &self.sessions {
            if let Some(room) = &session.room {
                assert!(self.rooms[room].contains(id));
            }
            let memberships = self.rooms.values().filter(|m| m.contains(id)).count();
            assert_eq!(memberships, usize::from(session.room.is_some()));
        }
    }
}

fn join_notice(room: &str, joiner: SessionId, members: &[SessionId]) -> SystemMessage {
    SystemMessage::new(Action::Join)
        .with_room(room)
        .with_user(joiner)
        .with_participants(members)
}

fn leave_notice(room: &str, leaver: SessionId, remaining: &[SessionId]) -> SystemMessage {
    SystemMessage::new(Action::Leave)
        .with_room(room)
        .with_user(leaver)
        .with_participants(remaining)
}
