// ============================
// crates/backend-lib/src/rooms.rs
// ============================
//! Multi-party call rooms.
//!
//! A user sits in at most one room at a time and is bound to exactly one
//! connection there. Rooms are created on first join and dropped when the
//! last participant leaves.
use chrono::Utc;
use metrics::gauge;
use okean_common::{ConnectionId, RoomParticipant, UserId, UserSummary};
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::error::AppError;

#[derive(Default)]
struct Room {
    participants: HashMap<UserId, RoomParticipant>,
}

#[derive(Default)]
struct RoomTable {
    rooms: HashMap<String, Room>,
    user_rooms: HashMap<UserId, String>,
}

impl RoomTable {
    fn remove_participant(&mut self, room_id: &str, user_id: &str) -> Option<RoomDeparture> {
        let room = self.rooms.get_mut(room_id)?;
        let participant = room.participants.remove(user_id)?;
        if room.participants.is_empty() {
            self.rooms.remove(room_id);
        }
        self.user_rooms.remove(user_id);
        gauge!(crate::metrics::ROOMS_ACTIVE).set(self.rooms.len() as f64);
        Some(RoomDeparture {
            room_id: room_id.to_string(),
            participant,
        })
    }
}

/// A participant that left a room
#[derive(Debug, Clone)]
pub struct RoomDeparture {
    pub room_id: String,
    pub participant: RoomParticipant,
}

/// Outcome of joining a room
#[derive(Debug, Clone)]
pub struct RoomJoin {
    pub participant: RoomParticipant,
    /// Everyone else already in the room
    pub others: Vec<RoomParticipant>,
    /// Room the user was moved out of, if any
    pub previous: Option<RoomDeparture>,
    /// Connection the user was bound to before a rejoin of the same room
    pub replaced_connection: Option<ConnectionId>,
}

#[derive(Default)]
pub struct RoomManager {
    table: Mutex<RoomTable>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, user: &UserSummary, connection_id: ConnectionId, room_id: &str) -> RoomJoin {
        let mut table = self.table.lock();

        let mut previous = None;
        let mut replaced_connection = None;
        match table.user_rooms.get(&user.id).cloned() {
            Some(current) if current == room_id => {
                // Rejoin from another connection keeps media state and join time
                if let Some(existing) = table
                    .rooms
                    .get_mut(room_id)
                    .and_then(|room| room.participants.get_mut(&user.id))
                {
                    if existing.connection_id != connection_id {
                        replaced_connection = Some(existing.connection_id);
                        existing.connection_id = connection_id;
                    }
                }
            },
            Some(current) => previous = table.remove_participant(&current, &user.id),
            None => {},
        }

        let room = table.rooms.entry(room_id.to_string()).or_default();
        let participant = room
            .participants
            .entry(user.id.clone())
            .or_insert_with(|| RoomParticipant {
                user: user.clone(),
                connection_id,
                joined_at: Utc::now(),
                audio_enabled: true,
                video_enabled: true,
            })
            .clone();
        let others = sorted(
            room.participants
                .values()
                .filter(|p| p.user.id != user.id)
                .cloned()
                .collect(),
        );

        table.user_rooms.insert(user.id.clone(), room_id.to_string());
        gauge!(crate::metrics::ROOMS_ACTIVE).set(table.rooms.len() as f64);

        RoomJoin {
            participant,
            others,
            previous,
            replaced_connection,
        }
    }

    /// Leave a room. None if the user was not in it.
    pub fn leave(&self, user_id: &str, room_id: &str) -> Option<RoomDeparture> {
        self.table.lock().remove_participant(room_id, user_id)
    }

    /// Leave whatever room the user is in, but only when `connection_id`
    /// is the connection bound there
    pub fn leave_connection(&self, user_id: &str, connection_id: ConnectionId) -> Option<RoomDeparture> {
        let mut table = self.table.lock();
        let room_id = table.user_rooms.get(user_id)?.clone();
        let bound = table
            .rooms
            .get(&room_id)
            .and_then(|room| room.participants.get(user_id))
            .is_some_and(|p| p.connection_id == connection_id);
        if !bound {
            return None;
        }
        table.remove_participant(&room_id, user_id)
    }

    pub fn set_media(
        &self,
        user_id: &str,
        room_id: &str,
        audio_enabled: bool,
        video_enabled: bool,
    ) -> Result<RoomParticipant, AppError> {
        let mut table = self.table.lock();
        let participant = table
            .rooms
            .get_mut(room_id)
            .and_then(|room| room.participants.get_mut(user_id))
            .ok_or_else(|| AppError::NotFound(format!("room {room_id}")))?;
        participant.audio_enabled = audio_enabled;
        participant.video_enabled = video_enabled;
        Ok(participant.clone())
    }

    /// Participants ordered by join time; empty when the room does not exist
    pub fn participants(&self, room_id: &str) -> Vec<RoomParticipant> {
        self.table
            .lock()
            .rooms
            .get(room_id)
            .map(|room| sorted(room.participants.values().cloned().collect()))
            .unwrap_or_default()
    }

    pub fn is_participant(&self, room_id: &str, user_id: &str) -> bool {
        self.table
            .lock()
            .rooms
            .get(room_id)
            .is_some_and(|room| room.participants.contains_key(user_id))
    }

    /// The target's participant record when both users are in `room_id`
    pub fn peer_in_room(&self, room_id: &str, from: &str, to: &str) -> Option<RoomParticipant> {
        let table = self.table.lock();
        let room = table.rooms.get(room_id)?;
        if !room.participants.contains_key(from) {
            return None;
        }
        room.participants.get(to).cloned()
    }

    pub fn room_of(&self, user_id: &str) -> Option<String> {
        self.table.lock().user_rooms.get(user_id).cloned()
    }

    pub fn room_count(&self) -> usize {
        self.table.lock().rooms.len()
    }
}

fn sorted(mut participants: Vec<RoomParticipant>) -> Vec<RoomParticipant> {
    participants.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.user.id.cmp(&b.user.id)));
    participants
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn user(id: &str) -> UserSummary {
        UserSummary::new(id, id)
    }

    #[test]
    fn test_join_reports_existing_participants() {
        let rooms = RoomManager::new();
        let first = rooms.join(&user("ana"), Uuid::new_v4(), "standup");
        assert!(first.others.is_empty());
        assert!(first.participant.audio_enabled && first.participant.video_enabled);

        let second = rooms.join(&user("ben"), Uuid::new_v4(), "standup");
        assert_eq!(second.others.len(), 1);
        assert_eq!(second.others[0].user.id, "ana");
        assert_eq!(rooms.participants("standup").len(), 2);
        assert_eq!(rooms.room_of("ben").as_deref(), Some("standup"));
    }

    #[test]
    fn test_joining_another_room_leaves_the_first() {
        let rooms = RoomManager::new();
        rooms.join(&user("ana"), Uuid::new_v4(), "a");
        let moved = rooms.join(&user("ana"), Uuid::new_v4(), "b");

        let previous = moved.previous.unwrap();
        assert_eq!(previous.room_id, "a");
        assert!(rooms.participants("a").is_empty());
        assert_eq!(rooms.room_count(), 1);
    }

    #[test]
    fn test_rejoin_rebinds_connection() {
        let rooms = RoomManager::new();
        let (old, new) = (Uuid::new_v4(), Uuid::new_v4());
        rooms.join(&user("ana"), old, "a");
        rooms.set_media("ana", "a", false, true).unwrap();

        let rejoin = rooms.join(&user("ana"), new, "a");
        assert_eq!(rejoin.replaced_connection, Some(old));
        assert!(rejoin.previous.is_none());
        assert_eq!(rejoin.participant.connection_id, new);
        assert!(!rejoin.participant.audio_enabled);

        // The stale connection no longer owns the seat
        assert!(rooms.leave_connection("ana", old).is_none());
        assert!(rooms.leave_connection("ana", new).is_some());
        assert_eq!(rooms.room_count(), 0);
    }

    #[test]
    fn test_leave_and_empty_room_is_dropped() {
        let rooms = RoomManager::new();
        rooms.join(&user("ana"), Uuid::new_v4(), "a");
        assert!(rooms.leave("ana", "other").is_none());
        assert!(rooms.leave("ana", "a").is_some());
        assert!(rooms.leave("ana", "a").is_none());
        assert_eq!(rooms.room_count(), 0);
        assert!(rooms.room_of("ana").is_none());
    }

    #[test]
    fn test_set_media_requires_participation() {
        let rooms = RoomManager::new();
        assert!(matches!(
            rooms.set_media("ana", "a", true, false),
            Err(AppError::NotFound(_))
        ));
        rooms.join(&user("ana"), Uuid::new_v4(), "a");
        let updated = rooms.set_media("ana", "a", true, false).unwrap();
        assert!(!updated.video_enabled);
    }

    #[test]
    fn test_peer_in_room() {
        let rooms = RoomManager::new();
        let ben_conn = Uuid::new_v4();
        rooms.join(&user("ana"), Uuid::new_v4(), "a");
        rooms.join(&user("ben"), ben_conn, "a");
        rooms.join(&user("cleo"), Uuid::new_v4(), "b");

        assert_eq!(rooms.peer_in_room("a", "ana", "ben").unwrap().connection_id, ben_conn);
        assert!(rooms.peer_in_room("a", "cleo", "ben").is_none());
        assert!(rooms.peer_in_room("a", "ana", "cleo").is_none());
        assert!(rooms.is_participant("b", "cleo"));
    }
}
