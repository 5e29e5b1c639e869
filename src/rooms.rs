use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

/// A named group of members.
///
/// Membership is kept in insertion order.  Usernames are indexed under their
/// case-folded form so chat targets match regardless of casing, while the
/// originally asserted casing is preserved for display.  Rooms are plain
/// data; the connection registry guards them with its own lock.
#[derive(Debug, Default)]
pub struct Room {
    /// Member ids in insertion order.
    members: Vec<String>,
    /// Case-folded username to (asserted casing, member id).
    by_username: HashMap<String, (String, String)>,
}

impl Room {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a member.  A registered username is indexed; members that have
    /// not asserted one yet join unindexed and become routable once renamed.
    pub fn insert(&mut self, member_id: &str, username: Option<&str>) {
        if !self.members.iter().any(|m| m == member_id) {
            self.members.push(member_id.to_string());
        }
        if let Some(name) = username {
            self.by_username.insert(
                casefold(name),
                (name.to_string(), member_id.to_string()),
            );
        }
    }

    /// Remove a member and its username index entry (no-op if absent).
    pub fn remove(&mut self, member_id: &str) {
        self.members.retain(|m| m != member_id);
        self.by_username.retain(|_, (_, id)| id != member_id);
    }

    /// Re-index a member under a newly asserted username.  No-op when the
    /// member is not in this room.
    pub fn rename(&mut self, member_id: &str, username: &str) {
        if !self.contains(member_id) {
            return;
        }
        self.by_username.retain(|_, (_, id)| id != member_id);
        self.by_username.insert(
            casefold(username),
            (username.to_string(), member_id.to_string()),
        );
    }

    /// Case-insensitive username lookup.  Returns the asserted casing and
    /// the member id.
    pub fn lookup(&self, target: &str) -> Option<(&str, &str)> {
        self.by_username
            .get(&casefold(target))
            .map(|(name, id)| (name.as_str(), id.as_str()))
    }

    /// Member ids in insertion order.
    pub fn member_ids(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(String::as_str)
    }

    /// Registered usernames, asserted casing, insertion order.
    pub fn usernames(&self) -> Vec<String> {
        self.members
            .iter()
            .filter_map(|id| {
                self.by_username
                    .values()
                    .find(|(_, mid)| mid == id)
                    .map(|(name, _)| name.clone())
            })
            .collect()
    }

    pub fn contains(&self, member_id: &str) -> bool {
        self.members.iter().any(|m| m == member_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

// ---------------------------------------------------------------------------
// RoomDirectory
// ---------------------------------------------------------------------------

/// All live rooms, keyed by room id.
///
/// Rooms are created lazily on first join and destroyed when the last member
/// departs.
#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: HashMap<String, Room>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a member to a room, creating the room if needed.
    /// Returns `true` when the room was created by this call.
    pub fn join(&mut self, room_id: &str, member_id: &str, username: Option<&str>) -> bool {
        let created = !self.rooms.contains_key(room_id);
        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(member_id, username);
        created
    }

    /// Remove a member from a room, destroying it when empty.
    /// Returns `true` when the room was destroyed by this call.
    pub fn leave(&mut self, room_id: &str, member_id: &str) -> bool {
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.remove(member_id);
            if room.is_empty() {
                self.rooms.remove(room_id);
                return true;
            }
        }
        false
    }

    pub fn get(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn get_mut(&mut self, room_id: &str) -> Option<&mut Room> {
        self.rooms.get_mut(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

/// Case-fold used for all username comparisons.
pub fn casefold(name: &str) -> String {
    name.trim().to_lowercase()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut room = Room::new();
        room.insert("m1", Some("Alice"));

        for target in ["alice", "ALICE", "Alice", "  alice "] {
            let (name, id) = room.lookup(target).expect("target should match");
            assert_eq!(name, "Alice");
            assert_eq!(id, "m1");
        }
        assert!(room.lookup("bob").is_none());
    }

    #[test]
    fn asserted_casing_is_preserved() {
        let mut room = Room::new();
        room.insert("m1", Some("AlIcE"));
        assert_eq!(room.usernames(), vec!["AlIcE".to_string()]);
    }

    #[test]
    fn rename_promotes_unindexed_member() {
        let mut room = Room::new();
        room.insert("m1", None);
        assert!(room.lookup("alice").is_none());

        room.rename("m1", "Alice");
        assert_eq!(room.lookup("alice").unwrap().1, "m1");
    }

    #[test]
    fn remove_clears_index() {
        let mut room = Room::new();
        room.insert("m1", Some("Alice"));
        room.insert("m2", Some("Bob"));
        room.remove("m1");

        assert!(room.lookup("alice").is_none());
        assert!(room.lookup("bob").is_some());
        assert_eq!(room.len(), 1);
    }

    #[test]
    fn members_keep_insertion_order() {
        let mut room = Room::new();
        room.insert("m1", Some("Alice"));
        room.insert("m2", Some("Bob"));
        room.insert("m3", Some("Carol"));
        let ids: Vec<&str> = room.member_ids().collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn directory_creates_lazily_and_destroys_when_empty() {
        let mut dir = RoomDirectory::new();

        assert!(dir.join("team", "m1", Some("Alice")));
        assert!(!dir.join("team", "m2", Some("Bob")));
        assert_eq!(dir.room_count(), 1);

        assert!(!dir.leave("team", "m1"));
        assert!(dir.leave("team", "m2"));
        assert!(dir.get("team").is_none());
        assert_eq!(dir.room_count(), 0);
    }

    #[test]
    fn duplicate_insert_does_not_double_count() {
        let mut room = Room::new();
        room.insert("m1", Some("Alice"));
        room.insert("m1", Some("Alice"));
        assert_eq!(room.len(), 1);
    }
}
