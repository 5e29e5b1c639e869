// Connection registry: the single source of truth for members, their TCP
// writers, their UDP return addresses, rooms, and liveness.
//
// One mutex guards the three inner maps.  Every read that feeds I/O copies a
// snapshot out first; no caller holds the lock across a send, and user-list
// broadcasts are dispatched on a fresh task after the lock is released.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{
    CLIENT_IDLE_TIMEOUT, DEFAULT_ROOM, HEARTBEAT_INTERVAL, UNKNOWN_USERNAME,
};
use crate::events::{EventBus, RegistryEvent};
use crate::protocol::{pack_message, MsgType};
use crate::rooms::RoomDirectory;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The two best-effort UDP stream types the registry tracks return
/// addresses for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

/// Shared handle to a member's TCP write half.  The async mutex serialises
/// writers across the heartbeat loop, the chat router, and broadcasts; it is
/// never held together with the registry lock.
pub type MemberWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// A connected participant.
struct Member {
    id: String,
    addr: SocketAddr,
    username: String,
    room: String,
    last_seen: Instant,
    writer: MemberWriter,
}

/// UDP return addresses learned from a single source IP.
#[derive(Debug, Default, Clone)]
struct StreamEntry {
    video: Option<SocketAddr>,
    audio: Option<SocketAddr>,
    last_seen: Option<Instant>,
}

impl StreamEntry {
    fn slot(&self, kind: StreamKind) -> Option<SocketAddr> {
        match kind {
            StreamKind::Video => self.video,
            StreamKind::Audio => self.audio,
        }
    }

    fn slot_mut(&mut self, kind: StreamKind) -> &mut Option<SocketAddr> {
        match kind {
            StreamKind::Video => &mut self.video,
            StreamKind::Audio => &mut self.audio,
        }
    }

    fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }
}

/// Snapshot of one member handed out to routers; safe to hold across I/O.
#[derive(Clone)]
pub struct MemberHandle {
    pub id: String,
    pub username: String,
    pub addr: SocketAddr,
    pub room: String,
    pub writer: MemberWriter,
}

impl Member {
    fn handle(&self) -> MemberHandle {
        MemberHandle {
            id: self.id.clone(),
            username: self.username.clone(),
            addr: self.addr,
            room: self.room.clone(),
            writer: self.writer.clone(),
        }
    }
}

/// One row of a USER_LIST payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub ip: String,
    pub last_seen: f64,
    pub last_seen_formatted: String,
    pub room: String,
}

struct Inner {
    members: HashMap<String, Member>,
    rooms: RoomDirectory,
    streams: HashMap<IpAddr, StreamEntry>,
}

// ---------------------------------------------------------------------------
// ConnectionRegistry
// ---------------------------------------------------------------------------

pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    events: EventBus,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                members: HashMap::new(),
                rooms: RoomDirectory::new(),
                streams: HashMap::new(),
            }),
            events: EventBus::new(),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ── Member lifecycle ────────────────────────────────────────────────

    /// Insert a freshly accepted TCP connection as an Unknown member in the
    /// default room.  Triggers a global user-list broadcast (which filters
    /// Unknown entries, so placeholder members stay invisible).
    pub fn add(self: &Arc<Self>, writer: OwnedWriteHalf, addr: SocketAddr) -> String {
        let member_id = format!("mem_{}", uuid::Uuid::new_v4());
        let total;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.rooms.join(DEFAULT_ROOM, &member_id, None);
            inner.members.insert(
                member_id.clone(),
                Member {
                    id: member_id.clone(),
                    addr,
                    username: UNKNOWN_USERNAME.to_string(),
                    room: DEFAULT_ROOM.to_string(),
                    last_seen: Instant::now(),
                    writer: Arc::new(tokio::sync::Mutex::new(writer)),
                },
            );
            total = inner.members.len();
        }

        info!(addr = %addr, total, "member added");
        self.schedule_user_list_broadcast();

        member_id
    }

    /// Remove a member: drop it from its room, drop any UDP stream
    /// registrations learned from the same source IP, shut the writer down,
    /// and broadcast updated user lists.  All I/O happens outside the lock.
    pub fn remove(self: &Arc<Self>, member_id: &str) -> Option<(String, SocketAddr)> {
        let (member, room_destroyed) = {
            let mut inner = self.inner.lock().unwrap();
            let removed = inner.members.remove(member_id)?;
            let room_destroyed = inner.rooms.leave(&removed.room, member_id);

            // The UDP routers correlate identity by source IP; once the TCP
            // member is gone its streams are gone too.
            inner.streams.remove(&removed.addr.ip());
            (removed, room_destroyed)
        };

        info!(username = %member.username, addr = %member.addr, "member removed");
        self.events.emit(RegistryEvent::member_left(
            &member.username,
            &member.addr.ip().to_string(),
            &member.room,
        ));
        if room_destroyed {
            debug!(room_id = %member.room, "room destroyed");
            self.events.emit(RegistryEvent::room_destroyed(&member.room));
        }

        // Half-close the socket so the peer sees EOF promptly.
        let writer = member.writer.clone();
        tokio::spawn(async move {
            let mut w = writer.lock().await;
            let _ = w.shutdown().await;
        });

        self.schedule_user_list_broadcast();
        if member.username != UNKNOWN_USERNAME && !room_destroyed {
            self.schedule_room_user_list_broadcast(&member.room);
        }

        Some((member.username, member.addr))
    }

    /// Bind an asserted username and meeting room to a member (the REGISTER
    /// operation).  Promotion from Unknown and the room move are atomic
    /// under the registry lock; broadcasts are scheduled afterwards.
    pub fn register(self: &Arc<Self>, member_id: &str, username: &str, room_id: &str) {
        let (promoted, old_room, created, destroyed) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(member) = inner.members.get_mut(member_id) else {
                return;
            };

            let promoted = member.username == UNKNOWN_USERNAME;
            member.username = username.to_string();
            member.last_seen = Instant::now();
            let old_room = member.room.clone();
            member.room = room_id.to_string();

            if old_room != room_id {
                let destroyed = inner.rooms.leave(&old_room, member_id);
                let created = inner.rooms.join(room_id, member_id, Some(username));
                (promoted, old_room, created, destroyed)
            } else {
                if let Some(room) = inner.rooms.get_mut(room_id) {
                    room.rename(member_id, username);
                }
                (promoted, old_room, false, false)
            }
        };

        info!(username, room_id, "member registered");
        if created {
            self.events.emit(RegistryEvent::room_created(room_id));
        }
        if destroyed {
            self.events.emit(RegistryEvent::room_destroyed(&old_room));
        }
        if promoted {
            self.events.emit(RegistryEvent::member_joined(
                username,
                &self.addr_of(member_id).map(|a| a.ip().to_string()).unwrap_or_default(),
                room_id,
            ));
            self.schedule_user_list_broadcast();
        }
        self.schedule_room_user_list_broadcast(room_id);
        if old_room != room_id && !destroyed {
            self.schedule_room_user_list_broadcast(&old_room);
        }
    }

    /// Refresh a member's last-seen; optionally promote a still-Unknown
    /// username and update the room.
    pub fn touch(self: &Arc<Self>, member_id: &str, username: Option<&str>, room: Option<&str>) {
        self.touch_inner(
            |inner| inner.members.contains_key(member_id).then(|| member_id.to_string()),
            username,
            room,
        );
    }

    /// Same as `touch`, found by source IP.  Used by the UDP servers to
    /// learn member identity from their registration datagrams.
    pub fn touch_by_ip(self: &Arc<Self>, ip: IpAddr, username: Option<&str>, room: Option<&str>) {
        self.touch_inner(
            |inner| {
                inner
                    .members
                    .values()
                    .find(|m| m.addr.ip() == ip)
                    .map(|m| m.id.clone())
            },
            username,
            room,
        );
    }

    fn touch_inner<F>(self: &Arc<Self>, find: F, username: Option<&str>, room: Option<&str>)
    where
        F: FnOnce(&Inner) -> Option<String>,
    {
        let mut promoted = false;
        let mut room_to_broadcast = None;
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(member_id) = find(&inner) else { return };

            let (mut current_room, display) = {
                let Some(member) = inner.members.get_mut(&member_id) else {
                    return;
                };
                member.last_seen = Instant::now();

                if let Some(name) = username {
                    if member.username == UNKNOWN_USERNAME && !name.is_empty() {
                        member.username = name.to_string();
                        promoted = true;
                    }
                }
                (member.room.clone(), member.username.clone())
            };

            if let Some(new_room) = room {
                // A downgrade back to the default room is ignored while a
                // real room is set; UDP REGISTER datagrams race TCP ones.
                let downgrade = new_room == DEFAULT_ROOM && current_room != DEFAULT_ROOM;
                if !downgrade && current_room != new_room {
                    if let Some(member) = inner.members.get_mut(&member_id) {
                        member.room = new_room.to_string();
                    }
                    let indexed =
                        (display != UNKNOWN_USERNAME).then_some(display.as_str());
                    inner.rooms.leave(&current_room, &member_id);
                    inner.rooms.join(new_room, &member_id, indexed);
                    room_to_broadcast = Some(new_room.to_string());
                    current_room = new_room.to_string();
                }
            }

            if promoted {
                if let Some(r) = inner.rooms.get_mut(&current_room) {
                    r.rename(&member_id, &display);
                }
            }
        }

        if promoted {
            self.schedule_user_list_broadcast();
        }
        if let Some(room_id) = room_to_broadcast {
            self.schedule_room_user_list_broadcast(&room_id);
        }
    }

    // ── Lookups ─────────────────────────────────────────────────────────

    pub fn contains(&self, member_id: &str) -> bool {
        self.inner.lock().unwrap().members.contains_key(member_id)
    }

    pub fn addr_of(&self, member_id: &str) -> Option<SocketAddr> {
        self.inner
            .lock()
            .unwrap()
            .members
            .get(member_id)
            .map(|m| m.addr)
    }

    /// Room of the member connected from `ip`, or the default room.
    pub fn room_of_ip(&self, ip: IpAddr) -> String {
        self.inner
            .lock()
            .unwrap()
            .members
            .values()
            .find(|m| m.addr.ip() == ip)
            .map(|m| m.room.clone())
            .unwrap_or_else(|| DEFAULT_ROOM.to_string())
    }

    /// Display name for the member at `ip`; falls back to the IP itself
    /// when no registered member matches.
    pub fn username_by_ip(&self, ip: IpAddr) -> String {
        self.inner
            .lock()
            .unwrap()
            .members
            .values()
            .find(|m| m.addr.ip() == ip && m.username != UNKNOWN_USERNAME)
            .map(|m| m.username.clone())
            .unwrap_or_else(|| ip.to_string())
    }

    /// Snapshot of one member.
    pub fn member(&self, member_id: &str) -> Option<MemberHandle> {
        let inner = self.inner.lock().unwrap();
        inner.members.get(member_id).map(Member::handle)
    }

    /// Snapshot of every member in a room, insertion order.
    pub fn room_members(&self, room_id: &str) -> Vec<MemberHandle> {
        let inner = self.inner.lock().unwrap();
        let Some(room) = inner.rooms.get(room_id) else {
            return Vec::new();
        };
        room.member_ids()
            .filter_map(|id| inner.members.get(id))
            .map(Member::handle)
            .collect()
    }

    /// Case-insensitive username lookup within a room.
    pub fn find_in_room(&self, room_id: &str, target: &str) -> Option<MemberHandle> {
        let inner = self.inner.lock().unwrap();
        let room = inner.rooms.get(room_id)?;
        let (_, member_id) = room.lookup(target)?;
        inner.members.get(member_id).map(Member::handle)
    }

    /// Registered usernames in a room (asserted casing).
    pub fn room_usernames(&self, room_id: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .rooms
            .get(room_id)
            .map(|r| r.usernames())
            .unwrap_or_default()
    }

    // ── UDP stream registrations ────────────────────────────────────────

    /// Record `(ip, port)` as the return address for a stream type.  The
    /// first packet from a source registers it; later packets refresh
    /// liveness.
    pub fn register_stream(&self, kind: StreamKind, addr: SocketAddr) {
        let fresh;
        {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner.streams.entry(addr.ip()).or_default();
            fresh = entry.slot(kind) != Some(addr);
            *entry.slot_mut(kind) = Some(addr);
            entry.last_seen = Some(Instant::now());
        }
        if fresh {
            debug!(kind = kind.as_str(), addr = %addr, "stream registered");
            self.events.emit(RegistryEvent::stream_registered(kind, &addr));
        }
    }

    /// Drop a return address after a send failure or liveness timeout.
    pub fn unregister_stream(&self, kind: StreamKind, addr: SocketAddr) {
        let dropped;
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.streams.get_mut(&addr.ip()) {
                Some(entry) if entry.slot(kind) == Some(addr) => {
                    *entry.slot_mut(kind) = None;
                    dropped = true;
                    if entry.is_empty() {
                        inner.streams.remove(&addr.ip());
                    }
                }
                _ => dropped = false,
            }
        }
        if dropped {
            debug!(kind = kind.as_str(), addr = %addr, "stream unregistered");
            self.events.emit(RegistryEvent::stream_expired(kind, &addr));
        }
    }

    /// Snapshot of current return addresses for a stream type, optionally
    /// restricted to sources whose IP belongs to `room`.
    pub fn listeners(&self, kind: StreamKind, room: Option<&str>) -> Vec<SocketAddr> {
        let inner = self.inner.lock().unwrap();
        inner
            .streams
            .iter()
            .filter_map(|(ip, entry)| {
                let addr = entry.slot(kind)?;
                match room {
                    Some(room_id) => {
                        let in_room = inner
                            .members
                            .values()
                            .any(|m| m.addr.ip() == *ip && m.room == room_id);
                        in_room.then_some(addr)
                    }
                    None => Some(addr),
                }
            })
            .collect()
    }

    /// Drop stream registrations idle longer than `idle`.  Invoked from the
    /// heartbeat tick with the configured idle timeout.
    pub fn sweep_stale_streams(&self, idle: Duration) {
        let mut expired = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.streams.retain(|_, entry| {
                let stale = entry
                    .last_seen
                    .map(|seen| seen.elapsed() > idle)
                    .unwrap_or(true);
                if stale {
                    if let Some(addr) = entry.video {
                        expired.push((StreamKind::Video, addr));
                    }
                    if let Some(addr) = entry.audio {
                        expired.push((StreamKind::Audio, addr));
                    }
                }
                !stale
            });
        }
        for (kind, addr) in expired {
            debug!(kind = kind.as_str(), addr = %addr, "stream expired");
            self.events.emit(RegistryEvent::stream_expired(kind, &addr));
        }
    }

    // ── User lists ──────────────────────────────────────────────────────

    /// Every member, including placeholders; broadcast paths filter Unknown.
    pub fn user_list(&self) -> Vec<UserEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .members
            .values()
            .map(|m| Self::user_entry(m))
            .collect()
    }

    /// Members of one room, Unknown placeholders excluded.
    pub fn room_user_list(&self, room_id: &str) -> Vec<UserEntry> {
        let inner = self.inner.lock().unwrap();
        let Some(room) = inner.rooms.get(room_id) else {
            return Vec::new();
        };
        room.member_ids()
            .filter_map(|id| inner.members.get(id))
            .filter(|m| m.username != UNKNOWN_USERNAME)
            .map(|m| Self::user_entry(m))
            .collect()
    }

    fn user_entry(member: &Member) -> UserEntry {
        let elapsed = member.last_seen.elapsed();
        UserEntry {
            username: member.username.clone(),
            ip: member.addr.ip().to_string(),
            last_seen: Utc::now().timestamp_millis() as f64 / 1000.0 - elapsed.as_secs_f64(),
            last_seen_formatted: format_last_seen(elapsed),
            room: member.room.clone(),
        }
    }

    // ── Broadcasts ──────────────────────────────────────────────────────

    /// Schedule a global USER_LIST broadcast on a fresh task; the caller
    /// returns immediately and never writes sockets itself.
    pub fn schedule_user_list_broadcast(self: &Arc<Self>) {
        let registry = self.clone();
        tokio::spawn(async move {
            registry.broadcast_user_list().await;
        });
    }

    pub fn schedule_room_user_list_broadcast(self: &Arc<Self>, room_id: &str) {
        let registry = self.clone();
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            registry.broadcast_room_user_list(&room_id).await;
        });
    }

    /// Send the global user list (Unknown entries filtered) to every live
    /// TCP socket.  Send failures remove the member.
    pub async fn broadcast_user_list(self: &Arc<Self>) {
        let users: Vec<UserEntry> = self
            .user_list()
            .into_iter()
            .filter(|u| u.username != UNKNOWN_USERNAME)
            .collect();
        let payload = match serde_json::to_vec(&users) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "user list serialization failed");
                return;
            }
        };
        let Ok(packet) = pack_message(MsgType::UserList, &payload) else {
            return;
        };

        let targets: Vec<(String, MemberWriter)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .members
                .values()
                .map(|m| (m.id.clone(), m.writer.clone()))
                .collect()
        };

        let mut failed = Vec::new();
        for (member_id, writer) in targets {
            if send_to_writer(&writer, &packet).await.is_err() {
                failed.push(member_id);
            }
        }
        for member_id in failed {
            self.remove(&member_id);
        }
    }

    /// Send a room-scoped user list to the sockets in that room.
    pub async fn broadcast_room_user_list(self: &Arc<Self>, room_id: &str) {
        let users = self.room_user_list(room_id);
        if users.is_empty() {
            return;
        }
        let payload = match serde_json::to_vec(&users) {
            Ok(p) => p,
            Err(_) => return,
        };
        let Ok(packet) = pack_message(MsgType::UserList, &payload) else {
            return;
        };

        let targets = self.room_members(room_id);
        let mut failed = Vec::new();
        for member in targets {
            if send_to_writer(&member.writer, &packet).await.is_err() {
                failed.push(member.id);
            }
        }
        for member_id in failed {
            self.remove(&member_id);
        }
    }

    // ── Heartbeat ───────────────────────────────────────────────────────

    /// Background ticker: every 3 s, send a zero-payload HEARTBEAT to every
    /// member and sweep stale UDP stream registrations.  Send failures mark
    /// the member for removal; removal runs after the snapshot, outside the
    /// registry lock.  Heartbeat send success is only a liveness hint; the
    /// authoritative last-seen refresh is receive-driven.
    pub async fn run_heartbeat(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Ok(packet) = pack_message(MsgType::Heartbeat, b"") else {
            return;
        };
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let targets: Vec<(String, MemberWriter)> = {
                let inner = self.inner.lock().unwrap();
                inner
                    .members
                    .values()
                    .map(|m| (m.id.clone(), m.writer.clone()))
                    .collect()
            };

            let mut failed = Vec::new();
            for (member_id, writer) in targets {
                if send_to_writer(&writer, &packet).await.is_err() {
                    failed.push(member_id);
                }
            }
            for member_id in failed {
                warn!(member_id = %member_id, "heartbeat failed, removing member");
                self.remove(&member_id);
            }

            self.sweep_stale_streams(CLIENT_IDLE_TIMEOUT);
        }

        info!("heartbeat loop stopped");
    }

    pub fn member_count(&self) -> usize {
        self.inner.lock().unwrap().members.len()
    }
}

// ---------------------------------------------------------------------------
// Send helper
// ---------------------------------------------------------------------------

/// Write a whole packet to a member's writer.  Caller must not hold the
/// registry lock.
pub async fn send_to_writer(writer: &MemberWriter, bytes: &[u8]) -> std::io::Result<()> {
    let mut w = writer.lock().await;
    w.write_all(bytes).await
}

/// Render "how long ago" for user-list rows.
fn format_last_seen(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        format!("{secs}s ago")
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else if secs < 86400 {
        format!("{}h ago", secs / 3600)
    } else {
        let then = Utc::now() - chrono::Duration::seconds(secs as i64);
        then.format("%Y-%m-%d %H:%M").to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
