// Registry event bus.
//
// Every meaningful registry state change (member lifecycle, room lifecycle,
// stream registration) is represented as a `RegistryEvent` and fanned out on
// a `tokio::sync::broadcast` channel.  Monitoring surfaces attach by
// subscribing to the bus; nothing inside the core threads callbacks into
// I/O tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::registry::StreamKind;

// ─── Event types ────────────────────────────────────────────────────────────

/// Canonical event type string, used in serialized payloads and filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "member.joined")]
    MemberJoined,
    #[serde(rename = "member.left")]
    MemberLeft,
    #[serde(rename = "room.created")]
    RoomCreated,
    #[serde(rename = "room.destroyed")]
    RoomDestroyed,
    #[serde(rename = "stream.registered")]
    StreamRegistered,
    #[serde(rename = "stream.expired")]
    StreamExpired,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MemberJoined => "member.joined",
            Self::MemberLeft => "member.left",
            Self::RoomCreated => "room.created",
            Self::RoomDestroyed => "room.destroyed",
            Self::StreamRegistered => "stream.registered",
            Self::StreamExpired => "stream.expired",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Event payloads ─────────────────────────────────────────────────────────

/// Metadata attached to member lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberPayload {
    pub username: String,
    pub ip: String,
    pub room_id: String,
}

/// Metadata attached to room lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomPayload {
    pub room_id: String,
}

/// Metadata attached to stream registration events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPayload {
    pub kind: String, // "video" | "audio"
    pub addr: String,
}

/// Type-safe union of all possible payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Member(MemberPayload),
    Room(RoomPayload),
    Stream(StreamPayload),
}

// ─── The event envelope ─────────────────────────────────────────────────────

/// A fully self-describing registry event, ready for serialisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEvent {
    /// Globally unique event identifier (format: `evt_<uuid-v4>`).
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: EventType,

    /// ISO-8601 timestamp (UTC).
    pub created_at: DateTime<Utc>,

    pub data: EventPayload,
}

impl RegistryEvent {
    pub fn member_joined(username: &str, ip: &str, room_id: &str) -> Self {
        Self::new(
            EventType::MemberJoined,
            EventPayload::Member(MemberPayload {
                username: username.to_string(),
                ip: ip.to_string(),
                room_id: room_id.to_string(),
            }),
        )
    }

    pub fn member_left(username: &str, ip: &str, room_id: &str) -> Self {
        Self::new(
            EventType::MemberLeft,
            EventPayload::Member(MemberPayload {
                username: username.to_string(),
                ip: ip.to_string(),
                room_id: room_id.to_string(),
            }),
        )
    }

    pub fn room_created(room_id: &str) -> Self {
        Self::new(
            EventType::RoomCreated,
            EventPayload::Room(RoomPayload {
                room_id: room_id.to_string(),
            }),
        )
    }

    pub fn room_destroyed(room_id: &str) -> Self {
        Self::new(
            EventType::RoomDestroyed,
            EventPayload::Room(RoomPayload {
                room_id: room_id.to_string(),
            }),
        )
    }

    pub fn stream_registered(kind: StreamKind, addr: &std::net::SocketAddr) -> Self {
        Self::new(
            EventType::StreamRegistered,
            EventPayload::Stream(StreamPayload {
                kind: kind.as_str().to_string(),
                addr: addr.to_string(),
            }),
        )
    }

    pub fn stream_expired(kind: StreamKind, addr: &std::net::SocketAddr) -> Self {
        Self::new(
            EventType::StreamExpired,
            EventPayload::Stream(StreamPayload {
                kind: kind.as_str().to_string(),
                addr: addr.to_string(),
            }),
        )
    }

    fn new(event_type: EventType, data: EventPayload) -> Self {
        Self {
            id: format!("evt_{}", uuid::Uuid::new_v4()),
            event_type,
            created_at: Utc::now(),
            data,
        }
    }
}

// ─── EventBus ───────────────────────────────────────────────────────────────

/// Broadcast-based fan-out channel for `RegistryEvent`.
///
/// Subscribers that lag more than the channel capacity skip events
/// (`broadcast::RecvError::Lagged` semantics).  The bus is cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RegistryEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Publish an event.  Returns the number of active subscribers that will
    /// receive it; silently succeeds with zero subscribers.
    pub fn emit(&self, event: RegistryEvent) -> usize {
        debug!(event_type = %event.event_type, event_id = %event.id, "registry event");
        self.tx.send(event).unwrap_or(0)
    }

    /// Obtain a new receiver.  Each receiver gets an independent copy of
    /// every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
