// Chat payloads at the router boundary.
//
// Clients send loosely shaped JSON objects.  Ingress parsing is permissive
// (unknown fields are preserved and relayed), but the router itself only
// ever sees a tagged `ChatMessage`, never a raw JSON blob.  System replies
// (delivery confirmations, routing errors, file announcements) are
// synthesized here with the `SYSTEM` sender.

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::error::{RelayError, RelayResult};

/// Sender name used for server-synthesized chat packets.
pub const SYSTEM_SENDER: &str = "SYSTEM";

/// Target spellings that mean "everyone in the room".
pub fn is_broadcast_target(target: &str) -> bool {
    matches!(target.trim().to_lowercase().as_str(), "" | "all" | "everyone")
}

// ---------------------------------------------------------------------------
// ChatMessage
// ---------------------------------------------------------------------------

/// Routing-relevant classification of a chat payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatMessage {
    /// No target, or a target spelling that means the whole room.
    Broadcast { sender: String, text: String },
    /// A single case-insensitively matched username.
    Unicast {
        sender: String,
        target: String,
        text: String,
    },
    /// Server-to-targets notice that an uploaded file is available.
    FileAnnounce {
        sender: String,
        filename: String,
        size: u64,
        target: String,
    },
    /// Server-to-sender summary of a routing attempt.
    DeliveryConfirm { text: String },
    /// Server-to-sender routing failure.
    Error { text: String },
}

/// A parsed inbound chat packet: the tagged message plus the normalized
/// JSON object that gets relayed to recipients.
#[derive(Debug, Clone)]
pub struct ChatIngress {
    pub message: ChatMessage,
    object: Map<String, Value>,
}

impl ChatIngress {
    /// Parse an inbound chat payload.
    ///
    /// Fills in `sender` and `meeting_id` from connection state when the
    /// client omitted them, stamps the server-side `timestamp`, and keeps
    /// every other field as-is for forward compatibility.
    pub fn parse(
        payload: &[u8],
        default_sender: &str,
        default_meeting: &str,
    ) -> RelayResult<ChatIngress> {
        let value: Value = serde_json::from_slice(payload)?;
        let Value::Object(mut object) = value else {
            return Err(RelayError::MalformedPacket("chat payload is not an object"));
        };

        let missing = |object: &Map<String, Value>, key: &str| {
            object
                .get(key)
                .and_then(Value::as_str)
                .map(str::is_empty)
                .unwrap_or(true)
        };
        if missing(&object, "sender") {
            object.insert("sender".into(), json!(default_sender));
        }
        if missing(&object, "meeting_id") {
            object.insert("meeting_id".into(), json!(default_meeting));
        }
        object.insert("timestamp".into(), json!(now_secs()));

        let sender = object
            .get("sender")
            .and_then(Value::as_str)
            .unwrap_or(default_sender)
            .to_string();
        let text = object
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let target = object
            .get("target")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let kind = object.get("type").and_then(Value::as_str).unwrap_or("");

        let message = match kind {
            "error" => ChatMessage::Error { text },
            "delivery_confirm" => ChatMessage::DeliveryConfirm { text },
            "file_announce" => ChatMessage::FileAnnounce {
                sender: sender.clone(),
                filename: object
                    .get("filename")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                size: object.get("size").and_then(Value::as_u64).unwrap_or(0),
                target: if target.is_empty() { "all".into() } else { target },
            },
            _ if is_broadcast_target(&target) => ChatMessage::Broadcast { sender, text },
            _ => ChatMessage::Unicast {
                sender,
                target,
                text,
            },
        };

        Ok(ChatIngress { message, object })
    }

    /// The normalized JSON bytes relayed to recipients.
    pub fn to_payload(&self) -> Vec<u8> {
        // Serializing a Map<String, Value> cannot fail.
        serde_json::to_vec(&Value::Object(self.object.clone())).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Synthesized system packets
// ---------------------------------------------------------------------------

/// Error reply for an unknown unicast target, naming the available users.
pub fn unknown_target_error(
    sender_username: &str,
    meeting_id: &str,
    target: &str,
    available: &[String],
) -> Vec<u8> {
    let text = format!(
        "User \"{}\" not found. Available: {}",
        target,
        available.join(", ")
    );
    system_packet(sender_username, meeting_id, "error", &text)
}

/// Delivery summary returned to the sender after every routing attempt.
/// Clients use it to update their UI silently.
pub fn delivery_confirm(
    sender_username: &str,
    meeting_id: &str,
    status: &str,
    sent: usize,
    failed: usize,
) -> Vec<u8> {
    let (kind, text) = if sent > 0 || failed == 0 {
        (
            "delivery_confirm",
            format!("Message delivered: {status} (sent: {sent}, failed: {failed})"),
        )
    } else {
        (
            "error",
            format!("Message delivery failed: {status} (sent: {sent}, failed: {failed})"),
        )
    };
    system_packet(sender_username, meeting_id, kind, &text)
}

/// Availability notice emitted after a successful upload, routed by the
/// chat rules.
pub fn file_announce(sender: &str, filename: &str, size: u64, target: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "type": "file_announce",
        "filename": filename,
        "sender": sender,
        "size": size,
        "target": target,
        "timestamp": now_secs(),
    }))
    .unwrap_or_default()
}

fn system_packet(target_username: &str, meeting_id: &str, kind: &str, text: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "sender": SYSTEM_SENDER,
        "target": target_username,
        "text": text,
        "timestamp": now_secs(),
        "meeting_id": meeting_id,
        "type": kind,
    }))
    .unwrap_or_default()
}

fn now_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
