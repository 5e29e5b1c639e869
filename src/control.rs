// TCP control server: registration, heartbeat, chat routing, disconnect.
//
// Each accepted connection gets a dedicated reader task.  Reads are framed
// with a per-iteration timeout: a timeout resumes the loop (never a
// disconnect), a zero-length read or framing error closes it.  All replies
// and relays go through member writers snapshotted out of the registry; a
// failed send removes that recipient.

use std::sync::Arc;

use serde::Deserialize;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::chat::{self, ChatIngress, ChatMessage};
use crate::config::{Config, DEFAULT_ROOM, MAX_MESSAGE_SIZE, SOCKET_TIMEOUT};
use crate::error::RelayResult;
use crate::protocol::{pack_message, read_framed_message, MsgType};
use crate::registry::{send_to_writer, ConnectionRegistry, MemberHandle};

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// `REGISTER` payload: `{"username": ..., "meeting_id": ...}`.
#[derive(Debug, Deserialize)]
struct RegisterPayload {
    username: Option<String>,
    meeting_id: Option<String>,
}

// ---------------------------------------------------------------------------
// ControlServer
// ---------------------------------------------------------------------------

pub struct ControlServer {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    shutdown: watch::Receiver<bool>,
}

impl ControlServer {
    pub async fn bind(
        config: &Config,
        registry: Arc<ConnectionRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> RelayResult<Self> {
        let listener = TcpListener::bind(config.bind_addr(config.control_port)).await?;
        info!(addr = %listener.local_addr()?, "control server listening");
        Ok(Self {
            listener,
            registry,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop.  Each connection is registered with the registry and
    /// handed to its own reader task.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!(addr = %addr, "control connection accepted");
                            let (read, write) = stream.into_split();
                            let member_id = self.registry.add(write, addr);
                            tokio::spawn(run_connection(
                                self.registry.clone(),
                                read,
                                member_id,
                                self.shutdown.clone(),
                            ));
                        }
                        Err(e) => {
                            warn!(error = %e, "control accept failed");
                        }
                    }
                }
            }
        }
        info!("control server stopped");
    }
}

// ---------------------------------------------------------------------------
// Per-connection reader
// ---------------------------------------------------------------------------

async fn run_connection(
    registry: Arc<ConnectionRegistry>,
    mut reader: OwnedReadHalf,
    member_id: String,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() || !registry.contains(&member_id) {
            break;
        }

        let frame = match timeout(
            SOCKET_TIMEOUT,
            read_framed_message(&mut reader, MAX_MESSAGE_SIZE),
        )
        .await
        {
            // No data this interval; keep the connection alive.
            Err(_elapsed) => continue,
            // Clean close at a packet boundary.
            Ok(Ok(None)) => break,
            // Framing error on TCP closes the connection without partial state.
            Ok(Err(e)) => {
                debug!(member_id = %member_id, error = %e, "framing error, closing");
                break;
            }
            Ok(Ok(Some(frame))) => frame,
        };

        let (header, payload) = frame;
        registry.touch(&member_id, None, None);

        match header.msg_type {
            MsgType::Register => handle_register(&registry, &member_id, &payload),
            MsgType::Heartbeat => {}
            MsgType::Chat => handle_chat(&registry, &member_id, &payload).await,
            MsgType::Disconnect => {
                debug!(member_id = %member_id, "disconnect requested");
                break;
            }
            other => {
                debug!(msg_type = %other, "unexpected message on control connection");
            }
        }
    }

    registry.remove(&member_id);
}

fn handle_register(registry: &Arc<ConnectionRegistry>, member_id: &str, payload: &[u8]) {
    let parsed: RegisterPayload = match serde_json::from_slice(payload) {
        Ok(p) => p,
        Err(e) => {
            warn!(member_id = %member_id, error = %e, "invalid REGISTER payload");
            return;
        }
    };

    let fallback = registry
        .addr_of(member_id)
        .map(|a| format!("User-{}", a.port()))
        .unwrap_or_else(|| "User".to_string());
    let username = parsed
        .username
        .filter(|u| !u.is_empty())
        .unwrap_or(fallback);
    let meeting_id = parsed
        .meeting_id
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| DEFAULT_ROOM.to_string());

    registry.register(member_id, &username, &meeting_id);
}

// ---------------------------------------------------------------------------
// Chat routing
// ---------------------------------------------------------------------------

async fn handle_chat(registry: &Arc<ConnectionRegistry>, member_id: &str, payload: &[u8]) {
    let Some(sender) = registry.member(member_id) else {
        return;
    };

    let ingress = match ChatIngress::parse(payload, &sender.username, &sender.room) {
        Ok(ingress) => ingress,
        Err(_) => {
            // Legacy clients send bare text; relay it to the room as-is.
            relay_raw(registry, &sender, payload).await;
            return;
        }
    };

    let packet = match pack_message(MsgType::Chat, &ingress.to_payload()) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "chat packet too large");
            return;
        }
    };

    // Routing is decided by the target; the room scope is the sender's room.
    let unicast_target = match &ingress.message {
        ChatMessage::Unicast { target, .. } => Some(target.clone()),
        ChatMessage::FileAnnounce { target, .. } if !chat::is_broadcast_target(target) => {
            Some(target.clone())
        }
        _ => None,
    };

    let (targets, status) = match unicast_target {
        Some(target) => match registry.find_in_room(&sender.room, &target) {
            Some(recipient) => {
                let status = format!("private to {}", recipient.username);
                (vec![recipient], status)
            }
            None => {
                // Unknown target: error back to the sender, nothing routed.
                let available = registry.room_usernames(&sender.room);
                let error = chat::unknown_target_error(
                    &sender.username,
                    &sender.room,
                    &target,
                    &available,
                );
                reply_to_sender(registry, &sender, &error).await;
                return;
            }
        },
        None => {
            let targets: Vec<MemberHandle> = registry
                .room_members(&sender.room)
                .into_iter()
                .filter(|m| m.id != sender.id)
                .collect();
            let status = format!("broadcast to {} recipients", targets.len());
            (targets, status)
        }
    };

    send_to_targets(registry, &sender, targets, &packet, &status).await;
}

/// Relay a non-JSON chat payload to the sender's room unchanged.
async fn relay_raw(registry: &Arc<ConnectionRegistry>, sender: &MemberHandle, payload: &[u8]) {
    let Ok(packet) = pack_message(MsgType::Chat, payload) else {
        return;
    };
    let targets: Vec<MemberHandle> = registry
        .room_members(&sender.room)
        .into_iter()
        .filter(|m| m.id != sender.id)
        .collect();
    let status = format!("broadcast to {} recipients", targets.len());
    send_to_targets(registry, sender, targets, &packet, &status).await;
}

/// Deliver a chat packet to each target, remove the ones whose sockets
/// fail, and return a delivery summary to the sender.
async fn send_to_targets(
    registry: &Arc<ConnectionRegistry>,
    sender: &MemberHandle,
    targets: Vec<MemberHandle>,
    packet: &[u8],
    status: &str,
) {
    let mut sent = 0usize;
    let mut failed = Vec::new();

    for target in targets {
        match send_to_writer(&target.writer, packet).await {
            Ok(()) => sent += 1,
            Err(e) => {
                debug!(target = %target.username, error = %e, "chat delivery failed");
                failed.push(target.id);
            }
        }
    }

    let failed_count = failed.len();
    for id in failed {
        registry.remove(&id);
    }

    debug!(sent, failed = failed_count, status, "chat routed");
    let confirm =
        chat::delivery_confirm(&sender.username, &sender.room, status, sent, failed_count);
    reply_to_sender(registry, sender, &confirm).await;
}

async fn reply_to_sender(
    registry: &Arc<ConnectionRegistry>,
    sender: &MemberHandle,
    payload: &[u8],
) {
    let Ok(packet) = pack_message(MsgType::Chat, payload) else {
        return;
    };
    if send_to_writer(&sender.writer, &packet).await.is_err() {
        registry.remove(&sender.id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PROTOCOL_VERSION;
    use crate::protocol::{unpack_message, Header};
    use serde_json::{json, Value};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::time::Duration;

    async fn start_server() -> (
        std::net::SocketAddr,
        Arc<ConnectionRegistry>,
        watch::Sender<bool>,
    ) {
        let registry = ConnectionRegistry::new();
        let (shutdown_tx, shutdown) = watch::channel(false);
        let config = Config {
            bind_host: "127.0.0.1".into(),
            control_port: 0,
            ..Config::default()
        };
        let server = ControlServer::bind(&config, registry.clone(), shutdown)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (addr, registry, shutdown_tx)
    }

    async fn send(stream: &mut TcpStream, msg_type: MsgType, payload: &[u8]) {
        let packet = pack_message(msg_type, payload).unwrap();
        stream.write_all(&packet).await.unwrap();
    }

    /// Read packets until one matches `want`, skipping heartbeats and
    /// whatever else arrives in between.
    async fn recv_until(stream: &mut TcpStream, want: MsgType) -> (Header, Vec<u8>) {
        loop {
            let frame = timeout(
                Duration::from_secs(2),
                read_framed_message(stream, MAX_MESSAGE_SIZE),
            )
            .await
            .expect("timed out waiting for packet")
            .expect("read failed")
            .expect("connection closed");
            if frame.0.msg_type == want {
                return frame;
            }
        }
    }

    async fn recv_chat_json(stream: &mut TcpStream) -> Value {
        let (_, payload) = recv_until(stream, MsgType::Chat).await;
        serde_json::from_slice(&payload).unwrap()
    }

    async fn connect_and_register(
        addr: std::net::SocketAddr,
        username: &str,
        meeting_id: &str,
    ) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let payload =
            serde_json::to_vec(&json!({"username": username, "meeting_id": meeting_id})).unwrap();
        send(&mut stream, MsgType::Register, &payload).await;
        stream
    }

    #[tokio::test]
    async fn register_and_receive_user_list() {
        let (addr, _registry, _shutdown) = start_server().await;
        let mut alice = connect_and_register(addr, "Alice", "team").await;

        // After registration Alice gets a USER_LIST naming her and her room.
        let users = loop {
            let (header, payload) = recv_until(&mut alice, MsgType::UserList).await;
            assert_eq!(header.version, PROTOCOL_VERSION);
            let users: Vec<Value> = serde_json::from_slice(&payload).unwrap();
            if users.iter().any(|u| u["username"] == "Alice") {
                break users;
            }
        };
        let entry = users.iter().find(|u| u["username"] == "Alice").unwrap();
        assert_eq!(entry["room"], "team");

        // When Bob joins the same room, Alice sees both names.
        let mut _bob = connect_and_register(addr, "Bob", "team").await;
        loop {
            let (_, payload) = recv_until(&mut alice, MsgType::UserList).await;
            let users: Vec<Value> = serde_json::from_slice(&payload).unwrap();
            if users.iter().any(|u| u["username"] == "Bob") {
                assert!(users.iter().any(|u| u["username"] == "Alice"));
                break;
            }
        }
    }

    #[tokio::test]
    async fn case_insensitive_unicast() {
        let (addr, _registry, _shutdown) = start_server().await;
        let mut alice = connect_and_register(addr, "Alice", "team").await;
        let mut bob = connect_and_register(addr, "Bob", "team").await;
        let mut carol = connect_and_register(addr, "Carol", "team").await;

        // Give registrations time to land before routing.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let payload = serde_json::to_vec(&json!({"target": "bob", "text": "hi"})).unwrap();
        send(&mut alice, MsgType::Chat, &payload).await;

        let received = recv_chat_json(&mut bob).await;
        assert_eq!(received["text"], "hi");
        assert_eq!(received["sender"], "Alice");

        let confirm = recv_chat_json(&mut alice).await;
        assert_eq!(confirm["type"], "delivery_confirm");
        assert!(confirm["text"]
            .as_str()
            .unwrap()
            .contains("sent: 1, failed: 0"));

        // Carol must receive nothing on the chat channel.
        let nothing = timeout(Duration::from_millis(300), async {
            recv_chat_json(&mut carol).await
        })
        .await;
        assert!(nothing.is_err(), "unicast leaked to a third member");
    }

    #[tokio::test]
    async fn unknown_target_gets_error_listing_users() {
        let (addr, _registry, _shutdown) = start_server().await;
        let mut alice = connect_and_register(addr, "Alice", "team").await;
        let mut bob = connect_and_register(addr, "Bob", "team").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let payload = serde_json::to_vec(&json!({"target": "nobody", "text": "x"})).unwrap();
        send(&mut alice, MsgType::Chat, &payload).await;

        let error = recv_chat_json(&mut alice).await;
        assert_eq!(error["type"], "error");
        let text = error["text"].as_str().unwrap();
        assert!(text.contains("\"nobody\" not found"));
        assert!(text.contains("Alice"));
        assert!(text.contains("Bob"));

        let nothing = timeout(Duration::from_millis(300), async {
            recv_chat_json(&mut bob).await
        })
        .await;
        assert!(nothing.is_err(), "unknown-target chat leaked");
    }

    #[tokio::test]
    async fn broadcast_excludes_sender_and_other_rooms() {
        let (addr, _registry, _shutdown) = start_server().await;
        let mut alice = connect_and_register(addr, "Alice", "team").await;
        let mut bob = connect_and_register(addr, "Bob", "team").await;
        let mut dave = connect_and_register(addr, "Dave", "other").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let payload = serde_json::to_vec(&json!({"text": "hello room"})).unwrap();
        send(&mut alice, MsgType::Chat, &payload).await;

        let received = recv_chat_json(&mut bob).await;
        assert_eq!(received["text"], "hello room");

        // The sender only sees the delivery confirmation.
        let confirm = recv_chat_json(&mut alice).await;
        assert_eq!(confirm["type"], "delivery_confirm");

        let nothing = timeout(Duration::from_millis(300), async {
            recv_chat_json(&mut dave).await
        })
        .await;
        assert!(nothing.is_err(), "broadcast crossed rooms");
    }

    #[tokio::test]
    async fn cross_room_unicast_is_refused() {
        let (addr, _registry, _shutdown) = start_server().await;
        let mut alice = connect_and_register(addr, "Alice", "team").await;
        let mut carol = connect_and_register(addr, "Carol", "other").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let payload = serde_json::to_vec(&json!({"target": "Carol", "text": "psst"})).unwrap();
        send(&mut alice, MsgType::Chat, &payload).await;

        let error = recv_chat_json(&mut alice).await;
        assert_eq!(error["type"], "error");

        let nothing = timeout(Duration::from_millis(300), async {
            recv_chat_json(&mut carol).await
        })
        .await;
        assert!(nothing.is_err(), "unicast crossed rooms");
    }

    #[tokio::test]
    async fn disconnect_removes_member() {
        let (addr, registry, _shutdown) = start_server().await;
        let mut alice = connect_and_register(addr, "Alice", "team").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.member_count(), 1);

        send(&mut alice, MsgType::Disconnect, b"").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(registry.member_count(), 0);
    }

    #[tokio::test]
    async fn heartbeat_is_accepted_silently() {
        let (addr, registry, _shutdown) = start_server().await;
        let mut alice = connect_and_register(addr, "Alice", "team").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        send(&mut alice, MsgType::Heartbeat, b"").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.member_count(), 1);
    }

    #[tokio::test]
    async fn malformed_header_closes_connection() {
        let (addr, registry, _shutdown) = start_server().await;
        let mut alice = connect_and_register(addr, "Alice", "team").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // A packet with a foreign protocol version.
        let mut bogus = pack_message(MsgType::Chat, b"x").unwrap().to_vec();
        bogus[0] = 7;
        alice.write_all(&bogus).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(registry.member_count(), 0);
    }

    #[test]
    fn unpack_rejects_short_input() {
        assert!(unpack_message(&[1, 2, 3]).is_err());
    }
}
