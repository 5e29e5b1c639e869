// UDP video router.
//
// Frames are opaque JPEG payloads; the router re-emits each received
// datagram byte-for-byte to every video listener in the sender's room,
// excluding the sender's own address.  No re-encoding, no reordering, no
// queueing; out-of-order delivery is acceptable.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::RelayResult;
use crate::protocol::{unpack_message, MsgType, StreamRegister};
use crate::registry::{ConnectionRegistry, StreamKind};

/// Receive buffer sized to the largest datagram a client may send
/// (1 MiB payload plus header).
const RECV_BUFFER: usize = crate::config::MAX_MESSAGE_SIZE + crate::config::HEADER_SIZE;

pub struct VideoServer {
    socket: Arc<UdpSocket>,
    registry: Arc<ConnectionRegistry>,
    shutdown: watch::Receiver<bool>,
}

impl VideoServer {
    pub async fn bind(
        config: &Config,
        registry: Arc<ConnectionRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> RelayResult<Self> {
        let socket = UdpSocket::bind(config.bind_addr(config.video_port)).await?;
        info!(addr = %socket.local_addr()?, "video server listening");
        Ok(Self {
            socket: Arc::new(socket),
            registry,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(mut self) {
        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            let (len, sender) = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "video receive failed");
                        continue;
                    }
                },
            };

            let datagram = &buf[..len];
            let (header, payload) = match unpack_message(datagram) {
                Ok(parsed) => parsed,
                // Malformed packets are dropped silently.
                Err(_) => continue,
            };

            match header.msg_type {
                MsgType::Register => {
                    self.handle_register(payload, sender);
                }
                MsgType::StreamVideo => {
                    self.registry.register_stream(StreamKind::Video, sender);
                    self.relay_frame(datagram, sender).await;
                }
                _ => {}
            }
        }
        info!("video server stopped");
    }

    /// A REGISTER datagram teaches the registry the member identity behind
    /// this source IP and marks the source as a video listener.
    fn handle_register(&self, payload: &[u8], sender: SocketAddr) {
        if let Ok(reg) = serde_json::from_slice::<StreamRegister>(payload) {
            self.registry.touch_by_ip(
                sender.ip(),
                reg.username.as_deref(),
                reg.room.as_deref(),
            );
        }
        self.registry.register_stream(StreamKind::Video, sender);
    }

    /// Re-emit the original datagram to every room listener except the
    /// sender's own address.  A failed send unregisters that listener.
    async fn relay_frame(&self, datagram: &[u8], sender: SocketAddr) {
        let room = self.registry.room_of_ip(sender.ip());
        let listeners = self.registry.listeners(StreamKind::Video, Some(&room));
        if listeners.is_empty() {
            return;
        }

        let mut sent = 0usize;
        for listener in listeners {
            if listener == sender {
                continue;
            }
            match self.socket.send_to(datagram, listener).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    debug!(listener = %listener, error = %e, "video send failed, unregistering");
                    self.registry.unregister_stream(StreamKind::Video, listener);
                }
            }
        }
        if sent > 0 {
            debug!(room = %room, sent, "video frame relayed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::pack_message;
    use serde_json::json;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::{timeout, Duration};

    async fn start_server() -> (SocketAddr, Arc<ConnectionRegistry>, watch::Sender<bool>) {
        let registry = ConnectionRegistry::new();
        let (shutdown_tx, shutdown) = watch::channel(false);
        let config = Config {
            bind_host: "127.0.0.1".into(),
            video_port: 0,
            ..Config::default()
        };
        let server = VideoServer::bind(&config, registry.clone(), shutdown)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (addr, registry, shutdown_tx)
    }

    /// Register a TCP member whose identity lives at a distinct loopback IP
    /// (127.0.0.0/8 is all local on Linux), so the per-IP identity model
    /// can be exercised with several clients.
    async fn add_tcp_member(
        registry: &Arc<ConnectionRegistry>,
        ip: &str,
        username: &str,
        room: &str,
    ) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_read, write) = server.into_split();
        let addr: SocketAddr = format!("{ip}:50000").parse().unwrap();
        let id = registry.add(write, addr);
        registry.register(&id, username, room);
        client
    }

    /// UDP client bound to a specific loopback IP, announced to the router.
    async fn udp_client(server: SocketAddr, ip: &str, username: &str, room: &str) -> UdpSocket {
        let socket = UdpSocket::bind((ip, 0)).await.unwrap();
        let payload = serde_json::to_vec(&json!({"username": username, "room": room})).unwrap();
        let packet = pack_message(MsgType::Register, &payload).unwrap();
        socket.send_to(&packet, server).await.unwrap();
        socket
    }

    #[tokio::test]
    async fn frame_relayed_byte_identical_excluding_sender() {
        let (server, registry, _shutdown) = start_server().await;
        let _alice_tcp = add_tcp_member(&registry, "127.0.0.2", "Alice", "team").await;
        let _bob_tcp = add_tcp_member(&registry, "127.0.0.3", "Bob", "team").await;

        let alice = udp_client(server, "127.0.0.2", "Alice", "team").await;
        let bob = udp_client(server, "127.0.0.3", "Bob", "team").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frame = pack_message(MsgType::StreamVideo, b"\xFF\xD8 jpeg bytes \xFF\xD9").unwrap();
        alice.send_to(&frame, server).await.unwrap();

        // Bob receives the datagram unchanged.
        let mut buf = vec![0u8; RECV_BUFFER];
        let (len, from) = timeout(Duration::from_secs(1), bob.recv_from(&mut buf))
            .await
            .expect("no frame relayed")
            .unwrap();
        assert_eq!(from, server);
        assert_eq!(&buf[..len], frame.as_ref());

        // The sender's own address gets nothing back.
        let mut buf2 = vec![0u8; RECV_BUFFER];
        let echo = timeout(Duration::from_millis(300), alice.recv_from(&mut buf2)).await;
        assert!(echo.is_err(), "frame echoed back to its sender");
    }

    #[tokio::test]
    async fn frames_stay_inside_the_room() {
        let (server, registry, _shutdown) = start_server().await;
        let _alice_tcp = add_tcp_member(&registry, "127.0.0.2", "Alice", "team").await;
        let _dave_tcp = add_tcp_member(&registry, "127.0.0.4", "Dave", "other").await;

        let alice = udp_client(server, "127.0.0.2", "Alice", "team").await;
        let dave = udp_client(server, "127.0.0.4", "Dave", "other").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frame = pack_message(MsgType::StreamVideo, b"team frame").unwrap();
        alice.send_to(&frame, server).await.unwrap();

        let mut buf = vec![0u8; RECV_BUFFER];
        let leaked = timeout(Duration::from_millis(300), dave.recv_from(&mut buf)).await;
        assert!(leaked.is_err(), "frame crossed rooms");
    }

    #[tokio::test]
    async fn sender_is_registered_as_listener_by_streaming() {
        let (server, registry, _shutdown) = start_server().await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let frame = pack_message(MsgType::StreamVideo, b"frame").unwrap();
        socket.send_to(&frame, server).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let listeners = registry.listeners(StreamKind::Video, None);
        assert_eq!(listeners, vec![socket.local_addr().unwrap()]);
    }

    #[tokio::test]
    async fn malformed_datagrams_are_dropped_silently() {
        let (server, registry, _shutdown) = start_server().await;
        let _alice_tcp = add_tcp_member(&registry, "127.0.0.2", "Alice", "team").await;
        let _bob_tcp = add_tcp_member(&registry, "127.0.0.3", "Bob", "team").await;

        let alice = udp_client(server, "127.0.0.2", "Alice", "team").await;
        let bob = udp_client(server, "127.0.0.3", "Bob", "team").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Garbage, a truncated header, and a foreign version.
        alice.send_to(b"garbage", server).await.unwrap();
        alice.send_to(&[1, 2], server).await.unwrap();
        let mut bad_version = pack_message(MsgType::StreamVideo, b"frame").unwrap().to_vec();
        bad_version[0] = 9;
        alice.send_to(&bad_version, server).await.unwrap();

        // The router keeps serving well-formed frames afterwards.
        let frame = pack_message(MsgType::StreamVideo, b"still alive").unwrap();
        alice.send_to(&frame, server).await.unwrap();

        let mut buf = vec![0u8; RECV_BUFFER];
        let (len, _) = timeout(Duration::from_secs(1), bob.recv_from(&mut buf))
            .await
            .expect("router stopped after malformed input")
            .unwrap();
        assert_eq!(&buf[..len], frame.as_ref());
    }
}
