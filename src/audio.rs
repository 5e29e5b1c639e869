// UDP audio mixer.
//
// Two tasks share one socket: the ingest loop buffers incoming PCM chunks
// per source, and the mix loop pops one chunk per source on a fixed-period
// tick, mixes a per-listener blend (same room, never the listener's own
// audio), and sends it back.  Ticks align to wallclock; when a tick's work
// overruns, catch-up ticks are skipped rather than emitted as a burst.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{
    Config, AUDIO_CHUNK_BYTES, AUDIO_SOURCE_TIMEOUT, JITTER_BUFFER_CHUNKS,
};
use crate::error::RelayResult;
use crate::protocol::{pack_message, unpack_message, MsgType, StreamRegister};
use crate::registry::{ConnectionRegistry, StreamKind};

const RECV_BUFFER: usize = 65_536;

/// Target loudness for the mixed signal, roughly -14 dBFS for voice.
const TARGET_RMS: f32 = 6000.0;

/// Gain ceiling; quiet rooms are lifted at most this much.
const MAX_GAIN: f32 = 2.0;

// ---------------------------------------------------------------------------
// Jitter buffers
// ---------------------------------------------------------------------------

struct Source {
    queue: VecDeque<Vec<u8>>,
    last_seen: Instant,
}

/// Per-source bounded chunk queues, guarded by their own mutex (separate
/// from the registry's).
#[derive(Default)]
pub struct JitterBuffers {
    sources: Mutex<HashMap<SocketAddr, Source>>,
}

impl JitterBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk, dropping the oldest when the bound is reached.
    pub fn push(&self, addr: SocketAddr, chunk: Vec<u8>) {
        let mut sources = self.sources.lock().unwrap();
        let source = sources.entry(addr).or_insert_with(|| Source {
            queue: VecDeque::with_capacity(JITTER_BUFFER_CHUNKS),
            last_seen: Instant::now(),
        });
        if source.queue.len() >= JITTER_BUFFER_CHUNKS {
            source.queue.pop_front();
        }
        source.queue.push_back(chunk);
        source.last_seen = Instant::now();
    }

    /// Pop the oldest buffered chunk from every source that has one.
    pub fn pop_round(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut sources = self.sources.lock().unwrap();
        sources
            .iter_mut()
            .filter_map(|(addr, source)| source.queue.pop_front().map(|c| (*addr, c)))
            .collect()
    }

    /// Drop sources idle longer than `idle`; returns their addresses so the
    /// caller can unregister the matching stream entries.
    pub fn sweep(&self, idle: std::time::Duration) -> Vec<SocketAddr> {
        let mut sources = self.sources.lock().unwrap();
        let stale: Vec<SocketAddr> = sources
            .iter()
            .filter(|(_, s)| s.last_seen.elapsed() > idle)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &stale {
            sources.remove(addr);
        }
        stale
    }

    pub fn source_count(&self) -> usize {
        self.sources.lock().unwrap().len()
    }

    pub fn buffered(&self, addr: SocketAddr) -> usize {
        self.sources
            .lock()
            .unwrap()
            .get(&addr)
            .map(|s| s.queue.len())
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Mixing
// ---------------------------------------------------------------------------

/// Mix raw PCM chunks (int16 little-endian, mono): zero-pad to the longest,
/// average as float, remove the DC offset, normalize toward the target RMS
/// with a gain ceiling, and clip back to int16.
pub fn mix_chunks(chunks: &[&[u8]]) -> Option<Vec<u8>> {
    let decoded: Vec<Vec<f32>> = chunks
        .iter()
        .map(|chunk| {
            chunk
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32)
                .collect()
        })
        .collect();
    if decoded.is_empty() {
        return None;
    }

    let max_len = decoded.iter().map(Vec::len).max().unwrap_or(0);
    if max_len == 0 {
        return None;
    }

    // Average across sources, treating short chunks as zero-padded.
    let count = decoded.len() as f32;
    let mut mixed: Vec<f32> = vec![0.0; max_len];
    for samples in &decoded {
        for (i, s) in samples.iter().enumerate() {
            mixed[i] += s;
        }
    }
    for sample in &mut mixed {
        *sample /= count;
    }

    // DC removal.
    let mean = mixed.iter().sum::<f32>() / max_len as f32;
    for sample in &mut mixed {
        *sample -= mean;
    }

    // Normalize toward the target loudness, limited to the gain ceiling.
    let rms = (mixed.iter().map(|s| s * s).sum::<f32>() / max_len as f32).sqrt();
    let gain = MAX_GAIN.min(TARGET_RMS / (rms + 1e-9));
    let out: Vec<u8> = mixed
        .iter()
        .map(|s| (s * gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .flat_map(|s| s.to_le_bytes())
        .collect();

    Some(out)
}

// ---------------------------------------------------------------------------
// AudioServer
// ---------------------------------------------------------------------------

pub struct AudioServer {
    socket: Arc<UdpSocket>,
    registry: Arc<ConnectionRegistry>,
    buffers: Arc<JitterBuffers>,
    tick: std::time::Duration,
    shutdown: watch::Receiver<bool>,
}

impl AudioServer {
    pub async fn bind(
        config: &Config,
        registry: Arc<ConnectionRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> RelayResult<Self> {
        let socket = UdpSocket::bind(config.bind_addr(config.audio_port)).await?;
        info!(addr = %socket.local_addr()?, "audio server listening");
        Ok(Self {
            socket: Arc::new(socket),
            registry,
            buffers: Arc::new(JitterBuffers::new()),
            tick: config.audio_tick(),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawn the mix loop and run the ingest loop until shutdown.
    pub async fn run(mut self) {
        let mixer = Mixer {
            socket: self.socket.clone(),
            registry: self.registry.clone(),
            buffers: self.buffers.clone(),
            tick: self.tick,
            shutdown: self.shutdown.clone(),
        };
        tokio::spawn(mixer.run());

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
                        warn!(error = %e, "audio receive failed");
                        continue;
                    }
                },
            };

            let (header, payload) = match unpack_message(&buf[..len]) {
                Ok(parsed) => parsed,
                Err(_) => continue,
            };

            match header.msg_type {
                MsgType::Register => {
                    if let Ok(reg) = serde_json::from_slice::<StreamRegister>(payload) {
                        self.registry.touch_by_ip(
                            sender.ip(),
                            reg.username.as_deref(),
                            reg.room.as_deref(),
                        );
                    }
                    self.registry.register_stream(StreamKind::Audio, sender);
                }
                MsgType::StreamAudio => {
                    // Off-cadence chunks are dropped to keep the mix clean.
                    if payload.len() != AUDIO_CHUNK_BYTES {
                        continue;
                    }
                    self.registry.register_stream(StreamKind::Audio, sender);
                    self.buffers.push(sender, payload.to_vec());
                }
                _ => {}
            }
        }
        info!("audio server stopped");
    }
}

// ---------------------------------------------------------------------------
// Mix loop
// ---------------------------------------------------------------------------

struct Mixer {
    socket: Arc<UdpSocket>,
    registry: Arc<ConnectionRegistry>,
    buffers: Arc<JitterBuffers>,
    tick: std::time::Duration,
    shutdown: watch::Receiver<bool>,
}

impl Mixer {
    async fn run(mut self) {
        info!(tick_ms = self.tick.as_millis() as u64, "audio mixer started");
        let mut ticker = tokio::time::interval(self.tick);
        // Overruns skip to the next wallclock-aligned tick; no bursts.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            for addr in self.buffers.sweep(AUDIO_SOURCE_TIMEOUT) {
                self.registry.unregister_stream(StreamKind::Audio, addr);
            }

            let popped = self.buffers.pop_round();
            if popped.is_empty() {
                continue;
            }
            self.mix_and_send(&popped).await;
        }
        info!("audio mixer stopped");
    }

    /// One tick: build and send a per-listener mix.  Each listener hears
    /// the sources in its own room, never its own address, and at most one
    /// mixed chunk per tick.
    async fn mix_and_send(&self, popped: &[(SocketAddr, Vec<u8>)]) {
        // Rooms resolved once per tick, per distinct source IP.
        let source_rooms: HashMap<SocketAddr, String> = popped
            .iter()
            .map(|(addr, _)| (*addr, self.registry.room_of_ip(addr.ip())))
            .collect();

        let listeners = self.registry.listeners(StreamKind::Audio, None);
        for listener in listeners {
            let listener_room = self.registry.room_of_ip(listener.ip());

            let sources: Vec<&[u8]> = popped
                .iter()
                .filter(|(addr, _)| {
                    *addr != listener
                        && source_rooms.get(addr).map(String::as_str)
                            == Some(listener_room.as_str())
                })
                .map(|(_, chunk)| chunk.as_slice())
                .collect();

            // Nothing but the listener's own audio: skip, do not send silence.
            if sources.is_empty() {
                continue;
            }

            let Some(mixed) = mix_chunks(&sources) else {
                continue;
            };
            let Ok(packet) = pack_message(MsgType::StreamAudio, &mixed) else {
                continue;
            };
            if let Err(e) = self.socket.send_to(&packet, listener).await {
                debug!(listener = %listener, error = %e, "audio send failed, unregistering");
                self.registry.unregister_stream(StreamKind::Audio, listener);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    fn encode_chunk(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn decode_chunk(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    /// A full-length chunk alternating +level / -level (zero mean).
    fn square_chunk(level: i16) -> Vec<u8> {
        let samples: Vec<i16> = (0..crate::config::AUDIO_CHUNK)
            .map(|i| if i % 2 == 0 { level } else { -level })
            .collect();
        encode_chunk(&samples)
    }

    // ── mix_chunks ──────────────────────────────────────────────────────

    #[test]
    fn mix_of_nothing_is_none() {
        assert!(mix_chunks(&[]).is_none());
    }

    #[test]
    fn mix_applies_capped_gain() {
        // rms = 600, so the wanted gain 6000/600 = 10 is capped at 2.0.
        let chunk = square_chunk(600);
        let mixed = decode_chunk(&mix_chunks(&[&chunk]).unwrap());
        assert_eq!(mixed[0], 1200);
        assert_eq!(mixed[1], -1200);
    }

    #[test]
    fn mix_averages_sources() {
        // Averaging +900 and -900 squares in phase opposition cancels out.
        let a = square_chunk(900);
        let b: Vec<u8> = {
            let samples: Vec<i16> = (0..crate::config::AUDIO_CHUNK)
                .map(|i| if i % 2 == 0 { -900 } else { 900 })
                .collect();
            encode_chunk(&samples)
        };
        let mixed = decode_chunk(&mix_chunks(&[&a, &b]).unwrap());
        assert!(mixed.iter().all(|&s| s == 0));
    }

    #[test]
    fn mix_removes_dc_offset() {
        // A constant signal is pure DC; after removal only silence remains.
        let chunk = encode_chunk(&vec![1000i16; crate::config::AUDIO_CHUNK]);
        let mixed = decode_chunk(&mix_chunks(&[&chunk]).unwrap());
        assert!(mixed.iter().all(|&s| s == 0));
    }

    #[test]
    fn mix_zero_pads_short_chunks() {
        let long = square_chunk(600);
        let short = encode_chunk(&[600i16; 4]);
        let mixed = mix_chunks(&[&long, &short]).unwrap();
        assert_eq!(mixed.len(), long.len());
    }

    #[test]
    fn mix_clips_to_int16() {
        // A quiet chunk with one hot spike: the RMS-driven gain lifts the
        // whole signal and the spike must clip instead of wrapping.
        let mut samples = vec![100i16; crate::config::AUDIO_CHUNK];
        samples[0] = 30_000;
        let chunk = encode_chunk(&samples);
        let mixed = decode_chunk(&mix_chunks(&[&chunk]).unwrap());
        assert_eq!(*mixed.iter().max().unwrap(), i16::MAX);
    }

    // ── JitterBuffers ───────────────────────────────────────────────────

    #[test]
    fn buffer_bounds_at_ten_chunks_dropping_oldest() {
        let buffers = JitterBuffers::new();
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();

        for i in 0..12u8 {
            buffers.push(addr, vec![i]);
        }
        assert_eq!(buffers.buffered(addr), JITTER_BUFFER_CHUNKS);

        // The two oldest chunks were dropped.
        let popped = buffers.pop_round();
        assert_eq!(popped, vec![(addr, vec![2u8])]);
    }

    #[test]
    fn pop_round_takes_one_chunk_per_source() {
        let buffers = JitterBuffers::new();
        let a: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:5000".parse().unwrap();

        buffers.push(a, vec![1]);
        buffers.push(a, vec![2]);
        buffers.push(b, vec![9]);

        let mut round = buffers.pop_round();
        round.sort_by_key(|(addr, _)| *addr);
        assert_eq!(round, vec![(a, vec![1]), (b, vec![9])]);
        assert_eq!(buffers.buffered(a), 1);
        assert_eq!(buffers.buffered(b), 0);
    }

    #[test]
    fn sweep_drops_idle_sources() {
        let buffers = JitterBuffers::new();
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        buffers.push(addr, vec![1]);

        assert!(buffers.sweep(Duration::from_secs(5)).is_empty());
        let removed = buffers.sweep(Duration::ZERO);
        assert_eq!(removed, vec![addr]);
        assert_eq!(buffers.source_count(), 0);
    }

    // ── End-to-end over UDP ─────────────────────────────────────────────
    //
    // Identity is correlated by source IP, so each simulated participant
    // gets its own loopback address (127.0.0.0/8 is all local on Linux).

    async fn start_server() -> (SocketAddr, Arc<ConnectionRegistry>, watch::Sender<bool>) {
        let registry = ConnectionRegistry::new();
        let (shutdown_tx, shutdown) = watch::channel(false);
        let config = Config {
            bind_host: "127.0.0.1".into(),
            audio_port: 0,
            ..Config::default()
        };
        let server = AudioServer::bind(&config, registry.clone(), shutdown)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (addr, registry, shutdown_tx)
    }

    async fn audio_client(server: SocketAddr, ip: &str, username: &str, room: &str) -> UdpSocket {
        let socket = UdpSocket::bind((ip, 0)).await.unwrap();
        let payload = serde_json::to_vec(&json!({"username": username, "room": room})).unwrap();
        let packet = pack_message(MsgType::Register, &payload).unwrap();
        socket.send_to(&packet, server).await.unwrap();
        socket
    }

    async fn add_tcp_member(
        registry: &Arc<ConnectionRegistry>,
        ip: &str,
        username: &str,
        room: &str,
    ) -> tokio::net::TcpStream {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = tokio::net::TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_read, write) = server.into_split();
        let addr: SocketAddr = format!("{ip}:50000").parse().unwrap();
        let id = registry.add(write, addr);
        registry.register(&id, username, room);
        client
    }

    #[tokio::test]
    async fn lone_source_hears_nothing() {
        let (server, _registry, _shutdown) = start_server().await;
        let alice = audio_client(server, "127.0.0.2", "Alice", "default").await;

        let chunk = pack_message(MsgType::StreamAudio, &square_chunk(600)).unwrap();
        alice.send_to(&chunk, server).await.unwrap();

        // With no other sources in the room there is nothing to mix for
        // Alice; the mixer must not send silence either.
        let mut buf = vec![0u8; RECV_BUFFER];
        let echo = timeout(Duration::from_millis(400), alice.recv_from(&mut buf)).await;
        assert!(echo.is_err(), "mixer echoed a lone source to itself");
    }

    #[tokio::test]
    async fn two_sources_hear_each_other_not_themselves() {
        let (server, _registry, _shutdown) = start_server().await;
        let alice = audio_client(server, "127.0.0.2", "Alice", "default").await;
        let bob = audio_client(server, "127.0.0.3", "Bob", "default").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Distinct levels so each side can verify whose audio it received.
        let alice_chunk = pack_message(MsgType::StreamAudio, &square_chunk(3000)).unwrap();
        let bob_chunk = pack_message(MsgType::StreamAudio, &square_chunk(600)).unwrap();
        alice.send_to(&alice_chunk, server).await.unwrap();
        bob.send_to(&bob_chunk, server).await.unwrap();

        let mut buf = vec![0u8; RECV_BUFFER];

        // Alice hears Bob's level (600), normalized by the capped gain to
        // 1200, never her own 3000-level signal.
        let (len, _) = timeout(Duration::from_secs(1), alice.recv_from(&mut buf))
            .await
            .expect("alice received no mix")
            .unwrap();
        let (header, payload) = unpack_message(&buf[..len]).unwrap();
        assert_eq!(header.msg_type, MsgType::StreamAudio);
        let samples = decode_chunk(payload);
        assert_eq!(samples.len(), crate::config::AUDIO_CHUNK);
        assert!(samples.iter().map(|s| s.unsigned_abs()).max().unwrap() <= 1200);

        // Bob hears Alice's louder signal, lifted well past that bound.
        let (len, _) = timeout(Duration::from_secs(1), bob.recv_from(&mut buf))
            .await
            .expect("bob received no mix")
            .unwrap();
        let (_, payload) = unpack_message(&buf[..len]).unwrap();
        let samples = decode_chunk(payload);
        assert!(samples.iter().map(|s| s.unsigned_abs()).max().unwrap() > 1200);
    }

    #[tokio::test]
    async fn rooms_isolate_audio() {
        let (server, registry, _shutdown) = start_server().await;
        let _alice_tcp = add_tcp_member(&registry, "127.0.0.2", "Alice", "team").await;
        let _bob_tcp = add_tcp_member(&registry, "127.0.0.3", "Bob", "team").await;
        let _dave_tcp = add_tcp_member(&registry, "127.0.0.4", "Dave", "other").await;

        let alice = audio_client(server, "127.0.0.2", "Alice", "team").await;
        let bob = audio_client(server, "127.0.0.3", "Bob", "team").await;
        let dave = audio_client(server, "127.0.0.4", "Dave", "other").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let team_chunk = pack_message(MsgType::StreamAudio, &square_chunk(900)).unwrap();
        let other_chunk = pack_message(MsgType::StreamAudio, &square_chunk(900)).unwrap();
        alice.send_to(&team_chunk, server).await.unwrap();
        dave.send_to(&other_chunk, server).await.unwrap();

        // Bob shares Alice's room and hears her.
        let mut buf = vec![0u8; RECV_BUFFER];
        timeout(Duration::from_secs(1), bob.recv_from(&mut buf))
            .await
            .expect("bob received no mix")
            .unwrap();

        // Dave is alone in his room: Alice's audio must not reach him.
        let leaked = timeout(Duration::from_millis(300), dave.recv_from(&mut buf)).await;
        assert!(leaked.is_err(), "audio crossed rooms");
    }

    #[tokio::test]
    async fn off_size_chunks_are_dropped() {
        let (server, _registry, _shutdown) = start_server().await;
        let alice = audio_client(server, "127.0.0.2", "Alice", "default").await;
        let bob = audio_client(server, "127.0.0.3", "Bob", "default").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // One byte short of the canonical size: dropped before buffering.
        let short = vec![0x11u8; AUDIO_CHUNK_BYTES - 1];
        let packet = pack_message(MsgType::StreamAudio, &short).unwrap();
        alice.send_to(&packet, server).await.unwrap();

        let mut buf = vec![0u8; RECV_BUFFER];
        let received = timeout(Duration::from_millis(400), bob.recv_from(&mut buf)).await;
        assert!(received.is_err(), "off-size chunk reached the mix");
    }
}
