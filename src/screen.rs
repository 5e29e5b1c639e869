// Screen-share fan-out.
//
// Presenters and viewers share one TCP listener.  The channel carries bare
// length-prefixed frames (4-byte big-endian length + opaque bytes, no
// common header); a zero length is the explicit stop sentinel and is
// forwarded so viewers can render "no share".  Every complete frame is
// relayed, in arrival order, to every other connected socket; viewers may
// join mid-stream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::config::{Config, MAX_SCREEN_FRAME};
use crate::error::RelayResult;

type FrameSink = SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>;
type FrameStream = SplitStream<Framed<TcpStream, LengthDelimitedCodec>>;
type SharedSink = Arc<tokio::sync::Mutex<FrameSink>>;

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(MAX_SCREEN_FRAME)
        .new_codec()
}

/// Presenter-side share lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShareState {
    Idle,
    Active,
    Stopped,
}

// ---------------------------------------------------------------------------
// ScreenServer
// ---------------------------------------------------------------------------

pub struct ScreenServer {
    listener: TcpListener,
    sinks: Arc<Mutex<HashMap<u64, SharedSink>>>,
    next_id: AtomicU64,
    shutdown: watch::Receiver<bool>,
}

impl ScreenServer {
    pub async fn bind(config: &Config, shutdown: watch::Receiver<bool>) -> RelayResult<Self> {
        let listener = TcpListener::bind(config.bind_addr(config.screen_port)).await?;
        info!(addr = %listener.local_addr()?, "screen share server listening");
        Ok(Self {
            listener,
            sinks: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

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
                            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                            debug!(addr = %addr, id, "screen connection accepted");

                            let framed = Framed::new(stream, frame_codec());
                            let (sink, frames) = framed.split();
                            self.sinks
                                .lock()
                                .unwrap()
                                .insert(id, Arc::new(tokio::sync::Mutex::new(sink)));

                            tokio::spawn(run_connection(
                                id,
                                addr,
                                frames,
                                self.sinks.clone(),
                                self.shutdown.clone(),
                            ));
                        }
                        Err(e) => {
                            warn!(error = %e, "screen accept failed");
                        }
                    }
                }
            }
        }
        info!("screen share server stopped");
    }
}

// ---------------------------------------------------------------------------
// Per-connection relay
// ---------------------------------------------------------------------------

async fn run_connection(
    id: u64,
    addr: SocketAddr,
    mut frames: FrameStream,
    sinks: Arc<Mutex<HashMap<u64, SharedSink>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut state = ShareState::Idle;

    loop {
        let frame = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(frame)) => {
                if frame.is_empty() {
                    // Stop sentinel: forward so viewers drop to "no share".
                    if state == ShareState::Active {
                        info!(addr = %addr, "screen share stopped");
                    }
                    state = ShareState::Stopped;
                    relay(id, &sinks, Bytes::new()).await;
                } else {
                    if state != ShareState::Active {
                        info!(addr = %addr, "screen share started");
                        state = ShareState::Active;
                    }
                    relay(id, &sinks, frame.freeze()).await;
                }
            }
            // Oversized length prefix or a torn read: malformed, drop the
            // presenter connection.
            Some(Err(e)) => {
                warn!(addr = %addr, error = %e, "malformed screen frame, closing");
                break;
            }
            None => break,
        }
    }

    if state == ShareState::Active {
        debug!(addr = %addr, "presenter closed mid-share");
    }
    sinks.lock().unwrap().remove(&id);
}

/// Forward one frame to every other connected socket.  Failed sinks are
/// dropped from the fan-out set.
async fn relay(from: u64, sinks: &Arc<Mutex<HashMap<u64, SharedSink>>>, frame: Bytes) {
    let targets: Vec<(u64, SharedSink)> = {
        let sinks = sinks.lock().unwrap();
        sinks
            .iter()
            .filter(|(id, _)| **id != from)
            .map(|(id, sink)| (*id, sink.clone()))
            .collect()
    };

    let mut failed = Vec::new();
    for (id, sink) in targets {
        let mut sink = sink.lock().await;
        if let Err(e) = sink.send(frame.clone()).await {
            debug!(viewer = id, error = %e, "screen relay failed, dropping viewer");
            failed.push(id);
        }
    }
    if !failed.is_empty() {
        let mut sinks = sinks.lock().unwrap();
        for id in failed {
            sinks.remove(&id);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
