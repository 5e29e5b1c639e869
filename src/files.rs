// File transfer server: reliable, connection-per-transfer.
//
// A client connects, sends one framed request (upload or download), and the
// whole transfer runs on that connection.  Uploads are validated for
// filename safety and size, streamed to disk in chunks, and checksummed;
// a mismatch deletes the file.  Successful uploads are announced to the
// uploader's room through the chat routing rules.

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::chat;
use crate::config::{Config, FILE_CHUNK_SIZE, MAX_MESSAGE_SIZE};
use crate::error::{RelayError, RelayResult};
use crate::protocol::{pack_message, read_framed_message, FileMetadata, MsgType};
use crate::registry::{send_to_writer, ConnectionRegistry, MemberHandle};
use crate::rooms::casefold;

/// Timeout for the initial request, before any metadata is known.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// FileServer
// ---------------------------------------------------------------------------

pub struct FileServer {
    listener: TcpListener,
    ctx: Arc<FileContext>,
    shutdown: watch::Receiver<bool>,
}

struct FileContext {
    registry: Arc<ConnectionRegistry>,
    storage_dir: PathBuf,
    max_file_size: u64,
}

impl FileServer {
    pub async fn bind(
        config: &Config,
        registry: Arc<ConnectionRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> RelayResult<Self> {
        fs::create_dir_all(&config.storage_dir).await?;
        let listener = TcpListener::bind(config.bind_addr(config.file_port)).await?;
        info!(
            addr = %listener.local_addr()?,
            storage = %config.storage_dir.display(),
            "file server listening"
        );
        Ok(Self {
            listener,
            ctx: Arc::new(FileContext {
                registry,
                storage_dir: config.storage_dir.clone(),
                max_file_size: config.max_file_size,
            }),
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
                            debug!(addr = %addr, "file connection accepted");
                            tokio::spawn(handle_connection(self.ctx.clone(), stream, addr));
                        }
                        Err(e) => {
                            warn!(error = %e, "file accept failed");
                        }
                    }
                }
            }
        }
        info!("file server stopped");
    }
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

async fn handle_connection(ctx: Arc<FileContext>, mut stream: TcpStream, addr: SocketAddr) {
    let request = match timeout(
        REQUEST_TIMEOUT,
        read_framed_message(&mut stream, MAX_MESSAGE_SIZE),
    )
    .await
    {
        Ok(Ok(Some(request))) => request,
        Ok(Ok(None)) => {
            debug!(addr = %addr, "no initial request");
            return;
        }
        Ok(Err(e)) => {
            debug!(addr = %addr, error = %e, "bad initial request");
            return;
        }
        Err(_elapsed) => {
            debug!(addr = %addr, "request timed out");
            return;
        }
    };

    let (header, payload) = request;
    let result = match header.msg_type {
        MsgType::FileRequestUpload => handle_upload(&ctx, &mut stream, addr, &payload).await,
        MsgType::FileRequestDownload => handle_download(&ctx, &mut stream, &payload).await,
        other => {
            debug!(addr = %addr, msg_type = %other, "unexpected file request");
            return;
        }
    };

    if let Err(e) = result {
        debug!(addr = %addr, error = %e, "file transfer failed");
        let _ = send_ack(&mut stream, MsgType::FileAckFailure, &e.ack_reason()).await;
    }
}

async fn send_ack(stream: &mut TcpStream, kind: MsgType, reason: &str) -> RelayResult<()> {
    let packet = pack_message(kind, reason.as_bytes())?;
    stream.write_all(&packet).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

async fn handle_upload(
    ctx: &FileContext,
    stream: &mut TcpStream,
    addr: SocketAddr,
    payload: &[u8],
) -> RelayResult<()> {
    let meta = FileMetadata::decode(payload)?;

    let filename = sanitize_filename(&meta.filename)?;
    if meta.filesize == 0 {
        return Err(RelayError::MalformedPacket("zero filesize"));
    }
    if meta.filesize > ctx.max_file_size {
        return Err(RelayError::FileTooLarge {
            size: meta.filesize,
            limit: ctx.max_file_size,
        });
    }

    // Slow links get more room: two seconds per MiB, at least 30 s.
    let per_read = Duration::from_secs_f64(
        (meta.filesize as f64 / 1_048_576.0 * 2.0).max(30.0),
    );

    let path = ctx.storage_dir.join(filename);
    info!(filename, size = meta.filesize, addr = %addr, "upload started");

    match receive_file(stream, &path, meta.filesize, per_read).await {
        Ok(()) => {}
        Err(e) => {
            let _ = fs::remove_file(&path).await;
            return Err(e);
        }
    }

    if !meta.checksum.is_empty() {
        let actual = md5_file(&path).await?;
        if actual != meta.checksum {
            let _ = fs::remove_file(&path).await;
            warn!(filename, "checksum mismatch, file deleted");
            return Err(RelayError::ChecksumMismatch);
        }
    }

    info!(filename, "upload complete");
    send_ack(stream, MsgType::FileAckSuccess, "Upload successful").await?;

    announce_upload(ctx, addr, filename, meta.filesize, &meta.target).await;
    Ok(())
}

async fn receive_file(
    stream: &mut TcpStream,
    path: &Path,
    filesize: u64,
    per_read: Duration,
) -> RelayResult<()> {
    let mut file = fs::File::create(path).await?;
    let mut received: u64 = 0;

    while received < filesize {
        let frame = timeout(per_read, read_framed_message(stream, FILE_CHUNK_SIZE))
            .await
            .map_err(|_| RelayError::ConnectionClosed)?;
        let Some((header, chunk)) = frame? else {
            return Err(RelayError::ConnectionClosed);
        };
        if header.msg_type != MsgType::FileChunk {
            return Err(RelayError::UnexpectedMessage {
                got: header.msg_type as u8,
            });
        }
        file.write_all(&chunk).await?;
        received += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    if received != filesize {
        return Err(RelayError::MalformedPacket("received size mismatch"));
    }
    Ok(())
}

/// Route a `file_announce` chat packet by the chat rules: everyone in the
/// uploader's room except the uploader, or one case-insensitively matched
/// username.
async fn announce_upload(
    ctx: &FileContext,
    addr: SocketAddr,
    filename: &str,
    size: u64,
    target: &str,
) {
    let sender = ctx.registry.username_by_ip(addr.ip());
    let room = ctx.registry.room_of_ip(addr.ip());

    let payload = chat::file_announce(&sender, filename, size, target);
    let Ok(packet) = pack_message(MsgType::Chat, &payload) else {
        return;
    };

    let targets = announce_targets(&ctx.registry, &sender, &room, target);
    let mut failed = Vec::new();
    for member in targets {
        if send_to_writer(&member.writer, &packet).await.is_err() {
            failed.push(member.id);
        }
    }
    for id in failed {
        ctx.registry.remove(&id);
    }
}

/// Target selection for an availability notice; the uploader never gets its
/// own announcement.  Exclusion uses the same case fold as every other
/// username comparison.
fn announce_targets(
    registry: &Arc<ConnectionRegistry>,
    sender: &str,
    room: &str,
    target: &str,
) -> Vec<MemberHandle> {
    let sender_key = casefold(sender);
    if chat::is_broadcast_target(target) {
        registry
            .room_members(room)
            .into_iter()
            .filter(|m| casefold(&m.username) != sender_key)
            .collect()
    } else {
        registry
            .find_in_room(room, target)
            .into_iter()
            .filter(|m| casefold(&m.username) != sender_key)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

async fn handle_download(
    ctx: &FileContext,
    stream: &mut TcpStream,
    payload: &[u8],
) -> RelayResult<()> {
    let filename = std::str::from_utf8(payload)
        .map_err(|_| RelayError::MalformedPacket("filename not utf-8"))?;
    let filename = sanitize_filename(filename)?;

    let path = ctx.storage_dir.join(filename);
    let stat = fs::metadata(&path)
        .await
        .map_err(|_| RelayError::FileNotFound)?;
    if !stat.is_file() {
        return Err(RelayError::FileNotFound);
    }

    let filesize = stat.len();
    let checksum = md5_file(&path).await?;

    let meta = FileMetadata {
        filename: filename.to_string(),
        filesize,
        checksum,
        target: "all".to_string(),
    };
    let packet = pack_message(MsgType::FileMetadata, &meta.encode()?)?;
    stream.write_all(&packet).await?;

    let mut file = fs::File::open(&path).await?;
    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = pack_message(MsgType::FileChunk, &buf[..n])?;
        stream.write_all(&chunk).await?;
    }

    info!(filename, size = filesize, "download complete");
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem safety
// ---------------------------------------------------------------------------

/// Accept only a single plain path component; anything that could resolve
/// outside the storage root (separators, `..`, absolute paths) is refused
/// before the filesystem is touched.
fn sanitize_filename(name: &str) -> RelayResult<&str> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => Err(RelayError::PathTraversal),
    }
}

/// Hex MD5 of a file, read in chunks.
async fn md5_file(path: &Path) -> RelayResult<String> {
    let mut file = fs::File::open(path).await?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
