// Wire protocol: a fixed 10-byte big-endian header followed by an opaque
// payload.  Framing is identical for TCP and UDP; TCP readers pull exactly
// `10 + payload_length` bytes per packet, UDP receives one packet per
// datagram.  The screen-share channel uses its own length-prefixed format
// and does not go through this codec.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::{HEADER_SIZE, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
use crate::error::{RelayError, RelayResult};

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// One-byte message type carried in every packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    // Control and handshake (TCP control, also REGISTER on both UDP ports)
    Register = 0x01,
    Heartbeat = 0x02,
    UserList = 0x03,
    Disconnect = 0x04,

    // Chat, multiplexed on the control connection
    Chat = 0x10,

    // File transfer
    FileMetadata = 0x20,
    FileChunk = 0x21,
    FileRequestUpload = 0x22,
    FileRequestDownload = 0x23,
    FileAckSuccess = 0x24,
    FileAckFailure = 0x25,

    // UDP streaming
    StreamVideo = 0x40,
    StreamAudio = 0x41,
}

impl MsgType {
    /// Human-readable name for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "REGISTER",
            Self::Heartbeat => "HEARTBEAT",
            Self::UserList => "USER_LIST",
            Self::Disconnect => "DISCONNECT",
            Self::Chat => "CHAT",
            Self::FileMetadata => "FILE_METADATA",
            Self::FileChunk => "FILE_CHUNK",
            Self::FileRequestUpload => "FILE_UPLOAD_REQ",
            Self::FileRequestDownload => "FILE_DOWNLOAD_REQ",
            Self::FileAckSuccess => "FILE_ACK_SUCCESS",
            Self::FileAckFailure => "FILE_ACK_FAILURE",
            Self::StreamVideo => "VIDEO",
            Self::StreamAudio => "AUDIO",
        }
    }
}

impl TryFrom<u8> for MsgType {
    type Error = RelayError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Register),
            0x02 => Ok(Self::Heartbeat),
            0x03 => Ok(Self::UserList),
            0x04 => Ok(Self::Disconnect),
            0x10 => Ok(Self::Chat),
            0x20 => Ok(Self::FileMetadata),
            0x21 => Ok(Self::FileChunk),
            0x22 => Ok(Self::FileRequestUpload),
            0x23 => Ok(Self::FileRequestDownload),
            0x24 => Ok(Self::FileAckSuccess),
            0x25 => Ok(Self::FileAckFailure),
            0x40 => Ok(Self::StreamVideo),
            0x41 => Ok(Self::StreamAudio),
            other => Err(RelayError::UnknownMessageType(other)),
        }
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Parsed 10-byte header: `version (u8) | type (u8) | payload_length (u32) |
/// sequence (u16) | reserved (u16)`, all big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: MsgType,
    pub payload_length: u32,
    pub sequence: u16,
    pub reserved: u16,
}

impl Header {
    /// Parse a header from the first 10 bytes of `data`.
    ///
    /// Rejects short input and foreign protocol versions; the payload length
    /// bound is enforced by the caller, which knows its transport limit.
    pub fn parse(data: &[u8]) -> RelayResult<Header> {
        if data.len() < HEADER_SIZE {
            return Err(RelayError::MalformedPacket("truncated header"));
        }

        let version = data[0];
        if version != PROTOCOL_VERSION {
            return Err(RelayError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                received: version,
            });
        }

        let msg_type = MsgType::try_from(data[1])?;
        let payload_length = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let sequence = u16::from_be_bytes([data[6], data[7]]);
        let reserved = u16::from_be_bytes([data[8], data[9]]);

        Ok(Header {
            version,
            msg_type,
            payload_length,
            sequence,
            reserved,
        })
    }
}

// ---------------------------------------------------------------------------
// Packing / unpacking
// ---------------------------------------------------------------------------

/// Pack a message with header and payload.  The server always emits
/// sequence 0; clients are free to number their datagrams.
pub fn pack_message(msg_type: MsgType, payload: &[u8]) -> RelayResult<Bytes> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(RelayError::PayloadTooLarge {
            length: payload.len(),
            limit: MAX_MESSAGE_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(msg_type as u8);
    buf.put_u32(payload.len() as u32);
    buf.put_u16(0); // sequence
    buf.put_u16(0); // reserved
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Unpack a complete packet (header and payload together, as received in a
/// single UDP datagram or assembled by `read_framed_message`).
pub fn unpack_message(data: &[u8]) -> RelayResult<(Header, &[u8])> {
    let header = Header::parse(data)?;
    let payload = &data[HEADER_SIZE..];

    if payload.len() != header.payload_length as usize {
        return Err(RelayError::MalformedPacket("payload length mismatch"));
    }

    Ok((header, payload))
}

/// Read exactly one framed message from a TCP stream.
///
/// Reads the 10-byte header, then exactly `payload_length` bytes, never
/// crossing a message boundary.  Returns `Ok(None)` on a clean EOF at a
/// packet boundary.  `max_payload` is the transport limit: 1 MiB for
/// control/chat connections, the file chunk bound for transfer connections.
pub async fn read_framed_message<R>(
    reader: &mut R,
    max_payload: usize,
) -> RelayResult<Option<(Header, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let header = Header::parse(&header_buf)?;
    let length = header.payload_length as usize;
    if length > max_payload {
        return Err(RelayError::PayloadTooLarge {
            length,
            limit: max_payload,
        });
    }

    let mut payload = vec![0u8; length];
    if length > 0 {
        // EOF mid-payload is a truncated packet, not a clean close.
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|_| RelayError::MalformedPacket("truncated payload"))?;
    }

    Ok(Some((header, payload)))
}

// ---------------------------------------------------------------------------
// File metadata
// ---------------------------------------------------------------------------

/// Metadata describing a file transfer, exchanged as the payload of
/// `FILE_REQUEST_UPLOAD` (client to server) and `FILE_METADATA` (server to
/// client on download).
///
/// `checksum` is the hex MD5 of the whole file, or empty when the uploader
/// declares none.  `target` is `all` or a username matched
/// case-insensitively when the availability notice is routed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub filename: String,
    pub filesize: u64,
    #[serde(default)]
    pub checksum: String,
    #[serde(default = "default_target")]
    pub target: String,
}

fn default_target() -> String {
    "all".to_string()
}

/// `REGISTER` payload carried in UDP datagrams: `{"username": ..., "room": ...}`.
/// The UDP routers use it to correlate a source IP with a member identity.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamRegister {
    pub username: Option<String>,
    pub room: Option<String>,
}

impl FileMetadata {
    /// Encode as the JSON form.  The legacy binary form is never emitted.
    pub fn encode(&self) -> RelayResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode metadata, accepting the JSON form first and falling back to
    /// the legacy length-prefixed binary form
    /// (`len(u32) filename len(u64) filesize len(u32) checksum`), which
    /// carries no target and decodes to `target = "all"`.
    pub fn decode(data: &[u8]) -> RelayResult<FileMetadata> {
        if let Ok(meta) = serde_json::from_slice::<FileMetadata>(data) {
            return Ok(meta);
        }
        Self::decode_legacy(data)
    }

    fn decode_legacy(data: &[u8]) -> RelayResult<FileMetadata> {
        fn take<'a>(data: &'a [u8], offset: &mut usize, n: usize) -> RelayResult<&'a [u8]> {
            let slice = data
                .get(*offset..*offset + n)
                .ok_or(RelayError::MalformedPacket("truncated file metadata"))?;
            *offset += n;
            Ok(slice)
        }

        fn take_u32(data: &[u8], offset: &mut usize) -> RelayResult<u32> {
            let bytes = take(data, offset, 4)?;
            Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }

        let mut offset = 0usize;

        let name_len = take_u32(data, &mut offset)? as usize;
        let filename = String::from_utf8(take(data, &mut offset, name_len)?.to_vec())
            .map_err(|_| RelayError::MalformedPacket("filename not utf-8"))?;

        let size_bytes = take(data, &mut offset, 8)?;
        let filesize = u64::from_be_bytes([
            size_bytes[0],
            size_bytes[1],
            size_bytes[2],
            size_bytes[3],
            size_bytes[4],
            size_bytes[5],
            size_bytes[6],
            size_bytes[7],
        ]);

        let sum_len = take_u32(data, &mut offset)? as usize;
        let checksum = String::from_utf8(take(data, &mut offset, sum_len)?.to_vec())
            .map_err(|_| RelayError::MalformedPacket("checksum not utf-8"))?;

        Ok(FileMetadata {
            filename,
            filesize,
            checksum,
            target: default_target(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
