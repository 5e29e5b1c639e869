use thiserror::Error;

/// Error kinds surfaced by the relay.
///
/// Framing errors drop the packet (UDP) or close the connection (TCP);
/// transport errors remove the failing destination; filesystem errors are
/// answered with a `FILE_ACK_FAILURE` carrying the textual reason.  None of
/// these are raised while the registry lock is held.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("Mismatching protocol version, expected {expected}, received {received}")]
    VersionMismatch { expected: u8, received: u8 },

    #[error("Payload length {length} exceeds limit {limit}")]
    PayloadTooLarge { length: usize, limit: usize },

    #[error("Unknown message type {0:#04x}")]
    UnknownMessageType(u8),

    #[error("Invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Invalid filename (path traversal)")]
    PathTraversal,

    #[error("File not found")]
    FileNotFound,

    #[error("File too large ({size} bytes, limit {limit})")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Unexpected message type {got:#04x} during transfer")]
    UnexpectedMessage { got: u8 },
}

impl RelayError {
    /// Textual reason placed in a `FILE_ACK_FAILURE` payload.
    pub fn ack_reason(&self) -> String {
        match self {
            RelayError::PathTraversal => "Invalid filename".into(),
            RelayError::FileNotFound => "File not found".into(),
            RelayError::FileTooLarge { .. } => "File too large".into(),
            RelayError::ChecksumMismatch => "Checksum mismatch".into(),
            other => other.to_string(),
        }
    }
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;
