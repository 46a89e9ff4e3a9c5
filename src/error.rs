// ABOUTME: Crate-level error type surfaced by Connection, MessageConnection, Waiter and PCM
// ABOUTME: Mirrors the teacher's client/error.rs shape: one thiserror enum, #[from] for the codec layer

use crate::codec::CodecError;
use crate::connection::ConnectionState;

/// Errors surfaced across the connection, waiter and manager layers.
///
/// Codec-level failures ([`CodecError`]) convert into this type via
/// [`From`]; everything above the wire format speaks `PeerError`.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("invalid state: {0:?}")]
    InvalidState(ConnectionState),

    #[error("codec mismatch: expected {expected:#x}, actual {actual:#x}")]
    CodecMismatch { expected: u32, actual: u32 },

    #[error("truncated frame")]
    Truncated,

    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;

impl From<CodecError> for PeerError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Truncated { .. } => PeerError::Truncated,
            CodecError::CodeMismatch { expected, actual } => {
                PeerError::CodecMismatch { expected, actual }
            }
            CodecError::UnknownCode(code) => {
                PeerError::Protocol(format!("unknown wire code {code:#x}"))
            }
            CodecError::Compression(reason) => {
                PeerError::Protocol(format!("compression error: {reason}"))
            }
        }
    }
}
