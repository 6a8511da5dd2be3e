use thiserror::Error;

/// Errors that can occur during peer communication.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The 68-byte handshake did not match the required layout.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The peer announced a different torrent than ours.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// A message frame whose declared length does not fit its type.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    #[error("connection closed")]
    ConnectionClosed,
}
