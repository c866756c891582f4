use tokio::io::Error as IoError;
use tokio::sync::mpsc::error::SendError;

pub type Result<T, E = HandshakeError> = std::result::Result<T, E>;

/// The ways a single connection attempt can fail.
///
/// Every variant is an expected outcome of an open network and is contained
/// within the one connection task that produced it. None of these must ever
/// reach the gateway loop.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("invalid info hash")]
    /// Peer's torrent info hash did not match ours.
    InvalidInfoHash,

    #[error("invalid peer id")]
    /// The peer identified itself with a different id than the tracker
    /// announced for its address.
    InvalidPeerId,

    #[error("peer closed the connection mid-handshake")]
    /// The remote side went away before both handshake fields arrived.
    Disconnected,

    #[error("handshake timed out")]
    /// The peer did not complete the handshake within the allowed time.
    Timeout,

    #[error("peer is already registered")]
    /// Another task registered a session for this address first. The
    /// losing task simply aborts.
    AlreadyRegistered,

    #[error("channel error")]
    /// The peer runtime stopped listening for connected peers.
    Channel,

    #[error("{0}")]
    /// An IO error occurred.
    Io(std::io::Error),
}

impl From<IoError> for HandshakeError {
    fn from(value: IoError) -> Self {
        Self::Io(value)
    }
}

impl<T> From<SendError<T>> for HandshakeError {
    fn from(_: SendError<T>) -> Self {
        Self::Channel
    }
}

impl From<tokio::time::error::Elapsed> for HandshakeError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}
