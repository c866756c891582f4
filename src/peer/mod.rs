use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::net::TcpStream;

use crate::PeerId;

pub mod codec;
pub mod registry;

/// One candidate peer from a tracker announce.
///
/// Compact announce responses carry only the address; full-form responses
/// may also carry the id the peer registered with the tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AnnouncePeer {
    pub addr: SocketAddr,
    /// If present, the peer must identify itself with this id during the
    /// handshake or the connection is aborted.
    pub id: Option<PeerId>,
}

impl From<SocketAddr> for AnnouncePeer {
    fn from(addr: SocketAddr) -> Self {
        Self { addr, id: None }
    }
}

/// One batch of announce results, as delivered by the tracker task.
///
/// The gateway only ever consumes these, it never produces them.
#[derive(Clone, Debug, Default)]
pub struct AnnounceInfo {
    pub peers: Vec<AnnouncePeer>,
}

impl AnnounceInfo {
    pub fn new(peers: Vec<AnnouncePeer>) -> Self {
        Self { peers }
    }
}

/// Identifies one registered peer session within its torrent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    /// Unique within the registry that issued it.
    pub id: u64,
    pub addr: SocketAddr,
}

/// A live, handshaked peer connection, handed to the message runtime.
///
/// The gateway never touches the socket again after the handoff.
#[derive(Debug)]
pub struct ConnectedPeer {
    pub session: SessionHandle,
    /// The id the peer identified itself with during the handshake.
    pub peer_id: PeerId,
    pub socket: TcpStream,
    /// Bytes the peer sent past the end of the handshake, if any. The
    /// message runtime must treat these as the head of its first read.
    pub read_buf: BytesMut,
}
