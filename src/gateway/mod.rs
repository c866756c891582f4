use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use rand::seq::SliceRandom;
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::timeout,
};
use tokio_util::codec::Framed;

use crate::{
    error::gateway::{HandshakeError, Result},
    gateway::admission::{AdmissionSlot, ConnectionAdmission},
    peer::{
        codec::handshake::{HandshakeCodec, HandshakeFrame, Preamble},
        registry::PeerRegistry,
        AnnounceInfo, AnnouncePeer, ConnectedPeer,
    },
    PeerId, Sha1Hash,
};

pub mod admission;

/// The channel on which the tracker task delivers announce results.
pub type AnnounceSender = UnboundedSender<AnnounceInfo>;
type AnnounceReceiver = UnboundedReceiver<AnnounceInfo>;

/// The channel on which handshaked peers are handed to the message
/// runtime.
pub type ConnectedSender = UnboundedSender<ConnectedPeer>;

/// Information shared with every connection task of a torrent.
///
/// An arc copy of this context travels into each spawned task, there is no
/// ambient global state. Lifetime spans the torrent session.
#[derive(Debug)]
pub struct GatewayCtx {
    /// The info hash of the torrent, derived from its metainfo. This is
    /// used to identify the torrent with peers and to verify them.
    pub info_hash: Sha1Hash,
    /// The arbitrary client id, advertised to peers in the handshake.
    pub client_id: PeerId,
    /// The registry of peers the torrent has a session with, shared with
    /// the message runtime.
    pub registry: PeerRegistry,
    /// Bounds the connection attempts the gateway itself makes.
    pub outbound: Arc<ConnectionAdmission>,
    /// Bounds the connections a listener-side acceptor admits. Carried
    /// here so both directions share one context, only the outbound
    /// counter is exercised by the announce path.
    pub inbound: Arc<ConnectionAdmission>,
    /// Where successfully handshaked peers are handed off.
    pub connected_tx: ConnectedSender,
    /// How long one step of a connection attempt may take before the
    /// attempt is abandoned.
    pub handshake_timeout: Duration,
}

/// Parameters for the gateway constructor.
pub struct Params {
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub max_active_connections: usize,
    pub max_passive_connections: usize,
    pub handshake_timeout: Duration,
    pub connected_tx: ConnectedSender,
}

/// Turns tracker announce results into live, handshaked peer connections.
///
/// The gateway consumes announce batches from its queue one at a time:
/// peers we already have a session with are dropped, the admission counter
/// is asked for slots, and one connection task is spawned per admitted
/// peer. The loop never awaits the tasks it spawns, the queue is its sole
/// pacing mechanism.
pub struct Gateway {
    ctx: Arc<GatewayCtx>,
    announce_rx: AnnounceReceiver,
}

impl Gateway {
    pub fn new(params: Params) -> (Self, AnnounceSender) {
        let (announce_tx, announce_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(GatewayCtx {
            info_hash: params.info_hash,
            client_id: params.client_id,
            registry: PeerRegistry::new(),
            outbound: Arc::new(ConnectionAdmission::new(
                params.max_active_connections,
            )),
            inbound: Arc::new(ConnectionAdmission::new(
                params.max_passive_connections,
            )),
            connected_tx: params.connected_tx,
            handshake_timeout: params.handshake_timeout,
        });
        (Self { ctx, announce_rx }, announce_tx)
    }

    pub fn ctx(&self) -> Arc<GatewayCtx> {
        Arc::clone(&self.ctx)
    }

    /// Runs the announce-consumption loop until the announce channel
    /// closes. A single peer's misbehavior can never end this loop.
    pub async fn run(&mut self) {
        while let Some(announce) = self.announce_rx.recv().await {
            self.handle_announce(announce);
        }
        log::info!("announce channel closed, gateway stopping");
    }

    /// Admits one announce batch and spawns its connection tasks.
    fn handle_announce(&self, announce: AnnounceInfo) {
        let mut candidates: Vec<AnnouncePeer> = announce
            .peers
            .into_iter()
            .filter(|peer| !self.ctx.registry.contains(peer.addr))
            .collect();

        let slots = self.ctx.outbound.reserve_slots(candidates.len());
        log::debug!(
            "announce with {} new peers, {} admitted",
            candidates.len(),
            slots.len()
        );

        // shuffle before truncating to the admitted count, so attempts are
        // spread fairly across the candidate set instead of favoring
        // whichever peers the tracker happened to list first
        candidates.shuffle(&mut rand::thread_rng());

        for (peer, slot) in candidates.into_iter().zip(slots) {
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                if let Err(e) = connect_peer(ctx, peer, slot).await {
                    log::debug!("failed handshake with {}: {}", peer.addr, e);
                }
            });
        }
    }
}

/// Runs one outbound connection attempt end to end.
///
/// The task owns both of its resources: the admission slot is given back
/// when the slot guard drops and the socket closes when it drops, so every
/// exit path below, early return or handoff, upholds the release
/// invariants. Every error is an expected outcome of an open network and
/// is only ever logged by the caller.
async fn connect_peer(
    ctx: Arc<GatewayCtx>,
    peer: AnnouncePeer,
    _slot: AdmissionSlot,
) -> Result<()> {
    let socket =
        timeout(ctx.handshake_timeout, TcpStream::connect(peer.addr)).await??;
    let mut socket = Framed::new(socket, HandshakeCodec::default());

    socket
        .send(HandshakeFrame::Preamble(Preamble::new(ctx.info_hash)))
        .await?;

    let preamble = match next_frame(&mut socket, ctx.handshake_timeout).await? {
        HandshakeFrame::Preamble(preamble) => preamble,
        // the codec always yields the preamble frame first
        HandshakeFrame::PeerId(_) => unreachable!(),
    };
    if preamble.info_hash != ctx.info_hash {
        return Err(HandshakeError::InvalidInfoHash);
    }

    socket.send(HandshakeFrame::PeerId(ctx.client_id)).await?;

    // the peer may have sent its id in the same flight as its preamble, in
    // which case the codec serves it from the leftover bytes of that read
    let peer_id = match next_frame(&mut socket, ctx.handshake_timeout).await? {
        HandshakeFrame::PeerId(peer_id) => peer_id,
        HandshakeFrame::Preamble(_) => unreachable!(),
    };
    if let Some(expected) = peer.id {
        if expected != peer_id {
            return Err(HandshakeError::InvalidPeerId);
        }
    }

    // another task may have registered this address while we were
    // handshaking, in which case this attempt simply loses the race
    let session = ctx
        .registry
        .insert(peer.addr)
        .ok_or(HandshakeError::AlreadyRegistered)?;

    let parts = socket.into_parts();
    let connected = ConnectedPeer {
        session,
        peer_id,
        socket: parts.io,
        read_buf: parts.read_buf,
    };

    log::info!("connected to peer {}", peer.addr);
    if let Err(e) = ctx.connected_tx.send(connected) {
        // the runtime is gone, roll the registration back
        ctx.registry.remove(peer.addr);
        return Err(e.into());
    }
    Ok(())
}

async fn next_frame(
    socket: &mut Framed<TcpStream, HandshakeCodec>,
    dur: Duration,
) -> Result<HandshakeFrame> {
    match timeout(dur, socket.next()).await? {
        Some(frame) => Ok(frame?),
        None => Err(HandshakeError::Disconnected),
    }
}
