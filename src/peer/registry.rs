use std::{collections::HashMap, net::SocketAddr, sync::Mutex};

use super::SessionHandle;

/// The shared registry of peers the torrent has a session with.
///
/// Connection tasks race to register the peers they handshake: insertion
/// is insert-if-absent under one short lock, so of two tasks connecting to
/// the same address exactly one obtains a session handle and the other
/// aborts its attempt.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// The source of session ids. Never reused within one registry.
    next_id: u64,
    sessions: HashMap<SocketAddr, u64>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the address already has a registered session.
    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.inner.lock().unwrap().sessions.contains_key(&addr)
    }

    /// Registers a session for the address, unless one already exists.
    pub fn insert(&self, addr: SocketAddr) -> Option<SessionHandle> {
        let mut inner = self.inner.lock().unwrap();
        if inner.sessions.contains_key(&addr) {
            return None;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.sessions.insert(addr, id);
        Some(SessionHandle { id, addr })
    }

    /// Removes the address's session, returning whether one existed.
    /// Invoked by the peer runtime when a session ends.
    pub fn remove(&self, addr: SocketAddr) -> bool {
        self.inner.lock().unwrap().sessions.remove(&addr).is_some()
    }

    /// The number of registered sessions.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
