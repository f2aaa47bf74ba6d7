//! Registry of connected peers and their lifecycle state
//!
//! This module tracks every peer the transport has registered, including:
//! - The peer's current `PeerState` and the only sanctioned way to change it
//! - The outbound queue used to push packets to the peer
//! - Which transport connection is the live one for a peer id
//! - Capacity enforcement for new registrations
//!
//! The registry is the liveness source of truth: a peer missing from it is
//! offline, even if a match still lists it as a member.

use crate::event::{ConnectionId, PeerSender};
use crate::timers::TimerHandle;
use log::{debug, info};
use shared::{PeerState, ServerPacket};
use std::collections::BTreeMap;

/// A connected peer and its transport handle
#[derive(Debug)]
pub struct Peer {
    /// Peer-chosen identifier, stable across reconnects
    pub id: String,
    /// Transport connection this entry belongs to
    pub conn_id: ConnectionId,
    state: PeerState,
    sender: PeerSender,
    /// Position in the matchmaking queue, refreshed on every entry into
    /// `lookingForMatch`
    seek_seq: u64,
    /// Pending `error` -> `idle` reversion, if any
    error_timer: Option<TimerHandle>,
}

impl Peer {
    /// Creates a peer in `idle`. The caller moves it to its first real state
    /// through `change_and_notify` so the client sees the transition.
    pub fn new(id: String, conn_id: ConnectionId, sender: PeerSender) -> Self {
        Self {
            id,
            conn_id,
            state: PeerState::Idle,
            sender,
            seek_seq: 0,
            error_timer: None,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn seek_seq(&self) -> u64 {
        self.seek_seq
    }

    /// Queues a packet for this peer. Delivery failures are not errors: a
    /// closed queue means the transport is about to report the disconnect.
    pub fn send(&self, packet: ServerPacket) {
        if self.sender.send(packet).is_err() {
            debug!("Dropped packet for {}: connection closed", self.id);
        }
    }

    /// Moves the peer to `to` and tells its client with a STATUS_UPDATE.
    /// Entering `lookingForMatch` goes through `PeerRegistry::change_and_notify`,
    /// which also stamps the queue position.
    pub fn change_and_notify(&mut self, to: PeerState) {
        let from = self.state;
        self.state = to;
        if to != PeerState::Error {
            self.error_timer = None;
        }
        debug!("Peer {} {} -> {}", self.id, from, to);
        self.send(ServerPacket::StatusUpdate { from, to });
    }

    pub fn send_error(&self, message: impl Into<String>) {
        self.send(ServerPacket::ServerError {
            message: message.into(),
        });
    }

    pub fn set_error_timer(&mut self, timer: TimerHandle) {
        self.error_timer = Some(timer);
    }

    /// Points this entry at a new transport connection and returns the old
    /// connection id. Dropping the old queue closes the old socket.
    pub fn replace_connection(&mut self, conn_id: ConnectionId, sender: PeerSender) -> ConnectionId {
        self.sender = sender;
        std::mem::replace(&mut self.conn_id, conn_id)
    }
}

/// All connected peers, keyed by id
#[derive(Debug)]
pub struct PeerRegistry {
    peers: BTreeMap<String, Peer>,
    max_connections: usize,
    /// Last queue position handed out
    seek_counter: u64,
}

impl PeerRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            peers: BTreeMap::new(),
            max_connections,
            seek_counter: 0,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.peers.len() < self.max_connections
    }

    /// Adds a peer entry. The caller must already have removed any previous
    /// entry for the same id.
    pub fn insert(&mut self, peer: Peer) {
        info!("Peer {} registered (connection {})", peer.id, peer.conn_id);
        self.peers.insert(peer.id.clone(), peer);
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<Peer> {
        let removed = self.peers.remove(peer_id);
        if let Some(peer) = &removed {
            info!("Peer {} deregistered (connection {})", peer.id, peer.conn_id);
        }
        removed
    }

    pub fn get(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut Peer> {
        self.peers.get_mut(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// True if `conn_id` is the live connection for `peer_id`.
    pub fn is_live(&self, peer_id: &str, conn_id: ConnectionId) -> bool {
        self.peers
            .get(peer_id)
            .is_some_and(|peer| peer.conn_id == conn_id)
    }

    pub fn state_of(&self, peer_id: &str) -> Option<PeerState> {
        self.peers.get(peer_id).map(Peer::state)
    }

    /// Sends to a peer if it is connected. Returns false if it is not.
    pub fn send_to(&self, peer_id: &str, packet: ServerPacket) -> bool {
        match self.peers.get(peer_id) {
            Some(peer) => {
                peer.send(packet);
                true
            }
            None => false,
        }
    }

    /// `Peer::change_and_notify` by id. A peer entering `lookingForMatch`
    /// from another state goes to the back of the queue. Returns false if the
    /// peer is offline.
    pub fn change_and_notify(&mut self, peer_id: &str, to: PeerState) -> bool {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return false;
        };

        if to == PeerState::LookingForMatch && peer.state != PeerState::LookingForMatch {
            self.seek_counter += 1;
            peer.seek_seq = self.seek_counter;
        }
        peer.change_and_notify(to);
        true
    }

    /// Peers in `lookingForMatch`, longest waiting first.
    pub fn seekers(&self) -> Vec<&Peer> {
        let mut seekers: Vec<&Peer> = self
            .peers
            .values()
            .filter(|peer| peer.state == PeerState::LookingForMatch)
            .collect();
        seekers.sort_by_key(|peer| peer.seek_seq);
        seekers
    }

    pub fn ids(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    /// Sends PEER_LIST_UPDATE with the full roster to every connected peer.
    pub fn broadcast_peer_list(&self) {
        let connected_peers = self.ids();
        for peer in self.peers.values() {
            peer.send(ServerPacket::PeerListUpdate {
                connected_peers: connected_peers.clone(),
            });
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
