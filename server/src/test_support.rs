//! Drives a `Coordinator` without a transport: each fake peer gets an inbox
//! and a connection id, and fired timers are read back from the event queue.

use crate::config::ServerConfig;
use crate::coordinator::Coordinator;
use crate::event::{ConnectionId, ServerEvent, TimerEvent};
use crate::timers::Timers;
use shared::{ClientPacket, PeerState, ServerPacket};
use std::collections::HashMap;
use tokio::sync::mpsc;

pub(crate) struct Harness {
    pub coordinator: Coordinator,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    inboxes: HashMap<String, mpsc::UnboundedReceiver<ServerPacket>>,
    connections: HashMap<String, ConnectionId>,
    next_conn_id: ConnectionId,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let (event_tx, events) = mpsc::unbounded_channel();
        Self {
            coordinator: Coordinator::new(config, Timers::new(event_tx)),
            events,
            inboxes: HashMap::new(),
            connections: HashMap::new(),
            next_conn_id: 0,
        }
    }

    pub fn connect(&mut self, peer_id: &str) -> ConnectionId {
        self.next_conn_id += 1;
        let conn_id = self.next_conn_id;
        let (sender, inbox) = mpsc::unbounded_channel();

        self.inboxes.insert(peer_id.to_string(), inbox);
        self.connections.insert(peer_id.to_string(), conn_id);
        self.coordinator.handle_event(ServerEvent::PeerConnected {
            peer_id: peer_id.to_string(),
            conn_id,
            sender,
        });
        conn_id
    }

    pub fn disconnect(&mut self, peer_id: &str) {
        let conn_id = self.connections.remove(peer_id).expect("peer was never connected");
        self.coordinator.handle_event(ServerEvent::PeerDisconnected {
            peer_id: peer_id.to_string(),
            conn_id,
        });
    }

    pub fn send(&mut self, peer_id: &str, packet: ClientPacket) {
        let conn_id = self.connections[peer_id];
        self.coordinator.handle_event(ServerEvent::PacketReceived {
            peer_id: peer_id.to_string(),
            conn_id,
            packet,
        });
    }

    pub fn send_malformed(&mut self, peer_id: &str, reason: &str) {
        let conn_id = self.connections[peer_id];
        self.coordinator.handle_event(ServerEvent::MalformedPacket {
            peer_id: peer_id.to_string(),
            conn_id,
            reason: reason.to_string(),
        });
    }

    /// Everything queued for `peer_id` since the last drain.
    pub fn drain(&mut self, peer_id: &str) -> Vec<ServerPacket> {
        let mut packets = Vec::new();
        if let Some(inbox) = self.inboxes.get_mut(peer_id) {
            while let Ok(packet) = inbox.try_recv() {
                packets.push(packet);
            }
        }
        packets
    }

    pub fn drain_all(&mut self) {
        let ids: Vec<String> = self.inboxes.keys().cloned().collect();
        for id in ids {
            self.drain(&id);
        }
    }

    pub fn state(&self, peer_id: &str) -> Option<PeerState> {
        self.coordinator.peer_state(peer_id)
    }

    /// Puts a peer in the pool without triggering a matchmaking pass.
    pub fn mark_seeking(&mut self, peer_id: &str) {
        self.coordinator
            .peers
            .change_and_notify(peer_id, PeerState::LookingForMatch);
    }

    pub async fn next_timer(&mut self) -> TimerEvent {
        loop {
            match self.events.recv().await {
                Some(ServerEvent::Timer(timer)) => return timer,
                Some(_) => continue,
                None => panic!("event queue closed"),
            }
        }
    }

    pub async fn fire_next_timer(&mut self) -> TimerEvent {
        let timer = self.next_timer().await;
        self.coordinator.handle_timer(timer.clone());
        timer
    }

    /// Connects `peer_ids` and walks them through a proposal into a match.
    /// The first id ends up as host. Inboxes are drained afterwards.
    pub fn form_match(&mut self, peer_ids: &[&str]) -> String {
        let (last, earlier) = peer_ids.split_last().expect("need at least one peer");

        for id in peer_ids {
            if self.coordinator.peer_state(id).is_none() {
                self.connect(id);
            }
        }
        for id in earlier {
            self.mark_seeking(id);
        }
        self.send(
            last,
            ClientPacket::LookingForMatch {
                max_peers: Some(peer_ids.len()),
            },
        );

        let proposal_id = self
            .coordinator
            .proposal_of(last)
            .map(|p| p.proposal_id.clone())
            .expect("no proposal was made");
        for id in earlier.iter().skip(1).chain(std::iter::once(last)) {
            self.send(
                id,
                ClientPacket::MatchAccept {
                    proposal_id: proposal_id.clone(),
                },
            );
        }

        let match_id = self
            .coordinator
            .match_id_of(peer_ids[0])
            .expect("no match was created")
            .to_string();
        self.drain_all();
        match_id
    }

    pub fn assert_invariants(&self) {
        self.coordinator.check_invariants();
    }
}
