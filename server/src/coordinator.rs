//! The single owner of all matchmaking state.
//!
//! Every transport event and every fired timer is handled here, one at a
//! time, by the event loop in `network`. Handlers run to completion against
//! the four shared maps, so operations that touch several of them (accepting
//! a proposal, dropping a match member) are never interleaved with another
//! peer's events.
//!
//! The component logic lives in `impl Coordinator` blocks next to the data it
//! works on: proposals in `matchmaking`, matches in `match_manager` and score
//! voting in `score`. This module holds the connection lifecycle and packet
//! dispatch.

use crate::config::ServerConfig;
use crate::error::CoordinatorError;
use crate::event::{ConnectionId, PeerSender, ServerEvent, TimerEvent};
use crate::match_manager::{active_members_of, notify_match_reconnection, EndReason, Match};
use crate::matchmaking::MatchProposal;
use crate::peer_registry::{Peer, PeerRegistry};
use crate::timers::Timers;
use log::{debug, info, warn};
use shared::{ClientPacket, PeerState, Scores, ServerPacket};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug)]
pub struct Coordinator {
    pub(crate) peers: PeerRegistry,
    /// Seat memory: survives a member's disconnect so it can rejoin
    pub(crate) peer_to_match: HashMap<String, String>,
    pub(crate) matches: HashMap<String, Match>,
    pub(crate) proposals: HashMap<String, MatchProposal>,
    pub(crate) timers: Timers,
    pub(crate) config: ServerConfig,
}

/// Snapshot for the periodic debug log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub peers: usize,
    pub seekers: usize,
    pub proposals: usize,
    pub matches: usize,
}

impl fmt::Display for CoordinatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} peers ({} seeking), {} proposals, {} matches",
            self.peers, self.seekers, self.proposals, self.matches
        )
    }
}

impl Coordinator {
    pub fn new(config: ServerConfig, timers: Timers) -> Self {
        Self {
            peers: PeerRegistry::new(config.max_connections),
            peer_to_match: HashMap::new(),
            matches: HashMap::new(),
            proposals: HashMap::new(),
            timers,
            config,
        }
    }

    /// Handles one event. Returns false when the loop should stop.
    pub fn handle_event(&mut self, event: ServerEvent) -> bool {
        match event {
            ServerEvent::PeerConnected {
                peer_id,
                conn_id,
                sender,
            } => self.handle_connect(peer_id, conn_id, sender),
            ServerEvent::PeerDisconnected { peer_id, conn_id } => {
                self.handle_disconnect(&peer_id, conn_id)
            }
            ServerEvent::PacketReceived {
                peer_id,
                conn_id,
                packet,
            } => self.handle_packet(&peer_id, conn_id, packet),
            ServerEvent::MalformedPacket {
                peer_id,
                conn_id,
                reason,
            } => self.handle_malformed(&peer_id, conn_id, &reason),
            ServerEvent::Timer(timer) => self.handle_timer(timer),
            ServerEvent::Shutdown => {
                info!("Coordinator stopping: {}", self.stats());
                return false;
            }
        }
        true
    }

    pub fn handle_connect(&mut self, peer_id: String, conn_id: ConnectionId, sender: PeerSender) {
        if self.peers.contains(&peer_id) {
            self.replace_connection(&peer_id, conn_id, sender);
            self.peers.broadcast_peer_list();
            return;
        }

        if !self.peers.has_capacity() {
            warn!("Refusing {}: {} peers connected", peer_id, self.peers.len());
            if sender
                .send(ServerPacket::ServerError {
                    message: CoordinatorError::ServerFull.to_string(),
                })
                .is_err()
            {
                debug!("Connection {} closed before refusal", conn_id);
            }
            return;
        }

        self.register(peer_id, conn_id, sender);
        self.peers.broadcast_peer_list();
    }

    /// Ignores disconnects from connections that were already replaced.
    pub fn handle_disconnect(&mut self, peer_id: &str, conn_id: ConnectionId) {
        if !self.peers.is_live(peer_id, conn_id) {
            debug!("Ignoring stale disconnect of {} ({})", peer_id, conn_id);
            return;
        }

        self.deregister(peer_id);
        self.peers.broadcast_peer_list();
    }

    pub fn handle_packet(&mut self, peer_id: &str, conn_id: ConnectionId, packet: ClientPacket) {
        if !self.peers.is_live(peer_id, conn_id) {
            debug!("Ignoring packet from stale connection {} of {}", conn_id, peer_id);
            return;
        }

        debug!("Packet from {}: {:?}", peer_id, packet);
        if let Err(e) = self.dispatch(peer_id, packet) {
            warn!("Rejected packet from {}: {}", peer_id, e);
            if let Some(peer) = self.peers.get(peer_id) {
                peer.send_error(e.to_string());
            }
        }
    }

    pub fn handle_malformed(&mut self, peer_id: &str, conn_id: ConnectionId, reason: &str) {
        if !self.peers.is_live(peer_id, conn_id) {
            return;
        }

        warn!("Malformed packet from {}: {}", peer_id, reason);
        if let Some(peer) = self.peers.get(peer_id) {
            peer.send_error(CoordinatorError::Malformed(reason.to_string()).to_string());
        }
        self.enter_error_state(peer_id);
    }

    pub fn handle_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::ProposalTimeout { proposal_id } => {
                self.handle_proposal_timeout(&proposal_id);
            }
            TimerEvent::MatchTimeout { match_id } => {
                self.end_match(&match_id, EndReason::Timeout);
            }
            TimerEvent::ErrorRevert { peer_id, conn_id } => {
                self.revert_error_state(&peer_id, conn_id);
            }
        }
    }

    fn dispatch(&mut self, peer_id: &str, packet: ClientPacket) -> Result<(), CoordinatorError> {
        match packet {
            ClientPacket::LookingForMatch { max_peers } => {
                self.handle_looking_for_match(peer_id, max_peers)
            }
            ClientPacket::CancelMatchSearch { reason } => {
                self.handle_cancel_search(peer_id, reason.as_deref())
            }
            ClientPacket::MatchAccept { proposal_id } => {
                self.accept_proposal(peer_id, &proposal_id).map(|_| ())
            }
            ClientPacket::MatchDecline { proposal_id } => {
                self.decline_proposal(peer_id, &proposal_id)
            }
            ClientPacket::LeaveMatch { reason, scores } => {
                self.handle_leave_match(peer_id, reason.as_deref(), scores)
            }
            ClientPacket::SubmitScore { scores } => self.handle_submit_score(peer_id, scores),
        }
    }

    fn handle_looking_for_match(
        &mut self,
        peer_id: &str,
        requested: Option<usize>,
    ) -> Result<(), CoordinatorError> {
        let state = self.current_state(peer_id);
        if !matches!(
            state,
            PeerState::Connected | PeerState::Idle | PeerState::LookingForMatch
        ) {
            return Err(CoordinatorError::CannotSeek(state));
        }

        let max_peers = self.config.normalize_max_peers(requested);
        self.peers.change_and_notify(peer_id, PeerState::LookingForMatch);
        self.attempt_matchmaking(peer_id, max_peers);
        Ok(())
    }

    /// Leaving the pool also withdraws the peer from any pending proposal.
    fn handle_cancel_search(
        &mut self,
        peer_id: &str,
        reason: Option<&str>,
    ) -> Result<(), CoordinatorError> {
        let state = self.current_state(peer_id);
        if state != PeerState::LookingForMatch {
            return Err(CoordinatorError::CannotCancel(state));
        }

        let pending = self
            .proposals
            .values()
            .find(|p| p.is_member(peer_id))
            .map(|p| p.proposal_id.clone());
        if let Some(proposal_id) = pending {
            self.decline_proposal(peer_id, &proposal_id)?;
        }

        info!(
            "Peer {} stopped searching: {}",
            peer_id,
            reason.unwrap_or("no reason given")
        );
        self.peers.change_and_notify(peer_id, PeerState::Connected);
        Ok(())
    }

    fn handle_leave_match(
        &mut self,
        peer_id: &str,
        reason: Option<&str>,
        scores: Option<Scores>,
    ) -> Result<(), CoordinatorError> {
        let state = self.current_state(peer_id);
        if state != PeerState::Match {
            return Err(CoordinatorError::CannotLeave(state));
        }

        let Some(match_id) = self.current_match_id(peer_id) else {
            self.peer_to_match.remove(peer_id);
            self.peers.change_and_notify(peer_id, PeerState::Connected);
            return Ok(());
        };

        if let Some(scores) = scores {
            self.submit_score(peer_id, &match_id, scores);
        }

        info!(
            "Peer {} leaving match {}: {}",
            peer_id,
            match_id,
            reason.unwrap_or("no reason given")
        );
        self.leave_peer_from_match(peer_id, &match_id);

        if self
            .matches
            .get(&match_id)
            .is_some_and(|m| m.active_members == 0)
        {
            self.end_match(&match_id, EndReason::AllPlayersLeft);
        }
        Ok(())
    }

    fn handle_submit_score(&mut self, peer_id: &str, scores: Scores) -> Result<(), CoordinatorError> {
        let state = self.current_state(peer_id);
        if state != PeerState::Match {
            return Err(CoordinatorError::CannotSubmit(state));
        }

        let match_id = self
            .current_match_id(peer_id)
            .ok_or(CoordinatorError::NoActiveMatch)?;
        if self.submit_score(peer_id, &match_id, scores.clone()) {
            self.notify_score_submitted(peer_id, &match_id, &scores);
        }
        Ok(())
    }

    fn register(&mut self, peer_id: String, conn_id: ConnectionId, sender: PeerSender) {
        self.peers.insert(Peer::new(peer_id.clone(), conn_id, sender));

        if let Some(match_id) = self.peer_to_match.get(&peer_id).cloned() {
            if self.matches.contains_key(&match_id) {
                self.rejoin_match(&peer_id, &match_id);
                return;
            }
            debug!("Purging stale match {} for {}", match_id, peer_id);
            self.peer_to_match.remove(&peer_id);
        }

        self.peers.change_and_notify(&peer_id, PeerState::Connected);
    }

    /// A second connection for a registered id takes over the entry in place.
    /// State, match seat and `activeMembers` are untouched; the new client is
    /// told where it stands.
    fn replace_connection(&mut self, peer_id: &str, conn_id: ConnectionId, sender: PeerSender) {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };

        let old_conn = peer.replace_connection(conn_id, sender);
        warn!(
            "Peer {} connected again on connection {}, closing connection {}",
            peer_id, conn_id, old_conn
        );

        let state = peer.state();
        peer.change_and_notify(state);

        match state {
            PeerState::Error => self.arm_error_revert(peer_id),
            PeerState::Match => {
                if let Some(m) = self
                    .current_match_id(peer_id)
                    .and_then(|match_id| self.matches.get(&match_id))
                {
                    notify_match_reconnection(&self.peers, peer_id, m);
                }
            }
            _ => {}
        }
    }

    fn rejoin_match(&mut self, peer_id: &str, match_id: &str) {
        let Some(m) = self.matches.get_mut(match_id) else {
            return;
        };

        m.active_members = (m.active_members + 1).min(m.peer_ids.len());
        self.peers.change_and_notify(peer_id, PeerState::Match);
        notify_match_reconnection(&self.peers, peer_id, m);

        for other in active_members_of(&self.peers, &self.peer_to_match, m) {
            if other != peer_id {
                self.peers.send_to(
                    &other,
                    ServerPacket::PeerReconnected {
                        peer_id: peer_id.to_string(),
                    },
                );
            }
        }

        info!(
            "Peer {} rejoined match {} ({} active)",
            peer_id, match_id, m.active_members
        );
    }

    /// Drops a peer's registration. Its match seat is kept for a reconnect.
    fn deregister(&mut self, peer_id: &str) {
        if self.peers.remove(peer_id).is_none() {
            return;
        }

        let Some(match_id) = self.peer_to_match.get(peer_id).cloned() else {
            return;
        };
        let Some(m) = self.matches.get_mut(&match_id) else {
            self.peer_to_match.remove(peer_id);
            return;
        };

        m.active_members = m.active_members.saturating_sub(1);
        let remaining = m.active_members;
        let was_host = m.host_id == peer_id;

        for other in active_members_of(&self.peers, &self.peer_to_match, m) {
            if other != peer_id {
                self.peers.send_to(
                    &other,
                    ServerPacket::PeerDisconnected {
                        peer_id: peer_id.to_string(),
                    },
                );
            }
        }

        if remaining == 0 {
            self.end_match(&match_id, EndReason::AllPlayersLeft);
        } else if was_host {
            self.assign_new_host(&match_id);
        }
    }

    /// Puts a peer in `error` unless that would abandon a match or a pending
    /// acceptance. It reverts to `idle` after the configured delay.
    fn enter_error_state(&mut self, peer_id: &str) {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        if matches!(peer.state(), PeerState::Match | PeerState::MatchAccepting) {
            return;
        }

        peer.change_and_notify(PeerState::Error);
        self.arm_error_revert(peer_id);
    }

    /// The revert is tied to the current connection.
    fn arm_error_revert(&mut self, peer_id: &str) {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };

        let timer = self.timers.arm(
            self.config.error_revert_delay,
            TimerEvent::ErrorRevert {
                peer_id: peer_id.to_string(),
                conn_id: peer.conn_id,
            },
        );
        peer.set_error_timer(timer);
    }

    fn revert_error_state(&mut self, peer_id: &str, conn_id: ConnectionId) {
        if self.peers.is_live(peer_id, conn_id)
            && self.peers.state_of(peer_id) == Some(PeerState::Error)
        {
            self.peers.change_and_notify(peer_id, PeerState::Idle);
        }
    }

    fn current_state(&self, peer_id: &str) -> PeerState {
        self.peers.state_of(peer_id).unwrap_or(PeerState::Idle)
    }

    /// The peer's match, if the index points at one that still exists.
    fn current_match_id(&self, peer_id: &str) -> Option<String> {
        self.peer_to_match
            .get(peer_id)
            .filter(|id| self.matches.contains_key(*id))
            .cloned()
    }

    pub fn peer_state(&self, peer_id: &str) -> Option<PeerState> {
        self.peers.state_of(peer_id)
    }

    pub fn get_match(&self, match_id: &str) -> Option<&Match> {
        self.matches.get(match_id)
    }

    pub fn match_id_of(&self, peer_id: &str) -> Option<&str> {
        self.peer_to_match.get(peer_id).map(String::as_str)
    }

    pub fn proposal(&self, proposal_id: &str) -> Option<&MatchProposal> {
        self.proposals.get(proposal_id)
    }

    pub fn proposal_of(&self, peer_id: &str) -> Option<&MatchProposal> {
        self.proposals.values().find(|p| p.is_member(peer_id))
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn match_count(&self) -> usize {
        self.matches.len()
    }

    pub fn proposal_count(&self) -> usize {
        self.proposals.len()
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            peers: self.peers.len(),
            seekers: self.peers.seekers().len(),
            proposals: self.proposals.len(),
            matches: self.matches.len(),
        }
    }

    /// Panics if the maps disagree with each other.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        for (peer_id, match_id) in &self.peer_to_match {
            if let Some(m) = self.matches.get(match_id) {
                assert!(m.is_member(peer_id), "{} indexed to {} but not a member", peer_id, match_id);
            }
        }

        for (match_id, m) in &self.matches {
            assert!(m.is_member(&m.host_id), "host of {} is not a member", match_id);
            assert!(m.active_members > 0, "match {} has no active members", match_id);
            assert_eq!(
                m.active_members,
                active_members_of(&self.peers, &self.peer_to_match, m).len(),
                "active member count of {} is off",
                match_id
            );
        }

        for proposal in self.proposals.values() {
            for accepted in &proposal.accepted_peers {
                assert!(proposal.is_member(accepted));
            }
        }

        for peer_id in self.peers.ids() {
            if self.peers.state_of(&peer_id) == Some(PeerState::Match) {
                assert!(
                    self.current_match_id(&peer_id).is_some(),
                    "{} is in match state without a match",
                    peer_id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use std::time::Duration;

    fn status(from: PeerState, to: PeerState) -> ServerPacket {
        ServerPacket::StatusUpdate { from, to }
    }

    #[tokio::test]
    async fn test_connect_moves_peer_to_connected() {
        let mut harness = Harness::new();
        harness.connect("p1");

        assert_eq!(harness.state("p1"), Some(PeerState::Connected));
        assert_eq!(
            harness.drain("p1"),
            vec![
                status(PeerState::Idle, PeerState::Connected),
                ServerPacket::PeerListUpdate {
                    connected_peers: vec!["p1".to_string()]
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_peer_list_follows_connects_and_disconnects() {
        let mut harness = Harness::new();
        harness.connect("p1");
        harness.connect("p2");
        harness.drain_all();

        harness.disconnect("p2");

        assert_eq!(
            harness.drain("p1"),
            vec![ServerPacket::PeerListUpdate {
                connected_peers: vec!["p1".to_string()]
            }]
        );
        assert_eq!(harness.coordinator.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_capacity_refuses_extra_peers() {
        let config = ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        };
        let mut harness = Harness::with_config(config);
        harness.connect("p1");
        harness.connect("p2");

        assert_eq!(harness.state("p2"), None);
        assert_eq!(
            harness.drain("p2"),
            vec![ServerPacket::ServerError {
                message: "Server full".to_string()
            }]
        );
        assert_eq!(harness.coordinator.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_reconnection_restores_match_seat() {
        let mut harness = Harness::new();
        let match_id = harness.form_match(&["p1", "p2", "p3"]);
        let before = harness.coordinator.get_match(&match_id).unwrap().active_members;

        harness.disconnect("p2");
        assert_eq!(
            harness.coordinator.get_match(&match_id).unwrap().active_members,
            before - 1
        );
        assert_eq!(harness.coordinator.match_id_of("p2"), Some(match_id.as_str()));
        assert!(harness.drain("p1").contains(&ServerPacket::PeerDisconnected {
            peer_id: "p2".to_string()
        }));

        harness.connect("p2");

        assert_eq!(
            harness.coordinator.get_match(&match_id).unwrap().active_members,
            before
        );
        assert_eq!(harness.state("p2"), Some(PeerState::Match));
        let p2 = harness.drain("p2");
        assert!(p2.contains(&status(PeerState::Idle, PeerState::Match)));
        assert!(p2.contains(&ServerPacket::MatchReconnected {
            match_id: match_id.clone(),
            peer_ids: vec!["p1".to_string(), "p2".to_string(), "p3".to_string()],
            is_host: false,
        }));
        assert!(harness.drain("p3").contains(&ServerPacket::PeerReconnected {
            peer_id: "p2".to_string()
        }));
        harness.assert_invariants();
    }

    #[tokio::test]
    async fn test_reconnect_after_match_ended_is_fresh() {
        let mut harness = Harness::new();
        let match_id = harness.form_match(&["p1", "p2"]);

        harness.disconnect("p2");
        harness.coordinator.end_match(&match_id, EndReason::Timeout);
        harness.connect("p2");

        assert_eq!(harness.state("p2"), Some(PeerState::Connected));
        assert_eq!(harness.coordinator.match_id_of("p2"), None);
        harness.assert_invariants();
    }

    #[tokio::test]
    async fn test_last_member_leaving_ends_match() {
        let mut harness = Harness::new();
        let match_id = harness.form_match(&["p1", "p2"]);

        harness.send(
            "p1",
            ClientPacket::LeaveMatch {
                reason: Some("done".to_string()),
                scores: None,
            },
        );
        let m = harness.coordinator.get_match(&match_id).unwrap();
        assert_eq!(m.active_members, 1);
        assert_eq!(m.host_id, "p2");
        harness.assert_invariants();

        harness.disconnect("p2");

        assert!(harness.coordinator.get_match(&match_id).is_none());
        assert_eq!(harness.coordinator.match_id_of("p1"), None);
        assert_eq!(harness.coordinator.match_id_of("p2"), None);
        harness.assert_invariants();
    }

    #[tokio::test]
    async fn test_everyone_leaving_ends_match() {
        let mut harness = Harness::new();
        let match_id = harness.form_match(&["p1", "p2"]);
        let leave = || ClientPacket::LeaveMatch {
            reason: None,
            scores: Some(Scores::new().with("winner", "p1")),
        };

        harness.send("p1", leave());
        harness.send("p2", leave());

        assert_eq!(harness.coordinator.match_count(), 0);
        assert_eq!(harness.state("p1"), Some(PeerState::Connected));
        assert_eq!(harness.state("p2"), Some(PeerState::Connected));
        harness.assert_invariants();
    }

    #[tokio::test]
    async fn test_leave_with_scores_records_them() {
        let mut harness = Harness::new();
        let match_id = harness.form_match(&["p1", "p2", "p3"]);
        let scores = Scores::new().with("p1", "5").with("p2", "3");

        harness.send(
            "p1",
            ClientPacket::LeaveMatch {
                reason: None,
                scores: Some(scores.clone()),
            },
        );

        let m = harness.coordinator.get_match(&match_id).unwrap();
        assert!(m.results.contains(&Some(scores)));
        assert!(!harness
            .drain("p2")
            .iter()
            .any(|p| matches!(p, ServerPacket::ScoreSubmitted { .. })));
    }

    #[tokio::test]
    async fn test_protocol_misuse_is_reported() {
        let mut harness = Harness::new();
        harness.connect("p1");
        harness.drain_all();

        harness.send("p1", ClientPacket::CancelMatchSearch { reason: None });
        harness.send(
            "p1",
            ClientPacket::LeaveMatch {
                reason: None,
                scores: None,
            },
        );

        assert_eq!(
            harness.drain("p1"),
            vec![
                ServerPacket::ServerError {
                    message: "Can't cancel match search while in connected".to_string()
                },
                ServerPacket::ServerError {
                    message: "Can't leave match while in connected".to_string()
                },
            ]
        );
        assert_eq!(harness.state("p1"), Some(PeerState::Connected));
    }

    #[tokio::test]
    async fn test_cannot_seek_from_match() {
        let mut harness = Harness::new();
        harness.form_match(&["p1", "p2"]);

        harness.send("p1", ClientPacket::LookingForMatch { max_peers: None });

        assert_eq!(
            harness.drain("p1"),
            vec![ServerPacket::ServerError {
                message: "Can't look for a match while in match".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_cancel_search_withdraws_from_proposal() {
        let mut harness = Harness::new();
        harness.connect("p1");
        harness.connect("p2");
        harness.send("p1", ClientPacket::LookingForMatch { max_peers: None });
        harness.send("p2", ClientPacket::LookingForMatch { max_peers: None });
        assert_eq!(harness.coordinator.proposal_count(), 1);
        harness.drain_all();

        harness.send("p2", ClientPacket::CancelMatchSearch { reason: None });

        assert_eq!(harness.coordinator.proposal_count(), 0);
        assert_eq!(harness.state("p2"), Some(PeerState::Connected));
        assert_eq!(harness.state("p1"), Some(PeerState::LookingForMatch));
        assert!(harness
            .drain("p1")
            .iter()
            .any(|p| matches!(p, ServerPacket::PeerDeclinedMatch { peer_id, .. } if peer_id == "p2")));
    }

    #[tokio::test]
    async fn test_duplicate_connect_replaces_old_connection() {
        let mut harness = Harness::new();
        let old_conn = harness.connect("p1");
        harness.send("p1", ClientPacket::LookingForMatch { max_peers: None });

        harness.connect("p1");
        assert_eq!(harness.state("p1"), Some(PeerState::LookingForMatch));
        assert_eq!(
            harness.drain("p1"),
            vec![
                status(PeerState::LookingForMatch, PeerState::LookingForMatch),
                ServerPacket::PeerListUpdate {
                    connected_peers: vec!["p1".to_string()]
                },
            ]
        );

        // Events from the replaced connection no longer count.
        harness.coordinator.handle_event(ServerEvent::PeerDisconnected {
            peer_id: "p1".to_string(),
            conn_id: old_conn,
        });
        assert_eq!(harness.state("p1"), Some(PeerState::LookingForMatch));
        assert_eq!(harness.coordinator.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_connect_keeps_match_seat() {
        let mut harness = Harness::new();
        let match_id = harness.form_match(&["p1", "p2"]);

        harness.connect("p1");

        assert_eq!(harness.state("p1"), Some(PeerState::Match));
        assert_eq!(
            harness.coordinator.get_match(&match_id).unwrap().active_members,
            2
        );
        assert!(harness.drain("p1").contains(&ServerPacket::MatchReconnected {
            match_id,
            peer_ids: vec!["p1".to_string(), "p2".to_string()],
            is_host: true,
        }));
        assert!(!harness.drain("p2").iter().any(|p| matches!(
            p,
            ServerPacket::PeerDisconnected { .. } | ServerPacket::PeerReconnected { .. }
        )));
        harness.assert_invariants();
    }

    #[tokio::test]
    async fn test_duplicate_connect_of_last_member_keeps_match() {
        let mut harness = Harness::new();
        let match_id = harness.form_match(&["p1", "p2"]);
        harness.send(
            "p2",
            ClientPacket::LeaveMatch {
                reason: None,
                scores: None,
            },
        );
        assert_eq!(
            harness.coordinator.get_match(&match_id).unwrap().active_members,
            1
        );

        harness.connect("p1");

        let m = harness.coordinator.get_match(&match_id).unwrap();
        assert_eq!(m.active_members, 1);
        assert_eq!(m.host_id, "p1");
        assert_eq!(harness.state("p1"), Some(PeerState::Match));
        harness.assert_invariants();
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_connect_in_error_still_reverts() {
        let mut harness = Harness::new();
        harness.connect("p1");
        harness.send_malformed("p1", "trailing characters");

        harness.connect("p1");
        assert_eq!(harness.state("p1"), Some(PeerState::Error));

        harness.fire_next_timer().await;
        assert_eq!(harness.state("p1"), Some(PeerState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_packet_reverts_after_delay() {
        let mut harness = Harness::new();
        harness.connect("p1");
        harness.drain_all();

        harness.send_malformed("p1", "expected value at line 1 column 1");

        assert_eq!(harness.state("p1"), Some(PeerState::Error));
        assert_eq!(
            harness.drain("p1"),
            vec![
                ServerPacket::ServerError {
                    message: "Malformed packet: expected value at line 1 column 1".to_string()
                },
                status(PeerState::Connected, PeerState::Error),
            ]
        );

        let start = tokio::time::Instant::now();
        harness.fire_next_timer().await;
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(6));
        assert_eq!(harness.state("p1"), Some(PeerState::Idle));

        harness.send("p1", ClientPacket::LookingForMatch { max_peers: None });
        assert_eq!(harness.state("p1"), Some(PeerState::LookingForMatch));
    }

    #[tokio::test]
    async fn test_malformed_packet_keeps_match_state() {
        let mut harness = Harness::new();
        harness.form_match(&["p1", "p2"]);

        harness.send_malformed("p1", "bad frame");

        assert_eq!(harness.state("p1"), Some(PeerState::Match));
        harness.assert_invariants();
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_timeout_ends_match() {
        let mut harness = Harness::new();
        let match_id = harness.form_match(&["p1", "p2"]);

        let timer = harness.fire_next_timer().await;

        assert_eq!(timer, TimerEvent::MatchTimeout { match_id });
        assert_eq!(harness.coordinator.match_count(), 0);
        assert!(harness.drain("p1").contains(&ServerPacket::MatchEnded {
            reason: "Match timed out".to_string(),
            final_score: Scores::default(),
        }));
    }

    #[tokio::test]
    async fn test_stats_summary() {
        let mut harness = Harness::new();
        harness.form_match(&["p1", "p2"]);
        harness.connect("p3");
        harness.send("p3", ClientPacket::LookingForMatch { max_peers: None });

        let stats = harness.coordinator.stats();
        assert_eq!(
            stats,
            CoordinatorStats {
                peers: 3,
                seekers: 1,
                proposals: 0,
                matches: 1
            }
        );
        assert_eq!(
            stats.to_string(),
            "3 peers (1 seeking), 0 proposals, 1 matches"
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_loop() {
        let mut harness = Harness::new();
        assert!(!harness.coordinator.handle_event(ServerEvent::Shutdown));
    }
}
