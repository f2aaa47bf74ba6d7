//! Active match lifetime: creation, membership, host role and teardown
//!
//! A match is created from a fully accepted proposal and lives until it is
//! ended by its auto-end timer or by its last active member leaving. Members
//! who drop their transport keep their seat (the peer -> match index entry)
//! so they can reconnect; members who explicitly leave give it up.

use crate::coordinator::Coordinator;
use crate::event::TimerEvent;
use crate::peer_registry::PeerRegistry;
use crate::score::calculate_final_score;
use crate::timers::TimerHandle;
use crate::utils::{generate_match_id, get_timestamp};
use log::{debug, info, warn};
use shared::{PeerState, Scores, ServerPacket};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug)]
pub struct Match {
    pub match_id: String,
    /// Members in creation order; never changes after creation
    pub peer_ids: Vec<String>,
    /// Always one of `peer_ids`
    pub host_id: String,
    /// Unix millis
    pub start_time: u64,
    /// Members currently connected and still holding their seat
    pub active_members: usize,
    pub max_peers: usize,
    /// Score reports; `None` marks a member that has not reported
    pub results: Vec<Option<Scores>>,
    /// Consensus score, empty until some report reaches a strict majority
    pub final_score: Scores,
    timeout: Option<TimerHandle>,
}

impl Match {
    pub fn is_member(&self, peer_id: &str) -> bool {
        self.peer_ids.iter().any(|id| id == peer_id)
    }

    fn cancel_timeout(&mut self) {
        if let Some(timer) = self.timeout.take() {
            timer.cancel();
        }
    }
}

/// Why a match was torn down, as reported in MATCH_ENDED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Timeout,
    AllPlayersLeft,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Timeout => f.write_str("Match timed out"),
            EndReason::AllPlayersLeft => f.write_str("All players left the match"),
        }
    }
}

/// Host policy shared by match creation and host migration: the first entry
/// of `peer_ids`, in their original order, that is eligible and is not
/// `excluding`.
pub fn pick_host<'a>(
    peer_ids: &'a [String],
    excluding: Option<&str>,
    is_eligible: impl Fn(&str) -> bool,
) -> Option<&'a str> {
    peer_ids
        .iter()
        .map(String::as_str)
        .find(|id| Some(*id) != excluding && is_eligible(id))
}

/// A member is active while it is connected and its index entry still points
/// at this match.
pub(crate) fn is_active_member(
    peers: &PeerRegistry,
    peer_to_match: &HashMap<String, String>,
    peer_id: &str,
    match_id: &str,
) -> bool {
    peers.contains(peer_id) && peer_to_match.get(peer_id).map(String::as_str) == Some(match_id)
}

pub(crate) fn active_members_of(
    peers: &PeerRegistry,
    peer_to_match: &HashMap<String, String>,
    m: &Match,
) -> Vec<String> {
    m.peer_ids
        .iter()
        .filter(|id| is_active_member(peers, peer_to_match, id, &m.match_id))
        .cloned()
        .collect()
}

fn notify_match_created(peers: &PeerRegistry, m: &Match) {
    for peer_id in &m.peer_ids {
        peers.send_to(
            peer_id,
            ServerPacket::MatchCreated {
                match_id: m.match_id.clone(),
                peer_ids: m.peer_ids.clone(),
                is_host: m.host_id == *peer_id,
            },
        );
    }
}

pub(crate) fn notify_match_reconnection(peers: &PeerRegistry, peer_id: &str, m: &Match) {
    peers.send_to(
        peer_id,
        ServerPacket::MatchReconnected {
            match_id: m.match_id.clone(),
            peer_ids: m.peer_ids.clone(),
            is_host: m.host_id == peer_id,
        },
    );
}

impl Coordinator {
    /// Creates a match for `peer_ids`, indexes every member and tells each one
    /// the roster and whether it is host. Returns the new match id.
    pub fn create_match(&mut self, peer_ids: Vec<String>, max_peers: usize) -> Option<String> {
        let peers = &self.peers;
        let host_id = pick_host(&peer_ids, None, |id| peers.contains(id))
            .or_else(|| peer_ids.first().map(String::as_str))?
            .to_string();

        let match_id = generate_match_id(&peer_ids);
        let active_members = peer_ids.iter().filter(|id| self.peers.contains(id)).count();
        let timeout = self.timers.arm(
            self.config.match_timeout,
            TimerEvent::MatchTimeout {
                match_id: match_id.clone(),
            },
        );

        let m = Match {
            match_id: match_id.clone(),
            results: vec![None; peer_ids.len()],
            peer_ids,
            host_id,
            start_time: get_timestamp(),
            active_members,
            max_peers,
            final_score: Scores::default(),
            timeout: Some(timeout),
        };

        for peer_id in &m.peer_ids {
            if let Some(previous) = self.peer_to_match.insert(peer_id.clone(), match_id.clone()) {
                warn!("Peer {} was still indexed to match {}", peer_id, previous);
            }
        }

        info!(
            "Match {} created with {:?} (host {})",
            match_id, m.peer_ids, m.host_id
        );
        notify_match_created(&self.peers, &m);
        self.matches.insert(match_id.clone(), m);

        Some(match_id)
    }

    /// Tears a match down. Safe to call for a match that is already gone.
    pub fn end_match(&mut self, match_id: &str, reason: EndReason) -> bool {
        let Some(mut m) = self.matches.remove(match_id) else {
            debug!("Match {} already ended", match_id);
            return false;
        };

        m.cancel_timeout();
        calculate_final_score(&mut m);

        for peer_id in &m.peer_ids {
            let indexed_here = self.peer_to_match.get(peer_id).map(String::as_str) == Some(match_id);

            if indexed_here && self.peers.state_of(peer_id) == Some(PeerState::Match) {
                self.peers.change_and_notify(peer_id, PeerState::Connected);
                self.peers.send_to(
                    peer_id,
                    ServerPacket::MatchEnded {
                        reason: reason.to_string(),
                        final_score: m.final_score.clone(),
                    },
                );
            }

            if indexed_here {
                self.peer_to_match.remove(peer_id);
            }
        }

        info!(
            "Match {} ended: {} (final score {:?})",
            match_id, reason, m.final_score.result
        );
        true
    }

    /// Explicit leave. The caller decides whether the match must end
    /// afterwards by checking `active_members`.
    pub fn leave_peer_from_match(&mut self, peer_id: &str, match_id: &str) {
        let was_host = {
            let Some(m) = self.matches.get_mut(match_id) else {
                return;
            };

            if self.peers.contains(peer_id) {
                m.active_members = m.active_members.saturating_sub(1);
                self.peers.change_and_notify(peer_id, PeerState::Connected);
            }
            if self.peer_to_match.get(peer_id).map(String::as_str) == Some(match_id) {
                self.peer_to_match.remove(peer_id);
            }

            m.host_id == peer_id && m.active_members > 0
        };

        if was_host {
            self.assign_new_host(match_id);
        }

        if let Some(m) = self.matches.get(match_id) {
            for other in active_members_of(&self.peers, &self.peer_to_match, m) {
                self.peers.send_to(
                    &other,
                    ServerPacket::PeerLeftMatch {
                        peer_id: peer_id.to_string(),
                    },
                );
            }
            info!(
                "Peer {} left match {} ({} active)",
                peer_id, match_id, m.active_members
            );
        }
    }

    /// Moves the host role to the first active member after the current host
    /// in roster order. Leaves `host_id` unchanged if nobody is eligible.
    pub fn assign_new_host(&mut self, match_id: &str) -> Option<String> {
        let m = self.matches.get_mut(match_id)?;
        let peers = &self.peers;
        let index = &self.peer_to_match;

        let new_host = pick_host(&m.peer_ids, Some(&m.host_id), |id| {
            is_active_member(peers, index, id, match_id)
        })?
        .to_string();

        info!(
            "Match {} host migrated {} -> {}",
            match_id, m.host_id, new_host
        );
        m.host_id = new_host.clone();

        peers.send_to(&new_host, ServerPacket::HostAssigned { is_host: true });
        for other in active_members_of(peers, index, m) {
            if other != new_host {
                peers.send_to(
                    &other,
                    ServerPacket::HostChanged {
                        new_host_id: new_host.clone(),
                    },
                );
            }
        }

        Some(new_host)
    }
}
