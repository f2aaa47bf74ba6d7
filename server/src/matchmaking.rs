//! Matchmaking engine and proposal lifecycle
//!
//! A proposal groups the longest-waiting seekers into a time-boxed offer.
//! The initiator (the member that has waited longest) is counted as accepted
//! from the start; the match is created once every member has accepted. A
//! decline or the proposal timer ends the offer without retrying.
//!
//! A peer belongs to at most one pending proposal, so the same seeker is
//! never offered two matches at once.

use crate::coordinator::Coordinator;
use crate::error::CoordinatorError;
use crate::event::TimerEvent;
use crate::match_manager::pick_host;
use crate::timers::TimerHandle;
use crate::utils::generate_proposal_id;
use log::{debug, info};
use shared::{PeerState, ServerPacket};
use std::collections::HashSet;

const TIMEOUT_ACCEPTED_MESSAGE: &str =
    "Match proposal timed out. You've been returned to looking for match.";
const TIMEOUT_PENDING_MESSAGE: &str = "Match proposal timed out. No action needed.";

#[derive(Debug)]
pub struct MatchProposal {
    pub proposal_id: String,
    pub initiator_id: String,
    pub target_peer_ids: Vec<String>,
    /// Always a subset of `members()`, seeded with the initiator
    pub accepted_peers: HashSet<String>,
    pub max_peers: usize,
    timeout: Option<TimerHandle>,
}

impl MatchProposal {
    /// Initiator followed by the targets, in invitation order.
    pub fn members(&self) -> Vec<String> {
        std::iter::once(&self.initiator_id)
            .chain(&self.target_peer_ids)
            .cloned()
            .collect()
    }

    pub fn is_member(&self, peer_id: &str) -> bool {
        self.initiator_id == peer_id || self.target_peer_ids.iter().any(|id| id == peer_id)
    }

    pub fn is_fully_accepted(&self) -> bool {
        self.accepted_peers.len() == self.target_peer_ids.len() + 1
    }

    fn cancel_timeout(&mut self) {
        if let Some(timer) = self.timeout.take() {
            timer.cancel();
        }
    }
}

impl Coordinator {
    pub fn in_pending_proposal(&self, peer_id: &str) -> bool {
        self.proposals.values().any(|p| p.is_member(peer_id))
    }

    /// Tries to build a proposal around `peer_id`. Returns the proposal id if
    /// one was made.
    pub fn attempt_matchmaking(&mut self, peer_id: &str, max_peers: usize) -> Option<String> {
        if self.peers.state_of(peer_id) != Some(PeerState::LookingForMatch) {
            return None;
        }
        if self.in_pending_proposal(peer_id) {
            debug!("Peer {} already has a pending proposal", peer_id);
            return None;
        }

        let mut group: Vec<_> = self
            .peers
            .seekers()
            .into_iter()
            .filter(|p| p.id != peer_id && !self.in_pending_proposal(&p.id))
            .take(max_peers.saturating_sub(1))
            .collect();

        if group.is_empty() {
            debug!("No other seekers for {}, waiting", peer_id);
            return None;
        }

        group.push(self.peers.get(peer_id)?);
        group.sort_by_key(|p| p.seek_seq());

        let mut target_peer_ids: Vec<String> = group.into_iter().map(|p| p.id.clone()).collect();
        let initiator_id = target_peer_ids.remove(0);

        Some(self.notify_potential_match(initiator_id, target_peer_ids, max_peers))
    }

    /// Stores a new proposal, arms its timeout and invites every member.
    pub fn notify_potential_match(
        &mut self,
        initiator_id: String,
        target_peer_ids: Vec<String>,
        max_peers: usize,
    ) -> String {
        let proposal_id = generate_proposal_id(&initiator_id, &target_peer_ids);
        let timeout_seconds = self.config.proposal_timeout.as_secs();
        let timeout = self.timers.arm(
            self.config.proposal_timeout,
            TimerEvent::ProposalTimeout {
                proposal_id: proposal_id.clone(),
            },
        );

        self.peers.send_to(
            &initiator_id,
            ServerPacket::MatchProposed {
                proposal_id: proposal_id.clone(),
                target_peer_ids: target_peer_ids.clone(),
                timeout_seconds,
            },
        );

        for target in &target_peer_ids {
            let all_peer_ids = std::iter::once(&initiator_id)
                .chain(target_peer_ids.iter().filter(|id| *id != target))
                .cloned()
                .collect();
            self.peers.send_to(
                target,
                ServerPacket::MatchOpportunity {
                    proposal_id: proposal_id.clone(),
                    initiator_id: initiator_id.clone(),
                    all_peer_ids,
                    timeout_seconds,
                },
            );
        }

        info!(
            "Proposal {} from {} to {:?}",
            proposal_id, initiator_id, target_peer_ids
        );

        let accepted_peers = HashSet::from([initiator_id.clone()]);
        self.proposals.insert(
            proposal_id.clone(),
            MatchProposal {
                proposal_id: proposal_id.clone(),
                initiator_id,
                target_peer_ids,
                accepted_peers,
                max_peers,
                timeout: Some(timeout),
            },
        );

        proposal_id
    }

    /// Records an acceptance. Returns the match id once the last member
    /// accepts.
    pub fn accept_proposal(
        &mut self,
        peer_id: &str,
        proposal_id: &str,
    ) -> Result<Option<String>, CoordinatorError> {
        let proposal = self
            .proposals
            .get_mut(proposal_id)
            .ok_or(CoordinatorError::ProposalNotFound)?;
        if !proposal.is_member(peer_id) {
            return Err(CoordinatorError::NotInProposal);
        }

        proposal.accepted_peers.insert(peer_id.to_string());
        let members = proposal.members();
        let peers = &self.peers;
        let host_peer_id = pick_host(&members, None, |id| peers.contains(id))
            .unwrap_or(proposal.initiator_id.as_str())
            .to_string();

        let progress = ServerPacket::PeerAcceptedMatch {
            proposal_id: proposal_id.to_string(),
            host_peer_id,
            accepted_count: proposal.accepted_peers.len(),
            total_count: members.len(),
        };
        for member in &members {
            peers.send_to(member, progress.clone());
        }

        let complete = proposal.is_fully_accepted();
        self.peers.change_and_notify(peer_id, PeerState::MatchAccepting);
        debug!("Peer {} accepted proposal {}", peer_id, proposal_id);

        if !complete {
            return Ok(None);
        }

        let Some(mut proposal) = self.proposals.remove(proposal_id) else {
            return Ok(None);
        };
        proposal.cancel_timeout();

        for member in &members {
            self.peers.change_and_notify(member, PeerState::Match);
        }

        Ok(self.create_match(members, proposal.max_peers))
    }

    pub fn decline_proposal(
        &mut self,
        peer_id: &str,
        proposal_id: &str,
    ) -> Result<(), CoordinatorError> {
        let proposal = self
            .proposals
            .get(proposal_id)
            .ok_or(CoordinatorError::ProposalNotFound)?;
        if !proposal.is_member(peer_id) {
            return Err(CoordinatorError::NotInProposal);
        }

        let Some(mut proposal) = self.proposals.remove(proposal_id) else {
            return Ok(());
        };
        proposal.cancel_timeout();

        for member in proposal.members() {
            let delivered = self.peers.send_to(
                &member,
                ServerPacket::PeerDeclinedMatch {
                    proposal_id: proposal_id.to_string(),
                    peer_id: peer_id.to_string(),
                },
            );
            if delivered && proposal.accepted_peers.contains(&member) {
                self.peers.change_and_notify(&member, PeerState::LookingForMatch);
            }
        }

        info!("Peer {} declined proposal {}", peer_id, proposal_id);
        Ok(())
    }

    /// Proposal timer handler. Returns false if the proposal was already
    /// resolved.
    pub fn handle_proposal_timeout(&mut self, proposal_id: &str) -> bool {
        let Some(proposal) = self.proposals.remove(proposal_id) else {
            debug!("Stale timeout for proposal {}", proposal_id);
            return false;
        };

        for member in proposal.members() {
            if !self.peers.contains(&member) {
                continue;
            }

            let message = if proposal.accepted_peers.contains(&member) {
                self.peers.change_and_notify(&member, PeerState::LookingForMatch);
                TIMEOUT_ACCEPTED_MESSAGE
            } else {
                TIMEOUT_PENDING_MESSAGE
            };

            self.peers.send_to(
                &member,
                ServerPacket::MatchProposalTimeout {
                    proposal_id: proposal_id.to_string(),
                    message: message.to_string(),
                },
            );
        }

        info!("Proposal {} timed out", proposal_id);
        true
    }
}
