//! Score reconciliation
//!
//! Every member may report a score for its match; the final score is the
//! report that a strict majority of reporters agree on, compared by
//! structure. The tally runs once, when the match ends; without a majority
//! the final score stays empty.

use crate::coordinator::Coordinator;
use crate::match_manager::{active_members_of, Match};
use log::{debug, info};
use shared::{Scores, ServerPacket};
use std::collections::HashMap;

/// The report held by more than half of the non-empty entries in `results`.
pub fn majority_score(results: &[Option<Scores>]) -> Option<&Scores> {
    let mut tally: HashMap<&Scores, usize> = HashMap::new();
    let mut reported = 0;

    for scores in results.iter().flatten() {
        *tally.entry(scores).or_insert(0) += 1;
        reported += 1;
    }

    tally
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .filter(|(_, count)| count * 2 > reported)
        .map(|(scores, _)| scores)
}

/// Recomputes `final_score` from the match's reports.
pub fn calculate_final_score(m: &mut Match) {
    if let Some(scores) = majority_score(&m.results) {
        m.final_score = scores.clone();
    }
}

impl Coordinator {
    /// Records a report from `peer_id`. Returns false if the match does not
    /// exist.
    pub fn submit_score(&mut self, peer_id: &str, match_id: &str, scores: Scores) -> bool {
        let Some(m) = self.matches.get_mut(match_id) else {
            debug!("Score from {} for unknown match {}", peer_id, match_id);
            return false;
        };

        info!(
            "Peer {} reported {:?} for match {}",
            peer_id, scores.result, match_id
        );
        m.results.push(Some(scores));
        true
    }

    pub fn notify_score_submitted(&self, submitter: &str, match_id: &str, scores: &Scores) {
        let Some(m) = self.matches.get(match_id) else {
            return;
        };

        for member in active_members_of(&self.peers, &self.peer_to_match, m) {
            self.peers.send_to(
                &member,
                ServerPacket::ScoreSubmitted {
                    peer_id: submitter.to_string(),
                    scores: scores.clone(),
                },
            );
        }
    }
}
