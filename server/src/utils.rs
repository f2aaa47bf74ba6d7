use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Get current timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

pub fn generate_proposal_id(initiator_id: &str, target_peer_ids: &[String]) -> String {
    format!(
        "proposal_{}_{}_{}",
        get_timestamp(),
        initiator_id,
        target_peer_ids.join("_")
    )
}

pub fn generate_match_id(peer_ids: &[String]) -> String {
    format!("match_{}_{}", get_timestamp(), peer_ids.join("_"))
}
