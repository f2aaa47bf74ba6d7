use shared::PeerState;

/// Protocol misuse by a single peer.
///
/// The `Display` text is exactly what the offending peer receives in
/// `SERVER_ERROR.message`. None of these are fatal to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Can't look for a match while in {0}")]
    CannotSeek(PeerState),
    #[error("Can't cancel match search while in {0}")]
    CannotCancel(PeerState),
    #[error("Can't leave match while in {0}")]
    CannotLeave(PeerState),
    #[error("Can't submit score while in {0}")]
    CannotSubmit(PeerState),
    #[error("Failed to submit score: Invalid match or score")]
    NoActiveMatch,
    #[error("Match proposal not found or has expired")]
    ProposalNotFound,
    #[error("You are not part of this match proposal")]
    NotInProposal,
    #[error("Server full")]
    ServerFull,
    #[error("Malformed packet: {0}")]
    Malformed(String),
}

/// Failures of the transport around the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] shared::ProtocolError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_state() {
        assert_eq!(
            CoordinatorError::CannotCancel(PeerState::Connected).to_string(),
            "Can't cancel match search while in connected"
        );
        assert_eq!(
            CoordinatorError::CannotSubmit(PeerState::LookingForMatch).to_string(),
            "Can't submit score while in lookingForMatch"
        );
    }
}
