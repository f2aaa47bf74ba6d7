//! Wire vocabulary shared by the rendezvous server and its clients.
//!
//! Every frame on the wire is a JSON envelope `{"type": "data", "packet": ...}`
//! whose packet is an internally tagged object such as
//! `{"type": "MATCH_ACCEPT", "proposalId": "..."}`. Inbound and outbound
//! packets are separate closed enums so each side matches exhaustively.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Envelope `type` carried by every coordinator packet.
pub const DATA_ENVELOPE: &str = "data";
/// Match size used when a seeker does not ask for one.
pub const DEFAULT_MAX_PEERS: usize = 2;
pub const PROPOSAL_TIMEOUT_SECS: u64 = 10;
pub const MATCH_TIMEOUT_SECS: u64 = 600;
pub const ERROR_REVERT_SECS: u64 = 5;

/// Lifecycle state of a peer as mirrored to its client.
///
/// `CancellingMatch` and `StartLookingForMatch` are client-side markers; the
/// coordinator never assigns them but they are part of the shared vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerState {
    Idle,
    Connecting,
    Connected,
    LookingForMatch,
    CancellingMatch,
    StartLookingForMatch,
    MatchAccepting,
    Match,
    Error,
}

impl PeerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::Idle => "idle",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::LookingForMatch => "lookingForMatch",
            PeerState::CancellingMatch => "cancellingMatch",
            PeerState::StartLookingForMatch => "startLookingForMatch",
            PeerState::MatchAccepting => "matchAccepting",
            PeerState::Match => "match",
            PeerState::Error => "error",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A score report for a finished match.
///
/// Equality and hashing are structural, so two reports that arrive as
/// separate JSON documents with the same content count as the same vote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scores {
    #[serde(default)]
    pub result: BTreeMap<String, String>,
}

impl Scores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, mostly handy in tests and the test client.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.result.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.result.is_empty()
    }
}

/// Packets sent from a peer to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientPacket {
    LookingForMatch {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_peers: Option<usize>,
    },
    CancelMatchSearch {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    MatchAccept {
        proposal_id: String,
    },
    MatchDecline {
        proposal_id: String,
    },
    LeaveMatch {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scores: Option<Scores>,
    },
    SubmitScore {
        scores: Scores,
    },
}

/// Packets sent from the coordinator to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerPacket {
    StatusUpdate {
        from: PeerState,
        to: PeerState,
    },
    MatchProposed {
        proposal_id: String,
        target_peer_ids: Vec<String>,
        timeout_seconds: u64,
    },
    MatchOpportunity {
        proposal_id: String,
        initiator_id: String,
        all_peer_ids: Vec<String>,
        timeout_seconds: u64,
    },
    PeerAcceptedMatch {
        proposal_id: String,
        host_peer_id: String,
        accepted_count: usize,
        total_count: usize,
    },
    PeerDeclinedMatch {
        proposal_id: String,
        peer_id: String,
    },
    MatchProposalTimeout {
        proposal_id: String,
        message: String,
    },
    MatchCreated {
        match_id: String,
        peer_ids: Vec<String>,
        is_host: bool,
    },
    MatchReconnected {
        match_id: String,
        peer_ids: Vec<String>,
        is_host: bool,
    },
    PeerReconnected {
        peer_id: String,
    },
    PeerDisconnected {
        peer_id: String,
    },
    HostAssigned {
        is_host: bool,
    },
    HostChanged {
        new_host_id: String,
    },
    PeerLeftMatch {
        peer_id: String,
    },
    ScoreSubmitted {
        peer_id: String,
        scores: Scores,
    },
    MatchEnded {
        reason: String,
        final_score: Scores,
    },
    ServerError {
        message: String,
    },
    PeerListUpdate {
        connected_peers: Vec<String>,
    },
}

/// Outer frame around every packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<P> {
    #[serde(rename = "type")]
    pub kind: String,
    pub packet: P,
}

impl<P> Envelope<P> {
    pub fn data(packet: P) -> Self {
        Self {
            kind: DATA_ENVELOPE.to_string(),
            packet,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("data envelope without a packet")]
    MissingPacket,
}

// Lets us skip non-data envelopes before committing to a packet type.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    packet: Option<serde_json::Value>,
}

fn encode<P: Serialize>(packet: &P) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(&Envelope::data(packet))?)
}

/// Decodes one text frame. Returns `Ok(None)` for envelopes that are not
/// `"data"`, which the coordinator does not interpret.
fn decode<P: DeserializeOwned>(text: &str) -> Result<Option<P>, ProtocolError> {
    let raw: RawEnvelope = serde_json::from_str(text)?;
    if raw.kind != DATA_ENVELOPE {
        return Ok(None);
    }
    let packet = raw.packet.ok_or(ProtocolError::MissingPacket)?;
    Ok(Some(serde_json::from_value(packet)?))
}

pub fn encode_server_packet(packet: &ServerPacket) -> Result<String, ProtocolError> {
    encode(packet)
}

pub fn encode_client_packet(packet: &ClientPacket) -> Result<String, ProtocolError> {
    encode(packet)
}

pub fn decode_client_envelope(text: &str) -> Result<Option<ClientPacket>, ProtocolError> {
    decode(text)
}

pub fn decode_server_envelope(text: &str) -> Result<Option<ServerPacket>, ProtocolError> {
    decode(text)
}
