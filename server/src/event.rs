//! Events funneled into the coordinator's single event loop.

use shared::{ClientPacket, ServerPacket};
use tokio::sync::mpsc;

/// Identifies one transport connection. A peer id may be seen on several
/// connections over its lifetime; only the newest one is live.
pub type ConnectionId = u64;

/// Per-peer outbound queue drained by that connection's writer task.
pub type PeerSender = mpsc::UnboundedSender<ServerPacket>;

/// A timer that fired. Handlers must re-check that the target still exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    ProposalTimeout { proposal_id: String },
    MatchTimeout { match_id: String },
    ErrorRevert { peer_id: String, conn_id: ConnectionId },
}

#[derive(Debug)]
pub enum ServerEvent {
    PeerConnected {
        peer_id: String,
        conn_id: ConnectionId,
        sender: PeerSender,
    },
    PeerDisconnected {
        peer_id: String,
        conn_id: ConnectionId,
    },
    PacketReceived {
        peer_id: String,
        conn_id: ConnectionId,
        packet: ClientPacket,
    },
    MalformedPacket {
        peer_id: String,
        conn_id: ConnectionId,
        reason: String,
    },
    Timer(TimerEvent),
    Shutdown,
}
