//! Runtime configuration for the coordinator and its transport.

use shared::{
    DEFAULT_MAX_PEERS, ERROR_REVERT_SECS, MATCH_TIMEOUT_SECS, PROPOSAL_TIMEOUT_SECS,
};
use std::net::SocketAddr;
use std::time::Duration;

/// Smallest match the coordinator will propose.
pub const MIN_MATCH_SIZE: usize = 2;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to
    pub bind_addr: SocketAddr,
    /// Registrations beyond this are refused with "Server full"
    pub max_connections: usize,
    /// Match size used when LOOKING_FOR_MATCH carries no `maxPeers`
    pub default_max_peers: usize,
    /// Upper clamp for a requested `maxPeers`
    pub max_match_size: usize,
    pub proposal_timeout: Duration,
    pub match_timeout: Duration,
    /// How long a peer stays in `error` before reverting to `idle`
    pub error_revert_delay: Duration,
    /// Period of the debug summary logged by the event loop
    pub stats_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            max_connections: 1024,
            default_max_peers: DEFAULT_MAX_PEERS,
            max_match_size: 8,
            proposal_timeout: Duration::from_secs(PROPOSAL_TIMEOUT_SECS),
            match_timeout: Duration::from_secs(MATCH_TIMEOUT_SECS),
            error_revert_delay: Duration::from_secs(ERROR_REVERT_SECS),
            stats_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Resolves a requested match size: absent or zero falls back to the
    /// default, anything else is clamped into `[MIN_MATCH_SIZE, max_match_size]`.
    pub fn normalize_max_peers(&self, requested: Option<usize>) -> usize {
        let upper = self.max_match_size.max(MIN_MATCH_SIZE);
        match requested {
            None | Some(0) => self.default_max_peers.clamp(MIN_MATCH_SIZE, upper),
            Some(n) => n.clamp(MIN_MATCH_SIZE, upper),
        }
    }
}
