//! # Rendezvous Server Library
//!
//! This library implements the rendezvous and matchmaking coordinator for
//! peer-to-peer multiplayer games. It tracks connected peers, groups peers
//! that are looking for a match, arbitrates acceptance of match proposals,
//! runs match sessions with a designated host, and reconciles the scores that
//! members report at the end.
//!
//! ## Core Responsibilities
//!
//! ### Peer Lifecycle
//! Every peer moves through a small state machine (`idle`, `connected`,
//! `lookingForMatch`, `matchAccepting`, `match`, `error`, ...). Each
//! transition is pushed to the peer as a STATUS_UPDATE so its client can
//! mirror the server's view.
//!
//! ### Matchmaking
//! Seekers are grouped longest-waiting first into a proposal. The initiator
//! accepts implicitly; the match starts once every invited peer accepts. A
//! decline or a 10 second timeout dissolves the proposal.
//!
//! ### Match Sessions
//! A match has a fixed roster and one host. Members that drop their
//! connection keep their seat and are put back into the match when they
//! reconnect. The host role moves to the next connected member in roster
//! order when the host goes away. A match ends when its last active member
//! leaves or after 10 minutes.
//!
//! ### Score Consensus
//! Members report scores while playing or when leaving. The final score is the
//! report shared by a strict majority of reporters.
//!
//! ## Architecture Design
//!
//! ### Single Event Loop
//! All state lives in one `Coordinator` owned by the event loop in `network`.
//! Connection tasks and timers only send `ServerEvent`s into a channel, so
//! handlers never interleave and multi-map updates are atomic by
//! construction.
//!
//! ### WebSocket Transport
//! Peers connect over WebSocket with their id in the query string. Frames are
//! JSON envelopes `{"type":"data","packet":{...}}`; packet types live in the
//! `shared` crate.
//!
//! ### Timers as Events
//! Proposal timeouts, match timeouts and error-state reversion are spawned
//! sleeps that post back into the event channel. Their handles cancel the
//! sleep when the owning record goes away, and every handler re-checks that
//! its target still exists.
//!
//! ## Module Organization
//!
//! ### Peer Registry (`peer_registry`)
//! Connected peers, their state, their outbound queues and the capacity
//! limit.
//!
//! ### Coordinator (`coordinator`)
//! Connection lifecycle, packet dispatch and protocol error reporting.
//!
//! ### Matchmaking (`matchmaking`)
//! Seeker grouping and the proposal accept/decline/timeout lifecycle.
//!
//! ### Match Manager (`match_manager`)
//! Match creation, teardown, explicit leaves and host migration.
//!
//! ### Score (`score`)
//! Score submission and majority voting.
//!
//! ### Network (`network`)
//! Listener, per-connection reader and writer tasks, and the event loop.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(ServerConfig::default()).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod match_manager;
pub mod matchmaking;
pub mod network;
pub mod peer_registry;
pub mod score;
pub mod timers;
pub mod utils;

#[cfg(test)]
mod test_support;
