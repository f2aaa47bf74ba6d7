use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use rand::Rng;
use shared::{
    decode_server_envelope, encode_client_packet, ClientPacket, PeerState, Scores, ServerPacket,
};
use std::time::Duration;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Scripted peer: seeks a match, accepts every opportunity, reports a random
/// score and leaves.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server URL without the query string
    #[clap(short, long, default_value = "ws://127.0.0.1:9000/")]
    url: String,
    /// Peer id; a random one is used if omitted
    #[clap(short, long)]
    id: Option<String>,
    /// Requested match size
    #[clap(short, long, default_value = "2")]
    max_peers: usize,
    /// Seconds to stay in a match before leaving
    #[clap(short, long, default_value = "3")]
    play_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut rng = rand::thread_rng();
    let peer_id = args
        .id
        .unwrap_or_else(|| format!("peer-{:04}", rng.gen_range(0..10_000)));

    let url = format!("{}?id={}", args.url, peer_id);
    info!("Connecting to {}", url);
    let (ws_stream, _) = connect_async(url.as_str()).await?;
    let (mut write, mut read) = ws_stream.split();

    let seek = ClientPacket::LookingForMatch {
        max_peers: Some(args.max_peers),
    };
    write.send(Message::Text(encode_client_packet(&seek)?)).await?;

    while let Some(message) = read.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Some(packet) = decode_server_envelope(&text)? else {
            continue;
        };
        info!("<- {:?}", packet);

        match packet {
            ServerPacket::MatchOpportunity { proposal_id, .. } => {
                let accept = ClientPacket::MatchAccept { proposal_id };
                write.send(Message::Text(encode_client_packet(&accept)?)).await?;
            }
            ServerPacket::MatchCreated {
                match_id,
                peer_ids,
                is_host,
            } => {
                info!(
                    "In match {} with {:?}{}",
                    match_id,
                    peer_ids,
                    if is_host { " as host" } else { "" }
                );
                sleep(Duration::from_secs(args.play_secs)).await;

                let winner = &peer_ids[rng.gen_range(0..peer_ids.len())];
                let leave = ClientPacket::LeaveMatch {
                    reason: Some("finished".to_string()),
                    scores: Some(Scores::new().with("winner", winner.as_str())),
                };
                write.send(Message::Text(encode_client_packet(&leave)?)).await?;
            }
            ServerPacket::MatchEnded { final_score, .. } => {
                info!("Final score: {:?}", final_score.result);
                break;
            }
            ServerPacket::StatusUpdate { from, to } => {
                // Back in the lobby after leaving
                if from == PeerState::Match && to == PeerState::Connected {
                    break;
                }
            }
            ServerPacket::ServerError { message } => warn!("Server error: {}", message),
            _ => {}
        }
    }

    write.close().await?;
    info!("{} done", peer_id);
    Ok(())
}
