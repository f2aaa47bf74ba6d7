//! WebSocket transport and the coordinator event loop
//!
//! Peers connect to `ws://host:port/?id=<peerId>`. Each accepted connection
//! gets a reader task that decodes frames into `ServerEvent`s and a writer
//! task that drains the peer's outbound queue. All events, including fired
//! timers, go through one channel into `Server::run`, which owns the
//! `Coordinator` and handles them one at a time.

use crate::config::ServerConfig;
use crate::coordinator::Coordinator;
use crate::error::ServerError;
use crate::event::{ConnectionId, ServerEvent};
use crate::timers::Timers;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{decode_client_envelope, encode_server_packet, ServerPacket};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

/// Main server owning the listener and the coordinator
pub struct Server {
    listener: TcpListener,
    coordinator: Coordinator,
    stats_interval: Duration,

    // Every connection task and timer feeds this channel
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    event_rx: mpsc::UnboundedReceiver<ServerEvent>,
}

/// Stops a running `Server` from outside the event loop.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    event_tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if self.event_tx.send(ServerEvent::Shutdown).is_err() {
            debug!("Server already stopped");
        }
    }
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("Rendezvous server listening on {}", listener.local_addr()?);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let stats_interval = config.stats_interval;
        let coordinator = Coordinator::new(config, Timers::new(event_tx.clone()));

        Ok(Server {
            listener,
            coordinator,
            stats_interval,
            event_tx,
            event_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            event_tx: self.event_tx.clone(),
        }
    }

    /// Runs until a `ShutdownHandle` fires.
    pub async fn run(self) -> Result<(), ServerError> {
        let Server {
            listener,
            mut coordinator,
            stats_interval,
            event_tx,
            mut event_rx,
        } = self;

        let acceptor = tokio::spawn(accept_loop(listener, event_tx));
        let mut stats_interval = interval(stats_interval);

        info!("Server started successfully");

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        Some(event) => {
                            if !coordinator.handle_event(event) {
                                break;
                            }
                        }
                        None => break,
                    }
                },

                _ = stats_interval.tick() => {
                    let stats = coordinator.stats();
                    if stats.peers > 0 {
                        debug!("{}", stats);
                    }
                },
            }
        }

        acceptor.abort();
        info!("Server shut down");
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, event_tx: mpsc::UnboundedSender<ServerEvent>) {
    let mut next_conn_id: ConnectionId = 0;

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                next_conn_id += 1;
                let conn_id = next_conn_id;
                let event_tx = event_tx.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, addr, conn_id, event_tx).await {
                        warn!("Connection {} from {} failed: {}", conn_id, addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

/// Extracts a non-empty `id` query parameter.
pub fn peer_id_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "id")
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    conn_id: ConnectionId,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
) -> Result<(), ServerError> {
    let mut peer_id = None;
    let ws_stream = accept_hdr_async(stream, |request: &Request, response: Response| {
        match peer_id_from_query(request.uri().query()) {
            Some(id) => {
                peer_id = Some(id);
                Ok(response)
            }
            None => {
                let mut refusal = ErrorResponse::new(Some("Missing peer id".to_string()));
                *refusal.status_mut() = StatusCode::BAD_REQUEST;
                Err(refusal)
            }
        }
    })
    .await?;

    let Some(peer_id) = peer_id else {
        return Ok(());
    };
    info!("Connection {} from {} as {}", conn_id, addr, peer_id);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (packet_tx, mut packet_rx) = mpsc::unbounded_channel::<ServerPacket>();

    if event_tx
        .send(ServerEvent::PeerConnected {
            peer_id: peer_id.clone(),
            conn_id,
            sender: packet_tx,
        })
        .is_err()
    {
        return Ok(());
    }

    // Ends when the coordinator drops the peer's queue, closing the socket
    tokio::spawn(async move {
        while let Some(packet) = packet_rx.recv().await {
            let text = match encode_server_packet(&packet) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize packet: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        if let Err(e) = ws_sender.close().await {
            debug!("Close after queue drop failed: {}", e);
        }
    });

    while let Some(message) = ws_receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error for {}: {}", peer_id, e);
                break;
            }
        };

        let event = match decode_client_envelope(&text) {
            Ok(Some(packet)) => ServerEvent::PacketReceived {
                peer_id: peer_id.clone(),
                conn_id,
                packet,
            },
            Ok(None) => {
                debug!("Ignoring non-data envelope from {}", peer_id);
                continue;
            }
            Err(e) => ServerEvent::MalformedPacket {
                peer_id: peer_id.clone(),
                conn_id,
                reason: e.to_string(),
            },
        };

        if event_tx.send(event).is_err() {
            break;
        }
    }

    info!("Connection {} of {} closed", conn_id, peer_id);
    if event_tx
        .send(ServerEvent::PeerDisconnected { peer_id, conn_id })
        .is_err()
    {
        debug!("Event loop gone before disconnect of connection {}", conn_id);
    }
    Ok(())
}
