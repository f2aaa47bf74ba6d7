use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::network::Server;
use std::net::SocketAddr;
use std::time::Duration;

/// Main-method of the rendezvous server.
/// Parses command-line arguments, then runs the coordinator until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "9000")]
        port: u16,
        /// Maximum number of connected peers
        #[clap(short, long, default_value = "1024")]
        max_connections: usize,
        /// Match size when a peer does not ask for one
        #[clap(long, default_value = "2")]
        default_max_peers: usize,
        /// Largest match a peer may ask for
        #[clap(long, default_value = "8")]
        max_match_size: usize,
        /// Seconds before an unanswered proposal expires
        #[clap(long, default_value = "10")]
        proposal_timeout_secs: u64,
        /// Seconds before a running match is ended
        #[clap(long, default_value = "600")]
        match_timeout_secs: u64,
        /// Log filter used when RUST_LOG is not set
        #[clap(short, long, default_value = "info")]
        log_level: String,
    }

    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let bind_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let config = ServerConfig {
        bind_addr,
        max_connections: args.max_connections,
        default_max_peers: args.default_max_peers,
        max_match_size: args.max_match_size,
        proposal_timeout: Duration::from_secs(args.proposal_timeout_secs),
        match_timeout: Duration::from_secs(args.match_timeout_secs),
        ..ServerConfig::default()
    };

    let server = Server::bind(config).await?;
    let shutdown = server.shutdown_handle();
    let mut server_handle = tokio::spawn(server.run());

    // Handle shutdown gracefully
    tokio::select! {
        result = &mut server_handle => {
            match result {
                Ok(Err(e)) => error!("Server stopped: {}", e),
                Err(e) => error!("Server task panicked: {}", e),
                Ok(Ok(())) => {}
            }
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            shutdown.shutdown();
        }
    }

    if let Err(e) = server_handle.await {
        error!("Server task panicked: {}", e);
    }

    Ok(())
}
