//! ember — ephemeral encrypted broadcast network.
//!
//! `ember` runs a node: TCP gossip with LAN discovery plus encrypted
//! relay channels. Without a TUI attached, network events go to the log
//! and stdin lines become broadcast messages. `ember relay` runs the
//! blind WebSocket forwarder instead.

mod config;
mod crypto;
mod e2e;
mod latch;
mod message;
mod net;
mod node;
mod relay;
mod store;
mod types;

use crate::config::{
    identity_path, peers_path, POW_DIFFICULTY, RELAY_PORT_DEFAULT, TCP_PORT_DEFAULT,
};
use crate::crypto::{load_identity, save_identity, validate_name, Identity};
use crate::message::Outgoing;
use crate::node::{Node, NodeConfig};
use crate::relay::{RelayConfig, RelayServer};
use crate::types::UiEvent;
use clap::{Parser, Subcommand};
use std::io::Write as _;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "ember", version, about = "ember: ephemeral encrypted broadcast network")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// TCP listen port (scans upward if taken)
    #[arg(short, long, default_value_t = TCP_PORT_DEFAULT)]
    port: u16,

    /// Dial a peer on startup (host:port), remembered for next time
    #[arg(short, long)]
    connect: Option<String>,

    /// Relay URLs, comma-separated, overriding the built-in list
    #[arg(long)]
    relays: Option<String>,

    /// Run without any relay connection (LAN/TCP only)
    #[arg(long)]
    no_relay: bool,

    /// Display name for first-run identity creation
    #[arg(long)]
    name: Option<String>,

    /// Proof-of-work difficulty in bits
    #[arg(long, default_value_t = POW_DIFFICULTY)]
    difficulty: u32,
}

#[derive(Subcommand)]
enum Command {
    /// Run a blind relay server
    Relay {
        /// WebSocket listen port
        #[arg(short, long, default_value_t = RELAY_PORT_DEFAULT)]
        port: u16,
        /// Wallet address announced to connecting peers
        #[arg(long)]
        wallet: Option<String>,
    },
    /// List saved peers
    Peers,
    /// Delete the local identity
    Reset,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ember=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Some(Command::Relay { port, wallet }) => run_relay(port, wallet).await,
        Some(Command::Peers) => {
            let peers = load_peers();
            if peers.is_empty() {
                println!("no saved peers");
            }
            for (host, port) in peers {
                println!("  {host}:{port}");
            }
        }
        Some(Command::Reset) => {
            if identity_path().exists() {
                match std::fs::remove_file(identity_path()) {
                    Ok(()) => println!("identity reset"),
                    Err(e) => eprintln!("could not remove identity: {e}"),
                }
            } else {
                println!("no identity to reset");
            }
        }
        None => run_node(args).await,
    }
}

// -----------------------------------------------------------------------------
// Node
// -----------------------------------------------------------------------------

async fn run_node(args: Args) {
    let identity = setup_identity(args.name);
    info!("ember v{VERSION} — {}", identity.peer_id());

    let relay_urls = if args.no_relay {
        Vec::new()
    } else {
        match &args.relays {
            Some(list) => list.split(',').map(|s| s.trim().to_string()).collect(),
            None => NodeConfig::default().relay_urls,
        }
    };

    let cfg = NodeConfig {
        tcp_port: args.port,
        relay_urls,
        pow_difficulty: args.difficulty,
        discovery: true,
    };

    let (node, mut events) = match Node::start(identity, cfg).await {
        Ok(started) => started,
        Err(e) => {
            error!("failed to start: {e}");
            return;
        }
    };
    let node = Arc::new(node);

    // Bootstrap: saved peers first, then an explicit --connect target.
    for (host, port) in load_peers() {
        node.connect(host, port);
    }
    if let Some(address) = &args.connect {
        match parse_host_port(address) {
            Some((host, port)) => {
                save_peer(&host, port);
                node.connect(host, port);
            }
            None => warn!("ignoring malformed --connect address: {address}"),
        }
    }

    // Headless event consumer: the event channel is the UI boundary, the
    // log stands in for the UI.
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                UiEvent::NewMessage(msg) => {
                    info!("[{}] {}: {}", msg.board, msg.display_author(), msg.content);
                }
                UiEvent::MessageSent(msg) => info!("sent {} to [{}]", msg.id, msg.board),
                UiEvent::PeerJoined(peer) => info!("peer joined: {peer}"),
                UiEvent::PeerLeft(peer) => info!("peer left: {peer}"),
                UiEvent::Status(line) => info!("{line}"),
                UiEvent::Error(line) => warn!("{line}"),
                UiEvent::E2e(active) => {
                    info!("end-to-end encryption {}", if active { "on" } else { "off" })
                }
            }
        }
    });

    // Status printer.
    let status = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            info!(
                "status: {} peers | {} live messages",
                status.network.peer_count().await,
                status.store.count()
            );
        }
    });

    // Interactive use: each stdin line becomes a text message on the
    // general board. Exits quietly when stdin closes (daemon use).
    let stdin_node = node.clone();
    let stdin_task = tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let content = line.trim().to_string();
            if content.is_empty() {
                continue;
            }
            stdin_node.send(Outgoing::text(content));
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    node.shutdown().await;
    event_task.abort();
    stdin_task.abort();
}

fn setup_identity(name_flag: Option<String>) -> Identity {
    if let Some(identity) = load_identity(&identity_path()) {
        return identity;
    }
    let name = match name_flag {
        Some(name) if validate_name(&name) => name,
        Some(bad) => {
            eprintln!("'{bad}' is not a valid name (1-20 chars, no spaces)");
            prompt_name()
        }
        None => prompt_name(),
    };
    let identity = Identity::generate(&name);
    if let Err(e) = save_identity(&identity_path(), &identity) {
        warn!("could not save identity: {e}");
    }
    println!("identity saved as {}", identity.peer_id());
    identity
}

fn prompt_name() -> String {
    loop {
        print!("pick a name (1-20 chars, no spaces): ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            std::process::exit(1);
        }
        let name = line.trim().to_string();
        if validate_name(&name) {
            return name;
        }
    }
}

fn parse_host_port(address: &str) -> Option<(String, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

// -----------------------------------------------------------------------------
// Saved peers
// -----------------------------------------------------------------------------

fn load_peers() -> Vec<(String, u16)> {
    let Ok(data) = std::fs::read_to_string(peers_path()) else {
        return Vec::new();
    };
    serde_json::from_str(&data).unwrap_or_default()
}

fn save_peer(host: &str, port: u16) {
    let mut peers = load_peers();
    let entry = (host.to_string(), port);
    if peers.contains(&entry) {
        return;
    }
    peers.push(entry);
    let _ = std::fs::create_dir_all(config::data_dir());
    if let Ok(json) = serde_json::to_string_pretty(&peers) {
        let _ = std::fs::write(peers_path(), json);
    }
}

// -----------------------------------------------------------------------------
// Relay
// -----------------------------------------------------------------------------

async fn run_relay(port: u16, wallet: Option<String>) {
    let server = RelayServer::new(RelayConfig {
        port,
        wallet: wallet.clone(),
        ..Default::default()
    });
    let addr = match server.bind().await {
        Ok(addr) => addr,
        Err(e) => {
            error!("relay failed to bind: {e}");
            return;
        }
    };

    info!("ember relay v{VERSION} (privacy mode)");
    info!("listening on ws://{addr}, scanner metadata at ws://{addr}/scan");
    info!("envelopes are end-to-end encrypted; sessions are random ids; nothing is stored");
    if let Some(wallet) = &wallet {
        info!("relay wallet: {wallet}");
    }

    let status = server.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let stats = status.stats();
            info!(
                "[{} peers | {} scanners | {} msgs forwarded]",
                stats.peers_online, stats.scanners, stats.total_messages
            );
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("relay shutting down");
}
