//! Duet CLI - Two-party chat over a direct peer connection
//!
//! Usage:
//!   duet create <name>              Open a room and wait for a peer
//!   duet join <name>                Join a room someone else opened
//!   duet hub <name> --key <key>     Serve many peers from one room
//!   duet signal                     Run the rendezvous server
//!   duet config                     Print a sample config file
//!
//! In a session, stdin lines are sent to the peer. `/retry` forces a
//! reconnect attempt, `/react <emoji>` sends a reaction and `/quit` leaves.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use duet_core::{Config, Payload, Role};
use duet_peer::{Hub, HubEvent, Session, SessionEvent, SessionHandle};
use duet_signal::SignalServer;

#[derive(Parser)]
#[command(name = "duet")]
#[command(about = "Direct two-party chat", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Signal server URL (overrides config)
    #[arg(short, long, global = true, env = "DUET_SIGNAL_URL")]
    url: Option<String>,

    /// Close the session after this many idle seconds (overrides config)
    #[arg(long, global = true)]
    idle_timeout: Option<u64>,

    /// Config file path (defaults to the per-user config)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a room and wait for a peer
    Create {
        /// Room name to share with the peer
        name: String,
    },

    /// Join an existing room
    Join {
        /// Room name
        name: String,
    },

    /// Serve many peers from one room
    Hub {
        /// Room name
        name: String,

        /// Hub key checked by the server
        #[arg(short, long)]
        key: String,
    },

    /// Run the rendezvous server
    Signal {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print a sample config file
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so the console keeps stdout
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if let Some(url) = cli.url {
        config.rendezvous.url = url;
    }
    if let Some(secs) = cli.idle_timeout {
        config.session.idle_timeout_ms = secs * 1000;
    }

    match cli.command {
        Commands::Create { name } => run_session(name, Role::Creator, config).await?,
        Commands::Join { name } => run_session(name, Role::Joiner, config).await?,
        Commands::Hub { name, key } => run_hub(name, key, config).await?,
        Commands::Signal { port } => run_signal(port, config).await?,
        Commands::Config => print!("{}", Config::sample()),
    }

    Ok(())
}

/// What the user typed
enum Line {
    Quit,
    Retry,
    Send(String),
    Empty,
}

fn parse_line(line: &str) -> Line {
    let line = line.trim_end();
    match line {
        "" => Line::Empty,
        "/quit" => Line::Quit,
        "/retry" => Line::Retry,
        _ => match line.strip_prefix("/react ") {
            Some(emoji) => Line::Send(
                Payload::Reaction {
                    emoji: emoji.trim().to_string(),
                }
                .encode(),
            ),
            None => Line::Send(line.to_string()),
        },
    }
}

fn render(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::Open => Some("* connected".into()),
        SessionEvent::Message(Payload::Text(text)) => Some(format!("peer: {}", text)),
        SessionEvent::Message(Payload::File { name, size, url }) => {
            Some(format!("peer shared {} ({} bytes): {}", name, size, url))
        }
        SessionEvent::Message(Payload::Reaction { emoji }) => Some(format!("peer reacted {}", emoji)),
        SessionEvent::Status(text) => Some(format!("* {}", text)),
        SessionEvent::Close => Some("* session closed".into()),
        SessionEvent::IceStateChange(state) => Some(format!("* link {}", state.as_str())),
        SessionEvent::InactivityReset(_) => None,
    }
}

async fn run_session(
    name: String,
    role: Role,
    config: Config,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting {:?} session for room '{}'", role, name);
    info!("  Signal server: {}", config.rendezvous.url);

    let Session {
        handle, mut events, task,
    } = Session::start(&name, role, &config).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if let Some(text) = render(&event) {
                        println!("{}", text);
                    }
                    if event == SessionEvent::Close {
                        break;
                    }
                }
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => handle_line(&handle, &line).await,
                None => {
                    stdin_open = false;
                    handle.close();
                }
            },
            _ = signal::ctrl_c() => {
                info!("Shutting down...");
                handle.close();
            }
        }
    }

    if let Err(e) = task.await {
        error!("Session task failed: {}", e);
    }
    Ok(())
}

async fn handle_line(handle: &SessionHandle, line: &str) {
    match parse_line(line) {
        Line::Quit => handle.close(),
        Line::Retry => handle.retry(),
        Line::Send(text) => {
            if !handle.send(text).await {
                println!("* not connected, message not sent");
            }
        }
        Line::Empty => {}
    }
}

async fn run_hub(name: String, key: String, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting hub for room '{}'", name);
    info!("  Signal server: {}", config.rendezvous.url);

    let Hub {
        handle, mut events, task,
    } = Hub::start(&name, &key, &config);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(HubEvent::Peer { peer_id, event }) => {
                    if let Some(text) = render(&event) {
                        println!("[{}] {}", peer_id, text);
                    }
                }
                Some(HubEvent::Status(text)) => println!("* {}", text),
                Some(HubEvent::Closed) | None => break,
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    // `/to <peer> <text>` addresses one peer, anything else goes to all
                    if let Some(rest) = line.strip_prefix("/to ") {
                        let (peer_id, text) = rest.split_once(' ').unwrap_or((rest, ""));
                        if !handle.send_to(peer_id, text).await {
                            println!("* {} not connected", peer_id);
                        }
                        continue;
                    }
                    match parse_line(&line) {
                        Line::Quit => handle.close(),
                        Line::Send(text) => {
                            let delivered = handle.broadcast(text).await;
                            if delivered == 0 {
                                println!("* no peers connected");
                            }
                        }
                        Line::Retry | Line::Empty => {}
                    }
                }
                None => {
                    stdin_open = false;
                    handle.close();
                }
            },
            _ = signal::ctrl_c() => {
                info!("Shutting down...");
                handle.close();
            }
        }
    }

    if let Err(e) = task.await {
        error!("Hub task failed: {}", e);
    }
    Ok(())
}

async fn run_signal(port: Option<u16>, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut signal_config = config.signal;
    if let Some(port) = port {
        signal_config.port = port;
    }
    let bind_addr = SocketAddr::new(signal_config.bind, signal_config.port);

    info!("Starting duet signal server...");
    info!("  Listening on: ws://{}", bind_addr);

    let server = SignalServer::new(signal_config);

    // Handle Ctrl+C
    tokio::select! {
        result = server.serve(bind_addr) => {
            if let Err(e) = result {
                error!("Signal server error: {:?}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
