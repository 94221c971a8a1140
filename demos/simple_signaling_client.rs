use std::time::Duration;

use clap::Parser;
use rustsignaling::signaling::signaling_client::SignalingClient;
use rustsignaling::signaling::signaling_config::SignalingConfig;
use rustsignaling::signaling::signaling_events::SignalingEvent;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};

/// Signs in to a signaling server and prints what happens. Lines on stdin are commands:
///  `send <peer id> <message>`, `bye <peer id>`, `capacity <value>`, `peers` and `quit`.
#[derive(Parser)]
struct Args {
    /// server host, optionally with `http://` or `https://`
    server: String,
    name: String,

    #[clap(short, long, default_value_t = 8888)]
    port: u16,

    /// negative values disable heartbeats
    #[clap(long, default_value_t = -1)]
    heartbeat_millis: i64,

    #[clap(long)]
    proxy: Option<String>,

    #[clap(long)]
    authorization: Option<String>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = SignalingConfig::new()
        .with_heartbeat_millis(args.heartbeat_millis);
    config.proxy = args.proxy;
    config.authorization = args.authorization;
    config.shutdown_timeout = Duration::from_secs(5);

    let client = SignalingClient::new(config)?;
    let mut events = client.subscribe();
    client.sign_in(&args.server, args.port, &args.name);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        select! {
            event = events.recv() => match event {
                Ok(SignalingEvent::ServerConnectionFailure) => {
                    warn!("could not sign in to {}:{}", args.server, args.port);
                    break;
                }
                Ok(SignalingEvent::Disconnected) => {
                    info!("disconnected");
                    break;
                }
                Ok(event) => info!("{:?}", event),
                Err(RecvError::Lagged(n)) => warn!("missed {} events", n),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_command(&client, line.trim()) {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

/// returns `false` to quit
fn handle_command(client: &SignalingClient, line: &str) -> bool {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "" => {}
        "quit" => return false,
        "peers" => {
            for peer in client.peers() {
                println!("{:>6}  {}", peer.id, peer.name);
            }
        }
        "send" => match rest.split_once(' ') {
            Some((id, message)) => match id.parse() {
                Ok(id) => {
                    if !client.send_to_peer(id, message) {
                        warn!("not signed in");
                    }
                }
                Err(_) => warn!("invalid peer id {:?}", id),
            },
            None => warn!("usage: send <peer id> <message>"),
        },
        "bye" => match rest.trim().parse() {
            Ok(id) => { client.send_hang_up(id); }
            Err(_) => warn!("usage: bye <peer id>"),
        },
        "capacity" => match rest.trim().parse() {
            Ok(value) => { client.update_capacity(value); }
            Err(_) => warn!("usage: capacity <value>"),
        },
        other => warn!("unknown command {:?}", other),
    }
    true
}
