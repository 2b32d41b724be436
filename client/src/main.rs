use clap::Parser;
use client::dispatch::ChatPrinter;
use client::network::Client;
use log::{info, warn};
use shared::{Packet, CONNECT_TIMEOUT_MS, SERVER_PORT};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value_t = SocketAddr::from(([127, 0, 0, 1], SERVER_PORT)))]
    server: SocketAddr,

    /// Name announced in the handshake
    #[arg(short, long, default_value = "player")]
    name: String,

    /// Milliseconds to wait for the server to accept
    #[arg(long, default_value_t = CONNECT_TIMEOUT_MS)]
    connect_timeout: u64,

    /// Ticks per second
    #[arg(short, long, default_value_t = 60)]
    tick_rate: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let client = Client::new();
    client.set_handler(ChatPrinter);
    client
        .connect(
            args.server,
            &args.name,
            Duration::from_millis(args.connect_timeout),
        )
        .await?;

    info!("Type a line to chat, !quit to leave");

    let tick = Duration::from_secs_f64(1.0 / f64::from(args.tick_rate.max(1)));
    let mut ticker = tokio::time::interval(tick);
    let mut last_tick = Instant::now();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while client.is_connected() {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                client.update(now - last_tick);
                last_tick = now;
            }
            line = lines.next_line() => match line? {
                Some(text) if text.trim() == "!quit" => break,
                Some(text) if text.trim().is_empty() => {}
                Some(text) => {
                    if let Err(e) = client.send(&Packet::Message { text }) {
                        warn!("Failed to send message: {}", e);
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    client.disconnect();
    Ok(())
}
