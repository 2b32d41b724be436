use clap::Parser;
use log::info;
use server::dispatch::ChatRelay;
use server::network::{Server, ServerConfig};
use shared::{ClientId, CLIENT_TIMEOUT_MS, HEARTBEAT_INTERVAL_MS, HEARTBEAT_RETRIES, SERVER_PORT};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// IP address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = SERVER_PORT)]
    port: u16,

    /// Ticks per second
    #[arg(short, long, default_value_t = 60)]
    tick_rate: u32,

    /// Milliseconds between heartbeat probes
    #[arg(long, default_value_t = HEARTBEAT_INTERVAL_MS as u64)]
    heartbeat_interval: u64,

    /// Unanswered probes before a client is dropped
    #[arg(long, default_value_t = HEARTBEAT_RETRIES)]
    heartbeat_retries: u32,

    /// Milliseconds of silence before a client is dropped
    #[arg(long, default_value_t = CLIENT_TIMEOUT_MS as u64)]
    client_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let server = Server::new(ServerConfig {
        bind_addr: SocketAddr::new(args.host, args.port),
        heartbeat_interval: Duration::from_millis(args.heartbeat_interval),
        heartbeat_retries: args.heartbeat_retries,
        client_timeout: Duration::from_millis(args.client_timeout),
    });
    server.set_handler(ChatRelay);
    server.set_timeout_handler(|client_id: ClientId| info!("Client {} has timed out", client_id));

    let addr = server.start().await?;
    info!("Commands: list, dc, !quit");
    println!("Listening on {}", addr);

    let tick = Duration::from_secs_f64(1.0 / f64::from(args.tick_rate.max(1)));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let ticker = server.clone();
    let run = tokio::spawn(async move { ticker.run(tick).await });

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(command) => match command.trim() {
                    "!quit" => break,
                    "dc" => {
                        server.disconnect_all();
                        println!("Disconnected all clients");
                    }
                    "list" => {
                        let clients = server.client_list();
                        println!("{} clients online:", clients.len());
                        for (client_id, addr) in clients {
                            if let Some(peer) = server.client_info(client_id) {
                                println!(
                                    "  {} {} (joined at {} ms, latency {} ms)",
                                    client_id, addr, peer.registered_at, peer.latency
                                );
                            }
                        }
                    }
                    "" => {}
                    other => println!("Unknown command: {}", other),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    server.stop();
    run.await?;

    let stats = server.stats();
    info!(
        "Sent {} bytes, received {} bytes, {} failed sends",
        stats.bytes_sent(),
        stats.bytes_received(),
        stats.failed_sends()
    );

    Ok(())
}
