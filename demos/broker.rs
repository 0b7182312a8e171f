//! Rendezvous broker
//!
//! Run with: cargo run --example broker [BIND_ADDR]
//!
//! Examples:
//!   cargo run --example broker                    # binds to 0.0.0.0:11717
//!   cargo run --example broker localhost          # binds to 127.0.0.1:11717
//!   cargo run --example broker 127.0.0.1:9000     # binds to 127.0.0.1:9000
//!
//! Besides relaying between clients, the broker hosts one service of its
//! own, `echo`, which sends every byte straight back. Try it with the
//! tunnel demo:
//!
//!   cargo run --example tunnel -- forward 127.0.0.1:7000 echo
//!   nc 127.0.0.1 7000

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rendezvous_rs::{BrokerServer, ChannelHandle, HostOwner, LocalBridge, ServerConfig, ServiceId};

/// Broker-hosted service that echoes every channel
struct EchoService;

struct EchoChannel {
    handle: ChannelHandle,
}

impl LocalBridge for EchoChannel {
    fn on_assigned(&self, handle: ChannelHandle) {
        println!("[echo] channel {} open", handle.id());
    }

    fn on_data(&self, data: Bytes, _channel: u32) {
        let _ = self.handle.send(data);
    }

    fn on_closed(&self, channel: u32) {
        println!("[echo] channel {} closed", channel);
    }
}

impl HostOwner for EchoService {
    fn on_id_assigned(&self, id: u32, name: &str) {
        println!("Hosting {}:{}", name, id);
    }

    fn new_connection(
        &self,
        handle: ChannelHandle,
        _service: &ServiceId,
    ) -> Option<Arc<dyn LocalBridge>> {
        Some(Arc::new(EchoChannel { handle }))
    }

    fn on_owner_closed(&self, service: &ServiceId) {
        println!("Stopped hosting {}", service);
    }
}

/// Parse bind address from command line argument.
///
/// Accepts "IP:PORT", a bare IP, or "localhost" with or without a port.
fn parse_bind_addr(arg: &str) -> Result<SocketAddr, String> {
    const DEFAULT_PORT: u16 = 11717;

    let normalized = arg.replace("localhost", "127.0.0.1");

    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    Err(format!(
        "Invalid bind address: '{}'. Expected format: IP:PORT or IP or 'localhost'",
        arg
    ))
}

fn print_usage() {
    eprintln!("Usage: broker [BIND_ADDR]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  BIND_ADDR    Address to bind to (default: 0.0.0.0:11717)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let mut config = ServerConfig::default();
    if let Some(arg) = args.get(1) {
        match parse_bind_addr(arg) {
            Ok(addr) => config = config.bind(addr),
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rendezvous_rs=debug".parse()?)
                .add_directive("broker=debug".parse()?),
        )
        .init();

    println!("Starting broker on {}", config.bind_addr);

    let server = Arc::new(BrokerServer::new(config));
    server.register_local("echo", Arc::new(EchoService));

    // Periodic stats line
    let reporter = Arc::clone(&server);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let stats = reporter.stats();
            println!(
                "Stats: sessions={} hosts={} total_connections={} uptime={}s",
                stats.active_sessions,
                stats.registered_hosts,
                stats.total_connections,
                stats.uptime.as_secs()
            );
        }
    });

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        println!("\nShutting down...");
    };

    if let Err(e) = server.run_until(shutdown).await {
        eprintln!("Server error: {}", e);
    }

    Ok(())
}
