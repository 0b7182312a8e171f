//! Reverse tunnel over a rendezvous broker
//!
//! Run with: cargo run --example tunnel -- [--broker ADDR] <COMMAND>
//!
//! Commands:
//!   expose <NAME> <TARGET_ADDR>     host TARGET_ADDR under NAME
//!   forward <LISTEN_ADDR> <NAME>    accept local connections and tunnel
//!                                   each one to host NAME
//!   lookup <QUERY>                  list hosts matching a wildcard query
//!
//! Examples:
//!   # on the machine running the service
//!   cargo run --example tunnel -- --broker broker.lan expose ssh 127.0.0.1:22
//!
//!   # anywhere else
//!   cargo run --example tunnel -- --broker broker.lan forward 127.0.0.1:2222 ssh
//!   ssh -p 2222 localhost

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use rendezvous_rs::{
    BrokerClient, ChannelHandle, ClientConfig, HostOwner, LocalBridge, ServiceId,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// One virtual channel spliced onto one TCP socket
///
/// Bytes from the channel are queued for a writer task; bytes from the
/// socket are pumped into the channel once it is assigned.
struct TcpBridge {
    to_socket: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    read_half: Mutex<Option<OwnedReadHalf>>,
}

impl TcpBridge {
    /// Bridge for a socket that is already connected
    fn for_socket(socket: TcpStream) -> Arc<Self> {
        let (read_half, write_half) = socket.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_pump(rx, write_half));

        Arc::new(Self {
            to_socket: Mutex::new(Some(tx)),
            read_half: Mutex::new(Some(read_half)),
        })
    }

    /// Bridge whose socket is opened in the background
    ///
    /// Channel data that arrives before the connection is up stays queued.
    fn connecting(target: SocketAddr, handle: ChannelHandle) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let socket = match TcpStream::connect(target).await {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::warn!(addr = %target, error = %e, "Could not reach exposed service");
                    handle.close();
                    return;
                }
            };
            let _ = socket.set_nodelay(true);
            let (read_half, write_half) = socket.into_split();
            tokio::spawn(read_pump(read_half, handle));
            write_pump(rx, write_half).await;
        });

        Arc::new(Self {
            to_socket: Mutex::new(Some(tx)),
            read_half: Mutex::new(None),
        })
    }
}

impl LocalBridge for TcpBridge {
    fn on_assigned(&self, handle: ChannelHandle) {
        tracing::debug!(channel = handle.id(), "Channel open");
        if let Some(read_half) = self.read_half.lock().unwrap().take() {
            tokio::spawn(read_pump(read_half, handle));
        }
    }

    fn on_data(&self, data: Bytes, _channel: u32) {
        if let Some(tx) = self.to_socket.lock().unwrap().as_ref() {
            let _ = tx.send(data);
        }
    }

    fn on_closed(&self, channel: u32) {
        tracing::debug!(channel = channel, "Channel closed");
        // Dropping the sender lets the writer finish and shut the socket
        self.to_socket.lock().unwrap().take();
        self.read_half.lock().unwrap().take();
    }
}

async fn read_pump(mut read_half: OwnedReadHalf, handle: ChannelHandle) {
    let mut buf = BytesMut::with_capacity(16 * 1024);
    loop {
        buf.reserve(16 * 1024);
        match read_half.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if handle.send(buf.split().freeze()).is_err() {
                    return;
                }
            }
        }
    }
    handle.close();
}

async fn write_pump(mut rx: mpsc::UnboundedReceiver<Bytes>, mut write_half: OwnedWriteHalf) {
    while let Some(data) = rx.recv().await {
        if write_half.write_all(&data).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Hosts a local TCP service; every incoming channel gets its own socket
struct ExposedService {
    target: SocketAddr,
}

impl HostOwner for ExposedService {
    fn on_id_assigned(&self, id: u32, name: &str) {
        println!("Exposing {} as {}:{}", self.target, name, id);
    }

    fn new_connection(
        &self,
        handle: ChannelHandle,
        service: &ServiceId,
    ) -> Option<Arc<dyn LocalBridge>> {
        tracing::info!(host = %service, channel = handle.id(), "Incoming tunnel");
        Some(TcpBridge::connecting(self.target, handle))
    }

    fn on_owner_closed(&self, service: &ServiceId) {
        println!("No longer exposing {}", service);
    }
}

async fn expose(
    client: BrokerClient,
    name: &str,
    target: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    client
        .register_host(name, Arc::new(ExposedService { target }))
        .await?;

    tokio::select! {
        _ = client.closed() => println!("Broker closed the session"),
        _ = tokio::signal::ctrl_c() => println!("\nShutting down..."),
    }
    Ok(())
}

async fn forward(
    client: BrokerClient,
    listen: SocketAddr,
    name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(listen).await?;
    println!("Forwarding {} to {}", listener.local_addr()?, name);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                let _ = socket.set_nodelay(true);
                tracing::info!(peer = %peer, host = name, "Opening tunnel");
                client.connect_name(name, TcpBridge::for_socket(socket))?;
            }
            _ = client.closed() => {
                println!("Broker closed the session");
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                return Ok(());
            }
        }
    }
}

async fn lookup(client: BrokerClient, query: &str) -> Result<(), Box<dyn std::error::Error>> {
    let hosts = client.lookup_hosts(query).await?;
    if hosts.is_empty() {
        println!("No hosts match '{}'", query);
    }
    for host in hosts {
        println!("{}", host);
    }
    Ok(())
}

fn print_usage() {
    eprintln!("Usage: tunnel [--broker ADDR] <COMMAND>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  expose <NAME> <TARGET_ADDR>     host TARGET_ADDR under NAME");
    eprintln!("  forward <LISTEN_ADDR> <NAME>    tunnel local connections to NAME");
    eprintln!("  lookup <QUERY>                  list hosts matching QUERY");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --broker ADDR    broker address (default: 127.0.0.1:11717)");
}

enum Command {
    Expose { name: String, target: SocketAddr },
    Forward { listen: SocketAddr, name: String },
    Lookup { query: String },
}

fn parse_command(args: &[String]) -> Result<Command, String> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["expose", name, target] => Ok(Command::Expose {
            name: name.to_string(),
            target: parse_addr(target)?,
        }),
        ["forward", listen, name] => Ok(Command::Forward {
            listen: parse_addr(listen)?,
            name: name.to_string(),
        }),
        ["lookup", query] => Ok(Command::Lookup {
            query: query.to_string(),
        }),
        _ => Err("Unknown command".to_string()),
    }
}

fn parse_addr(arg: &str) -> Result<SocketAddr, String> {
    arg.replace("localhost", "127.0.0.1")
        .parse()
        .map_err(|_| format!("Invalid address: '{}'. Expected IP:PORT", arg))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let mut config = ClientConfig::default();
    if args[0] == "--broker" {
        if args.len() < 2 {
            print_usage();
            std::process::exit(1);
        }
        config = ClientConfig::new(args[1].clone());
        args.drain(..2);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rendezvous_rs=info".parse()?)
                .add_directive("tunnel=debug".parse()?),
        )
        .init();

    let command = match parse_command(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    let client = BrokerClient::connect(config).await?;

    match command {
        Command::Expose { name, target } => expose(client, &name, target).await,
        Command::Forward { listen, name } => forward(client, listen, &name).await,
        Command::Lookup { query } => lookup(client, &query).await,
    }
}
