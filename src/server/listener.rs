//! Broker listener
//!
//! Handles the TCP accept loop and starts a session endpoint per connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::endpoint::{Endpoint, HostOwner, Role};
use crate::error::Result;
use crate::protocol::constants::BROKER_OWNER_ID;
use crate::registry::{HostRegistry, ServiceId};
use crate::server::config::ServerConfig;
use crate::server::session::{BrokerHandler, HostTarget};
use crate::stats::{ServerStats, SessionStats};

/// Rendezvous broker
pub struct BrokerServer {
    config: ServerConfig,
    registry: Arc<HostRegistry<HostTarget>>,
    handler: Arc<BrokerHandler>,
    sessions: Arc<DashMap<u64, Arc<Endpoint>>>,
    next_session_id: AtomicU64,
    total_connections: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
    local_addr: OnceLock<SocketAddr>,
    started_at: Instant,
}

impl BrokerServer {
    /// Create a new server with the given configuration
    pub fn new(config: ServerConfig) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        let registry = Arc::new(HostRegistry::new());

        Self {
            config,
            handler: Arc::new(BrokerHandler::new(Arc::clone(&registry))),
            registry,
            sessions: Arc::new(DashMap::new()),
            // 0 is reserved for hosts the broker registers itself
            next_session_id: AtomicU64::new(BROKER_OWNER_ID + 1),
            total_connections: AtomicU64::new(0),
            connection_semaphore,
            local_addr: OnceLock::new(),
            started_at: Instant::now(),
        }
    }

    /// Get a reference to the host registry
    pub fn registry(&self) -> &Arc<HostRegistry<HostTarget>> {
        &self.registry
    }

    /// Run the server
    ///
    /// This method blocks until the server is shut down.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run the server with graceful shutdown
    ///
    /// When `shutdown` completes every live session is torn down.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.serve(listener) => result,
        };

        self.close_all();
        result
    }

    /// Accept connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);
        tracing::info!(addr = %addr, "Broker listening");

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        }

        let endpoint = self.attach(socket, Some(peer_addr));
        if let Some(permit) = permit {
            endpoint.on_close(move || drop(permit));
        }
    }

    /// Run a broker session on any byte stream
    pub fn attach<S>(&self, stream: S, peer_addr: Option<SocketAddr>) -> Arc<Endpoint>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            session_id = session_id,
            peer = ?peer_addr,
            "New connection"
        );

        let endpoint = Endpoint::spawn(
            stream,
            session_id,
            Role::Broker,
            peer_addr,
            self.config.endpoint_config(),
            self.handler.clone(),
        );

        self.sessions.insert(session_id, Arc::clone(&endpoint));

        let registry = Arc::clone(&self.registry);
        let sessions = Arc::clone(&self.sessions);
        endpoint.on_close(move || {
            registry.remove_all(session_id);
            sessions.remove(&session_id);
            tracing::debug!(session_id = session_id, "Connection closed");
        });

        endpoint
    }

    /// Register a host served by the broker process itself
    pub fn register_local(&self, name: &str, owner: Arc<dyn HostOwner>) -> ServiceId {
        let id = self
            .registry
            .register(HostTarget::Local(Arc::clone(&owner)), name);
        owner.on_id_assigned(id, name);
        ServiceId::new(name, id)
    }

    /// Remove a host registered with [`register_local`](Self::register_local)
    pub fn unregister_local(&self, service: &ServiceId) -> bool {
        let Some(registration) = self.registry.lookup_exact(service) else {
            return false;
        };

        if !self.registry.unregister(BROKER_OWNER_ID, service) {
            return false;
        }

        if let HostTarget::Local(owner) = registration.owner {
            owner.on_owner_closed(service);
        }
        true
    }

    /// Every registered host
    pub fn list_services(&self) -> Vec<ServiceId> {
        self.registry
            .search("*")
            .into_iter()
            .map(|registration| registration.service)
            .collect()
    }

    /// Address the listener is bound to, once serving
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Get the configured bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// Server-wide counters
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_sessions: self.sessions.len() as u64,
            registered_hosts: self.registry.len() as u64,
            uptime: self.started_at.elapsed(),
        }
    }

    /// Counters for one live session
    pub fn session_stats(&self, session_id: u64) -> Option<SessionStats> {
        self.sessions.get(&session_id).map(|endpoint| endpoint.stats())
    }

    /// Tear down every live session
    pub fn close_all(&self) {
        let live: Vec<Arc<Endpoint>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        if !live.is_empty() {
            tracing::info!(sessions = live.len(), "Closing live sessions");
        }

        for endpoint in live {
            endpoint.close();
        }
    }
}

impl Drop for BrokerServer {
    fn drop(&mut self) {
        self.close_all();
    }
}
