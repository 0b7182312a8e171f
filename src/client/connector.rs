//! Broker connection for initiators
//!
//! [`BrokerClient`] owns one initiator endpoint. It keeps the services this
//! process hosts and wires every channel it opens or accepts to a
//! [`LocalBridge`].

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::endpoint::{
    deliver_reply, ChannelHandle, ChannelTarget, Endpoint, FrameHandler, HostOwner, LocalBridge,
    ReplyListener, Role,
};
use crate::error::{Error, Result};
use crate::protocol::constants::NULL_CHANNEL;
use crate::protocol::{Frame, Push, Reply, Request};
use crate::registry::ServiceId;
use crate::stats::SessionStats;

use super::config::ClientConfig;

type HostTable = Arc<DashMap<ServiceId, Arc<dyn HostOwner>>>;

/// Accepts CONNECT pushes for the services this client hosts
struct ClientHandler {
    hosts: HostTable,
}

impl ClientHandler {
    fn accept(&self, endpoint: &Arc<Endpoint>, service: ServiceId, channel: u32) {
        let owner = self.hosts.get(&service).map(|entry| Arc::clone(entry.value()));
        let Some(owner) = owner else {
            tracing::debug!(host = %service, channel = channel, "Connect for a service not hosted here");
            let _ = endpoint.notify(Request::Close { channel });
            return;
        };

        let handle = ChannelHandle::new(Arc::clone(endpoint), channel);
        match owner.new_connection(handle.clone(), &service) {
            Some(bridge) => {
                endpoint
                    .channels()
                    .insert(channel, ChannelTarget::Local(Arc::clone(&bridge)));
                tracing::debug!(host = %service, channel = channel, "Incoming channel accepted");
                bridge.on_assigned(handle);
            }
            None => {
                tracing::debug!(host = %service, channel = channel, "Incoming channel refused");
                let _ = endpoint.notify(Request::Close { channel });
            }
        }
    }
}

impl FrameHandler for ClientHandler {
    fn on_control(&self, endpoint: &Arc<Endpoint>, frame: Frame) {
        match frame {
            Frame::Push(Push::Connect { service, channel }) => {
                self.accept(endpoint, service, channel)
            }
            other => {
                tracing::debug!(kind = ?other.kind(), "Ignoring unexpected frame from broker");
            }
        }
    }
}

/// Connection to a rendezvous broker
///
/// # Example
/// ```no_run
/// use rendezvous_rs::client::{BrokerClient, ClientConfig};
///
/// # async fn example() -> rendezvous_rs::error::Result<()> {
/// let client = BrokerClient::connect(ClientConfig::new("broker.local")).await?;
///
/// for host in client.lookup_hosts("printer*").await? {
///     println!("found {}", host);
/// }
/// # Ok(())
/// # }
/// ```
pub struct BrokerClient {
    endpoint: Arc<Endpoint>,
    hosts: HostTable,
}

impl BrokerClient {
    /// Connect to the broker over TCP
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        tracing::debug!(addr = %config.broker_addr, "Connecting to broker");

        let stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect(&config.broker_addr),
        )
        .await
        .map_err(|_| Error::Timeout)??;

        if config.tcp_nodelay {
            stream.set_nodelay(true)?;
        }

        let peer_addr = stream.peer_addr().ok();
        tracing::info!(addr = %config.broker_addr, "Connected to broker");

        Ok(Self::start(stream, peer_addr, &config))
    }

    /// Speak the protocol over an already connected stream
    pub fn from_stream<S>(stream: S, config: &ClientConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(stream, None, config)
    }

    fn start<S>(stream: S, peer_addr: Option<SocketAddr>, config: &ClientConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let hosts: HostTable = Arc::new(DashMap::new());
        let handler = Arc::new(ClientHandler {
            hosts: Arc::clone(&hosts),
        });

        let endpoint = Endpoint::spawn(
            stream,
            0,
            Role::Initiator,
            peer_addr,
            config.endpoint_config(),
            handler,
        );

        let owned = Arc::clone(&hosts);
        endpoint.on_close(move || {
            let services: Vec<ServiceId> = owned.iter().map(|entry| entry.key().clone()).collect();
            for service in services {
                if let Some((service, owner)) = owned.remove(&service) {
                    owner.on_owner_closed(&service);
                }
            }
        });

        Self { endpoint, hosts }
    }

    /// Send a raw request; its reply goes to `listener`
    ///
    /// Requests without a reply are sent fire-and-forget. A CONNECT sent
    /// this way is not wired to a bridge, so traffic on the returned channel
    /// is refused; use [`open_channel`](Self::open_channel) to open usable channels.
    pub fn request(&self, request: Request, listener: Arc<dyn ReplyListener>) -> Result<u32> {
        if !request.kind().has_reply() {
            return self.endpoint.notify(request);
        }

        self.endpoint.request(
            request,
            Box::new(move |nonce, reply| deliver_reply(listener.as_ref(), nonce, reply)),
        )
    }

    /// Register `owner` under `name`
    ///
    /// `owner` learns its id through [`HostOwner::on_id_assigned`] and starts
    /// receiving connections once the broker has answered.
    pub fn register(&self, name: &str, owner: Arc<dyn HostOwner>) -> Result<u32> {
        self.register_with(name, owner, |_| {})
    }

    /// Register `owner` under `name` and wait for the assigned id
    pub async fn register_host(&self, name: &str, owner: Arc<dyn HostOwner>) -> Result<ServiceId> {
        let (tx, rx) = oneshot::channel();
        self.register_with(name, owner, move |service| {
            let _ = tx.send(service);
        })?;
        rx.await.map_err(|_| Error::ReplyDropped)
    }

    fn register_with(
        &self,
        name: &str,
        owner: Arc<dyn HostOwner>,
        done: impl FnOnce(ServiceId) + Send + Sync + 'static,
    ) -> Result<u32> {
        let hosts = Arc::clone(&self.hosts);
        let name = name.to_string();

        self.endpoint.request(
            Request::Register { name: name.clone() },
            Box::new(move |_, reply| {
                let Reply::Registered { id } = reply else {
                    return;
                };
                let service = ServiceId::new(name.as_str(), id);
                tracing::info!(host = %service, "Host registered");

                hosts.insert(service.clone(), Arc::clone(&owner));
                owner.on_id_assigned(id, &name);
                done(service);
            }),
        )
    }

    /// Withdraw a registration made by this client
    ///
    /// The owner stops receiving connections straight away.
    pub fn unregister(&self, service: &ServiceId) -> Result<u32> {
        self.hosts.remove(service);
        self.endpoint.notify(Request::Unregister {
            service: service.clone(),
        })
    }

    /// Open a channel to `service`
    ///
    /// On success the bridge gets [`LocalBridge::on_assigned`]; if the broker
    /// cannot reach the host it gets `on_closed(0)` instead.
    pub fn open_channel(&self, service: ServiceId, bridge: Arc<dyn LocalBridge>) -> Result<u32> {
        self.open(Request::Connect { service }, bridge)
    }

    /// Open a channel to the only host registered as `name`
    ///
    /// Refused with `on_closed(0)` if the name is unknown or registered more
    /// than once.
    pub fn connect_name(&self, name: &str, bridge: Arc<dyn LocalBridge>) -> Result<u32> {
        self.open(Request::ConnectName { name: name.into() }, bridge)
    }

    fn open(&self, request: Request, bridge: Arc<dyn LocalBridge>) -> Result<u32> {
        let endpoint = Arc::downgrade(&self.endpoint);

        self.endpoint.request(
            request,
            Box::new(move |_, reply| {
                let Reply::Connected { channel, .. } = reply else {
                    return;
                };
                if channel == NULL_CHANNEL {
                    tracing::debug!("Connect refused by broker");
                    bridge.on_closed(NULL_CHANNEL);
                    return;
                }
                let Some(endpoint) = endpoint.upgrade() else {
                    return;
                };

                endpoint
                    .channels()
                    .insert(channel, ChannelTarget::Local(Arc::clone(&bridge)));
                tracing::debug!(channel = channel, "Channel opened");
                bridge.on_assigned(ChannelHandle::new(endpoint, channel));
            }),
        )
    }

    /// Search for hosts matching a wildcard pattern
    pub fn lookup(&self, query: &str, listener: Arc<dyn ReplyListener>) -> Result<u32> {
        self.request(Request::Lookup { query: query.into() }, listener)
    }

    /// Search for hosts and wait for the result
    pub async fn lookup_hosts(&self, query: &str) -> Result<Vec<ServiceId>> {
        let (tx, rx) = oneshot::channel();
        self.endpoint.request(
            Request::Lookup { query: query.into() },
            Box::new(move |_, reply| {
                if let Reply::LookupResult { hosts } = reply {
                    let _ = tx.send(hosts);
                }
            }),
        )?;
        rx.await.map_err(|_| Error::ReplyDropped)
    }

    /// Send bytes on an open channel
    pub fn send(&self, channel: u32, data: Bytes) -> Result<()> {
        self.endpoint.send_data(channel, data)
    }

    /// Close a channel from this side
    ///
    /// The local bridge gets `on_closed` and the remote half a CLOSE.
    /// Returns false if the channel was not open.
    pub fn close_channel(&self, channel: u32) -> bool {
        match self.endpoint.close_channel(channel) {
            Some(ChannelTarget::Local(bridge)) => {
                bridge.on_closed(channel);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Services currently hosted by this client
    pub fn hosts(&self) -> Vec<ServiceId> {
        let mut hosts: Vec<ServiceId> = self.hosts.iter().map(|entry| entry.key().clone()).collect();
        hosts.sort();
        hosts
    }

    /// End the session
    ///
    /// Every hosted service and every open channel is told.
    pub fn close(&self) {
        self.endpoint.close();
    }

    pub fn is_closed(&self) -> bool {
        self.endpoint.is_closed()
    }

    /// Wait until the session has ended, from either side
    pub async fn closed(&self) {
        self.endpoint.closed().await
    }

    pub fn stats(&self) -> SessionStats {
        self.endpoint.stats()
    }

    /// The underlying endpoint
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        self.endpoint.close();
    }
}
