//! Broker side of one connection
//!
//! Every accepted socket runs an [`Endpoint`] in the broker role. Requests
//! from it are answered here: registry operations reply directly, connect
//! requests wire a channel pair and push CONNECT to the target host's
//! endpoint.
//!
//! # Connect handshake
//!
//! ```text
//!   initiator A              broker                     host B
//!       │ CONNECT(svc:0) n=4    │                          │
//!       │──────────────────────►│ reserve a_ch on A        │
//!       │                       │ allocate b_ch on B       │
//!       │                       │ A[a_ch] = Relay(B, b_ch) │
//!       │                       │ B[b_ch] = Relay(A, a_ch) │
//!       │ RESPONSE n=4 a_ch     │                          │
//!       │◄──────────────────────│ CONNECT(svc, 0, b_ch)    │
//!       │                       │─────────────────────────►│
//! ```
//!
//! The reply is queued before the push so the initiator always knows its
//! channel id before relayed data for it can arrive.

use std::fmt;
use std::sync::Arc;

use crate::endpoint::{ChannelHandle, ChannelTarget, Endpoint, FrameHandler, HostOwner};
use crate::protocol::constants::{BROKER_OWNER_ID, NULL_CHANNEL};
use crate::protocol::{Frame, Push, Reply, Request};
use crate::registry::{HostRegistration, HostRegistry, OwnerId, RegistryOwner, ServiceId};

/// Whoever answers connections for a registered host
#[derive(Clone)]
pub enum HostTarget {
    /// A host behind a connected endpoint
    Remote(Arc<Endpoint>),
    /// A host served by the broker process itself
    Local(Arc<dyn HostOwner>),
}

impl RegistryOwner for HostTarget {
    fn owner_id(&self) -> OwnerId {
        match self {
            HostTarget::Remote(endpoint) => endpoint.id(),
            HostTarget::Local(_) => BROKER_OWNER_ID,
        }
    }
}

impl fmt::Debug for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostTarget::Remote(endpoint) => write!(f, "Remote({})", endpoint.id()),
            HostTarget::Local(_) => write!(f, "Local"),
        }
    }
}

/// Request handling shared by every broker session
pub(crate) struct BrokerHandler {
    registry: Arc<HostRegistry<HostTarget>>,
}

impl BrokerHandler {
    pub(crate) fn new(registry: Arc<HostRegistry<HostTarget>>) -> Self {
        Self { registry }
    }

    fn register(&self, endpoint: &Arc<Endpoint>, nonce: u32, name: String) {
        // The reply is queued before the host becomes visible, so a CONNECT
        // push for it can never overtake the id
        self.registry.register_with(
            HostTarget::Remote(Arc::clone(endpoint)),
            &name,
            |id| {
                let _ = endpoint.reply(nonce, Reply::Registered { id });
            },
        );

        // Teardown may have swept the registry before this insert landed
        if endpoint.is_closed() {
            self.registry.remove_all(endpoint.id());
        }
    }

    fn connect(
        &self,
        endpoint: &Arc<Endpoint>,
        nonce: u32,
        by_name: bool,
        target: Option<HostRegistration<HostTarget>>,
    ) {
        let Some(HostRegistration { service, owner }) = target else {
            tracing::debug!(session_id = endpoint.id(), "Connect target not found");
            refuse(endpoint, nonce, by_name);
            return;
        };

        match owner {
            HostTarget::Remote(host) => self.connect_remote(endpoint, nonce, by_name, host, service),
            HostTarget::Local(owner) => self.connect_local(endpoint, nonce, by_name, owner, service),
        }
    }

    fn connect_remote(
        &self,
        endpoint: &Arc<Endpoint>,
        nonce: u32,
        by_name: bool,
        host: Arc<Endpoint>,
        service: ServiceId,
    ) {
        if host.is_closed() {
            refuse(endpoint, nonce, by_name);
            return;
        }

        let channel = endpoint.channels().reserve();
        let host_channel = host.channels().allocate(ChannelTarget::Relay {
            peer: Arc::clone(endpoint),
            channel,
        });
        let wired = endpoint.channels().set(
            channel,
            ChannelTarget::Relay {
                peer: Arc::clone(&host),
                channel: host_channel,
            },
        );

        if !wired || host.is_closed() {
            endpoint.channels().remove(channel);
            host.channels().remove(host_channel);
            refuse(endpoint, nonce, by_name);
            return;
        }

        if endpoint.reply(nonce, Reply::Connected { by_name, channel }).is_err() {
            host.channels().remove(host_channel);
            return;
        }

        // The host went away between wiring and replying; its teardown
        // closed our half before the initiator knew the id, so close again.
        if !endpoint.channels().contains(channel) {
            let _ = endpoint.push(Push::Close { channel });
            return;
        }

        tracing::debug!(
            session_id = endpoint.id(),
            host_session = host.id(),
            host = %service,
            channel = channel,
            host_channel = host_channel,
            "Channel bridged"
        );

        let _ = host.push(Push::Connect {
            service,
            channel: host_channel,
        });
    }

    fn connect_local(
        &self,
        endpoint: &Arc<Endpoint>,
        nonce: u32,
        by_name: bool,
        owner: Arc<dyn HostOwner>,
        service: ServiceId,
    ) {
        let channel = endpoint.channels().reserve();
        let handle = ChannelHandle::new(Arc::clone(endpoint), channel);

        let Some(bridge) = owner.new_connection(handle.clone(), &service) else {
            endpoint.channels().remove(channel);
            tracing::debug!(session_id = endpoint.id(), host = %service, "Local host refused connection");
            refuse(endpoint, nonce, by_name);
            return;
        };

        if !endpoint
            .channels()
            .set(channel, ChannelTarget::Local(Arc::clone(&bridge)))
        {
            refuse(endpoint, nonce, by_name);
            bridge.on_closed(channel);
            return;
        }

        tracing::debug!(
            session_id = endpoint.id(),
            host = %service,
            channel = channel,
            "Channel opened to local host"
        );

        let _ = endpoint.reply(nonce, Reply::Connected { by_name, channel });
        bridge.on_assigned(handle);
    }
}

fn refuse(endpoint: &Endpoint, nonce: u32, by_name: bool) {
    let _ = endpoint.reply(
        nonce,
        Reply::Connected {
            by_name,
            channel: NULL_CHANNEL,
        },
    );
}

impl FrameHandler for BrokerHandler {
    fn on_control(&self, endpoint: &Arc<Endpoint>, frame: Frame) {
        let Frame::Request { nonce, request } = frame else {
            return;
        };

        match request {
            Request::Register { name } => self.register(endpoint, nonce, name),
            Request::Unregister { service } => {
                self.registry.unregister(endpoint.id(), &service);
            }
            Request::Connect { service } => {
                let target = self.registry.lookup_exact(&service);
                self.connect(endpoint, nonce, false, target);
            }
            Request::ConnectName { name } => {
                let target = self.registry.lookup_unique(&name);
                self.connect(endpoint, nonce, true, target);
            }
            Request::Lookup { query } => {
                let hosts = self
                    .registry
                    .search(&query)
                    .into_iter()
                    .map(|registration| registration.service)
                    .collect();
                let _ = endpoint.reply(nonce, Reply::LookupResult { hosts });
            }
            // Data plane and END_SESSION never reach the handler
            Request::Send { .. } | Request::Close { .. } | Request::EndSession => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::endpoint::LocalBridge;
    use crate::protocol::codec::{encode, FrameDecoder};
    use crate::protocol::Direction;
    use crate::server::{BrokerServer, ServerConfig};

    /// Raw protocol peer on the far side of a duplex pipe
    struct Peer {
        io: DuplexStream,
        decoder: FrameDecoder,
        next_nonce: u32,
    }

    impl Peer {
        fn attach(server: &BrokerServer) -> (Arc<Endpoint>, Peer) {
            let (local, remote) = tokio::io::duplex(64 * 1024);
            let endpoint = server.attach(local, None);
            let peer = Peer {
                io: remote,
                decoder: FrameDecoder::new(Direction::FromBroker),
                next_nonce: 0,
            };
            (endpoint, peer)
        }

        async fn send(&mut self, request: Request) -> u32 {
            let nonce = self.next_nonce;
            self.next_nonce += 1;
            self.io
                .write_all(&encode(&Frame::Request { nonce, request }))
                .await
                .unwrap();
            nonce
        }

        async fn recv(&mut self) -> Frame {
            let read = async {
                loop {
                    if let Some(frame) = self.decoder.decode().unwrap() {
                        return frame;
                    }
                    self.decoder.buffer_mut().reserve(1024);
                    let n = self.io.read_buf(self.decoder.buffer_mut()).await.unwrap();
                    assert!(n > 0, "broker closed the connection");
                }
            };
            tokio::time::timeout(Duration::from_secs(5), read)
                .await
                .expect("timed out waiting for a frame")
        }

        async fn reply_to(&mut self, expected: u32) -> Reply {
            match self.recv().await {
                Frame::Response { nonce, reply } => {
                    assert_eq!(nonce, expected);
                    reply
                }
                other => panic!("expected a response, got {:?}", other),
            }
        }

        async fn register(&mut self, name: &str) -> u32 {
            let nonce = self.send(Request::Register { name: name.into() }).await;
            match self.reply_to(nonce).await {
                Reply::Registered { id } => id,
                other => panic!("unexpected reply: {:?}", other),
            }
        }

        async fn connect(&mut self, request: Request) -> u32 {
            let nonce = self.send(request).await;
            match self.reply_to(nonce).await {
                Reply::Connected { channel, .. } => channel,
                other => panic!("unexpected reply: {:?}", other),
            }
        }
    }

    /// Broker-hosted service that echoes everything back
    #[derive(Default)]
    struct EchoHost {
        events: Mutex<Vec<String>>,
    }

    struct EchoBridge {
        handle: Mutex<Option<ChannelHandle>>,
    }

    impl LocalBridge for EchoBridge {
        fn on_assigned(&self, handle: ChannelHandle) {
            *self.handle.lock().unwrap() = Some(handle);
        }
        fn on_data(&self, data: Bytes, _channel: u32) {
            if let Some(handle) = self.handle.lock().unwrap().as_ref() {
                handle.send(data).unwrap();
            }
        }
        fn on_closed(&self, _channel: u32) {}
    }

    impl HostOwner for EchoHost {
        fn on_id_assigned(&self, id: u32, name: &str) {
            self.events.lock().unwrap().push(format!("assigned {}:{}", name, id));
        }
        fn new_connection(
            &self,
            handle: ChannelHandle,
            service: &ServiceId,
        ) -> Option<Arc<dyn LocalBridge>> {
            self.events
                .lock()
                .unwrap()
                .push(format!("connection {} on {}", service, handle.id()));
            Some(Arc::new(EchoBridge {
                handle: Mutex::new(None),
            }))
        }
        fn on_owner_closed(&self, service: &ServiceId) {
            self.events.lock().unwrap().push(format!("closed {}", service));
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let server = BrokerServer::new(ServerConfig::default());
        let (_ep, mut peer) = Peer::attach(&server);

        assert_eq!(peer.register("printer").await, 0);
        assert_eq!(peer.register("printer").await, 1);
        assert_eq!(peer.register("plotter").await, 0);

        let nonce = peer.send(Request::Lookup { query: "p*er".into() }).await;
        assert_eq!(
            peer.reply_to(nonce).await,
            Reply::LookupResult {
                hosts: vec![
                    ServiceId::new("plotter", 0),
                    ServiceId::new("printer", 0),
                    ServiceId::new("printer", 1),
                ]
            }
        );

        let nonce = peer.send(Request::Lookup { query: "nothing".into() }).await;
        assert_eq!(
            peer.reply_to(nonce).await,
            Reply::LookupResult { hosts: vec![] }
        );
    }

    #[tokio::test]
    async fn test_connect_name_resolution() {
        let server = BrokerServer::new(ServerConfig::default());
        let (_host_ep, mut host) = Peer::attach(&server);
        let (_init_ep, mut initiator) = Peer::attach(&server);

        host.register("twice").await;
        host.register("twice").await;
        host.register("once").await;

        let ambiguous = initiator
            .connect(Request::ConnectName { name: "twice".into() })
            .await;
        assert_eq!(ambiguous, NULL_CHANNEL);

        let unknown = initiator
            .connect(Request::ConnectName { name: "missing".into() })
            .await;
        assert_eq!(unknown, NULL_CHANNEL);

        let unique = initiator
            .connect(Request::ConnectName { name: "once".into() })
            .await;
        assert_ne!(unique, NULL_CHANNEL);

        match host.recv().await {
            Frame::Push(Push::Connect { service, channel }) => {
                assert_eq!(service, ServiceId::new("once", 0));
                assert_ne!(channel, NULL_CHANNEL);
            }
            other => panic!("expected a CONNECT push, got {:?}", other),
        }

        let exact = initiator
            .connect(Request::Connect {
                service: ServiceId::new("twice", 1),
            })
            .await;
        assert_ne!(exact, NULL_CHANNEL);
        assert_ne!(exact, unique);

        let wrong_id = initiator
            .connect(Request::Connect {
                service: ServiceId::new("once", 5),
            })
            .await;
        assert_eq!(wrong_id, NULL_CHANNEL);
    }

    #[tokio::test]
    async fn test_relay_is_transparent_both_ways() {
        let server = BrokerServer::new(ServerConfig::default());
        let (_host_ep, mut host) = Peer::attach(&server);
        let (_init_ep, mut initiator) = Peer::attach(&server);

        host.register("svc").await;
        let channel = initiator
            .connect(Request::Connect {
                service: ServiceId::new("svc", 0),
            })
            .await;

        let host_channel = match host.recv().await {
            Frame::Push(Push::Connect { service, channel }) => {
                assert_eq!(service, ServiceId::new("svc", 0));
                channel
            }
            other => panic!("expected a CONNECT push, got {:?}", other),
        };

        let chunks: [&'static [u8]; 3] = [b"first", b"", &[0, 159, 146, 150, 255]];
        for chunk in chunks {
            initiator
                .send(Request::Send {
                    channel,
                    data: Bytes::from_static(chunk),
                })
                .await;
        }
        for chunk in chunks {
            assert_eq!(
                host.recv().await,
                Frame::Push(Push::Send {
                    channel: host_channel,
                    data: Bytes::from_static(chunk),
                })
            );
        }

        host.send(Request::Send {
            channel: host_channel,
            data: Bytes::from_static(b"reply"),
        })
        .await;
        assert_eq!(
            initiator.recv().await,
            Frame::Push(Push::Send {
                channel,
                data: Bytes::from_static(b"reply"),
            })
        );

        // Closing one half closes the other
        initiator.send(Request::Close { channel }).await;
        assert_eq!(
            host.recv().await,
            Frame::Push(Push::Close {
                channel: host_channel
            })
        );
    }

    #[tokio::test]
    async fn test_host_session_close_cascades() {
        let server = BrokerServer::new(ServerConfig::default());
        let (host_ep, mut host) = Peer::attach(&server);
        let (init_ep, mut initiator) = Peer::attach(&server);

        host.register("svc").await;
        let channel = initiator
            .connect(Request::ConnectName { name: "svc".into() })
            .await;
        host.recv().await; // CONNECT push

        host.send(Request::EndSession).await;
        host_ep.closed().await;

        assert_eq!(host.recv().await, Frame::Push(Push::EndSession));
        assert_eq!(initiator.recv().await, Frame::Push(Push::Close { channel }));
        assert!(server.list_services().is_empty());
        assert!(init_ep.channels().is_empty());
        assert!(!init_ep.is_closed());

        let stats = server.stats();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.registered_hosts, 0);
    }

    #[tokio::test]
    async fn test_unregister_requires_ownership() {
        let server = BrokerServer::new(ServerConfig::default());
        let (_a_ep, mut a) = Peer::attach(&server);
        let (_b_ep, mut b) = Peer::attach(&server);

        a.register("svc").await;
        b.send(Request::Unregister {
            service: ServiceId::new("svc", 0),
        })
        .await;

        // Round-trip a lookup so the unregister has been processed
        let nonce = b.send(Request::Lookup { query: "svc".into() }).await;
        assert_eq!(
            b.reply_to(nonce).await,
            Reply::LookupResult {
                hosts: vec![ServiceId::new("svc", 0)]
            }
        );

        a.send(Request::Unregister {
            service: ServiceId::new("svc", 0),
        })
        .await;
        let nonce = a.send(Request::Lookup { query: "svc".into() }).await;
        assert_eq!(
            a.reply_to(nonce).await,
            Reply::LookupResult { hosts: vec![] }
        );
    }

    #[tokio::test]
    async fn test_stray_channel_traffic_is_dropped() {
        let server = BrokerServer::new(ServerConfig::default());
        let (ep, mut peer) = Peer::attach(&server);

        peer.send(Request::Send {
            channel: 77,
            data: Bytes::from_static(b"nobody"),
        })
        .await;
        peer.send(Request::Close { channel: 77 }).await;

        // The session survives and the next reply is the first frame back
        let nonce = peer.send(Request::Lookup { query: "*".into() }).await;
        assert_eq!(
            peer.reply_to(nonce).await,
            Reply::LookupResult { hosts: vec![] }
        );
        assert!(!ep.is_closed());
    }

    #[tokio::test]
    async fn test_broker_hosted_service() {
        let server = BrokerServer::new(ServerConfig::default());
        let echo = Arc::new(EchoHost::default());
        let service = server.register_local("echo", echo.clone());
        assert_eq!(service, ServiceId::new("echo", 0));

        let (_ep, mut initiator) = Peer::attach(&server);
        let channel = initiator
            .connect(Request::ConnectName { name: "echo".into() })
            .await;
        assert_ne!(channel, NULL_CHANNEL);

        initiator
            .send(Request::Send {
                channel,
                data: Bytes::from_static(b"hello"),
            })
            .await;
        assert_eq!(
            initiator.recv().await,
            Frame::Push(Push::Send {
                channel,
                data: Bytes::from_static(b"hello"),
            })
        );

        assert!(server.unregister_local(&service));
        assert!(!server.unregister_local(&service));
        assert!(server.list_services().is_empty());

        assert_eq!(
            *echo.events.lock().unwrap(),
            vec![
                "assigned echo:0".to_string(),
                format!("connection echo:0 on {}", channel),
                "closed echo:0".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_framing_error_only_affects_its_session() {
        let server = BrokerServer::new(ServerConfig::default());
        let (bad_ep, mut bad) = Peer::attach(&server);
        let (_good_ep, mut good) = Peer::attach(&server);

        bad.register("doomed").await;
        good.register("fine").await;

        bad.io.write_all(&[200]).await.unwrap();
        bad_ep.closed().await;

        assert_eq!(server.list_services(), vec![ServiceId::new("fine", 0)]);
        let nonce = good.send(Request::Lookup { query: "*".into() }).await;
        assert_eq!(
            good.reply_to(nonce).await,
            Reply::LookupResult {
                hosts: vec![ServiceId::new("fine", 0)]
            }
        );
    }
}
