//! Endpoint runtime
//!
//! An [`Endpoint`] owns one physical connection. It runs two tasks:
//!
//! ```text
//!            ┌──────────── Arc<Endpoint> ────────────┐
//!            │ channels: ChannelTable                │
//!            │ correlator: Correlator                │
//!            │ outbound: mpsc::UnboundedSender       │
//!            └───────▲───────────────────┬───────────┘
//!                    │ dispatch()        │ recv()
//!   socket ──► [reader task]       [writer task] ──► socket
//!              decode frames       drain queue
//! ```
//!
//! Anything may enqueue a frame: the endpoint's own reader, a relay peer's
//! reader, or a local bridge. Enqueueing never blocks.
//!
//! # Teardown
//!
//! [`Endpoint::close`] is synchronous and runs at most once. It runs the
//! teardown hooks, empties the channel table (telling every bridge and relay
//! peer), queues END_SESSION and signals both tasks. The writer flushes what
//! is queued before shutting the socket down, for at most the configured
//! close timeout; a peer that stopped reading loses the rest. Since nothing
//! awaits, close is safe to call from inside the reader's own dispatch.
//!
//! # Field sizes
//!
//! Outgoing channel data larger than `max_field_size` is split into several
//! SEND frames. Any other frame with an oversized field is refused with
//! [`ProtocolError::FieldTooLarge`](crate::error::ProtocolError::FieldTooLarge)
//! instead of being written.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use super::channel::{ChannelTable, ChannelTarget};
use super::config::EndpointConfig;
use super::correlator::{Correlator, ReplyCallback};
use crate::error::{Error, Result};
use crate::protocol::codec::{check_field_sizes, encode, FrameDecoder};
use crate::protocol::{Direction, Frame, Push, Reply, Request};
use crate::stats::{SessionCounters, SessionStats};

/// Which side of the protocol an endpoint speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connects to a broker and sends correlated requests
    Initiator,
    /// Broker half of one accepted connection
    Broker,
}

impl Role {
    /// Direction of the frames this endpoint reads
    pub fn inbound(self) -> Direction {
        match self {
            Role::Initiator => Direction::FromBroker,
            Role::Broker => Direction::ToBroker,
        }
    }
}

/// Role-specific handling of control frames
///
/// The runtime handles RESPONSE, SEND, CLOSE and END_SESSION itself.
/// Everything else (broker requests, or an incoming CONNECT push on an
/// initiator) is passed here.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_control(&self, endpoint: &Arc<Endpoint>, frame: Frame);
}

type TeardownHook = Box<dyn FnOnce() + Send>;

/// One side of one physical connection
pub struct Endpoint {
    id: u64,
    role: Role,
    peer_addr: Option<SocketAddr>,
    max_field_size: u32,
    outbound: mpsc::UnboundedSender<Bytes>,
    channels: ChannelTable,
    correlator: Correlator,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    counters: SessionCounters,
    hooks: Mutex<Vec<TeardownHook>>,
    started_at: Instant,
}

impl Endpoint {
    /// Start the reader and writer tasks on `stream`
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<S>(
        stream: S,
        id: u64,
        role: Role,
        peer_addr: Option<SocketAddr>,
        config: EndpointConfig,
        handler: Arc<dyn FrameHandler>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let endpoint = Arc::new(Self {
            id,
            role,
            peer_addr,
            max_field_size: config.max_field_size.max(1),
            outbound: outbound_tx,
            channels: ChannelTable::new(),
            correlator: Correlator::new(),
            closed: AtomicBool::new(false),
            shutdown: shutdown_tx,
            counters: SessionCounters::new(),
            hooks: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        });

        let decoder = FrameDecoder::with_max_field_size(role.inbound(), config.max_field_size);

        tokio::spawn(write_loop(
            Arc::clone(&endpoint),
            writer,
            outbound_rx,
            shutdown_rx.clone(),
            config.close_timeout,
        ));
        tokio::spawn(read_loop(
            Arc::clone(&endpoint),
            reader,
            decoder,
            handler,
            shutdown_rx,
            config.read_buffer_size,
        ));

        tracing::debug!(endpoint = id, role = ?role, "Endpoint started");

        endpoint
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until the endpoint has been torn down
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Current counters for this endpoint
    pub fn stats(&self) -> SessionStats {
        let mut stats = self.counters.snapshot();
        stats.open_channels = self.channels.len() as u64;
        stats.pending_requests = self.correlator.pending() as u64;
        stats.duration = self.started_at.elapsed();
        stats
    }

    /// Run `hook` during teardown
    ///
    /// Runs it immediately if the endpoint is already closed.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
        if !self.is_closed() {
            hooks.push(Box::new(hook));
            return;
        }
        drop(hooks);
        hook();
    }

    /// Queue a frame for the writer
    pub fn enqueue(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.write_frame(&frame)
    }

    fn write_frame(&self, frame: &Frame) -> Result<()> {
        if let Err(e) = check_field_sizes(frame, self.max_field_size) {
            tracing::warn!(endpoint = self.id, kind = ?frame.kind(), error = %e, "Frame refused");
            return Err(e.into());
        }
        tracing::trace!(endpoint = self.id, kind = ?frame.kind(), "Frame queued");
        self.outbound
            .send(encode(frame))
            .map_err(|_| Error::ConnectionClosed)?;
        self.counters.frame_sent();
        Ok(())
    }

    /// Send a request and park `callback` for its reply
    ///
    /// Returns the nonce the request was sent with.
    pub fn request(&self, request: Request, callback: ReplyCallback) -> Result<u32> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let nonce = self.correlator.register(callback);
        if let Err(e) = self.enqueue(Frame::Request { nonce, request }) {
            self.correlator.cancel(nonce);
            return Err(e);
        }
        Ok(nonce)
    }

    /// Send a request that gets no reply
    ///
    /// It still takes a nonce. Returns the nonce it was sent with.
    pub fn notify(&self, request: Request) -> Result<u32> {
        let nonce = self.correlator.next_nonce();
        self.enqueue(Frame::Request { nonce, request })?;
        Ok(nonce)
    }

    /// Answer the request carrying `nonce`
    pub fn reply(&self, nonce: u32, reply: Reply) -> Result<()> {
        self.enqueue(Frame::Response { nonce, reply })
    }

    /// Send an uncorrelated message
    pub fn push(&self, push: Push) -> Result<()> {
        self.enqueue(Frame::Push(push))
    }

    /// Send data on `channel` in this endpoint's direction
    ///
    /// Data over the field cap goes out as several consecutive SEND frames.
    pub fn send_data(&self, channel: u32, mut data: Bytes) -> Result<()> {
        let max = self.max_field_size as usize;
        while data.len() > max {
            let chunk = data.split_to(max);
            self.send_chunk(channel, chunk)?;
        }
        self.send_chunk(channel, data)
    }

    fn send_chunk(&self, channel: u32, data: Bytes) -> Result<()> {
        match self.role {
            Role::Initiator => self
                .notify(Request::Send { channel, data })
                .map(|_| ()),
            Role::Broker => self.push(Push::Send { channel, data }),
        }
    }

    fn send_close(&self, channel: u32) -> Result<()> {
        match self.role {
            Role::Initiator => self.notify(Request::Close { channel }).map(|_| ()),
            Role::Broker => self.push(Push::Close { channel }),
        }
    }

    fn end_session_frame(&self) -> Frame {
        match self.role {
            Role::Initiator => Frame::Request {
                nonce: self.correlator.next_nonce(),
                request: Request::EndSession,
            },
            Role::Broker => Frame::Push(Push::EndSession),
        }
    }

    /// Close `channel` from this side
    ///
    /// The remote half is told with a CLOSE. The removed target is returned
    /// and a local bridge in it is not notified here.
    pub fn close_channel(&self, channel: u32) -> Option<ChannelTarget> {
        let target = self.channels.remove(channel)?;

        tracing::debug!(endpoint = self.id, channel = channel, "Channel closed locally");

        if let ChannelTarget::Relay {
            peer,
            channel: peer_channel,
        } = &target
        {
            peer.forward_close(*peer_channel);
        }
        let _ = self.send_close(channel);
        Some(target)
    }

    /// Drop a relayed channel whose peer half went away
    pub(crate) fn forward_close(&self, channel: u32) {
        match self.channels.remove(channel) {
            None | Some(ChannelTarget::Pending) => {}
            Some(_) => {
                tracing::trace!(endpoint = self.id, channel = channel, "Forwarding close");
                let _ = self.send_close(channel);
            }
        }
    }

    fn deliver_data(&self, channel: u32, data: Bytes) {
        match self.channels.get(channel) {
            Some(ChannelTarget::Local(bridge)) => bridge.on_data(data, channel),
            Some(ChannelTarget::Relay {
                peer,
                channel: peer_channel,
            }) => {
                let _ = peer.send_data(peer_channel, data);
            }
            Some(ChannelTarget::Pending) => {}
            None if self.role == Role::Initiator => {
                // Data for a channel nobody holds: close it so the remote
                // half stops sending.
                tracing::trace!(endpoint = self.id, channel = channel, "Data for dead channel");
                let _ = self.send_close(channel);
            }
            None => {
                tracing::trace!(endpoint = self.id, channel = channel, "Dropping data for unknown channel");
            }
        }
    }

    fn deliver_close(&self, channel: u32) {
        match self.channels.remove(channel) {
            Some(ChannelTarget::Local(bridge)) => {
                tracing::debug!(endpoint = self.id, channel = channel, "Channel closed by peer");
                bridge.on_closed(channel);
            }
            Some(ChannelTarget::Relay {
                peer,
                channel: peer_channel,
            }) => peer.forward_close(peer_channel),
            Some(ChannelTarget::Pending) | None => {
                tracing::trace!(endpoint = self.id, channel = channel, "Close for unknown channel");
            }
        }
    }

    fn dispatch(self: &Arc<Self>, handler: &dyn FrameHandler, frame: Frame) {
        tracing::trace!(endpoint = self.id, kind = ?frame.kind(), "Frame received");

        match frame {
            Frame::Response { nonce, reply } => {
                self.correlator.complete(nonce, reply);
            }
            Frame::Request {
                request: Request::Send { channel, data },
                ..
            }
            | Frame::Push(Push::Send { channel, data }) => self.deliver_data(channel, data),
            Frame::Request {
                request: Request::Close { channel },
                ..
            }
            | Frame::Push(Push::Close { channel }) => self.deliver_close(channel),
            Frame::Request {
                request: Request::EndSession,
                ..
            }
            | Frame::Push(Push::EndSession) => {
                tracing::debug!(endpoint = self.id, "Peer ended session");
                self.close();
            }
            other => handler.on_control(self, other),
        }
    }

    /// Tear the endpoint down
    ///
    /// Idempotent and safe to call from any thread or from inside a
    /// callback.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::debug!(endpoint = self.id, role = ?self.role, "Endpoint closing");

        let hooks = std::mem::take(&mut *self.hooks.lock().unwrap_or_else(|e| e.into_inner()));
        for hook in hooks {
            hook();
        }

        for (channel, target) in self.channels.drain() {
            match target {
                ChannelTarget::Local(bridge) => bridge.on_closed(channel),
                ChannelTarget::Relay {
                    peer,
                    channel: peer_channel,
                } => peer.forward_close(peer_channel),
                ChannelTarget::Pending => {}
            }
        }

        self.correlator.clear();

        let _ = self.write_frame(&self.end_session_frame());
        self.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop<R>(
    endpoint: Arc<Endpoint>,
    mut reader: R,
    mut decoder: FrameDecoder,
    handler: Arc<dyn FrameHandler>,
    mut shutdown: watch::Receiver<bool>,
    read_buffer_size: usize,
) where
    R: AsyncRead + Unpin,
{
    'session: loop {
        loop {
            if endpoint.is_closed() {
                break 'session;
            }
            match decoder.decode() {
                Ok(Some(frame)) => {
                    endpoint.counters.frame_received();
                    endpoint.dispatch(handler.as_ref(), frame);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(endpoint = endpoint.id, error = %e, "Framing error");
                    break 'session;
                }
            }
        }

        decoder.buffer_mut().reserve(read_buffer_size);

        tokio::select! {
            _ = shutdown.changed() => break,
            result = reader.read_buf(decoder.buffer_mut()) => match result {
                Ok(0) => {
                    match decoder.finish() {
                        Ok(()) => tracing::debug!(endpoint = endpoint.id, "Peer closed connection"),
                        Err(e) => tracing::warn!(endpoint = endpoint.id, error = %e, "Connection ended mid-frame"),
                    }
                    break;
                }
                Ok(n) => endpoint.counters.add_received(n),
                Err(e) => {
                    tracing::debug!(endpoint = endpoint.id, error = %e, "Read failed");
                    break;
                }
            }
        }
    }

    endpoint.close();
}

async fn write_loop<W>(
    endpoint: Arc<Endpoint>,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
    close_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    // Frame cut short by shutdown; it is finished before anything else
    let mut partial: Option<Bytes> = None;

    loop {
        let mut frame = tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let len = frame.len();
        let interrupted = tokio::select! {
            result = writer.write_all_buf(&mut frame) => match result {
                Ok(()) => {
                    endpoint.counters.add_sent(len);
                    false
                }
                Err(e) => {
                    tracing::debug!(endpoint = endpoint.id, error = %e, "Write failed");
                    endpoint.close();
                    return;
                }
            },
            _ = shutdown.changed() => true,
        };

        if interrupted {
            partial = Some(frame);
            break;
        }
    }

    let flush = async {
        if let Some(mut frame) = partial {
            let len = frame.len();
            writer.write_all_buf(&mut frame).await?;
            endpoint.counters.add_sent(len);
        }
        while let Ok(mut frame) = outbound.try_recv() {
            let len = frame.len();
            writer.write_all_buf(&mut frame).await?;
            endpoint.counters.add_sent(len);
        }
        writer.flush().await?;
        writer.shutdown().await
    };

    match tokio::time::timeout(close_timeout, flush).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(endpoint = endpoint.id, error = %e, "Final flush failed"),
        Err(_) => {
            tracing::debug!(endpoint = endpoint.id, "Peer stopped reading; queued frames dropped")
        }
    }
    tracing::debug!(endpoint = endpoint.id, "Endpoint closed");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::DuplexStream;

    use super::*;
    use crate::endpoint::channel::ChannelHandle;
    use crate::endpoint::handler::LocalBridge;
    use crate::error::ProtocolError;
    use crate::registry::ServiceId;

    /// Records control frames handed to it
    #[derive(Default)]
    struct Recorder(Mutex<Vec<Frame>>);

    impl FrameHandler for Recorder {
        fn on_control(&self, _endpoint: &Arc<Endpoint>, frame: Frame) {
            self.0.lock().unwrap().push(frame);
        }
    }

    /// Bridge that reports what happens to it over a channel
    struct TestBridge(mpsc::UnboundedSender<String>);

    impl LocalBridge for TestBridge {
        fn on_assigned(&self, handle: ChannelHandle) {
            let _ = self.0.send(format!("assigned {}", handle.id()));
        }
        fn on_data(&self, data: Bytes, channel: u32) {
            let text = String::from_utf8_lossy(&data).into_owned();
            let _ = self.0.send(format!("data {} {}", channel, text));
        }
        fn on_closed(&self, channel: u32) {
            let _ = self.0.send(format!("closed {}", channel));
        }
    }

    fn spawn_endpoint(role: Role, handler: Arc<dyn FrameHandler>) -> (Arc<Endpoint>, DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let endpoint = Endpoint::spawn(local, 1, role, None, EndpointConfig::default(), handler);
        (endpoint, remote)
    }

    fn spawn_with(role: Role, config: EndpointConfig, pipe: usize) -> (Arc<Endpoint>, DuplexStream) {
        let (local, remote) = tokio::io::duplex(pipe);
        let handler = Arc::new(Recorder::default());
        let endpoint = Endpoint::spawn(local, 1, role, None, config, handler);
        (endpoint, remote)
    }

    /// Read the next frame the endpoint wrote, as seen by its peer
    async fn next_frame(io: &mut DuplexStream, decoder: &mut FrameDecoder) -> Option<Frame> {
        let read = async {
            loop {
                if let Some(frame) = decoder.decode().unwrap() {
                    return Some(frame);
                }
                decoder.buffer_mut().reserve(1024);
                if io.read_buf(decoder.buffer_mut()).await.unwrap() == 0 {
                    return None;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), read)
            .await
            .expect("timed out waiting for a frame")
    }

    async fn write(io: &mut DuplexStream, frame: Frame) {
        io.write_all(&encode(&frame)).await.unwrap();
    }

    #[tokio::test]
    async fn test_control_frames_reach_handler() {
        let recorder = Arc::new(Recorder::default());
        let (endpoint, mut remote) = spawn_endpoint(Role::Broker, recorder.clone());

        let register = Frame::Request {
            nonce: 0,
            request: Request::Register { name: "svc".into() },
        };
        write(&mut remote, register.clone()).await;
        write(
            &mut remote,
            Frame::Request {
                nonce: 1,
                request: Request::EndSession,
            },
        )
        .await;

        endpoint.closed().await;
        assert_eq!(*recorder.0.lock().unwrap(), vec![register]);

        // END_SESSION is answered with END_SESSION before the socket closes
        let mut decoder = FrameDecoder::new(Direction::FromBroker);
        assert_eq!(
            next_frame(&mut remote, &mut decoder).await,
            Some(Frame::Push(Push::EndSession))
        );
        assert_eq!(next_frame(&mut remote, &mut decoder).await, None);
    }

    #[tokio::test]
    async fn test_replies_routed_by_nonce() {
        let (endpoint, mut remote) = spawn_endpoint(Role::Initiator, Arc::new(Recorder::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        for tag in ["first", "second"] {
            let tx = tx.clone();
            endpoint
                .request(
                    Request::Lookup { query: tag.into() },
                    Box::new(move |_, reply| {
                        let _ = tx.send((tag, reply));
                    }),
                )
                .unwrap();
        }

        let mut decoder = FrameDecoder::new(Direction::ToBroker);
        let mut nonces = Vec::new();
        for _ in 0..2 {
            match next_frame(&mut remote, &mut decoder).await {
                Some(Frame::Request { nonce, .. }) => nonces.push(nonce),
                other => panic!("unexpected frame: {:?}", other),
            }
        }
        assert_eq!(nonces, vec![0, 1]);

        // Answer in reverse order
        write(
            &mut remote,
            Frame::Response {
                nonce: 1,
                reply: Reply::LookupResult {
                    hosts: vec![ServiceId::new("second", 0)],
                },
            },
        )
        .await;
        write(
            &mut remote,
            Frame::Response {
                nonce: 0,
                reply: Reply::LookupResult { hosts: vec![] },
            },
        )
        .await;

        let (tag, reply) = rx.recv().await.unwrap();
        assert_eq!(tag, "second");
        assert_eq!(
            reply,
            Reply::LookupResult {
                hosts: vec![ServiceId::new("second", 0)]
            }
        );
        let (tag, reply) = rx.recv().await.unwrap();
        assert_eq!(tag, "first");
        assert_eq!(reply, Reply::LookupResult { hosts: vec![] });
        assert_eq!(endpoint.correlator().pending(), 0);
    }

    #[tokio::test]
    async fn test_data_for_dead_channel_is_closed() {
        let (_endpoint, mut remote) = spawn_endpoint(Role::Initiator, Arc::new(Recorder::default()));

        write(
            &mut remote,
            Frame::Push(Push::Send {
                channel: 9,
                data: Bytes::from_static(b"late"),
            }),
        )
        .await;

        let mut decoder = FrameDecoder::new(Direction::ToBroker);
        match next_frame(&mut remote, &mut decoder).await {
            Some(Frame::Request {
                request: Request::Close { channel },
                ..
            }) => assert_eq!(channel, 9),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_for_unknown_channel_is_not_echoed() {
        let (endpoint, mut remote) = spawn_endpoint(Role::Initiator, Arc::new(Recorder::default()));

        write(&mut remote, Frame::Push(Push::Close { channel: 4 })).await;
        write(&mut remote, Frame::Push(Push::EndSession)).await;
        endpoint.closed().await;

        // Only our own END_SESSION comes back
        let mut decoder = FrameDecoder::new(Direction::ToBroker);
        match next_frame(&mut remote, &mut decoder).await {
            Some(Frame::Request {
                request: Request::EndSession,
                ..
            }) => {}
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_bridge_receives_data_and_close() {
        let (endpoint, mut remote) = spawn_endpoint(Role::Initiator, Arc::new(Recorder::default()));
        let (tx, mut events) = mpsc::unbounded_channel();

        endpoint
            .channels()
            .insert(3, ChannelTarget::Local(Arc::new(TestBridge(tx))));

        write(
            &mut remote,
            Frame::Push(Push::Send {
                channel: 3,
                data: Bytes::from_static(b"hello"),
            }),
        )
        .await;
        write(&mut remote, Frame::Push(Push::Close { channel: 3 })).await;

        assert_eq!(events.recv().await.unwrap(), "data 3 hello");
        assert_eq!(events.recv().await.unwrap(), "closed 3");
        assert!(endpoint.channels().is_empty());
        assert!(!endpoint.is_closed());
    }

    #[tokio::test]
    async fn test_relay_forwards_data_and_close() {
        let (a, mut remote_a) = spawn_endpoint(Role::Broker, Arc::new(Recorder::default()));
        let (b, mut remote_b) = spawn_endpoint(Role::Broker, Arc::new(Recorder::default()));

        a.channels().insert(
            3,
            ChannelTarget::Relay {
                peer: Arc::clone(&b),
                channel: 7,
            },
        );
        b.channels().insert(
            7,
            ChannelTarget::Relay {
                peer: Arc::clone(&a),
                channel: 3,
            },
        );

        write(
            &mut remote_a,
            Frame::Request {
                nonce: 0,
                request: Request::Send {
                    channel: 3,
                    data: Bytes::from_static(b"payload"),
                },
            },
        )
        .await;

        let mut decoder_a = FrameDecoder::new(Direction::FromBroker);
        let mut decoder_b = FrameDecoder::new(Direction::FromBroker);
        assert_eq!(
            next_frame(&mut remote_b, &mut decoder_b).await,
            Some(Frame::Push(Push::Send {
                channel: 7,
                data: Bytes::from_static(b"payload"),
            }))
        );

        write(
            &mut remote_b,
            Frame::Request {
                nonce: 0,
                request: Request::Close { channel: 7 },
            },
        )
        .await;
        assert_eq!(
            next_frame(&mut remote_a, &mut decoder_a).await,
            Some(Frame::Push(Push::Close { channel: 3 }))
        );
        assert!(a.channels().is_empty());
        assert!(b.channels().is_empty());
    }

    #[tokio::test]
    async fn test_close_cascades_once() {
        let (a, _remote_a) = spawn_endpoint(Role::Broker, Arc::new(Recorder::default()));
        let (b, mut remote_b) = spawn_endpoint(Role::Broker, Arc::new(Recorder::default()));
        let (tx, mut events) = mpsc::unbounded_channel();

        a.channels().insert(
            1,
            ChannelTarget::Relay {
                peer: Arc::clone(&b),
                channel: 5,
            },
        );
        b.channels().insert(
            5,
            ChannelTarget::Relay {
                peer: Arc::clone(&a),
                channel: 1,
            },
        );
        a.channels()
            .insert(2, ChannelTarget::Local(Arc::new(TestBridge(tx.clone()))));

        let hook_tx = tx.clone();
        a.on_close(move || {
            let _ = hook_tx.send("hook".to_string());
        });

        a.close();
        a.close();

        assert_eq!(events.recv().await.unwrap(), "hook");
        assert_eq!(events.recv().await.unwrap(), "closed 2");
        assert!(a.is_closed());
        assert!(!b.is_closed());
        assert!(b.channels().is_empty());

        let mut decoder_b = FrameDecoder::new(Direction::FromBroker);
        assert_eq!(
            next_frame(&mut remote_b, &mut decoder_b).await,
            Some(Frame::Push(Push::Close { channel: 5 }))
        );

        // Hooks added after teardown run straight away
        let late_tx = tx.clone();
        a.on_close(move || {
            let _ = late_tx.send("late".to_string());
        });
        assert_eq!(events.recv().await.unwrap(), "late");

        assert!(matches!(
            a.enqueue(Frame::Push(Push::EndSession)),
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_framing_error_closes_endpoint() {
        let (endpoint, mut remote) = spawn_endpoint(Role::Broker, Arc::new(Recorder::default()));

        remote.write_all(&[42]).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), endpoint.closed())
            .await
            .unwrap();

        assert!(endpoint.is_closed());
        // Decoding the same byte on our side fails the same way
        let mut decoder = FrameDecoder::new(Direction::ToBroker);
        decoder.extend(&[42]);
        assert_eq!(decoder.decode(), Err(ProtocolError::UnknownKind(42)));
    }

    #[tokio::test]
    async fn test_stats_count_frames() {
        let (endpoint, mut remote) = spawn_endpoint(Role::Initiator, Arc::new(Recorder::default()));

        endpoint.notify(Request::Close { channel: 1 }).unwrap();
        let mut decoder = FrameDecoder::new(Direction::ToBroker);
        next_frame(&mut remote, &mut decoder).await;

        let stats = endpoint.stats();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.open_channels, 0);
        assert_eq!(stats.pending_requests, 0);
    }

    #[tokio::test]
    async fn test_close_gives_up_on_stalled_peer() {
        let config = EndpointConfig {
            close_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        // The far side never reads, so the pipe fills after 64 bytes
        let (endpoint, mut remote) = spawn_with(Role::Initiator, config, 64);

        endpoint
            .send_data(5, Bytes::from(vec![7u8; 4096]))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        endpoint.close();

        let released = async {
            while Arc::strong_count(&endpoint) > 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), released)
            .await
            .expect("endpoint tasks still running after close");

        // Socket was dropped: the peer drains what fit and then sees EOF
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), remote.read_to_end(&mut rest))
            .await
            .expect("socket still open")
            .unwrap();
        assert!(rest.len() < 4096);
    }

    #[tokio::test]
    async fn test_large_send_is_split_to_field_cap() {
        let config = EndpointConfig {
            max_field_size: 8,
            ..Default::default()
        };
        let (endpoint, mut remote) = spawn_with(Role::Initiator, config, 64 * 1024);

        endpoint
            .send_data(3, Bytes::from_static(b"abcdefghijklmnopqrst"))
            .unwrap();

        let mut decoder = FrameDecoder::with_max_field_size(Direction::ToBroker, 8);
        let mut received = Vec::new();
        let mut sizes = Vec::new();
        while received.len() < 20 {
            match next_frame(&mut remote, &mut decoder).await {
                Some(Frame::Request {
                    request: Request::Send { channel, data },
                    ..
                }) => {
                    assert_eq!(channel, 3);
                    sizes.push(data.len());
                    received.extend_from_slice(&data);
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }

        assert_eq!(sizes, vec![8, 8, 4]);
        assert_eq!(received, b"abcdefghijklmnopqrst");
        assert!(!endpoint.is_closed());
    }

    #[tokio::test]
    async fn test_oversized_field_is_refused() {
        let config = EndpointConfig {
            max_field_size: 8,
            ..Default::default()
        };
        let (endpoint, mut remote) = spawn_with(Role::Initiator, config, 64 * 1024);

        let result = endpoint.request(
            Request::Register {
                name: "much-too-long".into(),
            },
            Box::new(|_, _| {}),
        );
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::FieldTooLarge { size: 13, max: 8 }))
        ));
        assert_eq!(endpoint.correlator().pending(), 0);
        assert!(!endpoint.is_closed());

        // Nothing was written; the next frame out is the one after
        endpoint.notify(Request::Close { channel: 1 }).unwrap();
        let mut decoder = FrameDecoder::new(Direction::ToBroker);
        match next_frame(&mut remote, &mut decoder).await {
            Some(Frame::Request {
                request: Request::Close { channel },
                ..
            }) => assert_eq!(channel, 1),
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}
