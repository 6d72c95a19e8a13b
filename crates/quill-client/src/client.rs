//! Async MQTT client implementation using tokio.
//!
//! Split architecture: `AsyncClient` (cloneable handle) + `EventLoop`
//! (owns the socket and all connection state).
//!
//! Every acknowledged operation resolves when its acknowledgement arrives:
//! a QoS 1 publish completes on PUBACK, QoS 2 on PUBCOMP, subscribe on
//! SUBACK, unsubscribe on UNSUBACK. QoS 0 publishes complete once written.
//!
//! ```ignore
//! let (client, mut eventloop) = AsyncClient::new(config, 10);
//!
//! let mut sensors = client.subscribe_stream("sensors/#", QoS::AtLeastOnce).await?;
//! tokio::spawn(async move {
//!     while let Some(msg) = sensors.recv().await {
//!         println!("{}: {:?}", msg.topic, msg.payload);
//!     }
//! });
//!
//! // Must poll the eventloop to drive I/O
//! while let Ok(_) = eventloop.poll().await {}
//! ```

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use quill_core::packet::{
    decode_packet, encode_packet, reason_code, Ack, Auth, AuthProperties, ConnAck,
    ConnAckProperties, Connect, ConnectProperties, Disconnect, DisconnectProperties, Packet,
    Publish, PublishProperties, QoS, SubAck, Subscribe, Subscription, SubscriptionOptions,
    UnsubAck, Unsubscribe,
};
use quill_core::topic;

use crate::config::{ClientConfig, ReconnectMode, Transport};
use crate::dispatch::Dispatcher;
pub use crate::dispatch::{Message, MessageStream};
use crate::error::{ClientError, Result};
use crate::packet_id::PacketIdAllocator;
use crate::session::Session;
use crate::tls::build_client_config;

const DEFAULT_BUFFER_SIZE: usize = 8192;
const DEFAULT_STREAM_CAPACITY: usize = 100;

/// Wrapper enum for async streams (plain TCP or TLS).
enum AsyncStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    #[cfg(test)]
    Mem(tokio::io::DuplexStream),
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            AsyncStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(test)]
            AsyncStream::Mem(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            AsyncStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            AsyncStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(test)]
            AsyncStream::Mem(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Plain(s) => Pin::new(s).poll_flush(cx),
            AsyncStream::Tls(s) => Pin::new(s).poll_flush(cx),
            #[cfg(test)]
            AsyncStream::Mem(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            AsyncStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(test)]
            AsyncStream::Mem(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Events yielded by the EventLoop.
///
/// Operation completion is reported through the futures returned by the
/// `AsyncClient` methods; events cover connection lifecycle and messages
/// that no subscription stream claimed.
#[derive(Debug, Clone)]
pub enum Event {
    /// Connected to broker.
    Connected { session_present: bool },
    /// Received a message no subscription stream matched.
    Message(Message),
    /// Disconnected from broker.
    Disconnected,
    /// Attempting to reconnect (only with a reconnect policy configured).
    Reconnecting {
        /// Current reconnection attempt number (1-based).
        attempt: u32,
        /// Delay before the next attempt.
        delay: Duration,
    },
}

/// Commands sent from AsyncClient to EventLoop.
enum Command {
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        properties: Option<PublishProperties>,
        resp: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        subscriptions: Vec<(String, SubscriptionOptions)>,
        route: Option<mpsc::Sender<Message>>,
        resp: oneshot::Sender<Result<Vec<u8>>>,
    },
    Unsubscribe {
        filters: Vec<String>,
        resp: oneshot::Sender<Result<Vec<u8>>>,
    },
    Reauthenticate {
        properties: AuthProperties,
        resp: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        session_expiry: Option<u32>,
        send_will: bool,
        resp: oneshot::Sender<Result<()>>,
    },
}

/// Async MQTT client handle.
///
/// This is the user-facing API. It's `Clone` and can be shared across tasks.
/// Commands are sent to the `EventLoop` via a channel.
#[derive(Clone)]
pub struct AsyncClient {
    tx: mpsc::Sender<Command>,
}

impl AsyncClient {
    /// Create a new client and eventloop pair.
    ///
    /// `cap` is the command channel capacity (10 is usually fine).
    pub fn new(config: ClientConfig, cap: usize) -> (Self, EventLoop) {
        let (tx, rx) = mpsc::channel(cap);
        let client = Self { tx };
        let eventloop = EventLoop::new(config, rx);
        (client, eventloop)
    }

    /// Publish a message.
    ///
    /// Completes when the message is acknowledged: immediately after the
    /// write for QoS 0, on PUBACK for QoS 1, on PUBCOMP for QoS 2.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        self.publish_with_properties(topic, payload, qos, retain, None)
            .await
    }

    /// Publish a message with MQTT 5.0 properties.
    pub async fn publish_with_properties(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
        properties: Option<PublishProperties>,
    ) -> Result<()> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(Command::Publish {
                topic: topic.to_string(),
                payload: payload.into(),
                qos,
                retain,
                properties,
                resp: resp_tx,
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;

        resp_rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Subscribe and get a dedicated message stream.
    ///
    /// Completes on SUBACK. Each subscription gets its own stream, so
    /// different topics can be handled in different tasks without manual
    /// topic matching.
    pub async fn subscribe_stream(&self, filter: &str, qos: QoS) -> Result<MessageStream> {
        let options = SubscriptionOptions {
            qos,
            ..Default::default()
        };
        let (msg_tx, msg_rx) = mpsc::channel(DEFAULT_STREAM_CAPACITY);
        let codes = self
            .send_subscribe(vec![(filter.to_string(), options)], Some(msg_tx))
            .await?;

        if let Some(&code) = codes.first() {
            if code >= 0x80 {
                return Err(ClientError::SubscribeFailed { code });
            }
        }

        Ok(MessageStream {
            rx: msg_rx,
            filter: filter.to_string(),
        })
    }

    /// Subscribe to topics (raw API). Completes on SUBACK with the broker's
    /// per-filter reason codes (granted QoS or failure).
    ///
    /// For most use cases, prefer `subscribe_stream()`; messages for raw
    /// subscriptions surface as `Event::Message` from the eventloop.
    pub async fn subscribe(&self, topics: &[(&str, QoS)]) -> Result<Vec<u8>> {
        let subscriptions = topics
            .iter()
            .map(|(filter, qos)| {
                (
                    filter.to_string(),
                    SubscriptionOptions {
                        qos: *qos,
                        ..Default::default()
                    },
                )
            })
            .collect();
        self.send_subscribe(subscriptions, None).await
    }

    /// Subscribe with full MQTT 5.0 subscription options.
    pub async fn subscribe_with_options(
        &self,
        topics: &[(&str, SubscriptionOptions)],
    ) -> Result<Vec<u8>> {
        let subscriptions = topics
            .iter()
            .map(|(filter, options)| (filter.to_string(), *options))
            .collect();
        self.send_subscribe(subscriptions, None).await
    }

    async fn send_subscribe(
        &self,
        subscriptions: Vec<(String, SubscriptionOptions)>,
        route: Option<mpsc::Sender<Message>>,
    ) -> Result<Vec<u8>> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(Command::Subscribe {
                subscriptions,
                route,
                resp: resp_tx,
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;

        resp_rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Unsubscribe from topics. Completes on UNSUBACK; the returned reason
    /// codes are empty on MQTT 3.1.1.
    pub async fn unsubscribe(&self, topics: &[&str]) -> Result<Vec<u8>> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(Command::Unsubscribe {
                filters: topics.iter().map(|t| t.to_string()).collect(),
                resp: resp_tx,
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;

        resp_rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Re-run authentication on the live connection (MQTT 5.0).
    ///
    /// Sends an AUTH packet with the Re-authenticate reason code and
    /// completes when the broker answers, or fails with `Timeout`.
    pub async fn reauthenticate(
        &self,
        properties: AuthProperties,
        timeout: Duration,
    ) -> Result<()> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(Command::Reauthenticate {
                properties,
                resp: resp_tx,
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;

        match tokio::time::timeout(timeout, resp_rx).await {
            Ok(result) => result.map_err(|_| ClientError::ConnectionClosed)?,
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Disconnect from the broker. No reconnect is attempted afterwards.
    pub async fn disconnect(&self) -> Result<()> {
        self.send_disconnect(None, false).await
    }

    /// Disconnect, overriding the session expiry interval (MQTT 5.0).
    pub async fn disconnect_with_expiry(&self, expiry: Duration) -> Result<()> {
        self.send_disconnect(
            Some(expiry.as_secs().min(u32::MAX as u64) as u32),
            false,
        )
        .await
    }

    /// Disconnect so that the broker still publishes the will message.
    ///
    /// On MQTT 5.0 this sends DISCONNECT with the Disconnect-with-Will
    /// reason code. MQTT 3.1.1 has no such code; the connection closes
    /// without a DISCONNECT, which makes the broker publish the will.
    pub async fn disconnect_with_will(&self) -> Result<()> {
        self.send_disconnect(None, true).await
    }

    async fn send_disconnect(&self, session_expiry: Option<u32>, send_will: bool) -> Result<()> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(Command::Disconnect {
                session_expiry,
                send_will,
                resp: resp_tx,
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;

        resp_rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }
}

/// Limits and capabilities advertised by the broker in CONNACK.
#[derive(Debug, Clone)]
pub struct BrokerLimits {
    /// Highest QoS the broker accepts.
    pub maximum_qos: QoS,
    /// Whether the broker stores retained messages.
    pub retain_available: bool,
    /// Largest packet the broker accepts, in bytes.
    pub maximum_packet_size: Option<u32>,
    /// Maximum concurrent QoS 1/2 deliveries the broker allows.
    pub receive_maximum: Option<u16>,
    /// Keep-alive the broker requires instead of the requested one.
    pub server_keep_alive: Option<u16>,
    /// Client identifier assigned by the broker when none was supplied.
    pub assigned_client_id: Option<String>,
}

impl Default for BrokerLimits {
    fn default() -> Self {
        Self {
            maximum_qos: QoS::ExactlyOnce,
            retain_available: true,
            maximum_packet_size: None,
            receive_maximum: None,
            server_keep_alive: None,
            assigned_client_id: None,
        }
    }
}

impl BrokerLimits {
    fn from_connack(properties: Option<&ConnAckProperties>) -> Self {
        let mut limits = Self::default();
        let Some(props) = properties else {
            return limits;
        };
        if let Some(max_qos) = props.maximum_qos {
            limits.maximum_qos = QoS::try_from(max_qos).unwrap_or(QoS::ExactlyOnce);
        }
        if let Some(retain) = props.retain_available {
            limits.retain_available = retain;
        }
        limits.maximum_packet_size = props.maximum_packet_size;
        limits.receive_maximum = props.receive_maximum;
        limits.server_keep_alive = props.server_keep_alive;
        limits.assigned_client_id = props.assigned_client_identifier.clone();
        limits
    }
}

struct PendingSubscribe {
    filters: Vec<String>,
    resp: oneshot::Sender<Result<Vec<u8>>>,
}

struct PendingUnsubscribe {
    resp: oneshot::Sender<Result<Vec<u8>>>,
}

/// The event loop that drives MQTT I/O.
///
/// You must call `poll()` repeatedly to process packets.
pub struct EventLoop {
    config: ClientConfig,
    rx: mpsc::Receiver<Command>,
    stream: Option<AsyncStream>,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
    session: Session,
    packet_ids: PacketIdAllocator,
    dispatcher: Dispatcher,
    /// Limits from the current connection's CONNACK.
    limits: BrokerLimits,
    /// Effective keep-alive (server override applied); zero disables pings.
    keep_alive: Duration,
    /// In-flight publish completions, keyed by packet ID.
    pending_pub: HashMap<u16, oneshot::Sender<Result<()>>>,
    pending_sub: HashMap<u16, PendingSubscribe>,
    pending_unsub: HashMap<u16, PendingUnsubscribe>,
    /// Singleton AUTH exchange slot.
    pending_auth: Option<oneshot::Sender<Result<()>>>,
    last_write: Instant,
    pending_pings: u8,
    connected: bool,
    /// Set by a caller-initiated disconnect; suppresses reconnection.
    shutting_down: bool,
    /// Whether a connection was ever established; an unplanned loss after
    /// that never falls back to the initial-connect path.
    ever_connected: bool,
    /// Cached TLS config for reconnection.
    tls_connector: Option<Arc<TlsConnector>>,
    reconnect_attempt: u32,
    reconnect_delay: Duration,
    should_reconnect: bool,
}

impl EventLoop {
    fn new(config: ClientConfig, rx: mpsc::Receiver<Command>) -> Self {
        // Pre-build TLS connector if the transport needs it
        let tls_connector = if config.transport.uses_tls() {
            match build_client_config(&config.tls) {
                Ok(tls_config) => Some(Arc::new(TlsConnector::from(Arc::new(tls_config)))),
                Err(e) => {
                    log::warn!("Failed to build TLS config: {}, will retry on connect", e);
                    None
                }
            }
        } else {
            None
        };

        let keep_alive = Duration::from_secs(config.keep_alive as u64);
        let initial_delay = config.reconnect.initial_delay();

        Self {
            config,
            rx,
            stream: None,
            read_buf: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            write_buf: Vec::with_capacity(DEFAULT_BUFFER_SIZE),
            session: Session::new(),
            packet_ids: PacketIdAllocator::new(),
            dispatcher: Dispatcher::new(),
            limits: BrokerLimits::default(),
            keep_alive,
            pending_pub: HashMap::new(),
            pending_sub: HashMap::new(),
            pending_unsub: HashMap::new(),
            pending_auth: None,
            last_write: Instant::now(),
            pending_pings: 0,
            connected: false,
            shutting_down: false,
            ever_connected: false,
            tls_connector,
            reconnect_attempt: 0,
            reconnect_delay: initial_delay,
            should_reconnect: false,
        }
    }

    /// Check if connected to broker.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Limits advertised by the broker on the current connection.
    pub fn broker_limits(&self) -> &BrokerLimits {
        &self.limits
    }

    /// Poll for the next event.
    ///
    /// This drives all I/O. You must call this in a loop. Messages matching
    /// a `subscribe_stream()` subscription are routed to their streams and
    /// won't appear as `Event::Message`.
    ///
    /// With a reconnect policy configured, an unexpected connection loss
    /// triggers reconnection attempts; `Reconnecting` is emitted before
    /// each delay.
    pub async fn poll(&mut self) -> Result<Event> {
        if self.stream.is_none() {
            if self.shutting_down {
                return Err(ClientError::ConnectionClosed);
            }

            if self.should_reconnect {
                self.reconnect_attempt += 1;
                let delay = self.reconnect_delay;
                tokio::time::sleep(delay).await;
                self.reconnect_delay = self.config.reconnect.next_delay(delay);

                return match self.connect().await {
                    Ok(session_present) => {
                        self.reconnect_attempt = 0;
                        self.reconnect_delay = self.config.reconnect.initial_delay();
                        self.should_reconnect = false;
                        Ok(Event::Connected { session_present })
                    }
                    Err(e) => {
                        log::warn!(
                            "Reconnect attempt {} failed: {}",
                            self.reconnect_attempt,
                            e
                        );
                        Ok(Event::Reconnecting {
                            attempt: self.reconnect_attempt,
                            delay: self.reconnect_delay,
                        })
                    }
                };
            }

            if self.ever_connected {
                // Unplanned loss with no reconnect policy: the caller
                // decides what happens next.
                return Err(ClientError::ConnectionClosed);
            }

            // Initial connection
            let session_present = self.connect().await?;
            self.reconnect_attempt = 0;
            self.reconnect_delay = self.config.reconnect.initial_delay();
            return Ok(Event::Connected { session_present });
        }

        loop {
            self.flush().await?;

            if let Some(event) = self.drain_incoming()? {
                return Ok(event);
            }

            let mut buf = [0u8; 4096];

            enum Action {
                Read(std::io::Result<usize>),
                Command(Option<Command>),
                Timeout,
            }

            let tick = self.tick_interval();
            let action = {
                let stream = match self.stream.as_mut() {
                    Some(stream) => stream,
                    None => return Ok(Event::Disconnected),
                };
                tokio::select! {
                    result = stream.read(&mut buf) => Action::Read(result),
                    cmd = self.rx.recv() => Action::Command(cmd),
                    _ = tokio::time::sleep(tick) => Action::Timeout,
                }
            };

            match action {
                Action::Read(result) => {
                    let n = match result {
                        Ok(n) => n,
                        Err(e) => {
                            self.handle_connection_loss();
                            return Err(ClientError::Io(e));
                        }
                    };
                    if n == 0 {
                        // Connection closed by peer
                        self.handle_connection_loss();
                        return Ok(Event::Disconnected);
                    }
                    self.read_buf.extend_from_slice(&buf[..n]);
                }
                Action::Command(cmd) => match cmd {
                    Some(cmd) => {
                        self.handle_command(cmd);
                        if self.shutting_down {
                            // Write out the DISCONNECT and close the
                            // transport; the broker's end is not waited on.
                            let flushed = self.flush().await;
                            self.handle_connection_loss();
                            flushed?;
                            return Ok(Event::Disconnected);
                        }
                    }
                    None => {
                        // All client handles dropped - clean disconnect
                        self.begin_disconnect(None, false);
                        self.flush().await?;
                        self.handle_connection_loss();
                        return Ok(Event::Disconnected);
                    }
                },
                Action::Timeout => {
                    if let Some(event) = self.on_tick()? {
                        return Ok(event);
                    }
                }
            }
        }
    }

    fn tick_interval(&self) -> Duration {
        let mut tick = self.config.retry_interval;
        if self.keep_alive > Duration::ZERO {
            tick = tick.min(self.keep_alive);
        }
        tick.max(Duration::from_millis(100))
    }

    fn on_tick(&mut self) -> Result<Option<Event>> {
        if !self.connected {
            return Ok(None);
        }

        // Redeliver overdue QoS 1/2 messages with DUP set.
        for packet in self.session.retry_packets(self.config.retry_interval) {
            log::debug!("retrying unacknowledged packet: {:?}", packet);
            encode_packet(&packet, self.config.protocol_version, &mut self.write_buf);
        }

        // Keep-alive: ping when the line has been idle for a full interval.
        if self.keep_alive > Duration::ZERO && self.last_write.elapsed() >= self.keep_alive {
            if self.pending_pings >= 2 {
                log::warn!("no PINGRESP from broker, dropping connection");
                self.handle_connection_loss();
                if self.should_reconnect {
                    return Ok(Some(Event::Disconnected));
                }
                return Err(ClientError::ConnectionClosed);
            }
            encode_packet(
                &Packet::PingReq,
                self.config.protocol_version,
                &mut self.write_buf,
            );
            self.pending_pings += 1;
        }

        Ok(None)
    }

    async fn flush(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        if let Some(stream) = &mut self.stream {
            stream
                .write_all(&self.write_buf)
                .await
                .map_err(ClientError::Io)?;
            self.write_buf.clear();
            self.last_write = Instant::now();
        }
        Ok(())
    }

    async fn connect(&mut self) -> Result<bool> {
        match self.config.transport {
            Transport::Tcp | Transport::Tls => {}
            Transport::WebSocket | Transport::WebSocketTls => {
                return Err(ClientError::Config(
                    "WebSocket framing is not provided by this client; \
                     supply an externally framed byte stream"
                        .to_string(),
                ));
            }
        }

        let address = (self.config.host.as_str(), self.config.port);
        let tcp_stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(address),
        )
        .await
        .map_err(|_| ClientError::ConnectionTimeout)?
        .map_err(ClientError::Io)?;

        tcp_stream.set_nodelay(true).map_err(ClientError::Io)?;

        let stream = if self.config.transport.uses_tls() {
            // Build TLS connector if not cached
            let connector = match &self.tls_connector {
                Some(c) => c.clone(),
                None => {
                    let tls_config = build_client_config(&self.config.tls)?;
                    let connector = Arc::new(TlsConnector::from(Arc::new(tls_config)));
                    self.tls_connector = Some(connector.clone());
                    connector
                }
            };

            // SNI hostname
            let hostname = self
                .config
                .tls
                .server_name
                .clone()
                .unwrap_or_else(|| self.config.host.clone());
            let server_name = ServerName::try_from(hostname.clone())
                .map_err(|_| ClientError::Tls(format!("Invalid server name: {}", hostname)))?;

            let tls_stream = tokio::time::timeout(
                self.config.connect_timeout,
                connector.connect(server_name, tcp_stream),
            )
            .await
            .map_err(|_| ClientError::ConnectionTimeout)?
            .map_err(|e| ClientError::Tls(e.to_string()))?;

            AsyncStream::Tls(Box::new(tls_stream))
        } else {
            AsyncStream::Plain(tcp_stream)
        };

        self.stream = Some(stream);
        self.handshake().await
    }

    /// Send CONNECT and wait for CONNACK on the installed stream.
    /// Returns the broker's session-present flag.
    async fn handshake(&mut self) -> Result<bool> {
        self.read_buf.clear();
        self.write_buf.clear();
        self.pending_pings = 0;

        self.send_connect().await?;
        let connack = match self.wait_connack().await {
            Ok(connack) => connack,
            Err(e) => {
                self.stream = None;
                return Err(e);
            }
        };

        if !connack.is_success() {
            self.stream = None;
            return Err(ClientError::ConnectionRefused {
                code: connack.reason_code,
            });
        }

        self.limits = BrokerLimits::from_connack(connack.properties.as_ref());
        self.keep_alive = Duration::from_secs(
            self.limits
                .server_keep_alive
                .unwrap_or(self.config.keep_alive) as u64,
        );
        self.connected = true;
        self.ever_connected = true;
        self.last_write = Instant::now();

        if connack.session_present && !self.config.clean_start {
            // Broker kept the session: re-send everything in flight, in
            // original order, with DUP set. Their identifiers stay reserved.
            for id in self.session.outbound_ids().collect::<Vec<_>>() {
                self.packet_ids.reserve(id);
            }
            for packet in self.session.resend_packets() {
                encode_packet(&packet, self.config.protocol_version, &mut self.write_buf);
            }
            self.flush().await?;
        } else {
            // Fresh session, whether requested or imposed by the broker:
            // nothing carries over, and old subscription streams end.
            self.session.clear();
            self.packet_ids.clear();
            self.dispatcher.clear();
        }

        Ok(connack.session_present)
    }

    async fn send_connect(&mut self) -> Result<()> {
        let properties = if self.config.protocol_version.is_v5() {
            let props = ConnectProperties {
                session_expiry_interval: self.config.session_expiry.interval_secs(),
                maximum_packet_size: (self.config.max_packet_size > 0)
                    .then_some(self.config.max_packet_size),
                user_properties: self.config.user_properties.clone(),
                ..Default::default()
            };
            (props != ConnectProperties::default()).then_some(props)
        } else {
            None
        };

        let connect = Connect {
            clean_start: self.config.clean_start,
            keep_alive: self.config.keep_alive,
            client_id: self.config.client_id.clone(),
            will: self.config.will.as_ref().map(|w| w.to_packet_will()),
            username: self.config.username.clone(),
            password: self.config.password.clone(),
            properties,
        };

        encode_packet(
            &Packet::Connect(connect),
            self.config.protocol_version,
            &mut self.write_buf,
        );
        self.flush().await
    }

    async fn wait_connack(&mut self) -> Result<ConnAck> {
        let version = self.config.protocol_version;
        let max_packet_size = self.config.max_packet_size;
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        let read_buf = &mut self.read_buf;

        let result = tokio::time::timeout(self.config.connack_timeout, async {
            loop {
                if let Some((packet, consumed)) =
                    decode_packet(read_buf, version, max_packet_size)?
                {
                    let _ = read_buf.split_to(consumed);
                    return match packet {
                        Packet::ConnAck(connack) => Ok(connack),
                        other => Err(ClientError::Protocol(
                            quill_core::ProtocolError::MalformedPacket(format!(
                                "expected CONNACK, got {other:?}"
                            )),
                        )),
                    };
                }

                let mut buf = [0u8; 1024];
                let n = stream.read(&mut buf).await.map_err(ClientError::Io)?;
                if n == 0 {
                    return Err(ClientError::ConnectionClosed);
                }
                read_buf.extend_from_slice(&buf[..n]);
            }
        })
        .await;

        result.map_err(|_| ClientError::ConnectionTimeout)?
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Publish {
                topic,
                payload,
                qos,
                retain,
                properties,
                resp,
            } => match self.do_publish(&topic, payload, qos, retain, properties) {
                Ok(Some(packet_id)) => {
                    self.pending_pub.insert(packet_id, resp);
                }
                Ok(None) => {
                    let _ = resp.send(Ok(()));
                }
                Err(e) => {
                    let _ = resp.send(Err(e));
                }
            },
            Command::Subscribe {
                subscriptions,
                route,
                resp,
            } => match self.do_subscribe(&subscriptions, route) {
                Ok(packet_id) => {
                    self.pending_sub.insert(
                        packet_id,
                        PendingSubscribe {
                            filters: subscriptions.into_iter().map(|(f, _)| f).collect(),
                            resp,
                        },
                    );
                }
                Err(e) => {
                    let _ = resp.send(Err(e));
                }
            },
            Command::Unsubscribe { filters, resp } => match self.do_unsubscribe(&filters) {
                Ok(packet_id) => {
                    self.pending_unsub
                        .insert(packet_id, PendingUnsubscribe { resp });
                }
                Err(e) => {
                    let _ = resp.send(Err(e));
                }
            },
            Command::Reauthenticate { properties, resp } => {
                match self.do_reauthenticate(properties) {
                    Ok(()) => self.pending_auth = Some(resp),
                    Err(e) => {
                        let _ = resp.send(Err(e));
                    }
                }
            }
            Command::Disconnect {
                session_expiry,
                send_will,
                resp,
            } => {
                self.begin_disconnect(session_expiry, send_will);
                let _ = resp.send(Ok(()));
            }
        }
    }

    fn do_publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        properties: Option<PublishProperties>,
    ) -> Result<Option<u16>> {
        if !self.connected {
            return Err(ClientError::NotConnected);
        }
        if !topic::is_valid_topic_name(topic) {
            return Err(ClientError::InvalidTopic(topic.to_string()));
        }
        if qos > self.limits.maximum_qos {
            return Err(ClientError::QosNotSupported(qos as u8));
        }
        if retain && !self.limits.retain_available {
            return Err(ClientError::RetainNotAvailable);
        }

        let packet_id = if qos != QoS::AtMostOnce {
            Some(
                self.packet_ids
                    .allocate()
                    .ok_or(ClientError::IdentifiersExhausted)?,
            )
        } else {
            None
        };

        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload,
            properties,
        };

        // Size guard before any bytes reach the wire.
        let mut encoded = Vec::new();
        encode_packet(
            &Packet::Publish(publish.clone()),
            self.config.protocol_version,
            &mut encoded,
        );
        if let Some(max) = self.limits.maximum_packet_size {
            if encoded.len() > max as usize {
                if let Some(id) = packet_id {
                    self.packet_ids.release(id);
                }
                return Err(ClientError::PacketTooLarge {
                    size: encoded.len(),
                    max,
                });
            }
        }

        self.write_buf.extend_from_slice(&encoded);
        if packet_id.is_some() {
            self.session.track(publish);
        }
        Ok(packet_id)
    }

    fn do_subscribe(
        &mut self,
        subscriptions: &[(String, SubscriptionOptions)],
        route: Option<mpsc::Sender<Message>>,
    ) -> Result<u16> {
        if !self.connected {
            return Err(ClientError::NotConnected);
        }
        for (filter, _) in subscriptions {
            if !topic::is_valid_topic_filter(filter) {
                return Err(ClientError::InvalidFilter(filter.clone()));
            }
        }

        let packet_id = self
            .packet_ids
            .allocate()
            .ok_or(ClientError::IdentifiersExhausted)?;

        let subscribe = Subscribe {
            packet_id,
            subscriptions: subscriptions
                .iter()
                .map(|(filter, options)| Subscription {
                    filter: filter.clone(),
                    options: *options,
                })
                .collect(),
            subscription_id: None,
            user_properties: Vec::new(),
        };

        for (filter, options) in subscriptions {
            self.session.add_subscription(filter.clone(), *options);
        }
        if let Some(tx) = route {
            for (filter, _) in subscriptions {
                self.dispatcher.register(filter.clone(), None, tx.clone());
            }
        }

        encode_packet(
            &Packet::Subscribe(subscribe),
            self.config.protocol_version,
            &mut self.write_buf,
        );
        Ok(packet_id)
    }

    fn do_unsubscribe(&mut self, filters: &[String]) -> Result<u16> {
        if !self.connected {
            return Err(ClientError::NotConnected);
        }

        let packet_id = self
            .packet_ids
            .allocate()
            .ok_or(ClientError::IdentifiersExhausted)?;

        let unsubscribe = Unsubscribe {
            packet_id,
            filters: filters.to_vec(),
            user_properties: Vec::new(),
        };

        for filter in filters {
            self.session.remove_subscription(filter);
            self.dispatcher.remove_filter(filter);
        }

        encode_packet(
            &Packet::Unsubscribe(unsubscribe),
            self.config.protocol_version,
            &mut self.write_buf,
        );
        Ok(packet_id)
    }

    fn do_reauthenticate(&mut self, properties: AuthProperties) -> Result<()> {
        if !self.config.protocol_version.is_v5() {
            return Err(ClientError::Config(
                "AUTH requires MQTT 5.0".to_string(),
            ));
        }
        if !self.connected {
            return Err(ClientError::NotConnected);
        }
        if self.pending_auth.is_some() {
            return Err(ClientError::Config(
                "a re-authentication exchange is already in progress".to_string(),
            ));
        }

        let auth = Auth {
            reason_code: reason_code::RE_AUTHENTICATE,
            properties: (properties != AuthProperties::default()).then_some(properties),
        };
        encode_packet(
            &Packet::Auth(auth),
            self.config.protocol_version,
            &mut self.write_buf,
        );
        Ok(())
    }

    fn begin_disconnect(&mut self, session_expiry: Option<u32>, send_will: bool) {
        if self.connected {
            if self.config.protocol_version.is_v5() {
                let reason = if send_will {
                    reason_code::DISCONNECT_WITH_WILL
                } else {
                    reason_code::NORMAL_DISCONNECTION
                };
                let disconnect = Disconnect {
                    reason_code: reason,
                    properties: session_expiry.map(|secs| DisconnectProperties {
                        session_expiry_interval: Some(secs),
                        ..Default::default()
                    }),
                };
                encode_packet(
                    &Packet::Disconnect(disconnect),
                    self.config.protocol_version,
                    &mut self.write_buf,
                );
            } else if !send_will {
                // 3.1.1 has no disconnect-with-will reason code; closing
                // the connection without DISCONNECT triggers the will.
                encode_packet(
                    &Packet::Disconnect(Disconnect::normal()),
                    self.config.protocol_version,
                    &mut self.write_buf,
                );
            }
        }
        self.connected = false;
        self.shutting_down = true;
    }

    /// Tear down the connection, failing every pending operation.
    /// Session state survives for resumption unless clean-start discards it.
    fn handle_connection_loss(&mut self) {
        self.connected = false;
        self.stream = None;
        self.read_buf.clear();
        self.write_buf.clear();
        self.pending_pings = 0;
        self.limits = BrokerLimits::default();

        for (_, tx) in self.pending_pub.drain() {
            let _ = tx.send(Err(ClientError::ConnectionClosed));
        }
        for (id, pending) in self.pending_sub.drain() {
            self.packet_ids.release(id);
            for filter in &pending.filters {
                self.dispatcher.remove_filter(filter);
            }
            let _ = pending.resp.send(Err(ClientError::ConnectionClosed));
        }
        for (id, pending) in self.pending_unsub.drain() {
            self.packet_ids.release(id);
            let _ = pending.resp.send(Err(ClientError::ConnectionClosed));
        }
        if let Some(tx) = self.pending_auth.take() {
            let _ = tx.send(Err(ClientError::ConnectionClosed));
        }

        if self.config.clean_start {
            self.session.clear();
            self.packet_ids.clear();
            // Subscriptions do not survive a fresh session; ending the
            // routes lets their streams observe the close.
            self.dispatcher.clear();
        }

        if !self.shutting_down && !matches!(self.config.reconnect, ReconnectMode::None) {
            self.should_reconnect = true;
        }
    }

    fn drain_incoming(&mut self) -> Result<Option<Event>> {
        loop {
            if self.read_buf.is_empty() {
                return Ok(None);
            }

            let decoded = decode_packet(
                &self.read_buf,
                self.config.protocol_version,
                self.config.max_packet_size,
            );
            let (packet, consumed) = match decoded {
                Ok(Some(hit)) => hit,
                Ok(None) => return Ok(None),
                Err(e) => {
                    // Malformed broker data is fatal to the connection.
                    self.handle_connection_loss();
                    return Err(ClientError::Protocol(e));
                }
            };
            let _ = self.read_buf.split_to(consumed);

            if let Some(event) = self.handle_packet(packet)? {
                return Ok(Some(event));
            }
        }
    }

    fn handle_packet(&mut self, packet: Packet) -> Result<Option<Event>> {
        match packet {
            Packet::Publish(publish) => Ok(self.handle_incoming_publish(publish)),
            Packet::PubAck(ack) => {
                if self.session.on_puback(ack.packet_id) {
                    self.packet_ids.release(ack.packet_id);
                    self.resolve_publish(ack.packet_id, ack.reason_code);
                }
                Ok(None)
            }
            Packet::PubRec(ack) => {
                if ack.reason_code >= 0x80 {
                    // Broker rejected the QoS 2 publish; the exchange ends here.
                    if self.session.abort(ack.packet_id) {
                        self.packet_ids.release(ack.packet_id);
                        if let Some(tx) = self.pending_pub.remove(&ack.packet_id) {
                            let _ = tx.send(Err(ClientError::PublishFailed {
                                code: ack.reason_code,
                            }));
                        }
                    }
                } else if self.session.on_pubrec(ack.packet_id) {
                    encode_packet(
                        &Packet::PubRel(Ack::new(ack.packet_id)),
                        self.config.protocol_version,
                        &mut self.write_buf,
                    );
                }
                Ok(None)
            }
            Packet::PubRel(ack) => {
                self.session.end_inbound_qos2(ack.packet_id);
                // PUBCOMP goes out even for an unknown ID.
                encode_packet(
                    &Packet::PubComp(Ack::new(ack.packet_id)),
                    self.config.protocol_version,
                    &mut self.write_buf,
                );
                Ok(None)
            }
            Packet::PubComp(ack) => {
                if self.session.on_pubcomp(ack.packet_id) {
                    self.packet_ids.release(ack.packet_id);
                    self.resolve_publish(ack.packet_id, ack.reason_code);
                }
                Ok(None)
            }
            Packet::SubAck(SubAck {
                packet_id,
                reason_codes,
                ..
            }) => {
                // Only an id we handed to a SUBSCRIBE may be released here;
                // anything else still belongs to an in-flight exchange.
                if let Some(pending) = self.pending_sub.remove(&packet_id) {
                    self.packet_ids.release(packet_id);
                    // Drop routes and records for filters the broker refused.
                    for (filter, &code) in pending.filters.iter().zip(&reason_codes) {
                        if code >= 0x80 {
                            self.dispatcher.remove_filter(filter);
                            self.session.remove_subscription(filter);
                        }
                    }
                    let _ = pending.resp.send(Ok(reason_codes));
                }
                Ok(None)
            }
            Packet::UnsubAck(UnsubAck {
                packet_id,
                reason_codes,
                ..
            }) => {
                if let Some(pending) = self.pending_unsub.remove(&packet_id) {
                    self.packet_ids.release(packet_id);
                    let _ = pending.resp.send(Ok(reason_codes));
                }
                Ok(None)
            }
            Packet::PingResp => {
                self.pending_pings = 0;
                Ok(None)
            }
            Packet::Disconnect(disconnect) => {
                log::info!(
                    "broker disconnected us: reason code {:#04x}",
                    disconnect.reason_code
                );
                self.handle_connection_loss();
                Ok(Some(Event::Disconnected))
            }
            Packet::Auth(auth) => {
                if let Some(tx) = self.pending_auth.take() {
                    let result = match auth.reason_code {
                        reason_code::SUCCESS => Ok(()),
                        code => Err(ClientError::ConnectionRefused { code }),
                    };
                    let _ = tx.send(result);
                }
                Ok(None)
            }
            // CONNACK outside the handshake and client-to-server packet
            // types are not meaningful here.
            _ => Ok(None),
        }
    }

    fn resolve_publish(&mut self, packet_id: u16, code: u8) {
        if let Some(tx) = self.pending_pub.remove(&packet_id) {
            let result = if code >= 0x80 {
                Err(ClientError::PublishFailed { code })
            } else {
                Ok(())
            };
            let _ = tx.send(result);
        }
    }

    fn handle_incoming_publish(&mut self, publish: Publish) -> Option<Event> {
        let qos = publish.qos;
        let incoming_id = publish.packet_id;
        let message = Message {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            properties: publish.properties,
        };

        match qos {
            QoS::AtMostOnce => self.deliver(message),
            QoS::AtLeastOnce => {
                let packet_id = incoming_id?;
                // Deliver before acknowledging.
                let event = self.deliver(message);
                encode_packet(
                    &Packet::PubAck(Ack::new(packet_id)),
                    self.config.protocol_version,
                    &mut self.write_buf,
                );
                event
            }
            QoS::ExactlyOnce => {
                let packet_id = incoming_id?;
                // Dispatch only on first sight; duplicates just get PUBREC
                // again.
                let event = if self.session.begin_inbound_qos2(packet_id) {
                    self.deliver(message)
                } else {
                    None
                };
                encode_packet(
                    &Packet::PubRec(Ack::new(packet_id)),
                    self.config.protocol_version,
                    &mut self.write_buf,
                );
                event
            }
        }
    }

    fn deliver(&mut self, message: Message) -> Option<Event> {
        if self.dispatcher.dispatch(&message) {
            None
        } else {
            Some(Event::Message(message))
        }
    }
}

#[cfg(test)]
impl EventLoop {
    /// Run the CONNECT handshake over an in-memory stream.
    async fn connect_over(&mut self, io: tokio::io::DuplexStream) -> Result<bool> {
        self.stream = Some(AsyncStream::Mem(io));
        self.handshake().await
    }
}
