//! Client configuration types.

use std::time::Duration;

use quill_core::packet::ProtocolVersion;

use crate::error::{ClientError, Result};
use crate::will::Will;

/// How the byte stream to the broker is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Plain TCP.
    Tcp,
    /// TCP with TLS.
    Tls,
    /// WebSocket framing over TCP. Framing is supplied externally; the
    /// client only derives addresses for this transport.
    WebSocket,
    /// WebSocket framing over TLS.
    WebSocketTls,
}

impl Transport {
    /// Default port for the transport when the URL carries none.
    pub fn default_port(self) -> u16 {
        match self {
            Transport::Tcp => 1883,
            Transport::Tls => 8883,
            Transport::WebSocket => 80,
            Transport::WebSocketTls => 443,
        }
    }

    pub fn uses_tls(self) -> bool {
        matches!(self, Transport::Tls | Transport::WebSocketTls)
    }
}

/// Session lifetime requested at connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionExpiry {
    /// Session state is discarded when the network connection closes.
    #[default]
    AtClose,
    /// Session state is kept by the broker for the given interval after
    /// the connection closes (MQTT 5.0 session expiry).
    AfterInterval(Duration),
}

impl SessionExpiry {
    /// Interval in seconds for the CONNECT session expiry property.
    pub(crate) fn interval_secs(self) -> Option<u32> {
        match self {
            SessionExpiry::AtClose => None,
            SessionExpiry::AfterInterval(d) => Some(d.as_secs().min(u32::MAX as u64) as u32),
        }
    }
}

/// Reconnect policy after an unexpected connection loss.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconnectMode {
    /// Never reconnect automatically.
    None,
    /// Reconnect after a fixed delay.
    Fixed(Duration),
    /// Reconnect with exponential backoff.
    Backoff {
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    },
}

impl Default for ReconnectMode {
    fn default() -> Self {
        ReconnectMode::None
    }
}

impl ReconnectMode {
    pub(crate) fn initial_delay(&self) -> Duration {
        match self {
            ReconnectMode::None => Duration::ZERO,
            ReconnectMode::Fixed(d) => *d,
            ReconnectMode::Backoff { initial_delay, .. } => *initial_delay,
        }
    }

    pub(crate) fn next_delay(&self, current: Duration) -> Duration {
        match self {
            ReconnectMode::None => Duration::ZERO,
            ReconnectMode::Fixed(d) => *d,
            ReconnectMode::Backoff {
                max_delay,
                multiplier,
                ..
            } => Duration::from_secs_f64(current.as_secs_f64() * multiplier).min(*max_delay),
        }
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Path to a PEM file with CA certificates. When unset, the webpki
    /// root store is used.
    pub ca_cert: Option<String>,
    /// Path to a PEM client certificate for mutual TLS.
    pub client_cert: Option<String>,
    /// Path to the PEM private key for the client certificate.
    pub client_key: Option<String>,
    /// Override the server name used for SNI and verification.
    pub server_name: Option<String>,
    /// Accept any server certificate. Only for testing.
    pub accept_invalid_certs: bool,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker hostname or IP address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Transport carrying the MQTT byte stream.
    pub transport: Transport,
    /// Client identifier.
    pub client_id: String,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<Vec<u8>>,
    /// Keep-alive interval in seconds (0 = disabled).
    pub keep_alive: u16,
    /// Start with a fresh session.
    pub clean_start: bool,
    /// MQTT protocol version.
    pub protocol_version: ProtocolVersion,
    /// Requested session lifetime (MQTT 5.0).
    pub session_expiry: SessionExpiry,
    /// Reconnect policy.
    pub reconnect: ReconnectMode,
    /// TCP/TLS connection timeout.
    pub connect_timeout: Duration,
    /// How long to wait for CONNACK after sending CONNECT.
    pub connack_timeout: Duration,
    /// Interval after which unacknowledged QoS 1/2 messages are re-sent.
    pub retry_interval: Duration,
    /// Last will message.
    pub will: Option<Will>,
    /// CONNECT user properties (MQTT 5.0).
    pub user_properties: Vec<(String, String)>,
    /// Largest inbound packet accepted, advertised to the broker (0 = no limit).
    pub max_packet_size: u32,
    /// TLS settings, used when the transport requires TLS.
    pub tls: TlsConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            transport: Transport::Tcp,
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: 60,
            clean_start: true,
            protocol_version: ProtocolVersion::V311,
            session_expiry: SessionExpiry::AtClose,
            reconnect: ReconnectMode::None,
            connect_timeout: Duration::from_secs(10),
            connack_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_secs(20),
            will: None,
            user_properties: Vec::new(),
            max_packet_size: 0,
            tls: TlsConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a new config for the given host and port over plain TCP.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Create a config from a broker URL.
    ///
    /// Recognized schemes: `mqtt` (TCP, port 1883), `mqtts` (TLS, 8883),
    /// `ws`/`http` (WebSocket, 80), `wss`/`https` (WebSocket over TLS, 443).
    /// A bare `host` or `host:port` or an unrecognized scheme is treated as
    /// `mqtt`. An explicit port always wins over the scheme default.
    pub fn parse_url(url: &str) -> Result<Self> {
        let (scheme, rest) = match url.split_once("://") {
            Some((scheme, rest)) => (Some(scheme.to_ascii_lowercase()), rest),
            None => (None, url),
        };

        let transport = match scheme.as_deref() {
            Some("mqtts") => Transport::Tls,
            Some("ws") | Some("http") => Transport::WebSocket,
            Some("wss") | Some("https") => Transport::WebSocketTls,
            _ => Transport::Tcp,
        };

        // Drop any path component.
        let authority = rest.split('/').next().unwrap_or("");
        if authority.is_empty() {
            return Err(ClientError::Config(format!("no host in URL: {url:?}")));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| ClientError::Config(format!("invalid port in URL: {url:?}")))?;
                (host, port)
            }
            None => (authority, transport.default_port()),
        };

        Ok(Self {
            host: host.to_string(),
            port,
            transport,
            ..Default::default()
        })
    }

    /// Set the client ID.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Set username and password.
    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set keep-alive interval in seconds.
    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set the clean-start flag.
    pub fn clean_start(mut self, clean: bool) -> Self {
        self.clean_start = clean;
        self
    }

    /// Use MQTT 5.0 protocol.
    pub fn mqtt5(mut self) -> Self {
        self.protocol_version = ProtocolVersion::V5;
        self
    }

    /// Request a session lifetime (MQTT 5.0).
    pub fn session_expiry(mut self, expiry: SessionExpiry) -> Self {
        self.session_expiry = expiry;
        self
    }

    /// Set the reconnect policy.
    pub fn reconnect(mut self, mode: ReconnectMode) -> Self {
        self.reconnect = mode;
        self
    }

    /// Set connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the QoS 1/2 redelivery interval.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the last will message.
    pub fn will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    /// Enable TLS with the given settings, regardless of the transport the
    /// config was created with.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.transport = Transport::Tls;
        self.tls = tls;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_scheme_defaults() {
        let cases = [
            ("mqtt.example.com", Transport::Tcp, 1883),
            ("mqtt.example.com:9999", Transport::Tcp, 9999),
            ("mqtt://mqtt.example.com", Transport::Tcp, 1883),
            ("mqtt://mqtt.example.com:9999", Transport::Tcp, 9999),
            ("mqtts://mqtt.example.com", Transport::Tls, 8883),
            ("mqtts://mqtt.example.com:9999", Transport::Tls, 9999),
            ("ws://mqtt.example.com", Transport::WebSocket, 80),
            ("http://mqtt.example.com", Transport::WebSocket, 80),
            ("ws://mqtt.example.com:9999", Transport::WebSocket, 9999),
            ("wss://mqtt.example.com", Transport::WebSocketTls, 443),
            ("https://mqtt.example.com", Transport::WebSocketTls, 443),
            ("wss://mqtt.example.com:9999", Transport::WebSocketTls, 9999),
            // Unrecognized schemes fall back to plain MQTT.
            ("xxx://mqtt.example.com", Transport::Tcp, 1883),
        ];

        for (url, transport, port) in cases {
            let config = ClientConfig::parse_url(url).unwrap();
            assert_eq!(config.host, "mqtt.example.com", "{url}");
            assert_eq!(config.transport, transport, "{url}");
            assert_eq!(config.port, port, "{url}");
        }
    }

    #[test]
    fn url_path_is_ignored() {
        let config = ClientConfig::parse_url("ws://mqtt.example.com:8080/mqtt").unwrap();
        assert_eq!(config.host, "mqtt.example.com");
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport, Transport::WebSocket);
    }

    #[test]
    fn url_errors() {
        assert!(ClientConfig::parse_url("").is_err());
        assert!(ClientConfig::parse_url("mqtt://").is_err());
        assert!(ClientConfig::parse_url("mqtt://host:notaport").is_err());
    }

    #[test]
    fn builder_chain() {
        let config = ClientConfig::new("localhost", 1883)
            .client_id("quill")
            .credentials("user", "pass")
            .keep_alive(30)
            .clean_start(false)
            .mqtt5()
            .session_expiry(SessionExpiry::AfterInterval(Duration::from_secs(300)));

        assert_eq!(config.client_id, "quill");
        assert_eq!(config.username.as_deref(), Some("user"));
        assert_eq!(config.keep_alive, 30);
        assert!(!config.clean_start);
        assert_eq!(config.protocol_version, ProtocolVersion::V5);
        assert_eq!(
            config.session_expiry.interval_secs(),
            Some(300)
        );
    }
}
