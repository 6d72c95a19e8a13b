//! quill-client - Async MQTT client library.
//!
//! An MQTT 3.1.1 / 5.0 client built on tokio. The API is split into a
//! cloneable [`AsyncClient`] handle and an [`EventLoop`] that owns the
//! connection and must be polled to drive I/O.
//!
//! # Example
//!
//! ```ignore
//! use quill_client::{AsyncClient, ClientConfig, QoS};
//!
//! let config = ClientConfig::parse_url("mqtts://broker.example.com")?
//!     .client_id("my-client")
//!     .mqtt5();
//!
//! let (client, mut eventloop) = AsyncClient::new(config, 10);
//!
//! let mut stream = client.subscribe_stream("sensors/#", QoS::AtLeastOnce).await?;
//! tokio::spawn(async move {
//!     while let Some(msg) = stream.recv().await {
//!         println!("{}: {:?}", msg.topic, msg.payload);
//!     }
//! });
//!
//! client.publish("sensors/temp", b"25.5", QoS::AtLeastOnce, false).await?;
//!
//! while let Ok(_event) = eventloop.poll().await {}
//! ```

mod client;
mod config;
mod dispatch;
mod error;
mod packet_id;
mod session;
mod tls;
mod will;

pub use client::{AsyncClient, Event, EventLoop, Message, MessageStream};
pub use config::{ClientConfig, ReconnectMode, SessionExpiry, TlsConfig, Transport};
pub use error::{ClientError, Result};
pub use will::Will;

// Re-export useful types from core
pub use quill_core::packet::{
    AuthProperties, ProtocolVersion, PublishProperties, QoS, SubscriptionOptions,
};
