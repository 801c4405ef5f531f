//! The seam between the channel and a concrete publish/subscribe client.
//!
//! [`crate::mqtt::MqttTransport`] is the production implementation; tests
//! plug in in-memory transports.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::config::{ChannelSettings, PrinterConfig};
use crate::error::{ConnError, PubError, SubError};
use crate::router::SubscriptionRouter;
use crate::tls::TlsPolicy;

/// Everything needed to open one broker connection.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// MQTT client id.
    pub client_id: String,
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// MQTT user name.
    pub username: String,
    /// MQTT password.
    pub password: String,
    /// Certificate policy.
    pub tls: TlsPolicy,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// Largest packet in either direction.
    pub max_packet_size: usize,
    /// Outgoing request queue capacity.
    pub queue_capacity: usize,
}

impl SessionParams {
    /// Derive connection parameters for `config`.
    pub fn for_printer(config: &PrinterConfig, tls: TlsPolicy, settings: &ChannelSettings) -> Self {
        Self {
            client_id: format!("vcad_{}", uuid::Uuid::new_v4()),
            host: config.broker_host().to_string(),
            port: config.broker_port(),
            username: config.username(),
            password: config.password().to_string(),
            tls,
            keep_alive: settings.keep_alive,
            max_packet_size: settings.max_packet_size,
            queue_capacity: settings.queue_capacity,
        }
    }
}

/// Sending half of a [`PublishAck`].
pub type AckSender = oneshot::Sender<Result<(), PubError>>;

/// Broker acknowledgment for one queued publish.
#[derive(Debug)]
pub struct PublishAck(oneshot::Receiver<Result<(), PubError>>);

impl PublishAck {
    /// A pending acknowledgment and the sender that completes it.
    pub fn pending() -> (AckSender, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self(rx))
    }

    /// An acknowledgment that has already arrived.
    pub fn acknowledged() -> Self {
        let (tx, ack) = Self::pending();
        let _ = tx.send(Ok(()));
        ack
    }

    /// Wait for the broker. A sender dropped without answering means the
    /// connection went away.
    pub async fn wait(self) -> Result<(), PubError> {
        self.0.await.unwrap_or(Err(PubError::Dropped))
    }
}

/// Opens connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and authenticate. Inbound messages must be handed to `router`
    /// for as long as the returned link lives.
    ///
    /// Dropping the returned future abandons the attempt.
    async fn open(
        &self,
        params: &SessionParams,
        router: Arc<SubscriptionRouter>,
    ) -> Result<Arc<dyn Link>, ConnError>;
}

/// One established connection.
#[async_trait]
pub trait Link: Send + Sync {
    /// Queue `payload` on `topic` at QoS 1.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<PublishAck, PubError>;

    /// Ask the broker for messages on `topic` at QoS 1.
    async fn subscribe(&self, topic: &str) -> Result<(), SubError>;

    /// Disconnect cleanly, forcing closure after `grace`.
    async fn close(&self, grace: Duration);

    /// Whether the connection is still up. Links that cannot tell stay open.
    fn is_open(&self) -> bool {
        true
    }
}
