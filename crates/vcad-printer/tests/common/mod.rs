//! In-memory broker that answers requests the way a printer would.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use vcad_printer::{
    ChannelSettings, ConnError, InboundMessage, Link, Printer, PrinterConfig, PubError,
    PublishAck, SessionParams, SubError, SubscriptionRouter, Transport, TrustRoot,
};

pub const DEVICE_ID: &str = "01P00C490700226";

pub fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(2)
}

pub fn local_config() -> PrinterConfig {
    PrinterConfig::local(DEVICE_ID, "192.168.0.33", "74462393")
}

/// Self-signed certificate naming the device, as printers ship.
pub fn device_certificate() -> TrustRoot {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, DEVICE_ID);
    let key = KeyPair::generate().unwrap();
    TrustRoot::from_der(params.self_signed(&key).unwrap().der().to_vec()).unwrap()
}

/// State shared by the fake transport and its links.
#[derive(Default)]
pub struct Broker {
    router: Mutex<Option<Arc<SubscriptionRouter>>>,
    published: Mutex<Vec<(String, Value)>>,
    subscriptions: Mutex<Vec<String>>,
    opened: Mutex<Vec<SessionParams>>,
    dropped: AtomicBool,
}

impl Broker {
    /// Deliver a raw payload as if the printer had published it.
    pub fn inject(&self, topic: &str, payload: &[u8]) -> usize {
        match self.router.lock().clone() {
            Some(router) => router.dispatch(&InboundMessage::new(topic, payload)),
            None => 0,
        }
    }

    pub fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    pub fn opened(&self) -> Vec<SessionParams> {
        self.opened.lock().clone()
    }

    /// Cut the current connection from the broker side.
    pub fn drop_connection(&self) {
        self.dropped.store(true, Ordering::SeqCst);
        *self.router.lock() = None;
    }
}

/// Answers every request on the report topic: an echo with `result: success`,
/// plus a status push for `pushall`.
pub struct EchoTransport {
    pub broker: Arc<Broker>,
}

impl EchoTransport {
    pub fn new() -> (Arc<Self>, Arc<Broker>) {
        let broker = Arc::new(Broker::default());
        (
            Arc::new(Self {
                broker: Arc::clone(&broker),
            }),
            broker,
        )
    }
}

#[async_trait]
impl Transport for EchoTransport {
    async fn open(
        &self,
        params: &SessionParams,
        router: Arc<SubscriptionRouter>,
    ) -> Result<Arc<dyn Link>, ConnError> {
        *self.broker.router.lock() = Some(router);
        self.broker.dropped.store(false, Ordering::SeqCst);
        self.broker.opened.lock().push(params.clone());
        Ok(Arc::new(EchoLink {
            broker: Arc::clone(&self.broker),
        }))
    }
}

struct EchoLink {
    broker: Arc<Broker>,
}

#[async_trait]
impl Link for EchoLink {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<PublishAck, PubError> {
        let request: Value =
            serde_json::from_slice(&payload).map_err(|e| PubError::Rejected(e.to_string()))?;
        self.broker
            .published
            .lock()
            .push((topic.to_string(), request.clone()));

        if let Some(device) = topic
            .strip_prefix("device/")
            .and_then(|rest| rest.strip_suffix("/request"))
        {
            let report_topic = format!("device/{device}/report");
            for reply in replies(request) {
                self.broker.inject(&report_topic, reply.to_string().as_bytes());
            }
        }

        Ok(PublishAck::acknowledged())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), SubError> {
        self.broker.subscriptions.lock().push(topic.to_string());
        Ok(())
    }

    async fn close(&self, _grace: Duration) {
        *self.broker.router.lock() = None;
    }

    fn is_open(&self) -> bool {
        !self.broker.dropped.load(Ordering::SeqCst)
    }
}

fn replies(mut request: Value) -> Vec<Value> {
    let Some((category, body)) = request
        .as_object_mut()
        .and_then(|outer| outer.iter_mut().next())
    else {
        return Vec::new();
    };
    let category = category.clone();
    body["result"] = json!("success");
    let sequence_id = body["sequence_id"].clone();

    let mut echo = Map::new();
    echo.insert(category.clone(), body.clone());
    let mut replies = vec![Value::Object(echo)];
    if category == "pushing" {
        replies.push(json!({"print": {
            "command": "push_status",
            "sequence_id": sequence_id,
            "gcode_state": "IDLE",
            "nozzle_temper": 24.0,
            "bed_temper": 22.5,
        }}));
    }
    replies
}

/// Never finishes connecting.
pub struct StalledTransport;

#[async_trait]
impl Transport for StalledTransport {
    async fn open(
        &self,
        _params: &SessionParams,
        _router: Arc<SubscriptionRouter>,
    ) -> Result<Arc<dyn Link>, ConnError> {
        std::future::pending().await
    }
}

/// A LAN printer session over `transport` with its certificate already pinned.
pub fn printer(transport: Arc<dyn Transport>) -> Printer {
    Printer::with_transport(local_config(), ChannelSettings::default(), transport)
        .with_trust_root(device_certificate())
}
