//! MQTT transport for Bambu printers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, TlsConfiguration,
};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{ConnError, PubError, SubError};
use crate::router::{InboundMessage, SubscriptionRouter};
use crate::tls;
use crate::transport::{AckSender, Link, PublishAck, SessionParams, Transport};

/// Connects to the broker with rumqttc over rustls.
#[derive(Debug, Default, Clone, Copy)]
pub struct MqttTransport;

#[async_trait]
impl Transport for MqttTransport {
    async fn open(
        &self,
        params: &SessionParams,
        router: Arc<SubscriptionRouter>,
    ) -> Result<Arc<dyn Link>, ConnError> {
        let tls_config = tls::client_config(&params.tls)
            .map_err(|e| ConnError::TransportFailure(format!("TLS setup: {e}")))?;

        let mut mqtt_options =
            MqttOptions::new(params.client_id.clone(), params.host.clone(), params.port);
        mqtt_options.set_credentials(params.username.clone(), params.password.clone());
        mqtt_options.set_keep_alive(params.keep_alive);
        mqtt_options.set_clean_session(true);
        mqtt_options.set_max_packet_size(params.max_packet_size, params.max_packet_size);
        mqtt_options.set_transport(rumqttc::Transport::tls_with_config(
            TlsConfiguration::Rustls(tls_config),
        ));

        let (client, mut event_loop) = AsyncClient::new(mqtt_options, params.queue_capacity);

        wait_for_connack(&mut event_loop).await?;
        debug!(host = %params.host, client_id = %params.client_id, "broker accepted connection");

        let link = MqttLink::new(client);
        let driver = tokio::spawn(drive(
            event_loop,
            router,
            Arc::clone(&link.acks),
            Arc::clone(&link.open),
        ));
        *link.driver.lock() = Some(driver);

        Ok(Arc::new(link))
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), ConnError> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(refused(code)),
                };
            }
            Ok(_) => continue,
            Err(ConnectionError::ConnectionRefused(code)) => return Err(refused(code)),
            Err(e) => return Err(ConnError::TransportFailure(e.to_string())),
        }
    }
}

fn refused(code: ConnectReturnCode) -> ConnError {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            ConnError::AuthFailed(format!("{code:?}"))
        }
        code => ConnError::TransportFailure(format!("broker refused connection: {code:?}")),
    }
}

/// Polls the event loop: routes inbound publishes and completes acknowledgments.
///
/// Clears `open` when the connection ends.
async fn drive(
    mut event_loop: EventLoop,
    router: Arc<SubscriptionRouter>,
    acks: Arc<AckTable>,
    open: Arc<AtomicBool>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage::new(publish.topic, publish.payload.to_vec());
                router.dispatch(&message);
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.sent(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => acks.acknowledge(ack.pkid),
            Ok(event) => trace!(?event, "mqtt event"),
            Err(err) => {
                warn!(error = %err, "printer connection closed");
                break;
            }
        }
    }
    open.store(false, Ordering::SeqCst);
    acks.fail_all();
}

/// Matches QoS 1 publishes to their PUBACKs.
///
/// The event loop handles requests in queue order, so the n-th queued sender
/// belongs to the n-th `Outgoing::Publish` event, which carries the packet id
/// the PUBACK will echo. A sender is queued only together with its request.
#[derive(Default)]
struct AckTable {
    state: parking_lot::Mutex<AckState>,
}

#[derive(Default)]
struct AckState {
    queued: VecDeque<AckSender>,
    inflight: HashMap<u16, AckSender>,
}

impl AckTable {
    /// Queue `sender` iff `enqueue` hands the request to the event loop.
    ///
    /// Runs under the table lock so senders and requests enter their queues
    /// in the same order; `enqueue` must not block.
    fn queue_with<E>(
        &self,
        sender: AckSender,
        enqueue: impl FnOnce() -> Result<(), E>,
    ) -> Result<(), E> {
        let mut state = self.state.lock();
        enqueue()?;
        state.queued.push_back(sender);
        Ok(())
    }

    fn sent(&self, pkid: u16) {
        let mut state = self.state.lock();
        if let Some(sender) = state.queued.pop_front() {
            state.inflight.insert(pkid, sender);
        }
    }

    fn acknowledge(&self, pkid: u16) {
        if let Some(sender) = self.state.lock().inflight.remove(&pkid) {
            let _ = sender.send(Ok(()));
        } else {
            trace!(pkid, "PUBACK for unknown packet");
        }
    }

    /// Drop every pending sender; waiters observe [`PubError::Dropped`].
    fn fail_all(&self) {
        let mut state = self.state.lock();
        state.queued.clear();
        state.inflight.clear();
    }
}

struct MqttLink {
    client: AsyncClient,
    acks: Arc<AckTable>,
    open: Arc<AtomicBool>,
    driver: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MqttLink {
    fn new(client: AsyncClient) -> Self {
        Self {
            client,
            acks: Arc::new(AckTable::default()),
            open: Arc::new(AtomicBool::new(true)),
            driver: parking_lot::Mutex::new(None),
        }
    }
}

#[async_trait]
impl Link for MqttLink {
    /// Never suspends: a full request queue is reported as
    /// [`PubError::Rejected`] rather than waited on, so a cancelled caller
    /// cannot leave a sender behind.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<PublishAck, PubError> {
        let (sender, ack) = PublishAck::pending();
        self.acks
            .queue_with(sender, || {
                self.client
                    .try_publish(topic, QoS::AtLeastOnce, false, payload)
            })
            .map_err(|e| PubError::Rejected(e.to_string()))?;
        Ok(ack)
    }

    async fn subscribe(&self, topic: &str) -> Result<(), SubError> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| SubError::Rejected(e.to_string()))
    }

    async fn close(&self, grace: Duration) {
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "could not queue DISCONNECT");
        }

        let driver = self.driver.lock().take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(grace, &mut driver).await.is_err() {
                debug!(?grace, "event loop still running after grace period, aborting");
                driver.abort();
            }
        }
        self.open.store(false, Ordering::SeqCst);
        self.acks.fail_all();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
    }
}
