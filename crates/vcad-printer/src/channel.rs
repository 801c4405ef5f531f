//! Connection lifecycle over a [`Transport`].

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::{ChannelSettings, UnackedPublish};
use crate::error::{ConnError, PubError, SubError};
use crate::router::{RawHandler, SubscriptionRouter};
use crate::transport::{Link, SessionParams, Transport};

/// Where a [`SecureChannel`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No connection.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The broker accepted the connection.
    Connected,
}

struct Inner {
    state: ChannelState,
    link: Option<Arc<dyn Link>>,
}

/// One authenticated broker connection plus its subscriptions.
///
/// The state lock is never held across an `.await`; operations clone the
/// link handle under it and work on the clone.
pub struct SecureChannel {
    transport: Arc<dyn Transport>,
    router: Arc<SubscriptionRouter>,
    settings: ChannelSettings,
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("state", &self.state())
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

/// Puts a channel back to Disconnected if a connect attempt ends without success,
/// including when the caller drops the connect future.
struct ConnectAttempt<'a> {
    inner: &'a RwLock<Inner>,
    settled: bool,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let mut inner = self.inner.write();
            if inner.state == ChannelState::Connecting {
                inner.state = ChannelState::Disconnected;
            }
        }
    }
}

impl SecureChannel {
    /// Create a disconnected channel.
    pub fn new(transport: Arc<dyn Transport>, settings: ChannelSettings) -> Self {
        Self {
            transport,
            router: Arc::new(SubscriptionRouter::new()),
            settings,
            inner: RwLock::new(Inner {
                state: ChannelState::Disconnected,
                link: None,
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.drop_lost_link();
        self.inner.read().state
    }

    /// Whether the broker has accepted the connection.
    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Router receiving this channel's inbound messages.
    pub fn router(&self) -> &Arc<SubscriptionRouter> {
        &self.router
    }

    /// Settings the channel was built with.
    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    /// Open the transport, racing it against `deadline`.
    ///
    /// On expiry the attempt is dropped, so it cannot complete later. Connecting
    /// an already connected channel is a no-op.
    pub async fn connect(&self, params: &SessionParams, deadline: Instant) -> Result<(), ConnError> {
        self.drop_lost_link();
        {
            let mut inner = self.inner.write();
            match inner.state {
                ChannelState::Connected => return Ok(()),
                ChannelState::Connecting => {
                    return Err(ConnError::TransportFailure(
                        "connection attempt already in progress".to_string(),
                    ))
                }
                ChannelState::Disconnected => inner.state = ChannelState::Connecting,
            }
        }
        let mut attempt = ConnectAttempt {
            inner: &self.inner,
            settled: false,
        };

        debug!(host = %params.host, port = params.port, "connecting to printer broker");
        let link = match timeout_at(deadline, self.transport.open(params, Arc::clone(&self.router))).await {
            Ok(Ok(link)) => link,
            Ok(Err(err)) => {
                warn!(host = %params.host, error = %err, "connection failed");
                return Err(err);
            }
            Err(_) => {
                warn!(host = %params.host, "connection timed out");
                return Err(ConnError::Timeout);
            }
        };

        {
            let mut inner = self.inner.write();
            inner.state = ChannelState::Connected;
            inner.link = Some(link);
        }
        attempt.settled = true;
        info!(host = %params.host, "connected to printer");
        Ok(())
    }

    /// Move to Disconnected if the transport closed the connection on its own.
    fn drop_lost_link(&self) {
        let lost = |inner: &Inner| {
            inner.state == ChannelState::Connected
                && inner.link.as_ref().is_some_and(|link| !link.is_open())
        };
        if !lost(&*self.inner.read()) {
            return;
        }

        let link = {
            let mut inner = self.inner.write();
            if !lost(&*inner) {
                return;
            }
            inner.state = ChannelState::Disconnected;
            inner.link.take()
        };
        self.router.clear();
        drop(link);
        warn!("connection to printer lost");
    }

    fn link(&self) -> Option<Arc<dyn Link>> {
        self.drop_lost_link();
        let inner = self.inner.read();
        match inner.state {
            ChannelState::Connected => inner.link.clone(),
            _ => None,
        }
    }

    /// Publish `payload` on `topic` at QoS 1 and wait for the broker's acknowledgment.
    ///
    /// The wait ends at `deadline` or after the fallback window, whichever comes
    /// first; the fallback outcome follows [`ChannelSettings::unacked_publish`].
    /// A message already queued may still be delivered after an error.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>, deadline: Instant) -> Result<(), PubError> {
        let link = self.link().ok_or(PubError::NotConnected)?;

        let ack = timeout_at(deadline, link.publish(topic, payload))
            .await
            .map_err(|_| PubError::DeadlineExceeded)??;

        let fallback = self.settings.publish_fallback;
        tokio::select! {
            biased;
            outcome = ack.wait() => outcome,
            _ = sleep_until(deadline) => Err(PubError::DeadlineExceeded),
            _ = sleep(fallback) => match self.settings.unacked_publish {
                UnackedPublish::Fail => Err(PubError::AckTimeout(fallback)),
                UnackedPublish::AssumeDelivered => {
                    warn!(topic, ?fallback, "no acknowledgment, assuming delivery");
                    Ok(())
                }
            },
        }
    }

    /// Bind `handler` to `topic` and subscribe at QoS 1.
    ///
    /// The handler is bound before the request goes out, so messages the broker
    /// sends right after granting the subscription are not missed. On failure
    /// the binding is removed again. Subscriptions last until the next disconnect.
    pub async fn subscribe(&self, topic: &str, handler: RawHandler, deadline: Instant) -> Result<(), SubError> {
        let link = self.link().ok_or(SubError::NotConnected)?;

        self.router.bind(topic, Arc::clone(&handler));
        let subscribed = match timeout_at(deadline, link.subscribe(topic)).await {
            Ok(result) => result,
            Err(_) => Err(SubError::Timeout),
        };
        if let Err(err) = subscribed {
            self.router.unbind(topic, &handler);
            warn!(topic, error = %err, "subscribe failed");
            return Err(err);
        }

        debug!(topic, "subscribed");
        Ok(())
    }

    /// Close the connection. Always ends Disconnected; calling it again is a no-op.
    pub async fn disconnect(&self) {
        let link = {
            let mut inner = self.inner.write();
            inner.state = ChannelState::Disconnected;
            inner.link.take()
        };

        self.router.clear();
        if let Some(link) = link {
            link.close(self.settings.disconnect_grace).await;
            info!("disconnected from printer");
        }
    }
}
