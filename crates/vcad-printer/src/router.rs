//! Topic-to-handler dispatch for inbound messages.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, trace};

/// A message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload.
    pub payload: Vec<u8>,
}

impl InboundMessage {
    /// Create a message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Callback invoked for every message on a bound topic.
///
/// Runs on the transport's delivery task; keep it short or hand off.
pub type RawHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Routes inbound messages to the handlers bound to their topic.
///
/// Holds no message history.
#[derive(Default)]
pub struct SubscriptionRouter {
    routes: RwLock<HashMap<String, Vec<RawHandler>>>,
}

impl std::fmt::Debug for SubscriptionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRouter")
            .field("topics", &self.topics())
            .finish()
    }
}

impl SubscriptionRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `topic`. Several handlers may share a topic.
    pub fn bind(&self, topic: &str, handler: RawHandler) {
        self.routes
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(handler);
    }

    /// Remove one binding of `handler` from `topic`; returns whether it was bound.
    pub fn unbind(&self, topic: &str, handler: &RawHandler) -> bool {
        let mut routes = self.routes.write();
        let Some(handlers) = routes.get_mut(topic) else {
            return false;
        };
        let Some(index) = handlers.iter().position(|h| Arc::ptr_eq(h, handler)) else {
            return false;
        };
        handlers.remove(index);
        if handlers.is_empty() {
            routes.remove(topic);
        }
        true
    }

    /// Invoke every handler bound to the message's topic; returns how many ran.
    ///
    /// A panicking handler is logged and does not stop the others.
    pub fn dispatch(&self, message: &InboundMessage) -> usize {
        // Snapshot so handlers may bind further topics without deadlocking.
        let handlers = match self.routes.read().get(&message.topic) {
            Some(handlers) => handlers.clone(),
            None => {
                trace!(topic = %message.topic, "no handler bound");
                return 0;
            }
        };

        let mut invoked = 0;
        for handler in &handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(()) => invoked += 1,
                Err(_) => error!(topic = %message.topic, "report handler panicked"),
            }
        }
        invoked
    }

    /// Whether any handler is bound to `topic`.
    pub fn is_bound(&self, topic: &str) -> bool {
        self.routes.read().contains_key(topic)
    }

    /// Bound topics.
    pub fn topics(&self) -> Vec<String> {
        self.routes.read().keys().cloned().collect()
    }

    /// Drop every binding.
    pub fn clear(&self) {
        self.routes.write().clear();
    }
}
