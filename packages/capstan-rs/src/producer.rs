//! Broker producer interface and the routing-key registry.
//!
//! Concrete broker bindings live outside this crate; the core consumes only
//! [`MessageProducer`]. A producer declares its capabilities so callers can
//! decide whether to rely on broker-native delay or partition ordering.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::message::Message;

/// What a producer binding can do natively.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProducerCapabilities {
    /// The broker supports delayed send without scheduler assistance.
    pub delay_native: bool,
    /// The broker honours the header partition key for ordering.
    pub partition_keyed: bool,
}

/// Sends messages to a broker.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    /// Capability flags for this binding.
    fn capabilities(&self) -> ProducerCapabilities {
        ProducerCapabilities::default()
    }

    /// Send a message, optionally delayed.
    ///
    /// Returns the provider-assigned message id, or `None` when the
    /// provider does not report one. Cancellation propagates to the broker
    /// client.
    async fn send(
        &self,
        message: &Message,
        delay: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>>;
}

/// Maps routing keys to producer bindings.
///
/// Built during startup and read-only afterwards.
#[derive(Default)]
pub struct ProducerRegistry {
    bindings: HashMap<String, Arc<dyn MessageProducer>>,
}

impl ProducerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a producer to a routing key, replacing any existing binding.
    pub fn register(&mut self, topic: impl Into<String>, producer: Arc<dyn MessageProducer>) {
        self.bindings.insert(topic.into(), producer);
    }

    /// Resolve the producer for a routing key.
    pub fn lookup(&self, topic: &str) -> Option<Arc<dyn MessageProducer>> {
        self.bindings.get(topic).cloned()
    }

    /// The registered routing keys.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl std::fmt::Debug for ProducerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerRegistry")
            .field("topics", &self.bindings.keys().collect::<Vec<_>>())
            .finish()
    }
}
