//! Broker consumer channel: the conduit between a broker consumer and a
//! message pump.
//!
//! A channel is exclusively owned by its pump. `receive` never returns
//! "nothing" implicitly: an empty channel yields a message with
//! [`MessageType::None`](crate::message::MessageType::None), and broker
//! faults surface as [`CapstanError::ChannelFailure`](crate::error::CapstanError)
//! so the pump can pick backoff or shutdown by failure kind.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::message::Message;

/// Bounded conduit between a broker consumer and a pump.
#[async_trait]
pub trait Channel: Send + Sync {
    /// The channel's name, used in logs.
    fn name(&self) -> &str;

    /// Receive the next message, waiting up to `timeout`.
    ///
    /// An empty channel returns a `MessageType::None` message. Broker-level
    /// faults return a `ChannelFailure`; a `Closed` failure kind tells the
    /// pump the channel is unusable.
    async fn receive(&self, timeout: Duration) -> Result<Message>;

    /// Acknowledge a message as handled.
    async fn acknowledge(&self, message: &Message) -> Result<()>;

    /// Reject a message (dropped or dead-lettered by the broker).
    async fn reject(&self, message: &Message) -> Result<()>;

    /// Requeue a message for redelivery, optionally delayed.
    ///
    /// Increments the message's `handled_count`. Returns `false` when the
    /// broker discarded the message instead of requeuing it.
    async fn requeue(&self, message: &Message, delay: Option<Duration>) -> Result<bool>;

    /// Push a message straight onto the local queue, bypassing the broker.
    ///
    /// Used by tests and to inject the `Quit` sentinel.
    async fn enqueue_local(&self, message: Message) -> Result<()>;

    /// Release the underlying consumer. Idempotent.
    async fn dispose(&self) -> Result<()>;
}
