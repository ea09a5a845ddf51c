//! In-memory test doubles.
//!
//! Available with the `testing` feature (and to this crate's own tests):
//!
//! ```toml
//! [dev-dependencies]
//! capstan = { version = "0.1", features = ["testing"] }
//! ```
//!
//! - [`InMemoryChannel`] - a scriptable channel: push messages, script
//!   receive failures, observe acks/rejects/requeues.
//! - [`InMemoryProducer`] - records sent messages; failures scriptable.
//! - [`Receipts`] - the shared "received messages" list spy handlers
//!   append to.
//!
//! The in-memory outbox, inbox and scheduler live with their interfaces
//! (they double as the single-process bindings); this module holds the
//! purely test-facing pieces.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::channel::Channel;
use crate::error::{CapstanError, ChannelFailureKind};
use crate::message::{Message, MessageType};
use crate::producer::{MessageProducer, ProducerCapabilities};

/// Poll granularity for the in-memory channel's receive wait.
const RECEIVE_POLL: Duration = Duration::from_millis(2);

// =============================================================================
// Channel
// =============================================================================

/// Scriptable in-memory channel.
///
/// Clones share state, so a test can keep a handle for assertions while
/// the pump owns its boxed clone.
#[derive(Clone)]
pub struct InMemoryChannel {
    name: String,
    queue: Arc<Mutex<VecDeque<Message>>>,
    acknowledged: Arc<Mutex<Vec<Message>>>,
    rejected: Arc<Mutex<Vec<Message>>>,
    delivered_counts: Arc<Mutex<Vec<u32>>>,
    scripted_failures: Arc<Mutex<VecDeque<ChannelFailureKind>>>,
    disposed: Arc<AtomicBool>,
}

impl InMemoryChannel {
    /// An empty channel.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            acknowledged: Arc::new(Mutex::new(Vec::new())),
            rejected: Arc::new(Mutex::new(Vec::new())),
            delivered_counts: Arc::new(Mutex::new(Vec::new())),
            scripted_failures: Arc::new(Mutex::new(VecDeque::new())),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queue a message for the pump.
    pub fn push(&self, message: Message) {
        self.queue.lock().unwrap().push_back(message);
    }

    /// Make the next receive fail with the given kind.
    pub fn fail_next_receive(&self, kind: ChannelFailureKind) {
        self.scripted_failures.lock().unwrap().push_back(kind);
    }

    /// Messages acknowledged so far.
    pub fn acknowledged(&self) -> Vec<Message> {
        self.acknowledged.lock().unwrap().clone()
    }

    /// Messages rejected so far.
    pub fn rejected(&self) -> Vec<Message> {
        self.rejected.lock().unwrap().clone()
    }

    /// The `handled_count` observed on each dispatchable delivery, in
    /// order. This is how requeue tests see the count progression.
    pub fn delivered_handled_counts(&self) -> Vec<u32> {
        self.delivered_counts.lock().unwrap().clone()
    }

    /// Messages still queued.
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the channel was disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(&self, timeout: Duration) -> Result<Message> {
        if let Some(kind) = self.scripted_failures.lock().unwrap().pop_front() {
            return Err(CapstanError::ChannelFailure {
                kind,
                message: "scripted failure".into(),
            }
            .into());
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.disposed.load(Ordering::SeqCst) {
                return Err(CapstanError::ChannelFailure {
                    kind: ChannelFailureKind::Closed,
                    message: "channel disposed".into(),
                }
                .into());
            }

            if let Some(message) = self.queue.lock().unwrap().pop_front() {
                if message.message_type().is_dispatchable() {
                    self.delivered_counts
                        .lock()
                        .unwrap()
                        .push(message.header.handled_count);
                }
                return Ok(message);
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(Message::none());
            }
            tokio::time::sleep(RECEIVE_POLL).await;
        }
    }

    async fn acknowledge(&self, message: &Message) -> Result<()> {
        self.acknowledged.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn reject(&self, message: &Message) -> Result<()> {
        self.rejected.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn requeue(&self, message: &Message, delay: Option<Duration>) -> Result<bool> {
        let mut redelivery = message.clone();
        redelivery.header.increment_handled_count();

        match delay {
            Some(delay) if !delay.is_zero() => {
                let queue = self.queue.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.lock().unwrap().push_back(redelivery);
                });
            }
            _ => {
                self.queue.lock().unwrap().push_back(redelivery);
            }
        }
        Ok(true)
    }

    async fn enqueue_local(&self, message: Message) -> Result<()> {
        self.queue.lock().unwrap().push_back(message);
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryChannel")
            .field("name", &self.name)
            .field("queued", &self.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// =============================================================================
// Producer
// =============================================================================

/// Recording in-memory producer with scriptable failures.
#[derive(Clone, Default)]
pub struct InMemoryProducer {
    sent: Arc<Mutex<Vec<Message>>>,
    failures_remaining: Arc<Mutex<usize>>,
    capabilities: ProducerCapabilities,
}

impl InMemoryProducer {
    /// A producer that always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sends before succeeding.
    pub fn fail_next(&self, n: usize) {
        *self.failures_remaining.lock().unwrap() = n;
    }

    /// Override the declared capabilities.
    pub fn with_capabilities(mut self, capabilities: ProducerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Messages sent so far.
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    /// Ids of the messages sent so far, in send order.
    pub fn sent_ids(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.id().to_string())
            .collect()
    }
}

#[async_trait]
impl MessageProducer for InMemoryProducer {
    fn capabilities(&self) -> ProducerCapabilities {
        self.capabilities
    }

    async fn send(
        &self,
        message: &Message,
        _delay: Option<Duration>,
        _cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        {
            let mut failures = self.failures_remaining.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("scripted producer failure");
            }
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(Some(message.id().to_string()))
    }
}

impl std::fmt::Debug for InMemoryProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryProducer")
            .field("sent", &self.sent.lock().unwrap().len())
            .finish()
    }
}

// =============================================================================
// Receipts
// =============================================================================

/// The shared "received messages" list spy handlers append to.
#[derive(Clone, Default)]
pub struct Receipts {
    entries: Arc<Mutex<Vec<(String, String)>>>,
}

impl Receipts {
    /// An empty receipt list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `handler` observed `request_id`.
    pub fn record(&self, handler: impl Into<String>, request_id: impl Into<String>) {
        self.entries
            .lock()
            .unwrap()
            .push((handler.into(), request_id.into()));
    }

    /// Whether `handler` observed `request_id`.
    pub fn contains(&self, handler: &str, request_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|(h, r)| h == handler && r == request_id)
    }

    /// Every recorded `(handler, request id)` pair, in order.
    pub fn all(&self) -> Vec<(String, String)> {
        self.entries.lock().unwrap().clone()
    }

    /// Number of recorded receipts.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Receipts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.all()).finish()
    }
}
