//! Durable outbox: same-transaction staging for outbound messages.
//!
//! The outbox pattern persists outbound messages in the same transaction as
//! business state, so a commit that writes an outbox row guarantees the
//! message is eventually dispatched. Entries move `Outstanding →
//! Dispatched` exactly once, after the producer confirms the send.
//!
//! Concrete database bindings live outside this crate; the core consumes
//! [`Outbox`] plus the pluggable transaction abstraction. Deposit without a
//! transaction scope is permitted only on stores that guarantee single-row
//! atomicity (the in-memory store does).
//!
//! # Guarantees
//!
//! - **At-least-once**: outstanding entries older than the sweep threshold
//!   are re-attempted indefinitely.
//! - **Single transition**: `mark_dispatched` is a conditional update from
//!   `Outstanding`; concurrent sweepers cannot double-dispatch.
//! - **No deletion**: the mediator never deletes entries; retention is an
//!   external policy. Attempt counters surface poison messages to
//!   operators.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CapstanError;
use crate::message::Message;

/// Lifecycle state of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxState {
    /// Persisted, not yet confirmed sent.
    Outstanding,
    /// The producer confirmed the send.
    Dispatched,
}

/// One staged outbound message.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    /// The staged message. The entry is keyed by `message.id()`.
    pub message: Message,
    /// Current lifecycle state.
    pub state: OutboxState,
    /// When the entry was staged.
    pub created_at: DateTime<Utc>,
    /// When the producer confirmed the send, if it has.
    pub dispatched_at: Option<DateTime<Utc>>,
    /// How many dispatch attempts have been made. Poison messages show up
    /// here.
    pub attempts: u32,
}

// =============================================================================
// Transactions
// =============================================================================

/// A unit of atomicity shared between business writes and outbox deposits.
///
/// Backends with ambient transactions can no-op these methods; explicit
/// handle backends commit or roll back buffered work.
#[async_trait]
pub trait TransactionScope: Send + Sync {
    /// Make all buffered work visible.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard all buffered work.
    async fn rollback(self: Box<Self>) -> Result<()>;

    /// Downcast support for store bindings.
    fn as_any(&self) -> &dyn Any;
}

/// Opens transaction scopes for a particular store binding.
#[async_trait]
pub trait TransactionProvider: Send + Sync {
    /// Begin a new transaction scope.
    async fn begin(&self) -> Result<Box<dyn TransactionScope>>;
}

// =============================================================================
// Outbox interface
// =============================================================================

/// Durable store of outbound messages keyed by message id.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Stage a message as `Outstanding`.
    ///
    /// When a transaction scope is supplied the write is buffered in it and
    /// becomes visible only on commit. Without a scope the store must
    /// guarantee single-row atomicity.
    async fn add(&self, message: Message, txn: Option<&dyn TransactionScope>) -> Result<()>;

    /// Fetch an entry by message id.
    async fn get(&self, message_id: &str) -> Result<Option<OutboxEntry>>;

    /// Outstanding messages staged at least `older_than` ago, oldest first,
    /// capped at `limit`.
    async fn outstanding(&self, older_than: Duration, limit: usize) -> Result<Vec<Message>>;

    /// Conditionally transition an entry from `Outstanding` to
    /// `Dispatched`.
    ///
    /// Returns `true` if this call performed the transition, `false` if
    /// the entry was already dispatched. A missing entry is
    /// [`CapstanError::RequestNotFound`].
    async fn mark_dispatched(&self, message_id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Record one dispatch attempt against an entry. Missing entries are
    /// ignored.
    async fn record_attempt(&self, message_id: &str) -> Result<()>;
}

// =============================================================================
// In-memory binding
// =============================================================================

/// In-memory outbox with single-row atomicity. The reference binding for
/// tests and single-process use.
#[derive(Default)]
pub struct InMemoryOutbox {
    entries: Mutex<HashMap<String, OutboxEntry>>,
}

impl InMemoryOutbox {
    /// An empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in any state.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("outbox poisoned").len()
    }

    /// Whether the outbox is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, message: Message) {
        let mut entries = self.entries.lock().expect("outbox poisoned");
        entries
            .entry(message.id().to_string())
            .or_insert_with(|| OutboxEntry {
                message,
                state: OutboxState::Outstanding,
                created_at: Utc::now(),
                dispatched_at: None,
                attempts: 0,
            });
    }
}

#[async_trait]
impl Outbox for InMemoryOutbox {
    async fn add(&self, message: Message, txn: Option<&dyn TransactionScope>) -> Result<()> {
        match txn {
            None => {
                self.insert(message);
                Ok(())
            }
            Some(scope) => {
                let scope = scope
                    .as_any()
                    .downcast_ref::<InMemoryTransaction>()
                    .ok_or_else(|| {
                        CapstanError::configuration(
                            "in-memory outbox requires an in-memory transaction scope",
                        )
                    })?;
                scope
                    .pending
                    .lock()
                    .expect("transaction buffer poisoned")
                    .push(message);
                Ok(())
            }
        }
    }

    async fn get(&self, message_id: &str) -> Result<Option<OutboxEntry>> {
        Ok(self
            .entries
            .lock()
            .expect("outbox poisoned")
            .get(message_id)
            .cloned())
    }

    async fn outstanding(&self, older_than: Duration, limit: usize) -> Result<Vec<Message>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        let entries = self.entries.lock().expect("outbox poisoned");

        let mut matches: Vec<&OutboxEntry> = entries
            .values()
            .filter(|e| e.state == OutboxState::Outstanding && e.created_at <= cutoff)
            .collect();
        matches.sort_by_key(|e| e.created_at);

        Ok(matches
            .into_iter()
            .take(limit)
            .map(|e| e.message.clone())
            .collect())
    }

    async fn mark_dispatched(&self, message_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut entries = self.entries.lock().expect("outbox poisoned");
        let entry = entries.get_mut(message_id).ok_or_else(|| {
            CapstanError::RequestNotFound {
                id: message_id.to_string(),
            }
        })?;

        if entry.state == OutboxState::Dispatched {
            return Ok(false);
        }
        entry.state = OutboxState::Dispatched;
        entry.dispatched_at = Some(at);
        Ok(true)
    }

    async fn record_attempt(&self, message_id: &str) -> Result<()> {
        let mut entries = self.entries.lock().expect("outbox poisoned");
        if let Some(entry) = entries.get_mut(message_id) {
            entry.attempts = entry.attempts.saturating_add(1);
        }
        Ok(())
    }
}

/// Buffers deposits for an [`InMemoryOutbox`] until commit.
pub struct InMemoryTransaction {
    outbox: std::sync::Arc<InMemoryOutbox>,
    pending: Mutex<Vec<Message>>,
}

#[async_trait]
impl TransactionScope for InMemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        let pending = std::mem::take(
            &mut *self.pending.lock().expect("transaction buffer poisoned"),
        );
        for message in pending {
            self.outbox.insert(message);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.pending
            .lock()
            .expect("transaction buffer poisoned")
            .clear();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Opens [`InMemoryTransaction`] scopes over a shared [`InMemoryOutbox`].
pub struct InMemoryTransactionProvider {
    outbox: std::sync::Arc<InMemoryOutbox>,
}

impl InMemoryTransactionProvider {
    /// A provider bound to the given outbox.
    pub fn new(outbox: std::sync::Arc<InMemoryOutbox>) -> Self {
        Self { outbox }
    }
}

#[async_trait]
impl TransactionProvider for InMemoryTransactionProvider {
    async fn begin(&self) -> Result<Box<dyn TransactionScope>> {
        Ok(Box::new(InMemoryTransaction {
            outbox: self.outbox.clone(),
            pending: Mutex::new(Vec::new()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageBody, MessageHeader, MessageType};
    use std::sync::Arc;

    fn message(id: &str) -> Message {
        Message::new(
            MessageHeader::new(id, "orders", MessageType::Event),
            MessageBody::empty(),
        )
    }

    #[tokio::test]
    async fn test_add_then_get() {
        let outbox = InMemoryOutbox::new();
        outbox.add(message("m-1"), None).await.unwrap();

        let entry = outbox.get("m-1").await.unwrap().unwrap();
        assert_eq!(entry.state, OutboxState::Outstanding);
        assert_eq!(entry.attempts, 0);
        assert!(entry.dispatched_at.is_none());
    }

    #[tokio::test]
    async fn test_mark_dispatched_transitions_once() {
        let outbox = InMemoryOutbox::new();
        outbox.add(message("m-2"), None).await.unwrap();

        let now = Utc::now();
        assert!(outbox.mark_dispatched("m-2", now).await.unwrap());
        // Second call reports the transition already happened.
        assert!(!outbox.mark_dispatched("m-2", now).await.unwrap());

        let entry = outbox.get("m-2").await.unwrap().unwrap();
        assert_eq!(entry.state, OutboxState::Dispatched);
        assert_eq!(entry.dispatched_at, Some(now));
    }

    #[tokio::test]
    async fn test_mark_dispatched_missing_entry() {
        let outbox = InMemoryOutbox::new();
        let err = outbox
            .mark_dispatched("ghost", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CapstanError>(),
            Some(CapstanError::RequestNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_outstanding_filters_by_state_and_age() {
        let outbox = InMemoryOutbox::new();
        outbox.add(message("old"), None).await.unwrap();
        outbox.add(message("done"), None).await.unwrap();
        outbox.mark_dispatched("done", Utc::now()).await.unwrap();

        let found = outbox.outstanding(Duration::ZERO, 10).await.unwrap();
        let ids: Vec<_> = found.iter().map(|m| m.id()).collect();
        assert_eq!(ids, ["old"]);

        // Nothing is an hour old yet.
        let found = outbox
            .outstanding(Duration::from_secs(3600), 10)
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_outstanding_respects_limit_and_order() {
        let outbox = InMemoryOutbox::new();
        for i in 0..5 {
            outbox.add(message(&format!("m-{i}")), None).await.unwrap();
        }

        let found = outbox.outstanding(Duration::ZERO, 3).await.unwrap();
        assert_eq!(found.len(), 3);
    }

    #[tokio::test]
    async fn test_record_attempt_accumulates() {
        let outbox = InMemoryOutbox::new();
        outbox.add(message("m-3"), None).await.unwrap();
        outbox.record_attempt("m-3").await.unwrap();
        outbox.record_attempt("m-3").await.unwrap();

        let entry = outbox.get("m-3").await.unwrap().unwrap();
        assert_eq!(entry.attempts, 2);
    }

    #[tokio::test]
    async fn test_duplicate_add_keeps_first_entry() {
        let outbox = InMemoryOutbox::new();
        outbox.add(message("m-4"), None).await.unwrap();
        outbox.record_attempt("m-4").await.unwrap();
        outbox.add(message("m-4"), None).await.unwrap();

        let entry = outbox.get("m-4").await.unwrap().unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(outbox.len(), 1);
    }

    #[tokio::test]
    async fn test_transactional_add_visible_only_after_commit() {
        let outbox = Arc::new(InMemoryOutbox::new());
        let provider = InMemoryTransactionProvider::new(outbox.clone());

        let txn = provider.begin().await.unwrap();
        outbox
            .add(message("m-5"), Some(txn.as_ref()))
            .await
            .unwrap();

        assert!(outbox.get("m-5").await.unwrap().is_none());

        txn.commit().await.unwrap();
        assert!(outbox.get("m-5").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_transactional_add_rolled_back_is_invisible() {
        let outbox = Arc::new(InMemoryOutbox::new());
        let provider = InMemoryTransactionProvider::new(outbox.clone());

        let txn = provider.begin().await.unwrap();
        outbox
            .add(message("m-6"), Some(txn.as_ref()))
            .await
            .unwrap();
        txn.rollback().await.unwrap();

        assert!(outbox.get("m-6").await.unwrap().is_none());
        assert!(outbox.is_empty());
    }
}
