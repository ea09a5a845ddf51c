//! Durable inbox: handled-request ids for once-only semantics.
//!
//! The inbox records which request ids a given context has already seen,
//! giving handlers idempotency under at-least-once delivery. The primary
//! key is `(request_id, context_key)`; duplicate adds are idempotent
//! no-ops, never errors - whether a duplicate *dispatch* is an error is the
//! inbox middleware's policy, not the store's.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CapstanError;
use crate::outbox::TransactionScope;

/// One recorded handled request.
#[derive(Debug, Clone)]
pub struct InboxEntry {
    /// The handled request's id.
    pub request_id: String,
    /// The handler context the request was seen in.
    pub context_key: String,
    /// Serialized request payload, for audit and replay.
    pub body: serde_json::Value,
    /// When the request was first recorded.
    pub timestamp: DateTime<Utc>,
}

/// Durable store of handled request ids.
#[async_trait]
pub trait Inbox: Send + Sync {
    /// Record a request id for a context. Duplicate adds are no-ops.
    async fn add(
        &self,
        request_id: &str,
        context_key: &str,
        body: serde_json::Value,
        txn: Option<&dyn TransactionScope>,
    ) -> Result<()>;

    /// Whether the id was already recorded for the context.
    async fn exists(&self, request_id: &str, context_key: &str) -> Result<bool>;

    /// Fetch a recorded entry; a miss is [`CapstanError::RequestNotFound`].
    async fn get(&self, request_id: &str, context_key: &str) -> Result<InboxEntry>;
}

/// In-memory inbox. The reference binding for tests and single-process use.
#[derive(Default)]
pub struct InMemoryInbox {
    entries: Mutex<HashMap<(String, String), InboxEntry>>,
}

impl InMemoryInbox {
    /// An empty inbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("inbox poisoned").len()
    }

    /// Whether the inbox is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Inbox for InMemoryInbox {
    async fn add(
        &self,
        request_id: &str,
        context_key: &str,
        body: serde_json::Value,
        _txn: Option<&dyn TransactionScope>,
    ) -> Result<()> {
        let mut entries = self.entries.lock().expect("inbox poisoned");
        entries
            .entry((request_id.to_string(), context_key.to_string()))
            .or_insert_with(|| InboxEntry {
                request_id: request_id.to_string(),
                context_key: context_key.to_string(),
                body,
                timestamp: Utc::now(),
            });
        Ok(())
    }

    async fn exists(&self, request_id: &str, context_key: &str) -> Result<bool> {
        let entries = self.entries.lock().expect("inbox poisoned");
        Ok(entries.contains_key(&(request_id.to_string(), context_key.to_string())))
    }

    async fn get(&self, request_id: &str, context_key: &str) -> Result<InboxEntry> {
        let entries = self.entries.lock().expect("inbox poisoned");
        entries
            .get(&(request_id.to_string(), context_key.to_string()))
            .cloned()
            .ok_or_else(|| {
                CapstanError::RequestNotFound {
                    id: request_id.to_string(),
                }
                .into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_then_exists() {
        let inbox = InMemoryInbox::new();
        inbox
            .add("r-1", "OrderHandler", serde_json::json!({}), None)
            .await
            .unwrap();

        assert!(inbox.exists("r-1", "OrderHandler").await.unwrap());
        assert!(!inbox.exists("r-1", "OtherHandler").await.unwrap());
        assert!(!inbox.exists("r-2", "OrderHandler").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_add_is_idempotent() {
        let inbox = InMemoryInbox::new();
        inbox
            .add("r-1", "ctx", serde_json::json!({"v": 1}), None)
            .await
            .unwrap();
        inbox
            .add("r-1", "ctx", serde_json::json!({"v": 2}), None)
            .await
            .unwrap();

        assert_eq!(inbox.len(), 1);
        // First write wins.
        let entry = inbox.get("r-1", "ctx").await.unwrap();
        assert_eq!(entry.body, serde_json::json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_get_miss_is_request_not_found() {
        let inbox = InMemoryInbox::new();
        let err = inbox.get("ghost", "ctx").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CapstanError>(),
            Some(CapstanError::RequestNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_same_id_different_contexts_are_distinct() {
        let inbox = InMemoryInbox::new();
        inbox
            .add("r-1", "ctx-a", serde_json::json!({}), None)
            .await
            .unwrap();
        inbox
            .add("r-1", "ctx-b", serde_json::json!({}), None)
            .await
            .unwrap();

        assert_eq!(inbox.len(), 2);
    }
}
