//! The on-wire and outbox message representation.
//!
//! A [`Message`] is a [`MessageHeader`] plus a [`MessageBody`]. The header
//! carries routing, identity, correlation and cloud-event metadata plus an
//! arbitrary string-keyed bag; the body is bytes with a content type.
//!
//! # Invariants
//!
//! - `handled_count` is monotonically non-decreasing; channels increment it
//!   on requeue and never reset it.
//! - [`MessageType::None`] is the sole legal "empty channel" signal.
//! - [`MessageType::Quit`] is a control sentinel used to stop a pump; it is
//!   never produced by message mappers.
//! - Messages are immutable once produced; only header-bag mutation by
//!   pipeline steps is permitted before dispatch.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CapstanError;

/// Cloud-event spec version stamped on new headers.
const CLOUD_EVENTS_SPEC_VERSION: &str = "1.0";

/// The class of a message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Maps to a command request (Send-style dispatch).
    Command,
    /// Maps to an event request (Publish-style dispatch).
    Event,
    /// Maps to a document request (Publish-style dispatch).
    Document,
    /// Control sentinel: the receiving pump disposes its channel and exits.
    Quit,
    /// Empty-channel signal: nothing was available within the receive
    /// timeout.
    None,
    /// The broker handed back something no mapper can translate.
    Unacceptable,
}

impl MessageType {
    /// Returns true for the types a pump dispatches to handlers.
    pub fn is_dispatchable(&self) -> bool {
        matches!(
            self,
            MessageType::Command | MessageType::Event | MessageType::Document
        )
    }
}

/// Routing, identity and correlation metadata for a message.
#[derive(Debug, Clone)]
pub struct MessageHeader {
    /// Unique message id. Mappers typically reuse the request id.
    pub message_id: String,
    /// The logical topic or queue name the message routes to.
    pub topic: String,
    /// The message class.
    pub message_type: MessageType,
    /// When the message was produced.
    pub timestamp: DateTime<Utc>,
    /// Correlation id linking this message to related work.
    pub correlation_id: Option<String>,
    /// Where replies should be routed.
    pub reply_to: Option<String>,
    /// MIME type of the body.
    pub content_type: String,
    /// How many times the message has been requeued. Monotonically
    /// non-decreasing.
    pub handled_count: u32,
    /// Delay before the message becomes visible to consumers.
    pub delayed: Duration,
    /// Broker-level ordering key (e.g. a FIFO message group).
    pub partition_key: Option<String>,
    /// Arbitrary string-keyed metadata. The only header state pipeline
    /// steps may mutate before dispatch.
    pub bag: HashMap<String, serde_json::Value>,
    /// Cloud-event `source` attribute.
    pub source: Option<String>,
    /// Cloud-event `type` attribute.
    pub event_type: Option<String>,
    /// Cloud-event `specversion` attribute.
    pub spec_version: String,
    /// Cloud-event `dataschema` attribute.
    pub data_schema: Option<String>,
    /// Cloud-event `subject` attribute.
    pub subject: Option<String>,
}

impl MessageHeader {
    /// Create a header with the given identity and routing.
    pub fn new(
        message_id: impl Into<String>,
        topic: impl Into<String>,
        message_type: MessageType,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            topic: topic.into(),
            message_type,
            timestamp: Utc::now(),
            correlation_id: None,
            reply_to: None,
            content_type: "application/json".to_string(),
            handled_count: 0,
            delayed: Duration::ZERO,
            partition_key: None,
            bag: HashMap::new(),
            source: None,
            event_type: None,
            spec_version: CLOUD_EVENTS_SPEC_VERSION.to_string(),
            data_schema: None,
            subject: None,
        }
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, cid: impl Into<String>) -> Self {
        self.correlation_id = Some(cid.into());
        self
    }

    /// Set the reply-to address.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Set the content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Set the partition key.
    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Set the cloud-event source attribute.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the cloud-event type attribute.
    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Set the cloud-event subject attribute.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Record one requeue of this message.
    pub fn increment_handled_count(&mut self) {
        self.handled_count = self.handled_count.saturating_add(1);
    }

    /// JSON-encode the header bag into a single attribute value.
    ///
    /// Brokers that carry headers out-of-band map the cloud-event fields to
    /// native attributes and pack everything unrecognised into one `bag`
    /// attribute produced here.
    pub fn bag_to_wire(&self) -> Result<String> {
        serde_json::to_string(&self.bag)
            .map_err(|e| CapstanError::mapping(format!("header bag encode: {e}")).into())
    }

    /// Merge a wire-encoded bag attribute back into this header.
    pub fn merge_wire_bag(&mut self, raw: &str) -> Result<()> {
        let decoded: HashMap<String, serde_json::Value> = serde_json::from_str(raw)
            .map_err(|e| CapstanError::mapping(format!("header bag decode: {e}")))?;
        self.bag.extend(decoded);
        Ok(())
    }
}

/// Message payload: bytes plus a content type.
#[derive(Debug, Clone)]
pub struct MessageBody {
    /// The payload bytes.
    pub bytes: Vec<u8>,
    /// MIME type of the bytes.
    pub content_type: String,
}

impl MessageBody {
    /// A JSON body from a serializable value.
    pub fn json(value: &serde_json::Value) -> Self {
        Self {
            bytes: value.to_string().into_bytes(),
            content_type: "application/json".to_string(),
        }
    }

    /// An empty body.
    pub fn empty() -> Self {
        Self {
            bytes: Vec::new(),
            content_type: "text/plain".to_string(),
        }
    }

    /// Decode the body as JSON.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.bytes)
            .map_err(|e| CapstanError::mapping(format!("body decode: {e}")).into())
    }
}

/// Header + body pair: the on-wire and outbox representation.
#[derive(Debug, Clone)]
pub struct Message {
    /// Routing and correlation metadata.
    pub header: MessageHeader,
    /// The payload.
    pub body: MessageBody,
}

impl Message {
    /// Create a message from a header and body.
    pub fn new(header: MessageHeader, body: MessageBody) -> Self {
        Self { header, body }
    }

    /// The empty-channel signal. The only legal way to report "nothing to
    /// receive".
    pub fn none() -> Self {
        Self {
            header: MessageHeader::new(
                Uuid::new_v4().to_string(),
                String::new(),
                MessageType::None,
            ),
            body: MessageBody::empty(),
        }
    }

    /// The control sentinel that stops a pump. Never produced by mappers.
    pub fn quit() -> Self {
        Self {
            header: MessageHeader::new(
                Uuid::new_v4().to_string(),
                String::new(),
                MessageType::Quit,
            ),
            body: MessageBody::empty(),
        }
    }

    /// The message id.
    pub fn id(&self) -> &str {
        &self.header.message_id
    }

    /// The message class.
    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_defaults() {
        let header = MessageHeader::new("m-1", "orders", MessageType::Command);
        assert_eq!(header.message_id, "m-1");
        assert_eq!(header.topic, "orders");
        assert_eq!(header.handled_count, 0);
        assert_eq!(header.delayed, Duration::ZERO);
        assert_eq!(header.spec_version, "1.0");
        assert!(header.bag.is_empty());
    }

    #[test]
    fn test_header_builder_chaining() {
        let header = MessageHeader::new("m-2", "orders", MessageType::Event)
            .with_correlation_id("corr-1")
            .with_partition_key("tenant-9")
            .with_source("capstan.test")
            .with_subject("order 42");

        assert_eq!(header.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(header.partition_key.as_deref(), Some("tenant-9"));
        assert_eq!(header.source.as_deref(), Some("capstan.test"));
        assert_eq!(header.subject.as_deref(), Some("order 42"));
    }

    #[test]
    fn test_handled_count_is_monotonic() {
        let mut header = MessageHeader::new("m-3", "orders", MessageType::Event);
        header.increment_handled_count();
        header.increment_handled_count();
        assert_eq!(header.handled_count, 2);
    }

    #[test]
    fn test_none_is_the_empty_channel_signal() {
        let msg = Message::none();
        assert_eq!(msg.message_type(), MessageType::None);
        assert!(!msg.message_type().is_dispatchable());
    }

    #[test]
    fn test_quit_is_not_dispatchable() {
        let msg = Message::quit();
        assert_eq!(msg.message_type(), MessageType::Quit);
        assert!(!msg.message_type().is_dispatchable());
    }

    #[test]
    fn test_dispatchable_types() {
        assert!(MessageType::Command.is_dispatchable());
        assert!(MessageType::Event.is_dispatchable());
        assert!(MessageType::Document.is_dispatchable());
        assert!(!MessageType::Unacceptable.is_dispatchable());
    }

    #[test]
    fn test_body_json_roundtrip() {
        let value = serde_json::json!({ "id": "r-1", "amount": 3 });
        let body = MessageBody::json(&value);
        assert_eq!(body.content_type, "application/json");
        assert_eq!(body.to_json().unwrap(), value);
    }

    #[test]
    fn test_bag_wire_roundtrip() {
        let mut header = MessageHeader::new("m-4", "orders", MessageType::Event);
        header
            .bag
            .insert("claim-check".into(), serde_json::json!("blob-7"));

        let wire = header.bag_to_wire().unwrap();

        let mut restored = MessageHeader::new("m-4", "orders", MessageType::Event);
        restored.merge_wire_bag(&wire).unwrap();
        assert_eq!(
            restored.bag.get("claim-check"),
            Some(&serde_json::json!("blob-7"))
        );
    }

    #[test]
    fn test_merge_wire_bag_rejects_garbage() {
        let mut header = MessageHeader::new("m-5", "orders", MessageType::Event);
        let err = header.merge_wire_bag("{not json").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CapstanError>(),
            Some(CapstanError::MessageMapping { .. })
        ));
    }
}
