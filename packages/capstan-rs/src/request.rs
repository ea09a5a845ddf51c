//! Core request model.
//!
//! A [`Request`] is the unit of work handed to the command processor. It is
//! either a **command** (exactly one handler), an **event** (zero or more
//! handlers, fan-out) or a **document** (fan-out, payload-centric).
//!
//! Requests carry their identity from construction: `id()` is assigned when
//! the request is built and never mutated afterwards. Correlation and
//! partition keys are optional transport-level metadata.
//!
//! # Type erasure
//!
//! The dispatch plumbing works over [`AnyRequest`], a type-erased view that
//! is automatically implemented for every [`Request`]. Typed handlers get
//! their concrete request back via downcasting; see the handler module.
//!
//! # Serialization
//!
//! Requests that travel through a durable scheduler backend must be
//! serializable. [`Request::serialize_to_json`] provides the payload and
//! [`SerializableRequest`] gives a type-erased `Serialize` for backends that
//! stream rather than buffer.

use std::any::{Any, TypeId};
use std::fmt;

/// The dispatch multiplicity class of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// A request expected to have exactly one handler.
    Command,
    /// A fact that may be handled by zero or more handlers.
    Event,
    /// A payload-centric request, dispatched like an event.
    Document,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Command => write!(f, "command"),
            RequestKind::Event => write!(f, "event"),
            RequestKind::Document => write!(f, "document"),
        }
    }
}

/// A request routed through the command processor.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct GreetingMade {
///     id: String,
///     greeting: String,
/// }
///
/// impl Request for GreetingMade {
///     fn id(&self) -> &str {
///         &self.id
///     }
///
///     fn request_kind(&self) -> RequestKind {
///         RequestKind::Event
///     }
///
///     fn serialize_to_json(&self) -> Option<serde_json::Value> {
///         serde_json::to_value(self).ok()
///     }
/// }
/// ```
pub trait Request: Any + Send + Sync + 'static {
    /// Unique id for this logical request. Assigned at construction and
    /// never mutated.
    fn id(&self) -> &str;

    /// Whether this request dispatches one-to-one or fan-out.
    fn request_kind(&self) -> RequestKind;

    /// Correlation id linking this request to related work.
    fn correlation_id(&self) -> Option<&str> {
        None
    }

    /// Broker-level ordering key (e.g. a FIFO message group).
    fn partition_key(&self) -> Option<&str> {
        None
    }

    /// Serialize the request payload for scheduler or outbox persistence.
    ///
    /// Returns `None` by default, which is fine for requests that never
    /// leave the process through a durable backend.
    fn serialize_to_json(&self) -> Option<serde_json::Value> {
        None
    }
}

/// Type-erased request view used by the dispatch plumbing.
///
/// Automatically implemented for every [`Request`]; user code never
/// implements this directly.
pub trait AnyRequest: Send + Sync {
    /// The request's unique id.
    fn request_id(&self) -> &str;

    /// The request's dispatch class.
    fn kind(&self) -> RequestKind;

    /// Correlation id, if any.
    fn correlation(&self) -> Option<&str>;

    /// Partition key, if any.
    fn partition(&self) -> Option<&str>;

    /// Serialized payload, if the request supports it.
    fn to_json(&self) -> Option<serde_json::Value>;

    /// The `TypeId` of the concrete request type.
    fn request_type_id(&self) -> TypeId;

    /// Human-readable type name of the concrete request.
    fn request_type_name(&self) -> &'static str;

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;

    /// Downcast support (boxed).
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<R: Request> AnyRequest for R {
    fn request_id(&self) -> &str {
        Request::id(self)
    }

    fn kind(&self) -> RequestKind {
        Request::request_kind(self)
    }

    fn correlation(&self) -> Option<&str> {
        Request::correlation_id(self)
    }

    fn partition(&self) -> Option<&str> {
        Request::partition_key(self)
    }

    fn to_json(&self) -> Option<serde_json::Value> {
        Request::serialize_to_json(self)
    }

    fn request_type_id(&self) -> TypeId {
        TypeId::of::<R>()
    }

    fn request_type_name(&self) -> &'static str {
        std::any::type_name::<R>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

impl fmt::Debug for dyn AnyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyRequest")
            .field("id", &self.request_id())
            .field("kind", &self.kind())
            .field("type", &self.request_type_name())
            .finish()
    }
}

/// Type-erased serializable request for durable scheduler backends.
///
/// Automatically implemented for requests that also implement
/// [`serde::Serialize`].
pub trait SerializableRequest: AnyRequest + erased_serde::Serialize {}

impl<R: Request + serde::Serialize> SerializableRequest for R {}

impl serde::Serialize for dyn SerializableRequest + Send + Sync {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        erased_serde::serialize(self, serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct PingCommand {
        id: String,
    }

    impl Request for PingCommand {
        fn id(&self) -> &str {
            &self.id
        }

        fn request_kind(&self) -> RequestKind {
            RequestKind::Command
        }

        fn serialize_to_json(&self) -> Option<serde_json::Value> {
            serde_json::to_value(self).ok()
        }
    }

    #[derive(Debug, Clone)]
    struct PingEvent {
        id: String,
        correlation: Option<String>,
    }

    impl Request for PingEvent {
        fn id(&self) -> &str {
            &self.id
        }

        fn request_kind(&self) -> RequestKind {
            RequestKind::Event
        }

        fn correlation_id(&self) -> Option<&str> {
            self.correlation.as_deref()
        }
    }

    #[test]
    fn test_any_request_preserves_identity() {
        let cmd = PingCommand { id: "p-1".into() };
        let erased: &dyn AnyRequest = &cmd;

        assert_eq!(erased.request_id(), "p-1");
        assert_eq!(erased.kind(), RequestKind::Command);
        assert_eq!(erased.request_type_id(), TypeId::of::<PingCommand>());
    }

    #[test]
    fn test_any_request_downcast() {
        let cmd = PingCommand { id: "p-2".into() };
        let erased: Box<dyn AnyRequest> = Box::new(cmd);

        let concrete = erased.as_any().downcast_ref::<PingCommand>();
        assert!(concrete.is_some());
        assert_eq!(concrete.unwrap().id, "p-2");
    }

    #[test]
    fn test_correlation_defaults_to_none() {
        let cmd = PingCommand { id: "p-3".into() };
        assert!(cmd.correlation_id().is_none());
        assert!(cmd.partition_key().is_none());
    }

    #[test]
    fn test_correlation_surfaces_through_erasure() {
        let event = PingEvent {
            id: "e-1".into(),
            correlation: Some("corr-9".into()),
        };
        let erased: &dyn AnyRequest = &event;
        assert_eq!(erased.correlation(), Some("corr-9"));
    }

    #[test]
    fn test_serialize_to_json_roundtrip() {
        let cmd = PingCommand { id: "p-4".into() };
        let json = cmd.serialize_to_json().unwrap();
        let back: PingCommand = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, "p-4");
    }

    #[test]
    fn test_request_kind_display() {
        assert_eq!(RequestKind::Command.to_string(), "command");
        assert_eq!(RequestKind::Event.to_string(), "event");
        assert_eq!(RequestKind::Document.to_string(), "document");
    }
}
