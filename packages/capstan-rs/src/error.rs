//! Structured error taxonomy for capstan.
//!
//! `CapstanError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. `anyhow` remains the transport inside handler code and
//! async trait methods; components classify at their boundaries by
//! downcasting.
//!
//! # Taxonomy
//!
//! - [`CapstanError::Configuration`] - missing mapper, missing handler,
//!   mis-registered multiplicity, missing producer. Fatal to the operation;
//!   pumps reject the message and dispose their channel.
//! - [`CapstanError::MessageMapping`] - wrap/unwrap failure. Pumps count the
//!   message as unacceptable and acknowledge it (poison containment); the
//!   publish side bubbles the error to the caller.
//! - [`CapstanError::DeferMessage`] - handler-signalled requeue. Control
//!   flow, not a fault.
//! - [`CapstanError::ChannelFailure`] - broker-level I/O error, possibly
//!   wrapping an open circuit. Triggers backoff in pumps and the mediator.
//! - [`CapstanError::OnceOnlyViolation`] - inbox duplicate when the inbox
//!   middleware is configured to throw.
//! - [`CapstanError::Aggregate`] - raised by publish when any fan-out chain
//!   fails; carries every inner error.
//! - [`CapstanError::RequestNotFound`] - inbox/outbox read miss where a hit
//!   was required.
//!
//! # Example
//!
//! ```ignore
//! match processor.send(my_command).await {
//!     Ok(()) => {}
//!     Err(e) => {
//!         if let Some(CapstanError::Configuration { message }) = e.downcast_ref() {
//!             eprintln!("wiring problem: {message}");
//!         }
//!     }
//! }
//! ```

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// What kind of failure a [`CapstanError::ChannelFailure`] wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFailureKind {
    /// A circuit-breaker guarding the producer or consumer is open.
    CircuitOpen,
    /// A broker-level I/O error. Transient; retried with backoff.
    Broker,
    /// The channel is closed or returned an unusable message. Fatal to the
    /// pump that owns the channel.
    Closed,
}

impl fmt::Display for ChannelFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelFailureKind::CircuitOpen => write!(f, "circuit open"),
            ChannelFailureKind::Broker => write!(f, "broker failure"),
            ChannelFailureKind::Closed => write!(f, "channel closed"),
        }
    }
}

/// Structured error type for capstan operations.
#[derive(Debug, Error)]
pub enum CapstanError {
    /// A registration is missing or inconsistent. Fatal to the operation.
    #[error("configuration error: {message}")]
    Configuration {
        /// What was missing or mis-registered.
        message: String,
    },

    /// A wrap or unwrap pipeline step failed to translate a message.
    #[error("message mapping failed: {message}")]
    MessageMapping {
        /// What failed to translate.
        message: String,
    },

    /// A handler requested that the current message be requeued.
    ///
    /// This is control flow rather than a fault: the pump honours the
    /// requeue limit and the optional delay.
    #[error("defer message")]
    DeferMessage {
        /// Requested redelivery delay, if any.
        delay: Option<Duration>,
    },

    /// A broker-level failure on a channel or producer.
    #[error("channel failure ({kind}): {message}")]
    ChannelFailure {
        /// The failure class, used by pumps to pick backoff vs. shutdown.
        kind: ChannelFailureKind,
        /// Provider detail.
        message: String,
    },

    /// A request id was already present in the inbox.
    #[error("request {request_id} already handled (context {context_key})")]
    OnceOnlyViolation {
        /// The duplicated request id.
        request_id: String,
        /// The inbox context the duplicate was detected in.
        context_key: String,
    },

    /// One or more fan-out handler chains failed during publish.
    #[error("{} handler chain(s) failed during publish", errors.len())]
    Aggregate {
        /// Every inner failure, in chain declaration order.
        errors: Vec<anyhow::Error>,
    },

    /// An inbox or outbox read missed where a hit was required.
    #[error("request {id} not found")]
    RequestNotFound {
        /// The id that missed.
        id: String,
    },

    /// Scheduling a deferred request failed.
    #[error("failed to schedule request: {message}")]
    ScheduleFailed {
        /// The underlying error message.
        message: String,
    },
}

impl CapstanError {
    /// Shorthand for a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        CapstanError::Configuration {
            message: message.into(),
        }
    }

    /// Shorthand for a mapping error.
    pub fn mapping(message: impl Into<String>) -> Self {
        CapstanError::MessageMapping {
            message: message.into(),
        }
    }

    /// Shorthand for a broker-level channel failure.
    pub fn broker(message: impl Into<String>) -> Self {
        CapstanError::ChannelFailure {
            kind: ChannelFailureKind::Broker,
            message: message.into(),
        }
    }

    /// Shorthand for an open-circuit channel failure.
    pub fn circuit_open(message: impl Into<String>) -> Self {
        CapstanError::ChannelFailure {
            kind: ChannelFailureKind::CircuitOpen,
            message: message.into(),
        }
    }

    /// Returns true if this error (or, for aggregates, any inner error)
    /// matches the predicate.
    pub fn any_matches(&self, pred: impl Fn(&CapstanError) -> bool + Copy) -> bool {
        if pred(self) {
            return true;
        }
        if let CapstanError::Aggregate { errors } = self {
            return errors
                .iter()
                .filter_map(|e| e.downcast_ref::<CapstanError>())
                .any(|e| e.any_matches(pred));
        }
        false
    }

    /// Finds the first defer request in this error or its aggregate inners.
    pub fn find_defer(&self) -> Option<Option<Duration>> {
        match self {
            CapstanError::DeferMessage { delay } => Some(*delay),
            CapstanError::Aggregate { errors } => errors
                .iter()
                .filter_map(|e| e.downcast_ref::<CapstanError>())
                .find_map(|e| e.find_defer()),
            _ => None,
        }
    }
}
