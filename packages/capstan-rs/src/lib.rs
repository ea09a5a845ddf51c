//! # Capstan
//!
//! A command/event dispatch and messaging runtime: hand it requests and it
//! routes them to in-process handler pipelines or out to brokers, with a
//! transactional outbox keeping business state and outbound publication
//! atomic.
//!
//! ## Architecture
//!
//! ```text
//! Application
//!     │ send / publish            │ post
//!     ▼                           ▼
//! CommandProcessor ──────► wrap pipeline ──► Outbox ──► OutboxMediator
//!     │                                       (Outstanding)   │ retry ⊂ breaker
//!     ▼                                                       ▼
//! handler chains                                         MessageProducer
//! (middleware + handler)                                      │
//!     ▲                                                       ▼
//!     │ send / publish                                     broker
//! MessagePump ◄── unwrap pipeline ◄── Channel ◄───────────────┘
//! ```
//!
//! ## Key invariants
//!
//! 1. **Commands dispatch exactly once** - one registered handler,
//!    enforced at registration and dispatch.
//! 2. **Publish fans out and aggregates** - every chain runs; failures
//!    come back together.
//! 3. **Post never silently loses a message** - a committed outbox row is
//!    eventually dispatched; entries transition `Outstanding → Dispatched`
//!    at most once.
//! 4. **Per-channel ordering** - each pump processes its channel strictly
//!    sequentially.
//!
//! ## Example
//!
//! ```ignore
//! use capstan::{CommandProcessorBuilder, HandlerRegistration};
//!
//! let processor = CommandProcessorBuilder::new()
//!     .with_command::<PlaceOrder>(HandlerRegistration::for_handler::<PlaceOrder, _>(
//!         "PlaceOrderHandler",
//!         || PlaceOrderHandler::new(),
//!     ))
//!     .with_mapper::<OrderPlaced>(MapperRegistration::new(Arc::new(OrderPlacedMapper)))
//!     .with_producer("orders.placed", Arc::new(sqs_producer))
//!     .build();
//!
//! processor.send(PlaceOrder { id: "o-1".into() }).await?;
//! processor.post(OrderPlaced { id: "o-1".into() }).await?;
//! processor.teardown();
//! ```
//!
//! Delivery is at-least-once end to end; pair the inbox middleware with
//! idempotent handlers for once-only semantics.

// Core modules
mod channel;
mod error;
mod handler;
mod inbox;
mod mediator;
mod message;
mod middleware;
mod outbox;
mod policy;
mod processor;
mod producer;
mod pump;
mod registry;
mod request;
mod scheduler;
mod transform;

// In-memory test doubles (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export the request model
pub use crate::request::{AnyRequest, Request, RequestKind, SerializableRequest};

// Re-export the message model
pub use crate::message::{Message, MessageBody, MessageHeader, MessageType};

// Re-export error types
pub use crate::error::{CapstanError, ChannelFailureKind};

// Re-export handler pipeline types
pub use crate::handler::{
    DispatchContext, Handler, HandlerAdapter, HandlerChain, HandlerRegistration, Middleware,
    MiddlewareDescriptor, Next, PipelineBuilder, RequestHandler, StepTiming,
};

// Re-export the built-in middleware
pub use crate::middleware::{
    FallbackMiddleware, InboxMiddleware, OnDuplicate, PolicyMiddleware, RequestLoggingMiddleware,
    ValidationMiddleware,
};

// Re-export registries
pub use crate::registry::{Multiplicity, SubscriberRegistry, Subscription};

// Re-export resilience policies
pub use crate::policy::{
    policy_names, CircuitBreaker, PolicyAction, PolicyRegistry, ResiliencePolicy, RetryPolicy,
};

// Re-export transform pipeline types
pub use crate::transform::{
    MapperRegistration, MessageMapper, MessageTransform, TransformDescriptor, TransformRegistry,
    UnwrapPipeline, WrapPipeline,
};

// Re-export the outbox and inbox
pub use crate::inbox::{InMemoryInbox, Inbox, InboxEntry};
pub use crate::outbox::{
    InMemoryOutbox, InMemoryTransaction, InMemoryTransactionProvider, Outbox, OutboxEntry,
    OutboxState, TransactionProvider, TransactionScope,
};

// Re-export the mediator
pub use crate::mediator::{MediatorConfig, OutboxMediator};

// Re-export broker-facing interfaces
pub use crate::channel::Channel;
pub use crate::producer::{MessageProducer, ProducerCapabilities, ProducerRegistry};

// Re-export the processor façade (primary entry point)
pub use crate::processor::{CommandProcessor, CommandProcessorBuilder};

// Re-export the scheduler
pub use crate::scheduler::{
    FireSchedulerHandler, FireSchedulerRequest, InMemoryScheduler, RequestRehydrators,
    ScheduledDispatch, Scheduler, SchedulerContext, StoredRequest,
};

// Re-export the message pump
pub use crate::pump::{
    MessagePump, Proactor, PumpConfig, PumpExit, PumpHost, PumpMode, Reactor,
};

// Re-export commonly used external types
pub use async_trait::async_trait;
