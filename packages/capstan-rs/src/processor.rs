//! The command processor: capstan's front door.
//!
//! The processor owns the registries for its lifetime and exposes:
//!
//! - **send** - dispatch a command through its single handler chain.
//! - **publish** - fan-out dispatch to every registered chain, aggregating
//!   failures.
//! - **post** - wrap the request into a message, deposit it in the outbox
//!   and trigger dispatch through the mediator.
//! - **deposit_post / clear_outbox / clear_outstanding** - explicit outbox
//!   staging and dispatch.
//! - **send_at / publish_after / post_at / ...** - deferred dispatch
//!   through the scheduler backend, returning an opaque schedule id that
//!   supports reschedule and cancel.
//!
//! Build one with [`CommandProcessorBuilder`]. The processor owns the
//! shared bus (the outbox mediator and its producers) plus the background
//! sweeper; [`CommandProcessor::teardown`] is the explicit cleanup hook.
//!
//! # Example
//!
//! ```ignore
//! let processor = CommandProcessorBuilder::new()
//!     .with_command::<PlaceOrder>(HandlerRegistration::for_handler::<PlaceOrder, _>(
//!         "PlaceOrderHandler",
//!         || PlaceOrderHandler,
//!     ))
//!     .with_mapper::<OrderPlaced>(MapperRegistration::new(Arc::new(OrderMapper)))
//!     .with_producer("orders.placed", Arc::new(my_producer))
//!     .build();
//!
//! processor.send(PlaceOrder::new()).await?;
//! processor.post(OrderPlaced::new()).await?;
//! ```

use std::any::TypeId;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CapstanError;
use crate::handler::{DispatchContext, HandlerRegistration, PipelineBuilder};
use crate::mediator::{MediatorConfig, OutboxMediator};
use crate::message::Message;
use crate::outbox::{InMemoryOutbox, Outbox, TransactionScope};
use crate::policy::PolicyRegistry;
use crate::producer::{MessageProducer, ProducerRegistry};
use crate::registry::{Multiplicity, SubscriberRegistry};
use crate::request::{AnyRequest, Request};
use crate::scheduler::{
    FireSchedulerHandler, FireSchedulerRequest, InMemoryScheduler, RequestRehydrators,
    ScheduledDispatch, Scheduler, SchedulerContext, StoredRequest,
};
use crate::transform::{MapperRegistration, TransformRegistry};

/// Front-door API over handler pipelines, the outbox mediator and the
/// scheduler.
pub struct CommandProcessor {
    subscribers: Arc<SubscriberRegistry>,
    pipelines: PipelineBuilder,
    transforms: Arc<TransformRegistry>,
    policies: Arc<PolicyRegistry>,
    mediator: Arc<OutboxMediator>,
    scheduler: Arc<dyn Scheduler>,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CommandProcessor {
    /// Start building a processor.
    pub fn builder() -> CommandProcessorBuilder {
        CommandProcessorBuilder::new()
    }

    fn context(&self) -> DispatchContext {
        DispatchContext::new(self.policies.clone())
    }

    // =========================================================================
    // Send / Publish
    // =========================================================================

    /// Dispatch a command through its single registered handler chain.
    pub async fn send<R: Request>(&self, request: R) -> Result<()> {
        self.send_dyn(&request).await
    }

    /// Type-erased [`send`](Self::send); used by pumps and the scheduler.
    pub async fn send_dyn(&self, request: &dyn AnyRequest) -> Result<()> {
        let type_id = request.request_type_id();
        let subscription = self.subscribers.lookup(type_id).ok_or_else(|| {
            CapstanError::configuration(format!(
                "no handler registered for {}",
                request.request_type_name()
            ))
        })?;
        if subscription.multiplicity != Multiplicity::One {
            return Err(CapstanError::configuration(format!(
                "{} is registered for publish, not send",
                subscription.type_name
            ))
            .into());
        }

        let chain = self
            .pipelines
            .build(type_id, 0, &subscription.handlers[0])?;
        debug!(
            request_id = request.request_id(),
            handler = chain.name(),
            "sending request"
        );
        chain.run(request, &self.context()).await
    }

    /// Fan-out dispatch: run every registered chain for the request type.
    ///
    /// All chains run even when earlier ones fail; failures come back as a
    /// single aggregate error.
    pub async fn publish<R: Request>(&self, request: R) -> Result<()> {
        self.publish_dyn(&request).await
    }

    /// Type-erased [`publish`](Self::publish).
    pub async fn publish_dyn(&self, request: &dyn AnyRequest) -> Result<()> {
        let type_id = request.request_type_id();
        let subscription = match self.subscribers.lookup(type_id) {
            // Zero registered handlers is a legal publish.
            None => return Ok(()),
            Some(subscription) => subscription,
        };
        if subscription.multiplicity != Multiplicity::Many {
            return Err(CapstanError::configuration(format!(
                "{} is registered for send, not publish",
                subscription.type_name
            ))
            .into());
        }

        let ctx = self.context();
        let mut errors: Vec<anyhow::Error> = Vec::new();
        for (slot, registration) in subscription.handlers.iter().enumerate() {
            let outcome = match self.pipelines.build(type_id, slot, registration) {
                Ok(chain) => chain.run(request, &ctx).await,
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                warn!(
                    request_id = request.request_id(),
                    handler = registration.name,
                    error = %e,
                    "publish chain failed"
                );
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CapstanError::Aggregate { errors }.into())
        }
    }

    // =========================================================================
    // Post / outbox
    // =========================================================================

    /// Wrap the request into a message, deposit it in the outbox and
    /// trigger dispatch. Returns the message id.
    ///
    /// A failed dispatch does not fail the call: once the outbox row is
    /// persisted, the sweep guarantees eventual delivery.
    pub async fn post<R: Request>(&self, request: R) -> Result<String> {
        self.post_dyn(&request).await
    }

    /// Type-erased [`post`](Self::post).
    pub async fn post_dyn(&self, request: &dyn AnyRequest) -> Result<String> {
        let message = self.wrap_request(request)?;
        self.mediator.deposit_and_clear(message).await
    }

    /// Stage a request into the outbox without dispatching. Returns the
    /// message id.
    ///
    /// With a transaction scope the entry becomes visible only when the
    /// caller commits; dispatch happens through [`clear_outbox`]
    /// (Self::clear_outbox) or the background sweep.
    pub async fn deposit_post<R: Request>(
        &self,
        request: R,
        txn: Option<&dyn TransactionScope>,
    ) -> Result<String> {
        self.deposit_post_dyn(&request, txn).await
    }

    /// Type-erased [`deposit_post`](Self::deposit_post).
    pub async fn deposit_post_dyn(
        &self,
        request: &dyn AnyRequest,
        txn: Option<&dyn TransactionScope>,
    ) -> Result<String> {
        let message = self.wrap_request(request)?;
        self.mediator.deposit(message, txn).await
    }

    /// Force dispatch of specific staged messages, in order.
    pub async fn clear_outbox(&self, message_ids: &[String]) -> Result<()> {
        self.mediator.clear(message_ids).await
    }

    /// Force dispatch of everything outstanding older than `older_than`.
    /// Returns the number of messages dispatched.
    pub async fn clear_outstanding(&self, older_than: Duration) -> Result<usize> {
        self.mediator.clear_outstanding(older_than).await
    }

    // =========================================================================
    // Transform access
    // =========================================================================

    /// Wrap a request into its on-wire message via the cached wrap
    /// pipeline.
    pub fn wrap_request(&self, request: &dyn AnyRequest) -> Result<Message> {
        let pipeline = self.transforms.wrap_pipeline(request.request_type_id())?;
        pipeline.wrap(request)
    }

    /// Unwrap a message back into a request via the cached unwrap pipeline
    /// for the given request type. Used by pumps.
    pub fn unwrap_message(&self, type_id: TypeId, message: &Message) -> Result<Box<dyn AnyRequest>> {
        let pipeline = self.transforms.unwrap_pipeline(type_id)?;
        pipeline.unwrap(message)
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    async fn schedule(
        &self,
        dispatch: ScheduledDispatch,
        request: StoredRequest,
        when: DateTime<Utc>,
    ) -> Result<String> {
        self.scheduler
            .schedule(dispatch, request, when)
            .await
            .map_err(|e| {
                CapstanError::ScheduleFailed {
                    message: e.to_string(),
                }
                .into()
            })
    }

    /// Send a command at an absolute time.
    pub async fn send_at<R: Request>(&self, request: R, when: DateTime<Utc>) -> Result<String> {
        self.schedule(ScheduledDispatch::Send, StoredRequest::Boxed(Box::new(request)), when)
            .await
    }

    /// Send a command after a delay.
    pub async fn send_after<R: Request>(&self, request: R, delay: Duration) -> Result<String> {
        self.send_at(request, Self::due(delay)?).await
    }

    /// Publish an event at an absolute time.
    pub async fn publish_at<R: Request>(&self, request: R, when: DateTime<Utc>) -> Result<String> {
        self.schedule(
            ScheduledDispatch::Publish,
            StoredRequest::Boxed(Box::new(request)),
            when,
        )
        .await
    }

    /// Publish an event after a delay.
    pub async fn publish_after<R: Request>(&self, request: R, delay: Duration) -> Result<String> {
        self.publish_at(request, Self::due(delay)?).await
    }

    /// Post a request through the outbox at an absolute time.
    pub async fn post_at<R: Request>(&self, request: R, when: DateTime<Utc>) -> Result<String> {
        self.schedule(ScheduledDispatch::Post, StoredRequest::Boxed(Box::new(request)), when)
            .await
    }

    /// Post a request through the outbox after a delay.
    pub async fn post_after<R: Request>(&self, request: R, delay: Duration) -> Result<String> {
        self.post_at(request, Self::due(delay)?).await
    }

    /// Move a pending schedule to a new due time.
    pub async fn reschedule(&self, schedule_id: &str, when: DateTime<Utc>) -> Result<bool> {
        self.scheduler.reschedule(schedule_id, when).await
    }

    /// Cancel a pending schedule. Idempotent.
    pub async fn cancel_schedule(&self, schedule_id: &str) -> Result<bool> {
        self.scheduler.cancel(schedule_id).await
    }

    fn due(delay: Duration) -> Result<DateTime<Utc>> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| CapstanError::ScheduleFailed {
                message: format!("delay out of range: {e}"),
            })?;
        Ok(Utc::now() + delay)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Release the processor's background resources: stops the outbox
    /// sweeper. Explicit, not tied to drop order.
    pub fn teardown(&self) {
        info!("command processor tearing down");
        self.cancel.cancel();
        if let Some(handle) = self.sweeper.lock().expect("sweeper handle poisoned").take() {
            handle.abort();
        }
    }

    /// The mediator's outbox, for assertions and operational tooling.
    pub fn outbox(&self) -> Arc<dyn Outbox> {
        self.mediator.outbox().clone()
    }

    /// Drop cached pipeline descriptions and transform pipelines. For
    /// tests.
    pub fn clear_pipeline_caches(&self) {
        self.pipelines.clear_cache();
        self.transforms.clear_cache();
    }
}

impl std::fmt::Debug for CommandProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("subscribers", &self.subscribers)
            .field("mediator", &self.mediator)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Fluent registration of handlers, mappers, producers, policies and the
/// scheduler backend.
pub struct CommandProcessorBuilder {
    subscribers: SubscriberRegistry,
    transforms: TransformRegistry,
    producers: ProducerRegistry,
    policies: PolicyRegistry,
    rehydrators: RequestRehydrators,
    outbox: Option<Arc<dyn Outbox>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    mediator_config: MediatorConfig,
    run_sweeper: bool,
}

impl CommandProcessorBuilder {
    /// A builder with default policies, an in-memory outbox and an
    /// in-memory scheduler.
    pub fn new() -> Self {
        Self {
            subscribers: SubscriberRegistry::new(),
            transforms: TransformRegistry::new(),
            producers: ProducerRegistry::new(),
            policies: PolicyRegistry::with_defaults(),
            rehydrators: RequestRehydrators::new(),
            outbox: None,
            scheduler: None,
            mediator_config: MediatorConfig::default(),
            run_sweeper: true,
        }
    }

    /// Register the single handler for a command type.
    ///
    /// # Panics
    ///
    /// Panics if the type already has a handler. Use
    /// [`try_with_command`](Self::try_with_command) for the non-panicking
    /// form.
    pub fn with_command<R: Request>(self, registration: HandlerRegistration) -> Self {
        self.try_with_command::<R>(registration)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    /// Non-panicking [`with_command`](Self::with_command).
    pub fn try_with_command<R: Request>(
        mut self,
        registration: HandlerRegistration,
    ) -> Result<Self> {
        self.subscribers.register_command::<R>(registration)?;
        Ok(self)
    }

    /// Register an additional fan-out handler for an event or document
    /// type.
    ///
    /// # Panics
    ///
    /// Panics if the type was registered as a command.
    pub fn with_event<R: Request>(self, registration: HandlerRegistration) -> Self {
        self.try_with_event::<R>(registration)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    /// Non-panicking [`with_event`](Self::with_event).
    pub fn try_with_event<R: Request>(
        mut self,
        registration: HandlerRegistration,
    ) -> Result<Self> {
        self.subscribers.register_event::<R>(registration)?;
        Ok(self)
    }

    /// Register the message mapper (and its transforms) for a request
    /// type.
    pub fn with_mapper<R: Request>(mut self, registration: MapperRegistration) -> Self {
        self.transforms.register::<R>(registration);
        self
    }

    /// Bind a producer to a routing key.
    pub fn with_producer(
        mut self,
        topic: impl Into<String>,
        producer: Arc<dyn MessageProducer>,
    ) -> Self {
        self.producers.register(topic, producer);
        self
    }

    /// Register a resilience policy under a name.
    pub fn with_policy(
        mut self,
        name: impl Into<String>,
        policy: Arc<dyn crate::policy::ResiliencePolicy>,
    ) -> Self {
        self.policies.register(name, policy);
        self
    }

    /// Use a specific outbox binding instead of the in-memory default.
    pub fn with_outbox(mut self, outbox: Arc<dyn Outbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Use a specific scheduler backend instead of the in-memory default.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Register a request type for durable-scheduler rehydration.
    pub fn with_scheduled_request<R>(mut self, request_type: impl Into<String>) -> Self
    where
        R: Request + serde::de::DeserializeOwned,
    {
        self.rehydrators.register::<R>(request_type);
        self
    }

    /// Tune the mediator and its background sweep.
    pub fn with_mediator_config(mut self, config: MediatorConfig) -> Self {
        self.mediator_config = config;
        self
    }

    /// Disable the background sweeper (tests that drive clears manually).
    pub fn without_sweeper(mut self) -> Self {
        self.run_sweeper = false;
        self
    }

    /// Assemble the processor.
    ///
    /// Registers the scheduler fire handler, binds the scheduler context
    /// and starts the outbox sweeper (when a tokio runtime is present).
    pub fn build(mut self) -> Arc<CommandProcessor> {
        // The scheduler's fire wrapper dispatches like any other command.
        let scheduler_context = Arc::new(SchedulerContext::new(Arc::new(self.rehydrators)));
        let fire_context = scheduler_context.clone();
        self.subscribers
            .register_command::<FireSchedulerRequest>(
                HandlerRegistration::for_handler::<FireSchedulerRequest, _>(
                    "FireSchedulerHandler",
                    move || FireSchedulerHandler::new(fire_context.clone()),
                ),
            )
            .expect("FireSchedulerRequest is registered by the builder alone");

        let outbox = self
            .outbox
            .unwrap_or_else(|| Arc::new(InMemoryOutbox::new()));
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(InMemoryScheduler::new()));
        let policies = Arc::new(self.policies);

        let mediator = Arc::new(OutboxMediator::new(
            outbox,
            Arc::new(self.producers),
            &policies,
            self.mediator_config,
        ));

        let cancel = CancellationToken::new();
        let sweeper = if self.run_sweeper {
            match tokio::runtime::Handle::try_current() {
                Ok(_) => Some(mediator.spawn_sweeper(cancel.clone())),
                Err(_) => {
                    debug!("no tokio runtime at build, sweeper not started");
                    None
                }
            }
        } else {
            None
        };

        let processor = Arc::new(CommandProcessor {
            subscribers: Arc::new(self.subscribers),
            pipelines: PipelineBuilder::new(),
            transforms: Arc::new(self.transforms),
            policies,
            mediator,
            scheduler: scheduler.clone(),
            cancel,
            sweeper: Mutex::new(sweeper),
        });

        scheduler_context.bind(&processor);
        scheduler.bind(scheduler_context);

        processor
    }
}

impl Default for CommandProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
