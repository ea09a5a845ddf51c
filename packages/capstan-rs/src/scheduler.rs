//! Deferred request execution.
//!
//! A [`Scheduler`] backend accepts `(request, dispatch kind, when)` and
//! fires at the scheduled moment. Its only obligations are at-least-once
//! firing and idempotent cancel; rescheduling updates the due time.
//!
//! Firings stay oblivious to the processor's internals: the backend wraps
//! the stored request in a [`FireSchedulerRequest`] and hands it to the
//! [`SchedulerContext`] - an explicit context object bound on the
//! processor's lifecycle, not process-wide static state. The context routes
//! the wrapper through the processor like any other command, where the
//! auto-registered [`FireSchedulerHandler`] rehydrates the real request and
//! dispatches it.
//!
//! Scheduled Send and Publish dispatch in-process and do not touch the
//! outbox; scheduled Post goes through the outbox like a direct Post.
//!
//! Durable backends persist `(request type, payload)` pairs and rebuild
//! requests through [`RequestRehydrators`]; the in-memory backend used in
//! tests simply keeps the boxed request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::CapstanError;
use crate::handler::{DispatchContext, RequestHandler};
use crate::processor::CommandProcessor;
use crate::request::{AnyRequest, Request, RequestKind};

/// Which processor operation a scheduled firing invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledDispatch {
    /// Dispatch to the single registered handler.
    Send,
    /// Fan-out dispatch.
    Publish,
    /// Wrap, deposit in the outbox and dispatch.
    Post,
}

/// A request held by a scheduler backend between schedule and fire.
pub enum StoredRequest {
    /// The live request, kept in memory. Used by the in-memory backend.
    Boxed(Box<dyn AnyRequest>),
    /// A serialized request for durable backends; rebuilt through
    /// [`RequestRehydrators`] at fire time.
    Serialized {
        /// Registered rehydrator key.
        request_type: String,
        /// The serialized payload.
        payload: serde_json::Value,
    },
}

impl std::fmt::Debug for StoredRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoredRequest::Boxed(request) => f
                .debug_tuple("Boxed")
                .field(&request.request_type_name())
                .finish(),
            StoredRequest::Serialized { request_type, .. } => f
                .debug_tuple("Serialized")
                .field(request_type)
                .finish(),
        }
    }
}

/// The wrapper request a scheduler firing produces.
///
/// Dispatching the wrapper through the processor keeps the scheduler
/// decoupled: its handler is the only code that knows how to unwrap and
/// re-dispatch the real request.
#[derive(Debug)]
pub struct FireSchedulerRequest {
    /// The schedule that fired.
    pub schedule_id: String,
    /// Which processor operation to invoke.
    pub dispatch: ScheduledDispatch,
    /// The request to dispatch.
    pub request: StoredRequest,
}

impl Request for FireSchedulerRequest {
    fn id(&self) -> &str {
        &self.schedule_id
    }

    fn request_kind(&self) -> RequestKind {
        RequestKind::Command
    }
}

// =============================================================================
// Rehydration
// =============================================================================

type RehydrateFn =
    Box<dyn Fn(&serde_json::Value) -> Result<Box<dyn AnyRequest>> + Send + Sync>;

/// Maps request type keys to deserializers, so durable scheduler backends
/// can rebuild requests from stored payloads.
#[derive(Default)]
pub struct RequestRehydrators {
    rehydrators: HashMap<String, RehydrateFn>,
}

impl RequestRehydrators {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request type under a stable key.
    pub fn register<R>(&mut self, request_type: impl Into<String>)
    where
        R: Request + DeserializeOwned,
    {
        self.rehydrators.insert(
            request_type.into(),
            Box::new(|payload: &serde_json::Value| {
                let request: R = serde_json::from_value(payload.clone())
                    .map_err(|e| CapstanError::mapping(format!("rehydrate failed: {e}")))?;
                Ok(Box::new(request) as Box<dyn AnyRequest>)
            }),
        );
    }

    /// Rebuild a request from its stored form.
    pub fn rehydrate(
        &self,
        request_type: &str,
        payload: &serde_json::Value,
    ) -> Result<Box<dyn AnyRequest>> {
        let rehydrate = self.rehydrators.get(request_type).ok_or_else(|| {
            CapstanError::configuration(format!(
                "no rehydrator registered for request type {request_type}"
            ))
        })?;
        rehydrate(payload)
    }

    /// Whether a key is registered.
    pub fn has(&self, request_type: &str) -> bool {
        self.rehydrators.contains_key(request_type)
    }
}

impl std::fmt::Debug for RequestRehydrators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRehydrators")
            .field("types", &self.rehydrators.keys().collect::<Vec<_>>())
            .finish()
    }
}

// =============================================================================
// Scheduler context
// =============================================================================

/// The explicit bridge between scheduler backends and the processor.
///
/// Created by the processor builder and bound to the processor once it
/// exists; backends receive it through [`Scheduler::bind`]. Holding a weak
/// reference keeps teardown honest: firings after the processor is gone
/// fail instead of keeping it alive.
pub struct SchedulerContext {
    processor: RwLock<Weak<CommandProcessor>>,
    rehydrators: Arc<RequestRehydrators>,
}

impl SchedulerContext {
    /// A context over the given rehydrators, unbound until the processor
    /// exists.
    pub fn new(rehydrators: Arc<RequestRehydrators>) -> Self {
        Self {
            processor: RwLock::new(Weak::new()),
            rehydrators,
        }
    }

    /// Bind the context to a live processor.
    pub fn bind(&self, processor: &Arc<CommandProcessor>) {
        *self.processor.write().expect("scheduler context poisoned") = Arc::downgrade(processor);
    }

    fn processor(&self) -> Result<Arc<CommandProcessor>> {
        self.processor
            .read()
            .expect("scheduler context poisoned")
            .upgrade()
            .ok_or_else(|| {
                CapstanError::configuration("scheduler fired after processor teardown").into()
            })
    }

    /// Route a firing through the processor as a [`FireSchedulerRequest`].
    pub async fn fire(&self, fire: FireSchedulerRequest) -> Result<()> {
        let processor = self.processor()?;
        processor.send_dyn(&fire).await
    }

    /// Dispatch the unwrapped request; used by the fire handler.
    async fn dispatch(&self, dispatch: ScheduledDispatch, request: &dyn AnyRequest) -> Result<()> {
        let processor = self.processor()?;
        match dispatch {
            ScheduledDispatch::Send => processor.send_dyn(request).await,
            ScheduledDispatch::Publish => processor.publish_dyn(request).await,
            ScheduledDispatch::Post => processor.post_dyn(request).await.map(|_| ()),
        }
    }
}

impl std::fmt::Debug for SchedulerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerContext").finish_non_exhaustive()
    }
}

/// Handles [`FireSchedulerRequest`]: rehydrates the stored request and
/// invokes the corresponding processor operation.
pub struct FireSchedulerHandler {
    context: Arc<SchedulerContext>,
}

impl FireSchedulerHandler {
    /// A handler bound to the processor's scheduler context.
    pub fn new(context: Arc<SchedulerContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl RequestHandler<FireSchedulerRequest> for FireSchedulerHandler {
    async fn handle(&self, request: &FireSchedulerRequest, _ctx: &DispatchContext) -> Result<()> {
        debug!(
            schedule_id = %request.schedule_id,
            dispatch = ?request.dispatch,
            "scheduler fired"
        );
        match &request.request {
            StoredRequest::Boxed(inner) => {
                self.context.dispatch(request.dispatch, inner.as_ref()).await
            }
            StoredRequest::Serialized {
                request_type,
                payload,
            } => {
                let inner = self.context.rehydrators.rehydrate(request_type, payload)?;
                self.context.dispatch(request.dispatch, inner.as_ref()).await
            }
        }
    }
}

// =============================================================================
// Scheduler interface
// =============================================================================

/// A backend that fires requests at a scheduled moment.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Receive the context that routes firings into the processor.
    ///
    /// Called once by the processor builder.
    fn bind(&self, context: Arc<SchedulerContext>);

    /// Schedule a request. Returns an opaque schedule id.
    async fn schedule(
        &self,
        dispatch: ScheduledDispatch,
        request: StoredRequest,
        when: DateTime<Utc>,
    ) -> Result<String>;

    /// Move a pending schedule to a new due time.
    ///
    /// Returns `false` if the schedule already fired or was cancelled.
    async fn reschedule(&self, schedule_id: &str, when: DateTime<Utc>) -> Result<bool>;

    /// Cancel a pending schedule. Idempotent: cancelling a fired or
    /// unknown schedule returns `false`.
    async fn cancel(&self, schedule_id: &str) -> Result<bool>;
}

// =============================================================================
// In-memory backend
// =============================================================================

struct ScheduledJob {
    dispatch: ScheduledDispatch,
    request: Option<StoredRequest>,
    timer: Option<JoinHandle<()>>,
}

/// Timer-based scheduler backend for tests and single-process use.
#[derive(Default)]
pub struct InMemoryScheduler {
    context: Arc<RwLock<Option<Arc<SchedulerContext>>>>,
    jobs: Arc<Mutex<HashMap<String, ScheduledJob>>>,
}

impl InMemoryScheduler {
    /// An empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending schedules.
    pub fn pending(&self) -> usize {
        self.jobs.lock().expect("scheduler jobs poisoned").len()
    }

    fn spawn_timer(&self, schedule_id: String, when: DateTime<Utc>) -> JoinHandle<()> {
        let jobs = self.jobs.clone();
        let context = self.context.clone();
        tokio::spawn(async move {
            let delay = (when - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            tokio::time::sleep(delay).await;

            let fire = {
                let mut jobs = jobs.lock().expect("scheduler jobs poisoned");
                match jobs.remove(&schedule_id) {
                    None => return, // cancelled
                    Some(mut job) => match job.request.take() {
                        None => return,
                        Some(request) => FireSchedulerRequest {
                            schedule_id: schedule_id.clone(),
                            dispatch: job.dispatch,
                            request,
                        },
                    },
                }
            };

            let context = context
                .read()
                .expect("scheduler context poisoned")
                .clone();
            match context {
                Some(context) => {
                    if let Err(e) = context.fire(fire).await {
                        error!(schedule_id = %schedule_id, error = %e, "scheduled dispatch failed");
                    }
                }
                None => {
                    warn!(schedule_id = %schedule_id, "scheduler fired before bind, dropping");
                }
            }
        })
    }
}

#[async_trait]
impl Scheduler for InMemoryScheduler {
    fn bind(&self, context: Arc<SchedulerContext>) {
        *self.context.write().expect("scheduler context poisoned") = Some(context);
    }

    async fn schedule(
        &self,
        dispatch: ScheduledDispatch,
        request: StoredRequest,
        when: DateTime<Utc>,
    ) -> Result<String> {
        let schedule_id = Uuid::new_v4().to_string();
        {
            let mut jobs = self.jobs.lock().expect("scheduler jobs poisoned");
            jobs.insert(
                schedule_id.clone(),
                ScheduledJob {
                    dispatch,
                    request: Some(request),
                    timer: None,
                },
            );
        }
        let timer = self.spawn_timer(schedule_id.clone(), when);
        if let Some(job) = self
            .jobs
            .lock()
            .expect("scheduler jobs poisoned")
            .get_mut(&schedule_id)
        {
            job.timer = Some(timer);
        }
        debug!(schedule_id = %schedule_id, %when, ?dispatch, "request scheduled");
        Ok(schedule_id)
    }

    async fn reschedule(&self, schedule_id: &str, when: DateTime<Utc>) -> Result<bool> {
        {
            let mut jobs = self.jobs.lock().expect("scheduler jobs poisoned");
            match jobs.get_mut(schedule_id) {
                None => return Ok(false),
                Some(job) => {
                    if let Some(timer) = job.timer.take() {
                        timer.abort();
                    }
                }
            }
        }
        let timer = self.spawn_timer(schedule_id.to_string(), when);
        let mut jobs = self.jobs.lock().expect("scheduler jobs poisoned");
        match jobs.get_mut(schedule_id) {
            // Lost a race with the old timer firing between locks.
            None => Ok(false),
            Some(job) => {
                job.timer = Some(timer);
                Ok(true)
            }
        }
    }

    async fn cancel(&self, schedule_id: &str) -> Result<bool> {
        let removed = self
            .jobs
            .lock()
            .expect("scheduler jobs poisoned")
            .remove(schedule_id);
        match removed {
            Some(job) => {
                if let Some(timer) = job.timer {
                    timer.abort();
                }
                debug!(schedule_id, "schedule cancelled");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl std::fmt::Debug for InMemoryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}
