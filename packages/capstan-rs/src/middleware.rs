//! Built-in handler middleware.
//!
//! These are the links a registration typically declares around its user
//! handler: request logging, policy-wrapped execution, once-only inbox
//! interception, request validation and fallback.
//!
//! Each is an ordinary [`Middleware`]; declare them on a registration with
//! a [`MiddlewareDescriptor`](crate::handler::MiddlewareDescriptor) naming
//! the step and timing.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::CapstanError;
use crate::handler::{DispatchContext, Middleware, Next};
use crate::inbox::Inbox;
use crate::policy::PolicyAction;
use crate::request::AnyRequest;

// =============================================================================
// Logging
// =============================================================================

/// Logs each request entering and leaving the chain.
pub struct RequestLoggingMiddleware {
    handler_name: &'static str,
}

impl RequestLoggingMiddleware {
    /// A logger tagged with the wrapped handler's name.
    pub fn new(handler_name: &'static str) -> Self {
        Self { handler_name }
    }
}

#[async_trait]
impl Middleware for RequestLoggingMiddleware {
    async fn call<'a>(
        &self,
        request: &'a dyn AnyRequest,
        ctx: &'a DispatchContext,
        next: Next<'a>,
    ) -> Result<()> {
        debug!(
            handler = self.handler_name,
            request_id = request.request_id(),
            kind = %request.kind(),
            "handling request"
        );
        let result = next.run(request, ctx).await;
        match &result {
            Ok(()) => debug!(
                handler = self.handler_name,
                request_id = request.request_id(),
                "request handled"
            ),
            Err(e) => warn!(
                handler = self.handler_name,
                request_id = request.request_id(),
                error = %e,
                "request failed"
            ),
        }
        result
    }
}

// =============================================================================
// Policy
// =============================================================================

/// Runs the rest of the chain under a named resilience policy.
///
/// The policy is resolved from the context's registry at call time, so the
/// same registration works against different policy configurations.
pub struct PolicyMiddleware {
    policy_name: &'static str,
}

impl PolicyMiddleware {
    /// Wrap the chain in the named policy.
    pub fn new(policy_name: &'static str) -> Self {
        Self { policy_name }
    }
}

#[async_trait]
impl Middleware for PolicyMiddleware {
    async fn call<'a>(
        &self,
        request: &'a dyn AnyRequest,
        ctx: &'a DispatchContext,
        next: Next<'a>,
    ) -> Result<()> {
        let policy = ctx.policies().lookup(self.policy_name).ok_or_else(|| {
            CapstanError::configuration(format!(
                "no policy registered under {}",
                self.policy_name
            ))
        })?;

        let action: PolicyAction<'a> = Box::new(move || next.run(request, ctx));
        policy.execute(action).await
    }
}

// =============================================================================
// Once-only inbox
// =============================================================================

/// What the inbox interceptor does when a request id was already handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDuplicate {
    /// Raise [`CapstanError::OnceOnlyViolation`].
    Throw,
    /// Log a warning and skip the rest of the chain.
    Warn,
    /// Silently skip the rest of the chain.
    Skip,
}

/// Records request ids in an inbox and short-circuits duplicates.
///
/// New requests are recorded before the chain continues; duplicates are
/// handled according to the configured [`OnDuplicate`] action.
pub struct InboxMiddleware {
    inbox: Arc<dyn Inbox>,
    context_key: String,
    on_duplicate: OnDuplicate,
}

impl InboxMiddleware {
    /// An interceptor scoped to `context_key`.
    pub fn new(inbox: Arc<dyn Inbox>, context_key: impl Into<String>) -> Self {
        Self {
            inbox,
            context_key: context_key.into(),
            on_duplicate: OnDuplicate::Warn,
        }
    }

    /// Override the duplicate action.
    pub fn with_on_duplicate(mut self, action: OnDuplicate) -> Self {
        self.on_duplicate = action;
        self
    }
}

#[async_trait]
impl Middleware for InboxMiddleware {
    async fn call<'a>(
        &self,
        request: &'a dyn AnyRequest,
        ctx: &'a DispatchContext,
        next: Next<'a>,
    ) -> Result<()> {
        if self
            .inbox
            .exists(request.request_id(), &self.context_key)
            .await?
        {
            return match self.on_duplicate {
                OnDuplicate::Throw => Err(CapstanError::OnceOnlyViolation {
                    request_id: request.request_id().to_string(),
                    context_key: self.context_key.clone(),
                }
                .into()),
                OnDuplicate::Warn => {
                    warn!(
                        request_id = request.request_id(),
                        context_key = %self.context_key,
                        "duplicate request skipped"
                    );
                    Ok(())
                }
                OnDuplicate::Skip => Ok(()),
            };
        }

        let body = request.to_json().unwrap_or(serde_json::Value::Null);
        self.inbox
            .add(request.request_id(), &self.context_key, body, None)
            .await?;

        next.run(request, ctx).await
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Validates the request before the chain continues.
pub struct ValidationMiddleware {
    validator: Arc<dyn Fn(&dyn AnyRequest) -> Result<()> + Send + Sync>,
}

impl ValidationMiddleware {
    /// A validator over the erased request.
    pub fn new(validator: impl Fn(&dyn AnyRequest) -> Result<()> + Send + Sync + 'static) -> Self {
        Self {
            validator: Arc::new(validator),
        }
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    async fn call<'a>(
        &self,
        request: &'a dyn AnyRequest,
        ctx: &'a DispatchContext,
        next: Next<'a>,
    ) -> Result<()> {
        (self.validator)(request)?;
        next.run(request, ctx).await
    }
}

// =============================================================================
// Fallback
// =============================================================================

/// Catches chain failures and runs a fallback action instead of
/// propagating.
///
/// Defer requests pass through untouched - they are control flow for the
/// pump, not failures a fallback should swallow.
pub struct FallbackMiddleware {
    fallback: Arc<dyn Fn(&dyn AnyRequest, &anyhow::Error) + Send + Sync>,
}

impl FallbackMiddleware {
    /// A fallback invoked with the request and the failure.
    pub fn new(fallback: impl Fn(&dyn AnyRequest, &anyhow::Error) + Send + Sync + 'static) -> Self {
        Self {
            fallback: Arc::new(fallback),
        }
    }
}

#[async_trait]
impl Middleware for FallbackMiddleware {
    async fn call<'a>(
        &self,
        request: &'a dyn AnyRequest,
        ctx: &'a DispatchContext,
        next: Next<'a>,
    ) -> Result<()> {
        match next.run(request, ctx).await {
            Ok(()) => Ok(()),
            Err(e)
                if matches!(
                    e.downcast_ref::<CapstanError>(),
                    Some(CapstanError::DeferMessage { .. })
                ) =>
            {
                Err(e)
            }
            Err(e) => {
                warn!(
                    request_id = request.request_id(),
                    error = %e,
                    "handler failed, running fallback"
                );
                (self.fallback)(request, &e);
                Ok(())
            }
        }
    }
}
