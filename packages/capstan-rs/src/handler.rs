//! Handler pipelines: user handlers composed with declared middleware.
//!
//! For each request type the subscriber registry holds one or more
//! [`HandlerRegistration`]s. A registration names the user handler, a
//! factory that instantiates it, and a set of [`MiddlewareDescriptor`]s
//! declaring `(step, timing)` ordering metadata plus a middleware factory.
//!
//! The [`PipelineBuilder`] turns a registration into a [`HandlerChain`]:
//!
//! ```text
//! Before middleware (step ascending)
//!     └─► After middleware (post-logic runs step descending)
//!             └─► user handler
//! ```
//!
//! Chains are built **per request** - handlers may be stateful per call -
//! but the builder caches the validated chain *description* (the sorted
//! link order), so repeated dispatches of the same type skip validation.
//! Given identical registrations the resulting chain is identical across
//! builds.
//!
//! Middleware are decorators: each link receives the request, the dispatch
//! context and a [`Next`] continuation. A link that never calls `next`
//! short-circuits the chain (the once-only inbox interceptor does exactly
//! that for duplicates).

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use smallvec::SmallVec;
use std::any::TypeId;
use std::collections::HashMap;

use crate::error::CapstanError;
use crate::policy::PolicyRegistry;
use crate::request::{AnyRequest, Request};

/// Whether a middleware's ordering slot is before or after the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTiming {
    /// Runs its logic on the way in; ordered by step ascending.
    Before,
    /// Runs its logic on the way out; ordered by step descending.
    After,
}

/// Context passed to every chain link.
///
/// Narrow on purpose: links get the policy registry for named-policy
/// resolution and a request-scoped bag for passing values between steps.
pub struct DispatchContext {
    policies: Arc<PolicyRegistry>,
    bag: Mutex<HashMap<String, serde_json::Value>>,
}

impl DispatchContext {
    /// Create a context backed by the given policy registry.
    pub fn new(policies: Arc<PolicyRegistry>) -> Self {
        Self {
            policies,
            bag: Mutex::new(HashMap::new()),
        }
    }

    /// The named-policy registry.
    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    /// Stash a value for later steps in this dispatch.
    pub fn set_bag(&self, key: impl Into<String>, value: serde_json::Value) {
        self.bag
            .lock()
            .expect("context bag poisoned")
            .insert(key.into(), value);
    }

    /// Read a value stashed by an earlier step.
    pub fn get_bag(&self, key: &str) -> Option<serde_json::Value> {
        self.bag
            .lock()
            .expect("context bag poisoned")
            .get(key)
            .cloned()
    }
}

/// A type-erased chain link target: the user handler.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle the request.
    async fn handle(&self, request: &dyn AnyRequest, ctx: &DispatchContext) -> Result<()>;
}

/// A typed user handler for requests of type `R`.
///
/// # Example
///
/// ```ignore
/// struct GreetingHandler;
///
/// #[async_trait]
/// impl RequestHandler<GreetingMade> for GreetingHandler {
///     async fn handle(&self, request: &GreetingMade, _ctx: &DispatchContext) -> Result<()> {
///         println!("{}", request.greeting);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait RequestHandler<R: Request>: Send + Sync + 'static {
    /// Handle the typed request.
    async fn handle(&self, request: &R, ctx: &DispatchContext) -> Result<()>;
}

/// Adapts a typed [`RequestHandler`] to the erased [`Handler`] shape.
pub struct HandlerAdapter<R, H> {
    inner: H,
    _marker: std::marker::PhantomData<fn(R)>,
}

impl<R, H> HandlerAdapter<R, H> {
    /// Wrap a typed handler.
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<R, H> Handler for HandlerAdapter<R, H>
where
    R: Request,
    H: RequestHandler<R>,
{
    async fn handle(&self, request: &dyn AnyRequest, ctx: &DispatchContext) -> Result<()> {
        let typed = request.as_any().downcast_ref::<R>().ok_or_else(|| {
            CapstanError::configuration(format!(
                "handler for {} received a {}",
                std::any::type_name::<R>(),
                request.request_type_name()
            ))
        })?;
        self.inner.handle(typed, ctx).await
    }
}

/// The continuation handed to middleware: the rest of the chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a HandlerChain,
    index: usize,
}

impl<'a> Next<'a> {
    /// Run the remainder of the chain.
    pub fn run(
        self,
        request: &'a dyn AnyRequest,
        ctx: &'a DispatchContext,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match self.chain.links.get(self.index) {
                Some(link) => {
                    link.call(
                        request,
                        ctx,
                        Next {
                            chain: self.chain,
                            index: self.index + 1,
                        },
                    )
                    .await
                }
                None => self.chain.target.handle(request, ctx).await,
            }
        })
    }
}

/// A decorating chain link.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Process the request, delegating to `next` for the rest of the chain.
    async fn call<'a>(
        &self,
        request: &'a dyn AnyRequest,
        ctx: &'a DispatchContext,
        next: Next<'a>,
    ) -> Result<()>;
}

type MiddlewareFactory = Arc<dyn Fn() -> Result<Arc<dyn Middleware>> + Send + Sync>;
type HandlerFactory = Arc<dyn Fn() -> Result<Arc<dyn Handler>> + Send + Sync>;

/// Declares one middleware on a handler registration: ordering metadata
/// plus the factory that instantiates the link.
#[derive(Clone)]
pub struct MiddlewareDescriptor {
    /// Ordering index within the timing group.
    pub step: u32,
    /// Before or after the handler.
    pub timing: StepTiming,
    factory: MiddlewareFactory,
}

impl MiddlewareDescriptor {
    /// Declare a middleware at the given slot.
    pub fn new(
        step: u32,
        timing: StepTiming,
        factory: impl Fn() -> Result<Arc<dyn Middleware>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            step,
            timing,
            factory: Arc::new(factory),
        }
    }
}

/// One handler subscribed to a request type, with its declared middleware.
#[derive(Clone)]
pub struct HandlerRegistration {
    /// Display name, used in logs and test assertions.
    pub name: &'static str,
    factory: HandlerFactory,
    middleware: Vec<MiddlewareDescriptor>,
}

impl HandlerRegistration {
    /// Register an erased handler factory.
    pub fn new(
        name: &'static str,
        factory: impl Fn() -> Result<Arc<dyn Handler>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            factory: Arc::new(factory),
            middleware: Vec::new(),
        }
    }

    /// Register a typed handler factory.
    pub fn for_handler<R, H>(
        name: &'static str,
        factory: impl Fn() -> H + Send + Sync + 'static,
    ) -> Self
    where
        R: Request,
        H: RequestHandler<R>,
    {
        Self::new(name, move || {
            Ok(Arc::new(HandlerAdapter::<R, H>::new(factory())) as Arc<dyn Handler>)
        })
    }

    /// Declare a middleware on this handler.
    pub fn with_middleware(mut self, descriptor: MiddlewareDescriptor) -> Self {
        self.middleware.push(descriptor);
        self
    }

    /// The declared middleware, in declaration order.
    pub fn middleware(&self) -> &[MiddlewareDescriptor] {
        &self.middleware
    }
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("name", &self.name)
            .field("middleware_count", &self.middleware.len())
            .finish()
    }
}

/// A fully instantiated pipeline: middleware links around a user handler.
pub struct HandlerChain {
    links: SmallVec<[Arc<dyn Middleware>; 4]>,
    target: Arc<dyn Handler>,
    name: &'static str,
}

impl std::fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerChain")
            .field("name", &self.name)
            .field("links_count", &self.links.len())
            .finish()
    }
}

impl HandlerChain {
    /// The registration name this chain was built from.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Drive the request through the chain.
    pub async fn run(&self, request: &dyn AnyRequest, ctx: &DispatchContext) -> Result<()> {
        Next {
            chain: self,
            index: 0,
        }
        .run(request, ctx)
        .await
    }
}

/// The validated link order for one registration: indices into the
/// registration's declared middleware.
type ChainPlan = Vec<usize>;

/// Builds handler chains, caching validated chain descriptions per request
/// type.
///
/// The cache is a lock-free compute-if-absent map shared across concurrent
/// callers; `clear_cache` exists for tests.
#[derive(Default)]
pub struct PipelineBuilder {
    plans: DashMap<(TypeId, usize), Arc<ChainPlan>>,
}

impl PipelineBuilder {
    /// An empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a fresh chain for one registration of `type_id`.
    ///
    /// `slot` is the registration's position within its subscription, used
    /// to key the description cache.
    pub fn build(
        &self,
        type_id: TypeId,
        slot: usize,
        registration: &HandlerRegistration,
    ) -> Result<HandlerChain> {
        let plan = match self.plans.get(&(type_id, slot)) {
            Some(plan) => plan.clone(),
            None => {
                let plan = Arc::new(Self::plan(registration)?);
                self.plans.insert((type_id, slot), plan.clone());
                plan
            }
        };

        let mut links = SmallVec::with_capacity(plan.len());
        for &index in plan.iter() {
            let link = (registration.middleware[index].factory)().map_err(|e| {
                CapstanError::configuration(format!(
                    "middleware factory for {} failed: {e}",
                    registration.name
                ))
            })?;
            links.push(link);
        }

        let target = (registration.factory)().map_err(|e| {
            CapstanError::configuration(format!(
                "handler factory for {} failed: {e}",
                registration.name
            ))
        })?;

        Ok(HandlerChain {
            links,
            target,
            name: registration.name,
        })
    }

    /// Validate and order a registration's middleware.
    ///
    /// Before links sort by step ascending; after links are nested inside
    /// them ascending too, which makes their post-logic run in descending
    /// step order. Ties keep declaration order; a duplicate step within one
    /// timing group is a configuration error.
    fn plan(registration: &HandlerRegistration) -> Result<ChainPlan> {
        let mut before: Vec<usize> = Vec::new();
        let mut after: Vec<usize> = Vec::new();

        for (index, descriptor) in registration.middleware.iter().enumerate() {
            let group = match descriptor.timing {
                StepTiming::Before => &mut before,
                StepTiming::After => &mut after,
            };
            if group
                .iter()
                .any(|&i| registration.middleware[i].step == descriptor.step)
            {
                return Err(CapstanError::configuration(format!(
                    "duplicate middleware step {} ({:?}) on {}",
                    descriptor.step, descriptor.timing, registration.name
                ))
                .into());
            }
            group.push(index);
        }

        // Stable sort keeps declaration order for distinct descriptors that
        // compare equal after validation.
        before.sort_by_key(|&i| registration.middleware[i].step);
        after.sort_by_key(|&i| registration.middleware[i].step);

        before.extend(after);
        Ok(before)
    }

    /// Drop all cached chain descriptions.
    pub fn clear_cache(&self) {
        self.plans.clear();
    }

    /// Number of cached descriptions.
    pub fn cached_plans(&self) -> usize {
        self.plans.len()
    }
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("cached_plans", &self.plans.len())
            .finish()
    }
}
