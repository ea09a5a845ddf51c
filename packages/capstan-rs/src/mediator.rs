//! Outbox-producer mediator: deposits, clears and sweeps.
//!
//! The mediator sits between the outbox and the broker producers:
//!
//! 1. **deposit** - persist a message as `Outstanding`, optionally inside
//!    the caller's transaction scope.
//! 2. **clear** - publish staged messages through the producer bound to
//!    their routing key and mark them `Dispatched`.
//! 3. **sweep** - a background task that periodically re-clears anything
//!    outstanding older than a threshold.
//!
//! Every producer send runs under retry nested **inside** a
//! circuit-breaker, so a whole retry burst counts as one call against the
//! breaker. The mediator enforces this composition itself rather than
//! trusting callers. Breaker state is per routing key and process-local,
//! shared by every pump and sweeper sending through that producer.
//!
//! The mediator owns no registries; it borrows producer, policy and outbox
//! references from the processor that builds it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::CapstanError;
use crate::message::Message;
use crate::outbox::{Outbox, OutboxState, TransactionScope};
use crate::policy::{policy_names, CircuitBreaker, PolicyAction, ResiliencePolicy};
use crate::producer::ProducerRegistry;

/// Tuning for the mediator and its background sweep.
#[derive(Debug, Clone)]
pub struct MediatorConfig {
    /// How often the sweeper looks for outstanding messages.
    pub sweep_interval: Duration,
    /// Only messages staged at least this long ago are swept.
    pub sweep_age: Duration,
    /// Maximum messages re-dispatched per sweep.
    pub sweep_batch_size: usize,
    /// Consecutive failures before a producer's breaker opens.
    pub breaker_failure_threshold: u32,
    /// How long an open breaker rejects sends.
    pub breaker_cooldown: Duration,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            sweep_age: Duration::from_secs(30),
            sweep_batch_size: 100,
            breaker_failure_threshold: 3,
            breaker_cooldown: Duration::from_secs(30),
        }
    }
}

/// Atomically persists outbound messages and dispatches them via producers
/// under resilience policies.
pub struct OutboxMediator {
    outbox: Arc<dyn Outbox>,
    producers: Arc<ProducerRegistry>,
    retry: Arc<dyn ResiliencePolicy>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: MediatorConfig,
}

impl OutboxMediator {
    /// Build a mediator over the given outbox and producer bindings.
    ///
    /// The retry policy is resolved from the policy registry under
    /// [`policy_names::RETRY_POLICY_ASYNC`]; circuit breakers are created
    /// per routing key from the config.
    pub fn new(
        outbox: Arc<dyn Outbox>,
        producers: Arc<ProducerRegistry>,
        policies: &crate::policy::PolicyRegistry,
        config: MediatorConfig,
    ) -> Self {
        let retry = policies
            .lookup(policy_names::RETRY_POLICY_ASYNC)
            .unwrap_or_else(|| Arc::new(crate::policy::RetryPolicy::default()));
        Self {
            outbox,
            producers,
            retry,
            breakers: DashMap::new(),
            config,
        }
    }

    /// The outbox this mediator stages into.
    pub fn outbox(&self) -> &Arc<dyn Outbox> {
        &self.outbox
    }

    fn breaker_for(&self, topic: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(topic.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    self.config.breaker_failure_threshold,
                    self.config.breaker_cooldown,
                ))
            })
            .clone()
    }

    // =========================================================================
    // Deposit
    // =========================================================================

    /// Stage a message as `Outstanding`.
    ///
    /// With a transaction scope the entry becomes visible only when the
    /// caller commits; without one the store's single-row atomicity
    /// applies. Returns the message id.
    pub async fn deposit(
        &self,
        message: Message,
        txn: Option<&dyn TransactionScope>,
    ) -> Result<String> {
        let id = message.id().to_string();
        self.outbox.add(message, txn).await?;
        debug!(message_id = %id, "message deposited");
        Ok(id)
    }

    /// Deposit and immediately attempt dispatch.
    ///
    /// A dispatch failure does not fail the call: the entry is committed
    /// and the sweep retries it.
    pub async fn deposit_and_clear(&self, message: Message) -> Result<String> {
        let id = self.deposit(message, None).await?;
        if let Err(e) = self.clear(std::slice::from_ref(&id)).await {
            warn!(message_id = %id, error = %e, "immediate dispatch failed, sweep will retry");
        }
        Ok(id)
    }

    // =========================================================================
    // Clear
    // =========================================================================

    /// Dispatch the given staged messages, in the provided order.
    ///
    /// Per id: absent or already dispatched entries are no-ops; a missing
    /// producer is a configuration error with no retry; an open circuit
    /// surfaces as a channel failure and the entry stays outstanding.
    pub async fn clear(&self, message_ids: &[String]) -> Result<()> {
        for id in message_ids {
            self.clear_one(id).await?;
        }
        Ok(())
    }

    async fn clear_one(&self, message_id: &str) -> Result<()> {
        let entry = match self.outbox.get(message_id).await? {
            None => {
                debug!(message_id, "clear skipped: entry absent");
                return Ok(());
            }
            Some(entry) if entry.state == OutboxState::Dispatched => {
                debug!(message_id, "clear skipped: already dispatched");
                return Ok(());
            }
            Some(entry) => entry,
        };

        let topic = entry.message.header.topic.clone();
        let producer = self.producers.lookup(&topic).ok_or_else(|| {
            CapstanError::configuration(format!("no producer registered for topic {topic}"))
        })?;

        self.outbox.record_attempt(message_id).await?;

        // Retry runs inside the breaker: a full retry burst is one call
        // against the circuit.
        let breaker = self.breaker_for(&topic);
        let retry = self.retry.clone();
        let message = Arc::new(entry.message);
        let cancel = CancellationToken::new();

        let attempt: Arc<dyn Fn() -> futures::future::BoxFuture<'static, Result<()>> + Send + Sync> = {
            let producer = producer.clone();
            let message = message.clone();
            let cancel = cancel.clone();
            Arc::new(move || {
                let producer = producer.clone();
                let message = message.clone();
                let cancel = cancel.clone();
                async move {
                    producer
                        .send(&message, None, &cancel)
                        .await
                        .map(|_provider_id| ())
                }
                .boxed()
            })
        };

        let composed: PolicyAction<'static> = Box::new(move || {
            let retry = retry.clone();
            let attempt = attempt.clone();
            async move {
                let inner: PolicyAction<'static> = Box::new(move || (attempt)());
                retry.execute(inner).await
            }
            .boxed()
        });

        breaker.execute(composed).await.map_err(|e| {
            warn!(message_id, topic = %topic, error = %e, "dispatch failed, entry stays outstanding");
            e
        })?;

        let transitioned = self.outbox.mark_dispatched(message_id, Utc::now()).await?;
        if transitioned {
            debug!(message_id, topic = %topic, "message dispatched");
        }
        Ok(())
    }

    // =========================================================================
    // Sweep
    // =========================================================================

    /// Re-dispatch everything outstanding older than `older_than`.
    ///
    /// Returns how many messages were successfully dispatched. Failures are
    /// logged and left for the next sweep; poison entries keep accumulating
    /// attempt counts in the outbox.
    pub async fn clear_outstanding(&self, older_than: Duration) -> Result<usize> {
        let staged = self
            .outbox
            .outstanding(older_than, self.config.sweep_batch_size)
            .await?;

        let mut dispatched = 0;
        for message in staged {
            match self.clear_one(message.id()).await {
                Ok(()) => dispatched += 1,
                Err(e) => {
                    warn!(message_id = message.id(), error = %e, "sweep dispatch failed");
                }
            }
        }
        Ok(dispatched)
    }

    /// Spawn the background sweep loop.
    ///
    /// Runs until the token is cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mediator = self.clone();
        tokio::spawn(async move {
            info!(
                interval_ms = mediator.config.sweep_interval.as_millis() as u64,
                age_ms = mediator.config.sweep_age.as_millis() as u64,
                "outbox sweeper starting"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(mediator.config.sweep_interval) => {
                        match mediator.clear_outstanding(mediator.config.sweep_age).await {
                            Ok(0) => {}
                            Ok(n) => debug!(count = n, "sweeper re-dispatched messages"),
                            Err(e) => error!(error = %e, "sweep failed"),
                        }
                    }
                }
            }
            info!("outbox sweeper stopped");
        })
    }
}

impl std::fmt::Debug for OutboxMediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxMediator")
            .field("breaker_count", &self.breakers.len())
            .finish_non_exhaustive()
    }
}
