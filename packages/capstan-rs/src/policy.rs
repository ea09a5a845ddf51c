//! Named resilience policies: retry and circuit-breaker.
//!
//! A [`ResiliencePolicy`] is an opaque "execute this action under this
//! policy" combinator. Policies are registered under well-known names in a
//! [`PolicyRegistry`] and resolved by middleware and the outbox mediator.
//!
//! The action is a factory: each attempt calls it again for a fresh future,
//! so retry policies can re-run the same operation.
//!
//! # Composition
//!
//! The blessed composition is retry **inside** circuit-breaker, so a whole
//! retry burst counts as a single call against the breaker. The outbox
//! mediator enforces this rather than trusting callers; see the mediator
//! module.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::CapstanError;

/// Well-known policy registry keys.
pub mod policy_names {
    /// Blocking-form retry policy.
    pub const RETRY_POLICY: &str = "RETRYPOLICY";
    /// Cooperative-form retry policy.
    pub const RETRY_POLICY_ASYNC: &str = "RETRYPOLICYASYNC";
    /// Blocking-form circuit breaker.
    pub const CIRCUIT_BREAKER: &str = "CIRCUITBREAKER";
    /// Cooperative-form circuit breaker.
    pub const CIRCUIT_BREAKER_ASYNC: &str = "CIRCUITBREAKERASYNC";
}

/// An action a policy can run and re-run. Every call produces a fresh
/// attempt future.
pub type PolicyAction<'a> = Box<dyn Fn() -> BoxFuture<'a, Result<()>> + Send + Sync + 'a>;

/// An opaque retry/circuit-breaker combinator.
#[async_trait]
pub trait ResiliencePolicy: Send + Sync {
    /// Execute the action under this policy.
    async fn execute<'a>(&self, action: PolicyAction<'a>) -> Result<()>;
}

// =============================================================================
// Retry
// =============================================================================

/// Bounded-attempt retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: u32,
}

impl RetryPolicy {
    /// A retry policy with the given attempt bound and base backoff delay.
    ///
    /// Attempt `n` (1-based) failing sleeps `base_delay * multiplier^(n-1)`
    /// before the next attempt.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier: 2,
        }
    }

    /// Override the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier.max(1);
        self
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(50))
    }
}

#[async_trait]
impl ResiliencePolicy for RetryPolicy {
    async fn execute<'a>(&self, action: PolicyAction<'a>) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match action().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// =============================================================================
// Circuit breaker
// =============================================================================

#[derive(Debug)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { until: DateTime<Utc> },
    HalfOpen,
}

/// Process-local circuit breaker.
///
/// Opens after `failure_threshold` consecutive failures, rejects calls for
/// `cooldown`, then allows a single probe (half-open). A successful probe
/// closes the breaker; a failed probe re-opens it.
///
/// State is shared by every clone holder, so all pumps sending through the
/// same producer observe one breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// A breaker that opens after `failure_threshold` consecutive failures
    /// and stays open for `cooldown`.
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Whether the breaker currently rejects calls.
    pub fn is_open(&self) -> bool {
        let state = self.state.lock().expect("breaker state poisoned");
        matches!(&*state, BreakerState::Open { until } if Utc::now() < *until)
    }

    /// Gate a call: returns an error if the breaker is open, flips to
    /// half-open when the cooldown has elapsed.
    fn check(&self) -> Result<()> {
        let mut state = self.state.lock().expect("breaker state poisoned");
        if let BreakerState::Open { until } = &*state {
            if Utc::now() < *until {
                return Err(CapstanError::circuit_open(format!(
                    "circuit open until {until}"
                ))
                .into());
            }
            debug!("circuit half-open, allowing probe");
            *state = BreakerState::HalfOpen;
        }
        Ok(())
    }

    fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker state poisoned");
        *state = BreakerState::Closed {
            consecutive_failures: 0,
        };
    }

    fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker state poisoned");
        let open = |cooldown: Duration| BreakerState::Open {
            until: Utc::now()
                + chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::zero()),
        };
        match &mut *state {
            BreakerState::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.failure_threshold {
                    warn!(
                        failures = *consecutive_failures,
                        cooldown_ms = self.cooldown.as_millis() as u64,
                        "circuit opened"
                    );
                    *state = open(self.cooldown);
                }
            }
            BreakerState::HalfOpen => {
                warn!("probe failed, circuit re-opened");
                *state = open(self.cooldown);
            }
            BreakerState::Open { .. } => {}
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(30))
    }
}

#[async_trait]
impl ResiliencePolicy for CircuitBreaker {
    async fn execute<'a>(&self, action: PolicyAction<'a>) -> Result<()> {
        self.check()?;
        match action().await {
            Ok(()) => {
                self.record_success();
                Ok(())
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Named policy lookup, keyed by the well-known names in [`policy_names`]
/// plus any user-defined keys.
///
/// Built during startup and read-only afterwards; readers take no locks.
#[derive(Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<dyn ResiliencePolicy>>,
}

impl PolicyRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry seeded with default retry and circuit-breaker policies
    /// under the well-known keys.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let retry: Arc<dyn ResiliencePolicy> = Arc::new(RetryPolicy::default());
        let breaker: Arc<dyn ResiliencePolicy> = Arc::new(CircuitBreaker::default());
        registry.register(policy_names::RETRY_POLICY, retry.clone());
        registry.register(policy_names::RETRY_POLICY_ASYNC, retry);
        registry.register(policy_names::CIRCUIT_BREAKER, breaker.clone());
        registry.register(policy_names::CIRCUIT_BREAKER_ASYNC, breaker);
        registry
    }

    /// Register a policy under a name, replacing any existing entry.
    pub fn register(&mut self, name: impl Into<String>, policy: Arc<dyn ResiliencePolicy>) {
        self.policies.insert(name.into(), policy);
    }

    /// Resolve a policy by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn ResiliencePolicy>> {
        self.policies.get(name).cloned()
    }

    /// Number of registered policies.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl std::fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("names", &self.policies.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failing_action(
        failures: usize,
        counter: Arc<AtomicUsize>,
    ) -> PolicyAction<'static> {
        Box::new(move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Err(anyhow::anyhow!("attempt {n} failed"))
                } else {
                    Ok(())
                }
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retry = RetryPolicy::new(3, Duration::from_millis(1));

        retry
            .execute(failing_action(2, calls.clone()))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_at_bound() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retry = RetryPolicy::new(2, Duration::from_millis(1));

        let result = retry.execute(failing_action(10, calls.clone())).await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retry_backoff_grows() {
        let retry = RetryPolicy::new(4, Duration::from_millis(10));
        assert_eq!(retry.backoff(1), Duration::from_millis(10));
        assert_eq!(retry.backoff(2), Duration::from_millis(20));
        assert_eq!(retry.backoff(3), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_breaker_opens_after_threshold() {
        let calls = Arc::new(AtomicUsize::new(0));
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));

        for _ in 0..2 {
            let _ = breaker.execute(failing_action(100, calls.clone())).await;
        }
        assert!(breaker.is_open());

        // Open breaker rejects without invoking the action.
        let before = calls.load(Ordering::SeqCst);
        let err = breaker
            .execute(failing_action(100, calls.clone()))
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), before);
        assert!(matches!(
            err.downcast_ref::<CapstanError>(),
            Some(CapstanError::ChannelFailure {
                kind: crate::error::ChannelFailureKind::CircuitOpen,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_breaker_closes_after_successful_probe() {
        let calls = Arc::new(AtomicUsize::new(0));
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));

        let _ = breaker.execute(failing_action(1, calls.clone())).await;
        assert!(breaker.is_open());

        tokio::time::sleep(Duration::from_millis(20)).await;

        // Cooldown elapsed: the probe runs and succeeds, closing the breaker.
        breaker
            .execute(failing_action(1, calls.clone()))
            .await
            .unwrap();
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn test_breaker_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let _ = breaker.execute(failing_action(1, calls.clone())).await; // fails
        breaker
            .execute(failing_action(0, Arc::new(AtomicUsize::new(0))))
            .await
            .unwrap(); // succeeds
        let _ = breaker
            .execute(failing_action(1, Arc::new(AtomicUsize::new(0))))
            .await; // fails again, but count was reset

        assert!(!breaker.is_open());
    }

    #[test]
    fn test_registry_defaults_cover_well_known_names() {
        let registry = PolicyRegistry::with_defaults();
        assert!(registry.lookup(policy_names::RETRY_POLICY).is_some());
        assert!(registry.lookup(policy_names::RETRY_POLICY_ASYNC).is_some());
        assert!(registry.lookup(policy_names::CIRCUIT_BREAKER).is_some());
        assert!(registry
            .lookup(policy_names::CIRCUIT_BREAKER_ASYNC)
            .is_some());
        assert!(registry.lookup("CUSTOM").is_none());
    }

    #[test]
    fn test_registry_user_defined_key() {
        let mut registry = PolicyRegistry::new();
        registry.register(
            "AGGRESSIVE",
            Arc::new(RetryPolicy::new(10, Duration::from_millis(1))),
        );
        assert!(registry.lookup("AGGRESSIVE").is_some());
        assert_eq!(registry.len(), 1);
    }
}
