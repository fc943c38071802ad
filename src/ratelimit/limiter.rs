//! Core rate limiter implementation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::clock::{offset, Clock, SystemClock};
use super::counter::CounterKey;
use super::identity::{resolve_identity, Identity, RequestMeta};
use super::policy::{FailureMode, Policy, PolicyName, PolicyRegistry};
use super::store::{MemoryWindowStore, StoreError, WindowStore};

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Admissions left in the current window
    pub remaining: u64,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
}

/// Quota state reported without consuming quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaInfo {
    /// Admissions left in the current window
    pub remaining: u64,
    /// When the current window ends, or would end if one started now
    pub reset: DateTime<Utc>,
}

/// Combines the policy registry, identity resolution and a window store into
/// admit/deny decisions.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    registry: PolicyRegistry,
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter with the built-in policies and an in-memory store.
    pub fn new() -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let store = Arc::new(MemoryWindowStore::new(clock.clone()));
        Self::with_store(PolicyRegistry::new(), store, clock)
    }

    /// Create a rate limiter from its parts.
    ///
    /// `clock` should be the same clock the store reads.
    pub fn with_store(
        registry: PolicyRegistry,
        store: Arc<dyn WindowStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
        }
    }

    /// Count one admission check for the caller behind `request`.
    ///
    /// A store failure is resolved by the policy's failure mode: `Open`
    /// admits with a warning, `Closed` returns the error so the caller can
    /// refuse the request.
    pub async fn check(
        &self,
        policy: PolicyName,
        request: &RequestMeta,
    ) -> Result<Decision, StoreError> {
        let identity = resolve_identity(request);
        self.check_identity(policy, identity).await
    }

    /// Like [`RateLimiter::check`] for an already-resolved identity.
    pub async fn check_identity(
        &self,
        policy: PolicyName,
        identity: Identity,
    ) -> Result<Decision, StoreError> {
        let policy = self.registry.resolve(policy);
        let key = CounterKey::new(policy.name, identity);

        trace!(key = %key, limit = policy.limit, "Checking rate limit");

        let state = match self
            .store
            .increment_and_read(&key, policy.limit, policy.window)
            .await
        {
            Ok(state) => state,
            Err(e) => return self.on_store_failure(policy, &key, e),
        };

        let allowed = state.count <= policy.limit;
        let decision = Decision {
            allowed,
            remaining: policy.limit.saturating_sub(state.count),
            reset_at: offset(state.window_start, policy.window),
        };

        if !allowed {
            debug!(
                key = %key,
                count = state.count,
                limit = policy.limit,
                reset_at = %decision.reset_at,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Boolean form of [`RateLimiter::check`]. A refused store failure is `false`.
    pub async fn check_rate_limit(&self, policy: PolicyName, request: &RequestMeta) -> bool {
        match self.check(policy, request).await {
            Ok(decision) => decision.allowed,
            Err(_) => false,
        }
    }

    /// Report quota state for `identity` without consuming any.
    ///
    /// With no live window this reports the full limit and a reset one
    /// window from now, as if a window were about to start.
    pub async fn info(
        &self,
        policy: PolicyName,
        identity: &Identity,
    ) -> Result<QuotaInfo, StoreError> {
        let policy = self.registry.resolve(policy);
        let key = CounterKey::new(policy.name, identity.clone());

        let info = match self.store.peek(&key, policy.window).await? {
            Some(state) => QuotaInfo {
                remaining: policy.limit.saturating_sub(state.count),
                reset: offset(state.window_start, policy.window),
            },
            None => QuotaInfo {
                remaining: policy.limit,
                reset: offset(self.clock.now(), policy.window),
            },
        };

        Ok(info)
    }

    /// The policy registry in use.
    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// The window store in use.
    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.store
    }

    fn on_store_failure(
        &self,
        policy: &Policy,
        key: &CounterKey,
        error: StoreError,
    ) -> Result<Decision, StoreError> {
        match policy.on_store_failure {
            FailureMode::Open => {
                warn!(
                    key = %key,
                    error = %error,
                    "Window store unavailable, admitting request (fail-open)"
                );
                Ok(Decision {
                    allowed: true,
                    remaining: policy.limit,
                    reset_at: offset(self.clock.now(), policy.window),
                })
            }
            FailureMode::Closed => {
                warn!(
                    key = %key,
                    error = %error,
                    "Window store unavailable, refusing request (fail-closed)"
                );
                Err(error)
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::counter::WindowState;
    use crate::ratelimit::policy::PolicyTable;
    use async_trait::async_trait;
    use chrono::{TimeDelta, TimeZone};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn limiter_with(registry: PolicyRegistry) -> (ManualClock, RateLimiter) {
        let clock = ManualClock::new(start());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(MemoryWindowStore::new(shared.clone()));
        (clock, RateLimiter::with_store(registry, store, shared))
    }

    fn limiter() -> (ManualClock, RateLimiter) {
        limiter_with(PolicyRegistry::new())
    }

    fn caller(last_octet: u8) -> RequestMeta {
        RequestMeta::from_peer(IpAddr::V4(Ipv4Addr::new(192, 0, 2, last_octet)))
    }

    /// A store that is always down.
    struct DownStore;

    #[async_trait]
    impl WindowStore for DownStore {
        async fn increment_and_read(
            &self,
            _key: &CounterKey,
            _limit: u64,
            _window: Duration,
        ) -> Result<WindowState, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn peek(
            &self,
            _key: &CounterKey,
            _window: Duration,
        ) -> Result<Option<WindowState>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn sweep(&self, _grace_multiple: u32) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn live_nodes(&self) -> Option<usize> {
            None
        }

        fn name(&self) -> &'static str {
            "down"
        }
    }

    fn down_limiter() -> RateLimiter {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(start()));
        RateLimiter::with_store(PolicyRegistry::new(), Arc::new(DownStore), clock)
    }

    #[tokio::test]
    async fn test_first_n_allowed_then_denied() {
        let (_clock, limiter) = limiter();
        let request = caller(1);

        for i in 1..=5u64 {
            let decision = limiter.check(PolicyName::Authentication, &request).await.unwrap();
            assert!(decision.allowed, "request {} should be allowed", i);
            assert_eq!(decision.remaining, 5 - i);
        }

        let decision = limiter.check(PolicyName::Authentication, &request).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_reset_at_is_stable_then_advances_by_window() {
        let (clock, limiter) = limiter();
        let request = caller(1);
        let window = TimeDelta::minutes(15);

        let first = limiter.check(PolicyName::Authentication, &request).await.unwrap();
        assert_eq!(first.reset_at, start() + window);

        clock.advance(Duration::from_secs(300));
        let second = limiter.check(PolicyName::Authentication, &request).await.unwrap();
        assert_eq!(second.reset_at, first.reset_at);

        clock.set(first.reset_at);
        let rolled = limiter.check(PolicyName::Authentication, &request).await.unwrap();
        assert!(rolled.allowed);
        assert_eq!(rolled.remaining, 4);
        assert_eq!(rolled.reset_at, first.reset_at + window);
    }

    #[tokio::test]
    async fn test_window_fully_resets_after_denial() {
        let (clock, limiter) = limiter();
        let request = caller(1);

        for _ in 0..8 {
            limiter.check(PolicyName::Authentication, &request).await.unwrap();
        }
        clock.advance(Duration::from_secs(15 * 60));

        let decision = limiter.check(PolicyName::Authentication, &request).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test]
    async fn test_identities_are_independent() {
        let (_clock, limiter) = limiter();

        for _ in 0..6 {
            limiter.check(PolicyName::Authentication, &caller(1)).await.unwrap();
        }
        assert!(!limiter.check_rate_limit(PolicyName::Authentication, &caller(1)).await);
        assert!(limiter.check_rate_limit(PolicyName::Authentication, &caller(2)).await);
    }

    #[tokio::test]
    async fn test_policies_are_independent() {
        let (_clock, limiter) = limiter();
        let request = caller(1);

        for _ in 0..6 {
            limiter.check(PolicyName::Authentication, &request).await.unwrap();
        }
        let decision = limiter.check(PolicyName::Administrative, &request).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 99);
    }

    #[tokio::test]
    async fn test_zero_limit_always_denies() {
        let table = PolicyTable::from_yaml(
            r#"
policies:
  administrative:
    limit: 0
    window_secs: 60
"#,
        )
        .unwrap();
        let (_clock, limiter) = limiter_with(PolicyRegistry::with_table(&table).unwrap());

        for _ in 0..3 {
            let decision = limiter.check(PolicyName::Administrative, &caller(1)).await.unwrap();
            assert!(!decision.allowed);
            assert_eq!(decision.remaining, 0);
        }
    }

    #[tokio::test]
    async fn test_info_does_not_consume() {
        let (clock, limiter) = limiter();
        let identity = Identity::new("192.0.2.1");

        let fresh = limiter.info(PolicyName::PublicSubmission, &identity).await.unwrap();
        assert_eq!(fresh.remaining, 10);
        assert_eq!(fresh.reset, clock.now() + TimeDelta::minutes(60));

        limiter.check(PolicyName::PublicSubmission, &caller(1)).await.unwrap();
        for _ in 0..3 {
            let info = limiter.info(PolicyName::PublicSubmission, &identity).await.unwrap();
            assert_eq!(info.remaining, 9);
            assert_eq!(info.reset, start() + TimeDelta::minutes(60));
        }
    }

    #[tokio::test]
    async fn test_info_after_window_elapses_reports_full_quota() {
        let (clock, limiter) = limiter();
        let identity = Identity::new("192.0.2.1");

        limiter.check(PolicyName::PublicSubmission, &caller(1)).await.unwrap();
        clock.advance(Duration::from_secs(3600));

        let info = limiter.info(PolicyName::PublicSubmission, &identity).await.unwrap();
        assert_eq!(info.remaining, 10);
        assert_eq!(info.reset, clock.now() + TimeDelta::minutes(60));
    }

    #[tokio::test]
    async fn test_fail_open_admits_default_policy() {
        let limiter = down_limiter();

        let decision = limiter.check(PolicyName::Default, &caller(1)).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1000);
    }

    #[tokio::test]
    async fn test_fail_closed_refuses_authentication() {
        let limiter = down_limiter();

        let result = limiter.check(PolicyName::Authentication, &caller(1)).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert!(!limiter.check_rate_limit(PolicyName::Authentication, &caller(1)).await);
    }

    #[tokio::test]
    async fn test_info_propagates_store_failure() {
        let limiter = down_limiter();
        let result = limiter.info(PolicyName::Default, &Identity::unknown()).await;
        assert!(result.is_err());
    }
}
