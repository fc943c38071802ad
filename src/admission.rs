//! Admission adapter: run a unit of work only if its policy admits the caller.
//!
//! This is the integration point for route handlers. Every denial renders the
//! same response, `429 {"error":"Too Many Requests"}`, whichever policy
//! triggered it.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::ratelimit::{
    Decision, Identity, PolicyName, QuotaInfo, RateLimiter, RequestMeta, StoreError,
};

/// Body text of every rate-limit rejection.
pub const TOO_MANY_REQUESTS: &str = "Too Many Requests";

/// Body text of every internal failure.
pub const INTERNAL_SERVER_ERROR: &str = "Internal Server Error";

/// Why a guarded unit of work did not produce its result.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The caller is over quota; the work was not run.
    #[error("too many requests")]
    TooManyRequests,

    /// The window store failed under a fail-closed policy; the work was not run.
    #[error("admission refused: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// The work ran and failed.
    #[error("handler failed: {0}")]
    Handler(anyhow::Error),
}

impl AdmissionError {
    /// HTTP status for this outcome.
    pub fn status(&self) -> StatusCode {
        match self {
            AdmissionError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            AdmissionError::StoreUnavailable(_) | AdmissionError::Handler(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let message = match &self {
            AdmissionError::TooManyRequests => TOO_MANY_REQUESTS,
            AdmissionError::StoreUnavailable(e) => {
                error!(error = %e, "Admission refused, window store unavailable");
                INTERNAL_SERVER_ERROR
            }
            AdmissionError::Handler(e) => {
                error!(error = ?e, "Guarded handler failed");
                INTERNAL_SERVER_ERROR
            }
        };

        (self.status(), Json(json!({ "error": message }))).into_response()
    }
}

/// Handle for guarding work with a rate-limit policy.
#[derive(Clone)]
pub struct Admission {
    limiter: Arc<RateLimiter>,
}

impl Admission {
    /// Create an adapter over `limiter`.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }

    /// The underlying rate limiter.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Run `handler` if `policy` admits the caller behind `request`.
    ///
    /// On admission the handler's result is returned as is, with its error
    /// wrapped in [`AdmissionError::Handler`]. On denial, or on a store
    /// failure the policy refuses, the handler is never called.
    pub async fn with_rate_limit<F, Fut, T, E>(
        &self,
        policy: PolicyName,
        request: &RequestMeta,
        handler: F,
    ) -> Result<T, AdmissionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        let decision = self.limiter.check(policy, request).await?;
        if !decision.allowed {
            return Err(AdmissionError::TooManyRequests);
        }

        handler().await.map_err(|e| AdmissionError::Handler(e.into()))
    }

    /// Whether `policy` admits the caller behind `request`. Consumes quota.
    pub async fn check_rate_limit(&self, policy: PolicyName, request: &RequestMeta) -> bool {
        self.limiter.check_rate_limit(policy, request).await
    }

    /// Full decision for the caller behind `request`. Consumes quota.
    pub async fn check(
        &self,
        policy: PolicyName,
        request: &RequestMeta,
    ) -> Result<Decision, StoreError> {
        self.limiter.check(policy, request).await
    }

    /// Quota state for `identity`. Does not consume quota.
    pub async fn rate_limit_info(
        &self,
        policy: PolicyName,
        identity: &Identity,
    ) -> Result<QuotaInfo, StoreError> {
        self.limiter.info(policy, identity).await
    }

    /// Middleware state that guards a route with `policy`.
    ///
    /// ```ignore
    /// let app = Router::new()
    ///     .route("/login", post(login))
    ///     .route_layer(middleware::from_fn_with_state(
    ///         admission.guard(PolicyName::Authentication),
    ///         rate_limit_middleware,
    ///     ));
    /// ```
    pub fn guard(&self, policy: PolicyName) -> PolicyGuard {
        PolicyGuard {
            admission: self.clone(),
            policy,
        }
    }
}

/// An [`Admission`] bound to one policy, used as middleware state.
#[derive(Clone)]
pub struct PolicyGuard {
    admission: Admission,
    policy: PolicyName,
}

/// Axum middleware running the rest of the stack through
/// [`Admission::with_rate_limit`].
pub async fn rate_limit_middleware(
    State(guard): State<PolicyGuard>,
    meta: RequestMeta,
    request: Request,
    next: Next,
) -> Response {
    let outcome = guard
        .admission
        .with_rate_limit(guard.policy, &meta, || async move {
            Ok::<_, Infallible>(next.run(request).await)
        })
        .await;

    match outcome {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}
