//! Admission service routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::admission::{Admission, AdmissionError};
use crate::ratelimit::{Identity, PolicyName, RequestMeta};

/// Build the service router.
///
/// - `POST /v1/check/:policy` consumes quota and returns the decision
/// - `POST /v1/admit/:policy` runs the admission adapter, answering 429 on denial
/// - `GET /v1/quota/:policy/:identity` reports quota without consuming it
/// - `GET /healthz` liveness, with the live node count for a shared store
pub fn router(admission: Admission) -> Router {
    Router::new()
        .route("/v1/check/:policy", post(check))
        .route("/v1/admit/:policy", post(admit))
        .route("/v1/quota/:policy/:identity", get(quota))
        .route("/healthz", get(health))
        .with_state(admission)
}

#[instrument(skip_all)]
async fn check(
    State(admission): State<Admission>,
    Path(policy): Path<String>,
    meta: RequestMeta,
) -> Response {
    let policy = PolicyName::resolve(&policy);

    match admission.check(policy, &meta).await {
        Ok(decision) => {
            info!(
                policy = %policy,
                allowed = decision.allowed,
                remaining = decision.remaining,
                "Rate limit decision made"
            );
            Json(decision).into_response()
        }
        Err(e) => AdmissionError::from(e).into_response(),
    }
}

#[instrument(skip_all)]
async fn admit(
    State(admission): State<Admission>,
    Path(policy): Path<String>,
    meta: RequestMeta,
) -> Response {
    let policy = PolicyName::resolve(&policy);

    let outcome = admission
        .with_rate_limit(policy, &meta, || async {
            debug!(policy = %policy, "Request admitted");
            Ok::<_, anyhow::Error>(Json(json!({ "status": "admitted" })))
        })
        .await;

    match outcome {
        Ok(body) => body.into_response(),
        Err(e) => e.into_response(),
    }
}

#[instrument(skip_all)]
async fn quota(
    State(admission): State<Admission>,
    Path((policy, identity)): Path<(String, String)>,
) -> Response {
    let policy = PolicyName::resolve(&policy);
    let identity = Identity::new(identity);

    match admission.rate_limit_info(policy, &identity).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => AdmissionError::from(e).into_response(),
    }
}

async fn health(State(admission): State<Admission>) -> impl IntoResponse {
    let store = admission.limiter().store();
    let mut body = json!({
        "status": "ok",
        "store": store.name(),
    });
    if let Some(nodes) = store.live_nodes().await {
        body["nodes"] = json!(nodes);
    }

    (StatusCode::OK, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{Cluster, ClusterConfig};
    use crate::ratelimit::{
        Clock, ManualClock, MemoryWindowStore, MeshWindowStore, PolicyRegistry, RateLimiter,
        SystemClock, FORWARDED_FOR,
    };
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> Router {
        let clock: Arc<dyn Clock> =
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let store = Arc::new(MemoryWindowStore::new(clock.clone()));
        let limiter = RateLimiter::with_store(PolicyRegistry::new(), store, clock);
        router(Admission::new(Arc::new(limiter)))
    }

    fn post_from(uri: &str, addr: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(FORWARDED_FOR, addr)
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_check_returns_decision() {
        let app = app();

        let response = app
            .oneshot(post_from("/v1/check/authentication", "203.0.113.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["allowed"], true);
        assert_eq!(body["remaining"], 4);
        assert_eq!(body["reset_at"], "2024-01-01T00:15:00Z");
    }

    #[tokio::test]
    async fn test_admit_rejects_with_standard_body() {
        let app = app();

        for _ in 0..10 {
            let response = app
                .clone()
                .oneshot(post_from("/v1/admit/public-submission", "203.0.113.2"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .clone()
            .oneshot(post_from("/v1/admit/public-submission", "203.0.113.2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            json_body(response).await,
            json!({ "error": "Too Many Requests" })
        );
    }

    #[tokio::test]
    async fn test_quota_reports_without_consuming() {
        let app = app();

        app.clone()
            .oneshot(post_from("/v1/check/public-submission", "203.0.113.3"))
            .await
            .unwrap();

        for _ in 0..2 {
            let request = Request::builder()
                .uri("/v1/quota/public-submission/203.0.113.3")
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);

            let body = json_body(response).await;
            assert_eq!(body["remaining"], 9);
            assert_eq!(body["reset"], "2024-01-01T01:00:00Z");
        }
    }

    #[tokio::test]
    async fn test_health_names_store() {
        let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({ "status": "ok", "store": "memory" })
        );
    }

    #[tokio::test]
    async fn test_health_reports_mesh_nodes() {
        let addr: std::net::SocketAddr = ([127, 0, 0, 1], 18950).into();
        let cluster = Arc::new(
            Cluster::start(ClusterConfig {
                node_id: "health-node".to_string(),
                listen_addr: addr,
                advertise_addr: addr,
                seed_nodes: Vec::new(),
                cluster_id: "test-cluster".to_string(),
                gossip_interval: std::time::Duration::from_millis(50),
                dead_node_grace_period: std::time::Duration::from_secs(60),
            })
            .await
            .unwrap(),
        );

        {
            let clock: Arc<dyn Clock> = Arc::new(SystemClock);
            let store = Arc::new(MeshWindowStore::new(cluster.clone(), clock.clone()));
            let limiter = RateLimiter::with_store(PolicyRegistry::new(), store, clock);
            let app = router(Admission::new(Arc::new(limiter)));

            let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
            let response = app.oneshot(request).await.unwrap();
            assert_eq!(
                json_body(response).await,
                json!({ "status": "ok", "store": "mesh", "nodes": 1 })
            );
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }
}
