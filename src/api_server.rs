// Route table for the fleet control plane
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::clock::Clock;
use crate::config::Config;
use crate::heartbeat::{
    AgentStatus, HeartbeatRequest, HeartbeatResponse, HeartbeatService, MetricsSummary, StreamSummary,
};
use crate::metrics::{FleetMetrics, PROMETHEUS_CONTENT_TYPE};
use crate::security::audit::AuditSink;
use crate::security::auth::{extract_bearer_token, AuthGate, AuthenticatedAgent};
use crate::security::credentials::{short_fingerprint, CredentialSummary, ROTATED_SUFFIX};
use crate::security::error::{AuthFailure, GateError};
use crate::security::interceptor::BearerAuthLayer;
use crate::security::middleware::{admin_middleware, auth_middleware, security_headers_middleware, AdminToken, CurrentAgent};
use crate::security::pipeline::Pipeline;
use crate::security::signature::require_signature_middleware;
use crate::storage::{CredentialStore, StoreError};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CredentialStore>,
    pub heartbeat: Arc<HeartbeatService>,
    pub started_at: Instant,
}

/// Errors raised by handlers after admission.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Gate(e) => e.into_response(),
            ApiError::Store(StoreError::NotFound) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "credential not found" })),
            )
                .into_response(),
            ApiError::Store(e) => GateError::from(e).into_response(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub label: String,
    pub owner: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RotateKeyRequest {
    pub secret: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IssuedKey {
    /// Plaintext secret, shown exactly once
    pub secret: String,
    pub fingerprint: String,
    pub label: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SweepResult {
    pub removed: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub timestamp: String,
    pub checks: BTreeMap<String, String>,
}

pub struct ApiServer {
    host: String,
    port: u16,
    state: AppState,
    gate: AuthGate,
    pipeline: Pipeline,
    admin_token: Option<AdminToken>,
}

impl ApiServer {
    pub fn new(
        config: &Config,
        store: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
        audit_sink: AuditSink,
        metrics: Arc<FleetMetrics>,
    ) -> Self {
        let pipeline = Pipeline::new(store.clone(), clock.clone(), &config.security, audit_sink);
        let heartbeat =
            HeartbeatService::new(config.server.latest_agent_version.clone(), clock, metrics);

        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            gate: AuthGate::new(store.clone()),
            state: AppState {
                store,
                heartbeat: Arc::new(heartbeat),
                started_at: Instant::now(),
            },
            pipeline,
            admin_token: config.security.admin_token.clone().map(AdminToken::new),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn router(&self) -> Router {
        let rpc_routes = Router::new()
            .route("/fleet.v1.AgentService/Heartbeat", post(heartbeat))
            .route("/fleet.v1.AgentService/StreamMetrics", post(stream_metrics))
            .route_layer(BearerAuthLayer::new(self.gate.clone()));

        let http_routes = Router::new()
            .route("/api/v1/whoami", get(whoami))
            .route(
                "/api/v1/credentials/rotate",
                post(rotate_own_credential)
                    .route_layer(middleware::from_fn(require_signature_middleware)),
            )
            .route_layer(middleware::from_fn_with_state(self.gate.clone(), auth_middleware));

        let mut api = Router::new().merge(rpc_routes).merge(http_routes);

        if let Some(token) = &self.admin_token {
            let admin_routes = Router::new()
                .route("/admin/v1/keys", get(list_keys).post(create_key))
                .route("/admin/v1/keys/rotate", post(rotate_key))
                .route("/admin/v1/keys/sweep", post(sweep_keys))
                .route("/admin/v1/agents", get(list_agents))
                .route_layer(middleware::from_fn_with_state(token.clone(), admin_middleware));
            api = api.merge(admin_routes);
        } else {
            info!("🔒 Admin endpoints disabled (no admin token configured)");
        }

        let health_routes = Router::new()
            .route("/health", get(health))
            .route("/ready", get(ready))
            .route("/live", get(live))
            .route("/metrics", get(metrics))
            .with_state(self.state.clone())
            .layer(middleware::from_fn(security_headers_middleware));

        self.pipeline
            .wrap(api.with_state(self.state.clone()))
            .merge(health_routes)
    }

    pub async fn serve<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let bind_addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("🎯 Control plane listening on {}", bind_addr);

        axum::serve(
            listener,
            self.router().into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
    }
}

async fn heartbeat(
    State(state): State<AppState>,
    CurrentAgent(agent): CurrentAgent,
    Json(request): Json<HeartbeatRequest>,
) -> Json<HeartbeatResponse> {
    Json(state.heartbeat.handle(&agent, &request))
}

/// Newline-delimited JSON samples. Unparsable lines are counted, not fatal.
async fn stream_metrics(
    State(state): State<AppState>,
    CurrentAgent(agent): CurrentAgent,
    body: Body,
) -> Result<Json<StreamSummary>, ApiError> {
    let mut stream = body.into_data_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut summary = StreamSummary::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|e| GateError::MalformedRequest(format!("metrics stream interrupted: {}", e)))?;
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            ingest_sample(&line, &mut summary);
        }
    }
    ingest_sample(&buffer, &mut summary);

    state.heartbeat.metrics().record_stream_samples(
        &agent.credential_id,
        summary.samples_accepted,
        summary.samples_rejected,
    );
    info!(
        "📈 Metrics stream from {} closed: {} samples ({} rejected)",
        agent.credential_id, summary.samples_accepted, summary.samples_rejected
    );
    Ok(Json(summary))
}

fn ingest_sample(line: &[u8], summary: &mut StreamSummary) {
    let line = line.trim_ascii();
    if line.is_empty() {
        return;
    }
    match serde_json::from_slice::<MetricsSummary>(line) {
        Ok(sample) => summary.record(&sample),
        Err(e) => {
            debug!("Dropping unparsable metrics sample: {}", e);
            summary.samples_rejected += 1;
        }
    }
}

async fn whoami(CurrentAgent(agent): CurrentAgent) -> Json<AuthenticatedAgent> {
    Json(agent)
}

async fn rotate_own_credential(
    State(state): State<AppState>,
    CurrentAgent(agent): CurrentAgent,
    headers: HeaderMap,
) -> Result<Json<IssuedKey>, ApiError> {
    let secret = extract_bearer_token(&headers).map_err(|e| GateError::from(AuthFailure::Bearer(e)))?;
    let new_secret = state.store.rotate(&secret).await?;

    info!("🔄 Agent credential {} rotated itself", agent.credential_id);
    Ok(Json(IssuedKey {
        fingerprint: short_fingerprint(&new_secret),
        secret: new_secret,
        label: agent.label.map(|label| format!("{}{}", label, ROTATED_SUFFIX)),
    }))
}

async fn list_keys(State(state): State<AppState>) -> Result<Json<Vec<CredentialSummary>>, ApiError> {
    Ok(Json(state.store.list().await?))
}

async fn create_key(
    State(state): State<AppState>,
    Json(request): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<IssuedKey>), ApiError> {
    let label = request.label.trim();
    if label.is_empty() {
        return Err(GateError::MalformedRequest("label must not be empty".into()).into());
    }

    let secret = state.store.create_owned(label, request.owner).await?;
    info!("🔑 Issued credential {} ({})", short_fingerprint(&secret), label);

    Ok((
        StatusCode::CREATED,
        Json(IssuedKey {
            fingerprint: short_fingerprint(&secret),
            secret,
            label: Some(label.to_string()),
        }),
    ))
}

async fn rotate_key(
    State(state): State<AppState>,
    Json(request): Json<RotateKeyRequest>,
) -> Result<Json<IssuedKey>, ApiError> {
    let new_secret = state.store.rotate(request.secret.trim()).await?;
    let label = state.store.lookup(&new_secret).await?.map(|c| c.label);

    info!(
        "🔄 Rotated credential {} -> {}",
        short_fingerprint(request.secret.trim()),
        short_fingerprint(&new_secret)
    );
    Ok(Json(IssuedKey {
        fingerprint: short_fingerprint(&new_secret),
        secret: new_secret,
        label,
    }))
}

async fn sweep_keys(State(state): State<AppState>) -> Result<Json<SweepResult>, ApiError> {
    let removed = state.store.sweep_expired().await?;
    Ok(Json(SweepResult { removed }))
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentStatus>> {
    Json(state.heartbeat.agents())
}

/// Prometheus scrape target. Served outside the admission pipeline.
async fn metrics(State(state): State<AppState>) -> Response {
    let metrics = state.heartbeat.metrics();
    metrics.set_uptime(state.started_at.elapsed().as_secs());
    state.heartbeat.active_agents();

    match metrics.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            warn!("⚠️  Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let mut checks = BTreeMap::new();
    let status = match state.store.ping().await {
        Ok(()) => {
            checks.insert("credential_store".to_string(), "ok".to_string());
            "ok"
        }
        Err(e) => {
            warn!("⚠️  Health check: credential store unavailable: {}", e);
            checks.insert("credential_store".to_string(), "error".to_string());
            "degraded"
        }
    };

    let code = if status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: state.started_at.elapsed().as_secs(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            checks,
        }),
    )
}

async fn ready(State(state): State<AppState>) -> (StatusCode, &'static str) {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "ready"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "not ready"),
    }
}

async fn live() -> &'static str {
    "live"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::security::signature::{sign_request, SIGNATURE_HEADER, TIMESTAMP_HEADER};
    use crate::storage::RocksCredentialStore;
    use axum::extract::Request;
    use tempfile::tempdir;
    use tower::ServiceExt;

    const ADMIN: &str = "admin-token-0123456789";

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<RocksCredentialStore>,
        clock: Arc<MockClock>,
        router: Router,
    }

    fn fixture(admin_token: Option<&str>) -> Fixture {
        let dir = tempdir().unwrap();
        let clock = Arc::new(MockClock::at_now());
        let store = Arc::new(RocksCredentialStore::open_with_clock(dir.path(), clock.clone()).unwrap());

        let mut config = Config::default();
        config.server.latest_agent_version = "1.2.0".into();
        config.security.admin_token = admin_token.map(str::to_string);

        let sink: AuditSink = Arc::new(|_: crate::security::audit::AuditEntry| {});
        let metrics = Arc::new(FleetMetrics::new().unwrap());
        let server = ApiServer::new(&config, store.clone(), clock.clone(), sink, metrics);
        Fixture {
            _dir: dir,
            router: server.router(),
            store,
            clock,
        }
    }

    async fn json_body<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn admin_request(method: &str, uri: &str, token: &str, body: serde_json::Value) -> Request {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("x-fleet-admin-token", token)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let f = fixture(None);

        let response = f
            .router
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(header::X_CONTENT_TYPE_OPTIONS).unwrap(), "nosniff");
        let health: HealthResponse = json_body(response).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.checks.get("credential_store").map(String::as_str), Some("ok"));

        for (uri, expected) in [("/ready", "ready"), ("/live", "live")] {
            let response = f
                .router
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert_eq!(&bytes[..], expected.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_admin_routes_absent_without_token() {
        let f = fixture(None);
        let response = f
            .router
            .oneshot(admin_request("GET", "/admin/v1/keys", ADMIN, json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_rejects_wrong_token() {
        let f = fixture(Some(ADMIN));
        let response = f
            .router
            .oneshot(admin_request("GET", "/admin/v1/keys", "admin-token-wrong-value", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_admin_key_lifecycle() {
        let f = fixture(Some(ADMIN));

        let response = f
            .router
            .clone()
            .oneshot(admin_request(
                "POST",
                "/admin/v1/keys",
                ADMIN,
                json!({ "label": "edge-agent", "owner": "team-a" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let issued: IssuedKey = json_body(response).await;
        assert!(issued.secret.starts_with("sk_"));

        let response = f
            .router
            .clone()
            .oneshot(admin_request("GET", "/admin/v1/keys", ADMIN, json!({})))
            .await
            .unwrap();
        let listed: Vec<CredentialSummary> = json_body(response).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].owner.as_deref(), Some("team-a"));
        assert!(!serde_json::to_string(&listed).unwrap().contains(&issued.secret));

        let response = f
            .router
            .clone()
            .oneshot(admin_request(
                "POST",
                "/admin/v1/keys/rotate",
                ADMIN,
                json!({ "secret": issued.secret }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let rotated: IssuedKey = json_body(response).await;
        assert_eq!(rotated.label.as_deref(), Some("edge-agent-rotated"));

        f.clock.advance(chrono::Duration::hours(25));
        let response = f
            .router
            .clone()
            .oneshot(admin_request("POST", "/admin/v1/keys/sweep", ADMIN, json!({})))
            .await
            .unwrap();
        let swept: SweepResult = json_body(response).await;
        assert_eq!(swept.removed, 1);
        assert!(!f.store.validate(&issued.secret).await.unwrap());
        assert!(f.store.validate(&rotated.secret).await.unwrap());
    }

    #[tokio::test]
    async fn test_admin_rotate_unknown_is_not_found() {
        let f = fixture(Some(ADMIN));
        let response = f
            .router
            .oneshot(admin_request(
                "POST",
                "/admin/v1/keys/rotate",
                ADMIN,
                json!({ "secret": "sk_00000000000000000000000000000000" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_heartbeat_rpc() {
        let f = fixture(None);
        let secret = f.store.create("edge-agent").await.unwrap();

        let response = f
            .router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/fleet.v1.AgentService/Heartbeat")
                    .header(header::AUTHORIZATION, format!("Bearer {}", secret))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        json!({ "agent_id": "agent-42", "current_version": "1.0.0" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reply: HeartbeatResponse = json_body(response).await;
        assert_eq!(reply.command, crate::heartbeat::Command::Upgrade);
        assert_eq!(reply.latest_version, "1.2.0");
    }

    #[tokio::test]
    async fn test_stream_metrics_counts_samples() {
        let f = fixture(None);
        let secret = f.store.create("edge-agent").await.unwrap();
        let body = "{\"rx_packets\":10}\nnot json\n\n{\"rx_packets\":5,\"drop_count\":2}";

        let response = f
            .router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/fleet.v1.AgentService/StreamMetrics")
                    .header(header::AUTHORIZATION, format!("Bearer {}", secret))
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let summary: StreamSummary = json_body(response).await;
        assert_eq!(summary.samples_accepted, 2);
        assert_eq!(summary.samples_rejected, 1);
        assert_eq!(summary.rx_packets, 15);
        assert_eq!(summary.drop_count, 2);
    }

    #[tokio::test]
    async fn test_metrics_scrape_after_heartbeat() {
        let f = fixture(Some(ADMIN));
        let secret = f.store.create("edge-agent").await.unwrap();

        let response = f
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/fleet.v1.AgentService/Heartbeat")
                    .header(header::AUTHORIZATION, format!("Bearer {}", secret))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        json!({
                            "agent_id": "agent-42",
                            "current_version": "1.2.0",
                            "metrics": {
                                "rx_packets": 1200,
                                "tx_packets": 800,
                                "drop_count": 3,
                                "uptime_seconds": 3600
                            }
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = f
            .router
            .clone()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            PROMETHEUS_CONTENT_TYPE
        );
        assert!(response.headers().get("x-request-id").is_none());
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains(r#"fleet_heartbeat_total{agent_id="agent-42"} 1"#));
        assert!(text.contains(r#"fleet_agent_rx_packets{agent_id="agent-42"} 1200"#));
        assert!(text.contains(r#"fleet_agent_drop_count{agent_id="agent-42"} 3"#));
        assert!(text.contains("fleet_active_agents 1"));

        let response = f
            .router
            .oneshot(admin_request("GET", "/admin/v1/agents", ADMIN, json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let agents: Vec<AgentStatus> = json_body(response).await;
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].agent_id, "agent-42");
        assert_eq!(agents[0].version, "1.2.0");
        assert_eq!(agents[0].last_seen, f.clock.now());
    }

    #[tokio::test]
    async fn test_self_rotation_requires_signature() {
        let f = fixture(None);
        let secret = f.store.create("edge-agent").await.unwrap();

        let unsigned = Request::builder()
            .method("POST")
            .uri("/api/v1/credentials/rotate")
            .header(header::AUTHORIZATION, format!("Bearer {}", secret))
            .body(Body::empty())
            .unwrap();
        let response = f.router.clone().oneshot(unsigned).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let ts = f.clock.unix_seconds();
        let signed = Request::builder()
            .method("POST")
            .uri("/api/v1/credentials/rotate")
            .header(header::AUTHORIZATION, format!("Bearer {}", secret))
            .header(TIMESTAMP_HEADER, ts.to_string())
            .header(SIGNATURE_HEADER, sign_request(&secret, ts, b""))
            .body(Body::empty())
            .unwrap();
        let response = f.router.clone().oneshot(signed).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let issued: IssuedKey = json_body(response).await;
        assert_eq!(issued.label.as_deref(), Some("edge-agent-rotated"));
        assert!(f.store.validate(&issued.secret).await.unwrap());
    }
}
