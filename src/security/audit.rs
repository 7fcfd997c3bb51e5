// Audit trail of every admission decision
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::security::auth::AuthenticatedAgent;
use crate::security::middleware::RequestContext;

pub const AUDIT_LOG_TARGET: &str = "audit";

/// One observation per request, emitted after the response is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub identity: Option<AuthenticatedAgent>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: u64,
    pub client_ip: String,
    pub user_agent: String,
    pub request_id: Option<String>,
}

/// Where audit entries go. Must not block.
pub type AuditSink = Arc<dyn Fn(AuditEntry) + Send + Sync>;

/// Default sink: one JSON line per entry on the `audit` log target.
pub fn log_audit_sink() -> AuditSink {
    Arc::new(|entry: AuditEntry| match serde_json::to_string(&entry) {
        Ok(line) => info!(target: AUDIT_LOG_TARGET, "{}", line),
        Err(e) => warn!(target: AUDIT_LOG_TARGET, "Failed to encode audit entry: {}", e),
    })
}

/// Audit stage. Wraps every later stage so rejections are recorded too.
pub async fn audit_middleware(
    State(sink): State<AuditSink>,
    mut request: Request,
    next: Next,
) -> Response {
    let timestamp = Utc::now();
    let started = Instant::now();
    let context = RequestContext::ensure(&mut request);
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    sink(AuditEntry {
        timestamp,
        identity: context.identity().cloned(),
        method,
        path,
        status: response.status().as_u16(),
        duration_ms: started.elapsed().as_millis() as u64,
        client_ip: context.client_ip().to_string(),
        user_agent: context.user_agent().to_string(),
        request_id: context.request_id().map(str::to_string),
    });

    response
}
