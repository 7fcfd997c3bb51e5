// Axum middleware for agent authentication, security headers and request logging
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use log::{info, warn};
use rand::RngCore;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use subtle::ConstantTimeEq;

use crate::security::auth::{AuthGate, AuthenticatedAgent};
use crate::security::error::{AuthFailure, GateError};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const ADMIN_TOKEN_HEADER: &str = "x-fleet-admin-token";

/// Typed per-request state threaded through the admission stages.
///
/// Created by the outermost stage that needs it; later stages fill in the
/// request id and resolved identity, and the audit stage reads them back
/// after the handler returns.
#[derive(Clone, Debug)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    client_ip: String,
    user_agent: String,
    request_id: OnceLock<String>,
    identity: OnceLock<AuthenticatedAgent>,
}

impl RequestContext {
    pub fn new(client_ip: String, user_agent: String) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                client_ip,
                user_agent,
                request_id: OnceLock::new(),
                identity: OnceLock::new(),
            }),
        }
    }

    /// Fetch the context attached to `request`, creating it if no earlier stage did.
    pub fn ensure(request: &mut Request) -> Self {
        if let Some(existing) = request.extensions().get::<RequestContext>() {
            return existing.clone();
        }

        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let trusted = request
            .extensions()
            .get::<TrustedProxies>()
            .cloned()
            .unwrap_or_default();
        let client_ip = client_ip(request.headers(), peer, &trusted);
        let user_agent = request
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let context = Self::new(client_ip, user_agent);
        request.extensions_mut().insert(context.clone());
        context
    }

    pub fn client_ip(&self) -> &str {
        &self.inner.client_ip
    }

    pub fn user_agent(&self) -> &str {
        &self.inner.user_agent
    }

    pub fn request_id(&self) -> Option<&str> {
        self.inner.request_id.get().map(String::as_str)
    }

    pub fn set_request_id(&self, id: String) {
        let _ = self.inner.request_id.set(id);
    }

    pub fn identity(&self) -> Option<&AuthenticatedAgent> {
        self.inner.identity.get()
    }

    pub fn set_identity(&self, agent: AuthenticatedAgent) {
        let _ = self.inner.identity.set(agent);
    }
}

/// Peers whose `X-Forwarded-For` and `X-Real-IP` headers are believed.
/// Carried as a request extension; absent means no peer is trusted.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies(Arc<Vec<IpAddr>>);

impl TrustedProxies {
    /// Unparsable entries are skipped; `Config::validate` reports them first.
    pub fn new(addresses: &[String]) -> Self {
        let parsed = addresses
            .iter()
            .filter_map(|addr| match addr.trim().parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!("⚠️  Ignoring invalid trusted proxy address {:?}", addr);
                    None
                }
            })
            .collect();
        Self(Arc::new(parsed))
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.0.contains(ip)
    }
}

/// Resolve the originating client address. Proxy headers count only when
/// the connection itself comes from a trusted proxy.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>, trusted: &TrustedProxies) -> String {
    let peer = match peer {
        Some(peer) => peer,
        None => return "unknown".to_string(),
    };
    if !trusted.contains(&peer) {
        return peer.to_string();
    }

    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next().map(str::trim) {
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    peer.to_string()
}

/// HTTP presentation of the auth gate.
pub async fn auth_middleware(
    State(gate): State<AuthGate>,
    mut request: Request,
    next: Next,
) -> Result<Response, GateError> {
    let agent = gate.authenticate(request.headers()).await?;

    RequestContext::ensure(&mut request).set_identity(agent.clone());
    request.extensions_mut().insert(agent);

    Ok(next.run(request).await)
}

/// Extractor for the identity placed by either gate variant.
#[derive(Debug, Clone)]
pub struct CurrentAgent(pub AuthenticatedAgent);

#[axum::async_trait]
impl<S> axum::extract::FromRequestParts<S> for CurrentAgent
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedAgent>()
            .cloned()
            .map(CurrentAgent)
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}

/// Security headers for API-only responses, applied to every outcome.
pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=31536000; includeSubDomains; preload"),
    );
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(header::X_XSS_PROTECTION, HeaderValue::from_static("1; mode=block"));
    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("no-referrer"));
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate, private"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));

    response
}

/// One structured line per request: `[id] METHOD path status duration`.
pub async fn logging_middleware(mut request: Request, next: Next) -> Response {
    let started = Instant::now();
    let context = RequestContext::ensure(&mut request);

    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 64)
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);
    context.set_request_id(request_id.clone());

    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let mut response = next.run(request).await;

    info!(
        "[{}] {} {} {} {:?}",
        request_id,
        method,
        path,
        response.status().as_u16(),
        started.elapsed()
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn generate_request_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Operator token guarding the admin endpoints. Never printed.
#[derive(Clone)]
pub struct AdminToken(Arc<String>);

impl AdminToken {
    pub fn new(token: String) -> Self {
        Self(Arc::new(token))
    }

    /// Constant-time comparison; unequal lengths fail without early exit.
    pub fn verify(&self, provided: &str) -> bool {
        self.0.as_bytes().ct_eq(provided.as_bytes()).into()
    }
}

impl std::fmt::Debug for AdminToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AdminToken([REDACTED])")
    }
}

pub async fn admin_middleware(
    State(token): State<AdminToken>,
    request: Request,
    next: Next,
) -> Result<Response, GateError> {
    let provided = request
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if !token.verify(provided) {
        warn!("🚨 Rejected admin request to {}", request.uri().path());
        return Err(AuthFailure::InvalidAdminToken.into());
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for_from_trusted_proxy() {
        let trusted = TrustedProxies::new(&["10.0.0.1".to_string()]);
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(client_ip(&headers, Some(proxy()), &trusted), "203.0.113.7");

        headers.remove("x-forwarded-for");
        assert_eq!(client_ip(&headers, Some(proxy()), &trusted), "198.51.100.2");
    }

    #[test]
    fn test_client_ip_ignores_forwarded_headers_from_untrusted_peer() {
        let trusted = TrustedProxies::new(&["10.0.0.1".to_string()]);
        let peer: IpAddr = "198.51.100.9".parse().unwrap();

        let mut headers = HeaderMap::new();
        for spoofed in ["203.0.113.1", "203.0.113.2", "203.0.113.3"] {
            headers.insert("x-forwarded-for", HeaderValue::from_static(spoofed));
            headers.insert("x-real-ip", HeaderValue::from_static(spoofed));
            assert_eq!(client_ip(&headers, Some(peer), &trusted), "198.51.100.9");
        }

        assert_eq!(
            client_ip(&headers, Some(proxy()), &TrustedProxies::default()),
            "10.0.0.1"
        );
    }

    #[test]
    fn test_client_ip_fallbacks() {
        let trusted = TrustedProxies::new(&["10.0.0.1".to_string(), "not-an-ip".to_string()]);
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some(proxy()), &trusted), "10.0.0.1");
        assert_eq!(client_ip(&headers, None, &trusted), "unknown");

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));
        assert_eq!(client_ip(&headers, None, &trusted), "unknown");
    }

    #[test]
    fn test_request_context_is_shared() {
        let mut request = Request::builder()
            .uri("/api/v1/whoami")
            .header(header::USER_AGENT, "fleet-agent/1.2.0")
            .body(axum::body::Body::empty())
            .unwrap();

        let first = RequestContext::ensure(&mut request);
        let second = RequestContext::ensure(&mut request);
        second.set_identity(AuthenticatedAgent {
            credential_id: "abc123".into(),
            label: None,
            owner: None,
        });
        first.set_request_id("deadbeef".into());

        assert_eq!(first.identity().unwrap().credential_id, "abc123");
        assert_eq!(second.request_id(), Some("deadbeef"));
        assert_eq!(first.user_agent(), "fleet-agent/1.2.0");
        assert_eq!(first.client_ip(), "unknown");
    }

    #[test]
    fn test_admin_token_compare() {
        let token = AdminToken::new("0123456789abcdef".into());
        assert!(token.verify("0123456789abcdef"));
        assert!(!token.verify("0123456789abcdeX"));
        assert!(!token.verify("0123"));
        assert!(!token.verify(""));
        assert_eq!(format!("{:?}", token), "AdminToken([REDACTED])");
    }

    #[test]
    fn test_generated_request_id() {
        let id = generate_request_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
