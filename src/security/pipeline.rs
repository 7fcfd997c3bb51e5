// Fixed-order admission pipeline around the API router
use axum::{middleware, Extension, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

use crate::clock::Clock;
use crate::config::SecurityConfig;
use crate::security::audit::{audit_middleware, AuditSink};
use crate::security::cors::cors_layer;
use crate::security::middleware::{logging_middleware, security_headers_middleware, TrustedProxies};
use crate::security::rate_limiting::{rate_limit_middleware, RateLimitConfig, RateLimiter};
use crate::security::signature::{signature_middleware, SignatureVerifier};
use crate::storage::CredentialStore;

/// Owns the shared state of every stage and applies them in order:
///
/// SecurityHeaders → Audit → Signature → CORS → Logging → RateLimit → handler
///
/// Any stage may answer on its own; the stages above it still see the response.
#[derive(Clone)]
pub struct Pipeline {
    limiter: Arc<RateLimiter>,
    audit_sink: AuditSink,
    signature: SignatureVerifier,
    cors: CorsLayer,
    trusted_proxies: TrustedProxies,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
        config: &SecurityConfig,
        audit_sink: AuditSink,
    ) -> Self {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_minute: config.requests_per_minute,
            burst_limit: config.burst_size,
            idle_timeout_secs: config.bucket_idle_secs,
        });

        Self {
            limiter: Arc::new(limiter),
            audit_sink,
            signature: SignatureVerifier::new(store, clock, config.signature_mode, config.max_body_bytes),
            cors: cors_layer(&config.cors),
            trusted_proxies: TrustedProxies::new(&config.trusted_proxies),
        }
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        self.limiter.clone()
    }

    pub fn wrap(&self, router: Router) -> Router {
        router.layer(
            ServiceBuilder::new()
                .layer(Extension(self.trusted_proxies.clone()))
                .layer(middleware::from_fn(security_headers_middleware))
                .layer(middleware::from_fn_with_state(
                    self.audit_sink.clone(),
                    audit_middleware,
                ))
                .layer(middleware::from_fn_with_state(
                    self.signature.clone(),
                    signature_middleware,
                ))
                .layer(self.cors.clone())
                .layer(middleware::from_fn(logging_middleware))
                .layer(middleware::from_fn_with_state(
                    self.limiter.clone(),
                    rate_limit_middleware,
                )),
        )
    }
}
