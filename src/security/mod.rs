// Request admission: credentials, signing, rate limiting, audit
pub mod audit;
pub mod auth;
pub mod cors;
pub mod credentials;
pub mod error;
pub mod interceptor;
pub mod middleware;
pub mod pipeline;
pub mod rate_limiting;
pub mod signature;

pub use audit::{audit_middleware, log_audit_sink, AuditEntry, AuditSink};
pub use auth::{AuthGate, AuthenticatedAgent, BearerError};
pub use error::{AuthFailure, GateError};
pub use interceptor::BearerAuthLayer;
pub use cors::cors_layer;
pub use middleware::{
    auth_middleware, security_headers_middleware, AdminToken, CurrentAgent, RequestContext,
    TrustedProxies,
};
pub use pipeline::Pipeline;
pub use rate_limiting::{RateLimitConfig, RateLimiter};
pub use signature::{sign_request, verify_signature, SignatureMode, SignatureVerifier};
