// CORS stage built on tower-http
use axum::http::{HeaderName, HeaderValue, Method};
use log::warn;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::CorsConfig;

pub const PREFLIGHT_MAX_AGE_SECS: u64 = 86400;

/// Layer for the configured policy. Every `OPTIONS` request is answered by
/// the layer itself with 200, so later stages never see a preflight.
///
/// A `*` origin mirrors the caller's origin, which stays valid together with
/// `allow_credentials`.
pub fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let origins = if config.allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::mirror_request()
    } else {
        AllowOrigin::list(parse_all(&config.allowed_origins, "origin", |o| {
            HeaderValue::from_str(o).ok()
        }))
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(parse_all(&config.allowed_methods, "method", |m| {
            Method::from_bytes(m.as_bytes()).ok()
        }))
        .allow_headers(parse_all(&config.allowed_headers, "header", |h| {
            HeaderName::from_bytes(h.as_bytes()).ok()
        }))
        .allow_credentials(config.allow_credentials)
        .max_age(Duration::from_secs(PREFLIGHT_MAX_AGE_SECS))
}

fn parse_all<T>(values: &[String], kind: &str, parse: impl Fn(&str) -> Option<T>) -> Vec<T> {
    values
        .iter()
        .filter_map(|value| {
            let parsed = parse(value.trim());
            if parsed.is_none() {
                warn!("⚠️  Ignoring invalid CORS {} {:?}", kind, value);
            }
            parsed
        })
        .collect()
}
