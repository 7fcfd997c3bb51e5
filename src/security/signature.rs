// HMAC request signing with replay protection
use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, Method},
    middleware::Next,
    response::Response,
};
use hmac::{Hmac, Mac};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::clock::Clock;
use crate::security::auth::extract_bearer_token;
use crate::security::credentials::short_fingerprint;
use crate::security::error::{AuthFailure, GateError};
use crate::storage::CredentialStore;

pub const SIGNATURE_HEADER: &str = "X-Fleet-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Fleet-Timestamp";

/// Maximum distance, in either direction, between the signing time and now.
pub const MAX_TIMESTAMP_SKEW_SECS: u64 = 300;

type HmacSha256 = Hmac<Sha256>;

/// How unsigned requests are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureMode {
    /// Unsigned requests pass through and rely on the bearer check alone.
    #[default]
    Compat,
    /// Every request must be signed.
    Strict,
}

/// Raw HMAC-SHA256 over the little-endian timestamp followed by the body.
/// The secret is used verbatim as the key.
pub fn compute_mac(secret: &str, timestamp: i64, body: &[u8]) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(&timestamp.to_le_bytes());
    mac.update(body);
    mac.finalize().into_bytes().to_vec()
}

/// Hex-encoded signature, as an agent would send it.
pub fn sign_request(secret: &str, timestamp: i64, body: &[u8]) -> String {
    hex::encode(compute_mac(secret, timestamp, body))
}

/// Constant-time check of a presented hex signature. Bad hex never matches.
pub fn verify_signature(secret: &str, timestamp: i64, body: &[u8], signature: &str) -> bool {
    let presented = match hex::decode(signature) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let expected = compute_mac(secret, timestamp, body);
    expected.ct_eq(&presented).into()
}

/// Headers of a signed request that passed every check not needing the body.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub timestamp: i64,
    signature: String,
    secret: String,
}

/// Marker left in request extensions once a signature has been verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedSignature {
    pub timestamp: i64,
}

#[derive(Clone)]
pub struct SignatureVerifier {
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    mode: SignatureMode,
    max_body_bytes: usize,
}

impl SignatureVerifier {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
        mode: SignatureMode,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            store,
            clock,
            mode,
            max_body_bytes,
        }
    }

    pub fn mode(&self) -> SignatureMode {
        self.mode
    }

    /// Header checks, in order: presence, timestamp format, freshness,
    /// credential. `Ok(None)` means an unsigned request allowed by compat mode.
    pub async fn check_headers(&self, headers: &HeaderMap) -> Result<Option<SignedHeaders>, GateError> {
        let signature = header_value(headers, SIGNATURE_HEADER)?;
        let timestamp = header_value(headers, TIMESTAMP_HEADER)?;

        let (signature, timestamp) = match (signature, timestamp) {
            (Some(signature), Some(timestamp)) => (signature, timestamp),
            (None, None) => {
                return match self.mode {
                    SignatureMode::Compat => Ok(None),
                    SignatureMode::Strict => Err(AuthFailure::SignatureRequired.into()),
                };
            }
            _ => {
                return Err(GateError::MalformedRequest(
                    "signature and timestamp headers must be sent together".to_string(),
                ));
            }
        };

        let timestamp: i64 = timestamp.trim().parse().map_err(|_| {
            GateError::MalformedRequest(format!("invalid timestamp format: {:?}", timestamp))
        })?;

        let skew = self.clock.unix_seconds().abs_diff(timestamp);
        if skew > MAX_TIMESTAMP_SKEW_SECS {
            warn!("⚠️  Rejected signed request {} seconds outside the window", skew);
            return Err(AuthFailure::RequestExpired.into());
        }

        let secret = extract_bearer_token(headers).map_err(AuthFailure::Bearer)?;
        if !self.store.exists_and_unexpired(&secret).await? {
            warn!("⚠️  Signed request from unknown credential {}", short_fingerprint(&secret));
            return Err(AuthFailure::InvalidCredential.into());
        }

        Ok(Some(SignedHeaders {
            timestamp,
            signature: signature.to_string(),
            secret,
        }))
    }

    pub fn verify_body(&self, signed: &SignedHeaders, body: &[u8]) -> Result<(), GateError> {
        if verify_signature(&signed.secret, signed.timestamp, body, &signed.signature) {
            debug!("🔏 Signature verified for {}", short_fingerprint(&signed.secret));
            Ok(())
        } else {
            warn!("❌ Signature mismatch for {}", short_fingerprint(&signed.secret));
            Err(AuthFailure::InvalidSignature.into())
        }
    }
}

/// Non-empty header value; present-but-unreadable is malformed.
fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, GateError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| GateError::MalformedRequest(format!("unreadable {} header", name)))?;
            Ok(Some(value).filter(|v| !v.is_empty()))
        }
    }
}

/// Browsers never sign preflights, so an `OPTIONS` without either signature
/// header goes on to the CORS stage even in strict mode.
fn is_unsigned_preflight(request: &Request) -> bool {
    request.method() == Method::OPTIONS
        && !request.headers().contains_key(SIGNATURE_HEADER)
        && !request.headers().contains_key(TIMESTAMP_HEADER)
}

/// Signature stage. Buffers the body only for signed requests and hands the
/// same bytes on to later stages.
pub async fn signature_middleware(
    State(verifier): State<SignatureVerifier>,
    request: Request,
    next: Next,
) -> Result<Response, GateError> {
    if is_unsigned_preflight(&request) {
        return Ok(next.run(request).await);
    }

    let signed = match verifier.check_headers(request.headers()).await? {
        Some(signed) => signed,
        None => return Ok(next.run(request).await),
    };

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, verifier.max_body_bytes)
        .await
        .map_err(|e| GateError::MalformedRequest(format!("failed to read request body: {}", e)))?;

    verifier.verify_body(&signed, &bytes)?;

    let mut request = Request::from_parts(parts, Body::from(bytes));
    request.extensions_mut().insert(VerifiedSignature {
        timestamp: signed.timestamp,
    });
    Ok(next.run(request).await)
}

/// Route-level guard for sensitive operations: the request must have been
/// verified by the signature stage, whatever the pipeline-wide mode.
pub async fn require_signature_middleware(request: Request, next: Next) -> Result<Response, GateError> {
    if request.extensions().get::<VerifiedSignature>().is_none() {
        warn!("⚠️  Unsigned request to sensitive route {}", request.uri().path());
        return Err(AuthFailure::SignatureRequired.into());
    }
    Ok(next.run(request).await)
}
