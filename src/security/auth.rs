// Bearer credential validation shared by the RPC and HTTP gates
use axum::http::{header, HeaderMap};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::security::credentials::short_fingerprint;
use crate::security::error::{AuthFailure, GateError};
use crate::storage::CredentialStore;

/// Every way an `Authorization` header can fail to carry a bearer token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BearerError {
    #[error("missing Authorization header")]
    MissingHeader,
    #[error("Authorization header is not valid text")]
    Unparsable,
    #[error("malformed Authorization header")]
    Malformed,
    #[error("Authorization header must use Bearer scheme")]
    WrongScheme,
    #[error("empty bearer token")]
    EmptyToken,
}

/// Identity resolved for a request that passed the auth gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticatedAgent {
    /// Short fingerprint of the presented secret
    pub credential_id: String,
    pub label: Option<String>,
    pub owner: Option<String>,
}

/// Parse `Bearer <token>` (scheme is case-insensitive).
pub fn parse_bearer(value: &str) -> Result<String, BearerError> {
    if value.is_empty() {
        return Err(BearerError::MissingHeader);
    }

    let (scheme, token) = value.split_once(' ').ok_or(BearerError::Malformed)?;
    if !scheme.eq_ignore_ascii_case("Bearer") {
        return Err(BearerError::WrongScheme);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(BearerError::EmptyToken);
    }

    Ok(token.to_string())
}

/// Extract the bearer token from request headers.
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, BearerError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(BearerError::MissingHeader)?;
    let value = value.to_str().map_err(|_| BearerError::Unparsable)?;
    parse_bearer(value)
}

/// The single validation rule behind both gate presentations.
#[derive(Clone)]
pub struct AuthGate {
    store: Arc<dyn CredentialStore>,
}

impl AuthGate {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthenticatedAgent, GateError> {
        let token = extract_bearer_token(headers).map_err(|e| {
            debug!("Bearer extraction failed: {}", e);
            GateError::Unauthenticated(AuthFailure::Bearer(e))
        })?;
        self.authenticate_token(&token).await
    }

    pub async fn authenticate_token(&self, token: &str) -> Result<AuthenticatedAgent, GateError> {
        let credential_id = short_fingerprint(token);

        if !self.store.is_valid_format(token) {
            warn!("⚠️  Malformed credential presented ({})", credential_id);
            return Err(AuthFailure::InvalidCredential.into());
        }

        let credential = match self.store.record_use(token).await? {
            Some(credential) => credential,
            None => {
                warn!("⚠️  Invalid credential presented ({})", credential_id);
                return Err(AuthFailure::InvalidCredential.into());
            }
        };

        info!("🔐 Authenticated agent credential {}", credential_id);

        Ok(AuthenticatedAgent {
            credential_id,
            label: Some(credential.label),
            owner: credential.owner,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RocksCredentialStore;
    use axum::http::HeaderValue;
    use tempfile::tempdir;

    #[test]
    fn test_parse_bearer() {
        assert_eq!(parse_bearer("Bearer sk_abc").unwrap(), "sk_abc");
        assert_eq!(parse_bearer("bearer sk_abc").unwrap(), "sk_abc");
        assert_eq!(parse_bearer("BEARER   sk_abc  ").unwrap(), "sk_abc");
    }

    #[test]
    fn test_parse_bearer_failures_are_distinct() {
        assert_eq!(parse_bearer(""), Err(BearerError::MissingHeader));
        assert_eq!(parse_bearer("Bearer"), Err(BearerError::Malformed));
        assert_eq!(parse_bearer("NotBearer sk_abc"), Err(BearerError::WrongScheme));
        assert_eq!(parse_bearer("Basic dXNlcjpwYXNz"), Err(BearerError::WrongScheme));
        assert_eq!(parse_bearer("Bearer    "), Err(BearerError::EmptyToken));
    }

    #[test]
    fn test_extract_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), Err(BearerError::MissingHeader));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer sk_test"));
        assert_eq!(extract_bearer_token(&headers).unwrap(), "sk_test");

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_bytes(b"Bearer \xffsk").unwrap(),
        );
        assert_eq!(extract_bearer_token(&headers), Err(BearerError::Unparsable));
    }

    #[tokio::test]
    async fn test_gate_accepts_stored_credential() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RocksCredentialStore::open(dir.path()).unwrap());
        let secret = store.create_owned("edge-agent", Some("team-a".into())).await.unwrap();
        let gate = AuthGate::new(store.clone());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", secret)).unwrap(),
        );

        let agent = gate.authenticate(&headers).await.unwrap();
        assert_eq!(agent.label.as_deref(), Some("edge-agent"));
        assert_eq!(agent.owner.as_deref(), Some("team-a"));
        assert_eq!(agent.credential_id, short_fingerprint(&secret));

        let stored = store.lookup(&secret).await.unwrap().unwrap();
        assert!(stored.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_gate_rejects_unknown_credential() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RocksCredentialStore::open(dir.path()).unwrap());
        let gate = AuthGate::new(store);

        let result = gate.authenticate_token("sk_invalid_key_12345").await;
        assert!(matches!(
            result,
            Err(GateError::Unauthenticated(AuthFailure::InvalidCredential))
        ));

        let result = gate.authenticate_token("garbage").await;
        assert!(matches!(
            result,
            Err(GateError::Unauthenticated(AuthFailure::InvalidCredential))
        ));
    }
}
