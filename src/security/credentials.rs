// Agent credential records and secret generation
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Every issued secret starts with this prefix.
pub const SECRET_PREFIX: &str = "sk_";

/// Random bytes behind a secret (hex-encoded to 32 characters).
const SECRET_BYTES: usize = 16;

/// Length of the fingerprint shown in logs and admin listings.
const SHORT_FINGERPRINT_LEN: usize = 12;

/// Grace period an old secret stays valid after rotation.
pub const ROTATION_GRACE_HOURS: i64 = 24;

/// Label suffix given to the replacement credential on rotation.
pub const ROTATED_SUFFIX: &str = "-rotated";

/// Persisted credential. The plaintext secret is never stored, only its digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub fingerprint: String,
    pub label: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub owner: Option<String>,
}

impl Credential {
    pub fn new(secret: &str, label: &str, owner: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            fingerprint: fingerprint(secret),
            label: label.to_string(),
            issued_at: now,
            expires_at: None,
            last_used_at: None,
            owner,
        }
    }

    /// Usable for new requests at `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > now,
            None => true,
        }
    }

    /// Eligible for deletion by the expiry sweep.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at < now)
    }

    pub fn summary(&self) -> CredentialSummary {
        CredentialSummary {
            fingerprint: abbreviate(&self.fingerprint).to_string(),
            label: self.label.clone(),
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            last_used_at: self.last_used_at,
            owner: self.owner.clone(),
        }
    }
}

/// Admin-facing view of a credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialSummary {
    pub fingerprint: String,
    pub label: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub owner: Option<String>,
}

/// Generate a fresh secret: `sk_` followed by 32 hex characters.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("{}{}", SECRET_PREFIX, hex::encode(bytes))
}

/// Cheap structural check run before any storage access.
pub fn is_valid_format(secret: &str) -> bool {
    secret.len() > SECRET_PREFIX.len() && secret.starts_with(SECRET_PREFIX)
}

/// Hex SHA-256 of the secret; the storage key for its record.
pub fn fingerprint(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Shortened fingerprint safe to print in logs.
pub fn short_fingerprint(secret: &str) -> String {
    abbreviate(&fingerprint(secret)).to_string()
}

/// Leading characters of a stored fingerprint; short or non-ASCII values
/// come back whole.
fn abbreviate(fingerprint: &str) -> &str {
    fingerprint.get(..SHORT_FINGERPRINT_LEN).unwrap_or(fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_generated_secret_shape() {
        let secret = generate_secret();
        assert!(secret.starts_with("sk_"));
        assert_eq!(secret.len(), 3 + 32);
        assert!(secret[3..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(secret, generate_secret());
    }

    #[test]
    fn test_format_check() {
        assert!(is_valid_format("sk_00112233445566778899aabbccddeeff"));
        assert!(is_valid_format("sk_test_123456"));
        assert!(!is_valid_format("sk_"));
        assert!(!is_valid_format("pk_00112233"));
        assert!(!is_valid_format(""));
    }

    #[test]
    fn test_expiry_boundaries() {
        let now = Utc.with_ymd_and_hms(2024, 1, 25, 10, 0, 0).unwrap();
        let mut credential = Credential::new("sk_abc", "agent", None, now);
        assert!(credential.is_active_at(now));
        assert!(!credential.is_expired_at(now));

        credential.expires_at = Some(now);
        assert!(!credential.is_active_at(now));
        assert!(!credential.is_expired_at(now));
        assert!(credential.is_expired_at(now + Duration::seconds(1)));
    }

    #[test]
    fn test_summary_hides_full_digest() {
        let now = Utc::now();
        let credential = Credential::new("sk_abc", "agent", Some("team-a".into()), now);
        let summary = credential.summary();
        assert_eq!(summary.fingerprint.len(), 12);
        assert_eq!(summary.fingerprint, short_fingerprint("sk_abc"));
        assert_eq!(summary.owner.as_deref(), Some("team-a"));
    }

    #[test]
    fn test_summary_of_corrupt_record_does_not_panic() {
        let mut credential = Credential::new("sk_abc", "agent", None, Utc::now());
        credential.fingerprint = "abc".into();
        assert_eq!(credential.summary().fingerprint, "abc");

        credential.fingerprint = "aééééééé".into();
        assert_eq!(credential.summary().fingerprint, "aééééééé");

        credential.fingerprint = String::new();
        assert_eq!(credential.summary().fingerprint, "");
    }
}
