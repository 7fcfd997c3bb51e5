use async_trait::async_trait;
use chrono::Duration;
use log::{info, warn};
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, DB};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::clock::{Clock, SystemClock};
use crate::security::credentials::{
    self, fingerprint, generate_secret, short_fingerprint, Credential, CredentialSummary,
    ROTATED_SUFFIX, ROTATION_GRACE_HOURS,
};
use crate::storage::{CredentialStore, StoreError};

const CREDENTIALS_CF: &str = "credentials";

/// Persistent credential storage using RocksDB.
///
/// Records are keyed by the SHA-256 fingerprint of the secret. Structural
/// mutations are serialized through `write_lock` so that insert-if-absent,
/// rotation and the expiry sweep never interleave within one process.
/// Last-use stamps skip the lock; they sit on the hot path and may be lost.
#[derive(Clone)]
pub struct RocksCredentialStore {
    inner: Arc<Inner>,
}

struct Inner {
    db: DB,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl RocksCredentialStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    pub fn open_with_clock<P: AsRef<Path>>(
        path: P,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let data_dir = path.as_ref().to_path_buf();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors = vec![ColumnFamilyDescriptor::new(CREDENTIALS_CF, Options::default())];
        let db = DB::open_cf_descriptors(&opts, &data_dir, cf_descriptors)?;

        info!("🗄️  Credential store opened at: {}", data_dir.display());

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                clock,
                write_lock: Mutex::new(()),
            }),
        })
    }

    /// Run a storage operation on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| StoreError::Other(format!("storage task failed: {}", e)))?
    }
}

impl Inner {
    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self, key: &str) -> Result<Option<Credential>, StoreError> {
        let cf = self.db.cf_handle(CREDENTIALS_CF).ok_or_else(|| {
            StoreError::Other(format!("{} column family not found", CREDENTIALS_CF))
        })?;

        match self.db.get_cf(&cf, key.as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    fn put(&self, credential: &Credential) -> Result<(), StoreError> {
        let cf = self.db.cf_handle(CREDENTIALS_CF).ok_or_else(|| {
            StoreError::Other(format!("{} column family not found", CREDENTIALS_CF))
        })?;

        let value = serde_json::to_vec(credential)?;
        self.db.put_cf(&cf, credential.fingerprint.as_bytes(), value)?;
        Ok(())
    }

    fn all(&self) -> Result<Vec<Credential>, StoreError> {
        let cf = self.db.cf_handle(CREDENTIALS_CF).ok_or_else(|| {
            StoreError::Other(format!("{} column family not found", CREDENTIALS_CF))
        })?;

        let mut credentials = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            credentials.push(serde_json::from_slice(&value)?);
        }
        Ok(credentials)
    }

    /// Insert a brand-new random secret. Caller holds the write lock.
    fn insert_new(&self, label: &str, owner: Option<String>) -> Result<String, StoreError> {
        loop {
            let secret = generate_secret();
            if self.get(&fingerprint(&secret))?.is_some() {
                continue;
            }
            self.put(&Credential::new(&secret, label, owner, self.now()))?;
            return Ok(secret);
        }
    }

    fn is_active(&self, secret: &str) -> Result<bool, StoreError> {
        let now = self.now();
        Ok(self
            .get(&fingerprint(secret))?
            .map(|credential| credential.is_active_at(now))
            .unwrap_or(false))
    }
}

#[async_trait]
impl CredentialStore for RocksCredentialStore {
    async fn create_owned(&self, label: &str, owner: Option<String>) -> Result<String, StoreError> {
        let label = label.to_string();
        let secret = self
            .blocking(move |inner| {
                let _guard = inner.lock();
                inner.insert_new(&label, owner)
            })
            .await?;

        info!("🔑 Issued credential {}", short_fingerprint(&secret));
        Ok(secret)
    }

    async fn ensure(&self, secret: &str, label: &str) -> Result<(), StoreError> {
        let secret = secret.to_string();
        let label = label.to_string();
        self.blocking(move |inner| {
            let _guard = inner.lock();
            if inner.get(&fingerprint(&secret))?.is_none() {
                inner.put(&Credential::new(&secret, &label, None, inner.now()))?;
                info!("🔑 Seeded credential {} ({})", short_fingerprint(&secret), label);
            }
            Ok(())
        })
        .await
    }

    async fn validate(&self, secret: &str) -> Result<bool, StoreError> {
        if !credentials::is_valid_format(secret) {
            return Ok(false);
        }
        let secret = secret.to_string();
        self.blocking(move |inner| inner.is_active(&secret)).await
    }

    async fn exists_and_unexpired(&self, secret: &str) -> Result<bool, StoreError> {
        let secret = secret.to_string();
        self.blocking(move |inner| inner.is_active(&secret)).await
    }

    async fn lookup(&self, secret: &str) -> Result<Option<Credential>, StoreError> {
        let key = fingerprint(secret);
        self.blocking(move |inner| inner.get(&key)).await
    }

    async fn touch_last_used(&self, secret: &str) -> Result<(), StoreError> {
        let key = fingerprint(secret);
        self.blocking(move |inner| {
            if let Some(mut credential) = inner.get(&key)? {
                credential.last_used_at = Some(inner.now());
                inner.put(&credential)?;
            }
            Ok(())
        })
        .await
    }

    async fn record_use(&self, secret: &str) -> Result<Option<Credential>, StoreError> {
        if !credentials::is_valid_format(secret) {
            return Ok(None);
        }
        let secret = secret.to_string();
        self.blocking(move |inner| {
            let now = inner.now();
            let credential = match inner.get(&fingerprint(&secret))? {
                Some(credential) if credential.is_active_at(now) => credential,
                _ => return Ok(None),
            };

            let mut stamped = credential.clone();
            stamped.last_used_at = Some(now);
            if let Err(e) = inner.put(&stamped) {
                warn!("⚠️  Failed to record last use of {}: {}", short_fingerprint(&secret), e);
            }
            Ok(Some(credential))
        })
        .await
    }

    async fn rotate(&self, old_secret: &str) -> Result<String, StoreError> {
        let key = fingerprint(old_secret);
        let new_secret = self
            .blocking(move |inner| {
                let _guard = inner.lock();
                let now = inner.now();

                let mut old = match inner.get(&key)? {
                    Some(credential) if credential.is_active_at(now) => credential,
                    _ => return Err(StoreError::NotFound),
                };

                let grace_end = now + Duration::hours(ROTATION_GRACE_HOURS);
                old.expires_at = Some(match old.expires_at {
                    Some(existing) if existing < grace_end => existing,
                    _ => grace_end,
                });
                inner.put(&old)?;

                let label = format!("{}{}", old.label, ROTATED_SUFFIX);
                inner.insert_new(&label, old.owner.clone())
            })
            .await?;

        info!(
            "🔄 Rotated credential {} -> {}",
            short_fingerprint(old_secret),
            short_fingerprint(&new_secret)
        );
        Ok(new_secret)
    }

    async fn sweep_expired(&self) -> Result<usize, StoreError> {
        let removed = self
            .blocking(|inner| {
                let _guard = inner.lock();
                let now = inner.now();
                let cf = inner.db.cf_handle(CREDENTIALS_CF).ok_or_else(|| {
                    StoreError::Other(format!("{} column family not found", CREDENTIALS_CF))
                })?;

                let mut removed = 0;
                for credential in inner.all()? {
                    if credential.is_expired_at(now) {
                        inner.db.delete_cf(&cf, credential.fingerprint.as_bytes())?;
                        removed += 1;
                    }
                }
                Ok(removed)
            })
            .await?;

        if removed > 0 {
            info!("🧹 Swept {} expired credentials", removed);
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<CredentialSummary>, StoreError> {
        let mut summaries: Vec<CredentialSummary> = self
            .blocking(|inner| inner.all())
            .await?
            .iter()
            .map(Credential::summary)
            .collect();

        summaries.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        Ok(summaries)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.blocking(|inner| {
            let cf = inner.db.cf_handle(CREDENTIALS_CF).ok_or_else(|| {
                StoreError::Other(format!("{} column family not found", CREDENTIALS_CF))
            })?;
            inner.db.get_cf(&cf, b"__ping__")?;
            Ok(())
        })
        .await
    }
}
