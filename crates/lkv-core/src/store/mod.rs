//! [`CredentialStore`] trait: persistence for encrypted API keys keyed by
//! `(user, provider)`.
//!
//! Stores hold [`EncryptedSecret`] blobs only. They never see plaintext and
//! never call into the cipher, so swapping a backend never touches crypto
//! code and vice versa.

pub mod file;
pub mod keychain;
pub mod memory;
pub mod sqlite;

use crate::cipher::EncryptedSecret;
use crate::config::{StorageBackend, StorageConfig};
use crate::error::Result;
use crate::usage::UsageStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

pub use self::file::{FileStore, FileUsageLog};
pub use self::keychain::KeyringStore;
pub use self::memory::{MemoryStore, MemoryUsageLog};
pub use self::sqlite::SqliteStore;

/// Composite identity of a credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CredentialKey {
    pub user_id: String,
    pub provider: String,
}

impl CredentialKey {
    pub fn new(user_id: &str, provider: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
        }
    }
}

/// A stored credential as persisted by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub user_id: String,
    pub provider: String,
    pub encrypted_secret: EncryptedSecret,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// Build the record that results from upserting `secret` over `previous`.
    /// `created_at` survives a replace; `updated_at` always moves to `now`.
    pub(crate) fn upsert(
        previous: Option<&Credential>,
        user_id: &str,
        provider: &str,
        secret: EncryptedSecret,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            encrypted_secret: secret,
            created_at: previous.map_or(now, |p| p.created_at),
            updated_at: now,
        }
    }
}

/// Abstraction over credential persistence.
///
/// Implementations must replace whole records atomically so a concurrent
/// `get` never observes a half-written upsert. Storage failures surface as
/// [`crate::Error::StorageUnavailable`] without internal retries.
///
/// Writes to distinct pairs are only as independent as the backend allows.
/// [`MemoryStore`] and [`SqliteStore`] touch one record per write. [`FileStore`]
/// rewrites a single document and [`KeyringStore`] maintains a shared index,
/// so both serialize every write behind one lock.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Short backend name used in logs and errors.
    fn backend_name(&self) -> &'static str;

    /// Insert or replace the credential for `(user_id, provider)`.
    async fn put(&self, user_id: &str, provider: &str, secret: EncryptedSecret) -> Result<()>;

    async fn get(&self, user_id: &str, provider: &str) -> Result<Option<Credential>>;

    /// Remove the credential. Removing an absent credential is not an error.
    async fn delete(&self, user_id: &str, provider: &str) -> Result<()>;

    /// All live credentials for `user_id`, sorted by provider.
    async fn list(&self, user_id: &str) -> Result<Vec<Credential>>;

    /// Providers with a live credential for `user_id`.
    async fn list_providers(&self, user_id: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .list(user_id)
            .await?
            .into_iter()
            .map(|c| c.provider)
            .collect())
    }
}

/// The pair of backends a vault runs on.
#[derive(Clone)]
pub struct Backends {
    pub credentials: Arc<dyn CredentialStore>,
    pub usage: Arc<dyn UsageStore>,
}

/// Open the backends selected by `config`.
pub async fn open(config: &StorageConfig) -> Result<Backends> {
    let backends = match config.backend {
        StorageBackend::Memory => Backends {
            credentials: Arc::new(MemoryStore::new()),
            usage: Arc::new(MemoryUsageLog::new()),
        },
        StorageBackend::File => Backends {
            credentials: Arc::new(FileStore::open(&config.credentials_path).await?),
            usage: Arc::new(FileUsageLog::open(&config.usage_path).await?),
        },
        StorageBackend::Sqlite => {
            let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
            Backends {
                credentials: store.clone(),
                usage: store,
            }
        }
        StorageBackend::Keyring => Backends {
            credentials: Arc::new(KeyringStore::new(&config.keyring_service)),
            usage: Arc::new(FileUsageLog::open(&config.usage_path).await?),
        },
    };
    info!(
        credentials = backends.credentials.backend_name(),
        usage = backends.usage.backend_name(),
        "storage opened"
    );
    Ok(backends)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_preserves_created_at() {
        let t0 = Utc::now();
        let first = Credential::upsert(None, "u1", "openai", EncryptedSecret::from_encoded("a"), t0);
        assert_eq!(first.created_at, t0);
        assert_eq!(first.updated_at, t0);

        let t1 = t0 + chrono::Duration::seconds(5);
        let second = Credential::upsert(Some(&first), "u1", "openai", EncryptedSecret::from_encoded("b"), t1);
        assert_eq!(second.created_at, t0);
        assert_eq!(second.updated_at, t1);
        assert_eq!(second.encrypted_secret.as_str(), "b");
    }

    #[tokio::test]
    async fn test_open_memory_backends() {
        let config = StorageConfig {
            backend: StorageBackend::Memory,
            ..StorageConfig::default()
        };
        let backends = open(&config).await.unwrap();
        assert_eq!(backends.credentials.backend_name(), "memory");
        assert_eq!(backends.usage.backend_name(), "memory");
    }

    #[tokio::test]
    async fn test_open_file_backends() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            backend: StorageBackend::File,
            credentials_path: dir.path().join("credentials.json"),
            usage_path: dir.path().join("usage.jsonl"),
            ..StorageConfig::default()
        };
        let backends = open(&config).await.unwrap();
        assert_eq!(backends.credentials.backend_name(), "file");
        assert_eq!(backends.usage.backend_name(), "file");
    }
}
