//! In-memory backends.
//!
//! Suitable for tests and short-lived processes. Nothing survives a restart.

use super::{Credential, CredentialKey, CredentialStore};
use crate::cipher::EncryptedSecret;
use crate::error::Result;
use crate::usage::{UsageFilter, UsageRecord, UsageStore, UsageTotals};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Credential store over a sharded concurrent map. Writes to different
/// `(user, provider)` pairs land on independent shards.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<CredentialKey, Credential>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, user_id: &str, provider: &str, secret: EncryptedSecret) -> Result<()> {
        let now = Utc::now();
        self.entries
            .entry(CredentialKey::new(user_id, provider))
            .and_modify(|existing| {
                *existing = Credential::upsert(Some(&*existing), user_id, provider, secret.clone(), now);
            })
            .or_insert_with(|| Credential::upsert(None, user_id, provider, secret.clone(), now));
        Ok(())
    }

    async fn get(&self, user_id: &str, provider: &str) -> Result<Option<Credential>> {
        Ok(self
            .entries
            .get(&CredentialKey::new(user_id, provider))
            .map(|entry| entry.value().clone()))
    }

    async fn delete(&self, user_id: &str, provider: &str) -> Result<()> {
        self.entries.remove(&CredentialKey::new(user_id, provider));
        Ok(())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Credential>> {
        let mut credentials: Vec<Credential> = self
            .entries
            .iter()
            .filter(|entry| entry.key().user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect();
        credentials.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(credentials)
    }
}

// ---------------------------------------------------------------------------
// MemoryUsageLog
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MemoryUsageLog {
    records: Arc<Mutex<Vec<UsageRecord>>>,
}

impl MemoryUsageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl UsageStore for MemoryUsageLog {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn append(&self, record: &UsageRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    async fn totals(&self, filter: &UsageFilter) -> Result<UsageTotals> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(UsageTotals::from_records(
            records.iter().filter(|r| filter.matches(r)),
        ))
    }

    async fn providers(&self, filter: &UsageFilter) -> Result<BTreeSet<String>> {
        let filter = UsageFilter {
            provider: None,
            ..filter.clone()
        };
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .iter()
            .filter(|r| filter.matches(r))
            .map(|r| r.provider.clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(s: &str) -> EncryptedSecret {
        EncryptedSecret::from_encoded(s)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = MemoryStore::new();
        store.put("u1", "openai", blob("c1")).await.unwrap();
        let cred = store.get("u1", "openai").await.unwrap().unwrap();
        assert_eq!(cred.encrypted_secret, blob("c1"));
        assert_eq!(cred.user_id, "u1");
    }

    #[tokio::test]
    async fn test_put_overwrites_and_keeps_created_at() {
        let store = MemoryStore::new();
        store.put("u1", "openai", blob("c1")).await.unwrap();
        let first = store.get("u1", "openai").await.unwrap().unwrap();
        store.put("u1", "openai", blob("c2")).await.unwrap();
        let second = store.get("u1", "openai").await.unwrap().unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(second.encrypted_secret, blob("c2"));
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let store = MemoryStore::new();
        assert!(store.get("u1", "openai").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        store.put("u1", "openai", blob("c1")).await.unwrap();
        store.delete("u1", "openai").await.unwrap();
        store.delete("u1", "openai").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_list_providers_scoped_to_user() {
        let store = MemoryStore::new();
        store.put("u1", "openai", blob("a")).await.unwrap();
        store.put("u1", "anthropic", blob("b")).await.unwrap();
        store.put("u2", "gemini", blob("c")).await.unwrap();

        let providers = store.list_providers("u1").await.unwrap();
        assert_eq!(providers.into_iter().collect::<Vec<_>>(), vec!["anthropic", "openai"]);
        assert!(store.list_providers("u3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clone_shares_state() {
        let store = MemoryStore::new();
        let clone = store.clone();
        store.put("u1", "openai", blob("a")).await.unwrap();
        assert!(clone.get("u1", "openai").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_usage_log_providers_ignores_provider_filter() {
        let log = MemoryUsageLog::new();
        let now = Utc::now();
        for provider in ["openai", "anthropic"] {
            log.append(&UsageRecord {
                user_id: "u1".to_string(),
                provider: provider.to_string(),
                tokens: 1,
                cost_micros: 1,
                timestamp: now,
            })
            .await
            .unwrap();
        }
        let filter = UsageFilter {
            user_id: None,
            provider: Some("openai".to_string()),
            start: now,
            end: now + chrono::Duration::seconds(1),
        };
        assert_eq!(log.providers(&filter).await.unwrap().len(), 2);
        assert_eq!(log.totals(&filter).await.unwrap().requests, 1);
        assert_eq!(log.len(), 2);
    }
}
