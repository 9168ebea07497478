//! OS keychain backend via the `keyring` crate.
//!
//! Each credential is one keychain item whose account is `{user}/{provider}`
//! and whose password field holds the JSON-serialized [`Credential`] (the
//! secret inside is still ciphertext). Keychains cannot be enumerated
//! portably, so a per-user index item `{user}#providers` tracks which
//! providers exist.

use super::{Credential, CredentialStore};
use crate::cipher::EncryptedSecret;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeSet;
use tokio::sync::Mutex;
use tracing::warn;

const BACKEND: &str = "keyring";

pub struct KeyringStore {
    service: String,
    /// Serializes read-modify-write cycles on the provider index. Held for
    /// every put and delete, across all users.
    index_lock: Mutex<()>,
}

impl KeyringStore {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            index_lock: Mutex::new(()),
        }
    }
}

fn credential_account(user_id: &str, provider: &str) -> String {
    format!("{}/{}", user_id, provider)
}

fn index_account(user_id: &str) -> String {
    format!("{}#providers", user_id)
}

fn map_keyring_error(e: keyring::Error) -> Error {
    match e {
        keyring::Error::PlatformFailure(_) | keyring::Error::NoStorageAccess(_) => {
            Error::storage(BACKEND, "Keychain is locked or inaccessible. Please unlock and try again.")
        }
        other => Error::storage(BACKEND, other),
    }
}

/// Keychain calls block on the platform credential service.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::storage(BACKEND, e))?
}

fn read_item(service: &str, account: &str) -> Result<Option<String>> {
    let entry = keyring::Entry::new(service, account).map_err(map_keyring_error)?;
    match entry.get_password() {
        Ok(value) => Ok(Some(value)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(map_keyring_error(e)),
    }
}

fn write_item(service: &str, account: &str, value: &str) -> Result<()> {
    let entry = keyring::Entry::new(service, account).map_err(map_keyring_error)?;
    entry.set_password(value).map_err(map_keyring_error)
}

fn remove_item(service: &str, account: &str) -> Result<()> {
    let entry = keyring::Entry::new(service, account).map_err(map_keyring_error)?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(map_keyring_error(e)),
    }
}

fn read_credential(service: &str, user_id: &str, provider: &str) -> Result<Option<Credential>> {
    read_item(service, &credential_account(user_id, provider))?
        .map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| Error::storage(BACKEND, format!("Failed to deserialize: {}", e)))
        })
        .transpose()
}

fn read_index(service: &str, user_id: &str) -> Result<BTreeSet<String>> {
    match read_item(service, &index_account(user_id))? {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| Error::storage(BACKEND, format!("Provider index is corrupt: {}", e))),
        None => Ok(BTreeSet::new()),
    }
}

fn write_index(service: &str, user_id: &str, providers: &BTreeSet<String>) -> Result<()> {
    if providers.is_empty() {
        return remove_item(service, &index_account(user_id));
    }
    let json = serde_json::to_string(providers)
        .map_err(|e| Error::storage(BACKEND, format!("Failed to serialize: {}", e)))?;
    write_item(service, &index_account(user_id), &json)
}

#[async_trait]
impl CredentialStore for KeyringStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn put(&self, user_id: &str, provider: &str, secret: EncryptedSecret) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let (service, user_id, provider) = (self.service.clone(), user_id.to_string(), provider.to_string());
        blocking(move || {
            let previous = read_credential(&service, &user_id, &provider)?;
            let credential = Credential::upsert(previous.as_ref(), &user_id, &provider, secret, Utc::now());
            let json = serde_json::to_string(&credential)
                .map_err(|e| Error::storage(BACKEND, format!("Failed to serialize: {}", e)))?;
            write_item(&service, &credential_account(&user_id, &provider), &json)?;

            let mut index = read_index(&service, &user_id)?;
            if index.insert(provider) {
                write_index(&service, &user_id, &index)?;
            }
            Ok(())
        })
        .await
    }

    async fn get(&self, user_id: &str, provider: &str) -> Result<Option<Credential>> {
        let (service, user_id, provider) = (self.service.clone(), user_id.to_string(), provider.to_string());
        blocking(move || read_credential(&service, &user_id, &provider)).await
    }

    async fn delete(&self, user_id: &str, provider: &str) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let (service, user_id, provider) = (self.service.clone(), user_id.to_string(), provider.to_string());
        blocking(move || {
            remove_item(&service, &credential_account(&user_id, &provider))?;
            let mut index = read_index(&service, &user_id)?;
            if index.remove(&provider) {
                write_index(&service, &user_id, &index)?;
            }
            Ok(())
        })
        .await
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Credential>> {
        let (service, user_id) = (self.service.clone(), user_id.to_string());
        blocking(move || {
            let mut credentials = Vec::new();
            for provider in read_index(&service, &user_id)? {
                match read_credential(&service, &user_id, &provider)? {
                    Some(credential) => credentials.push(credential),
                    None => warn!(user = %user_id, provider = %provider, "index entry without keychain item"),
                }
            }
            Ok(credentials)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_names() {
        assert_eq!(credential_account("alice", "openai"), "alice/openai");
        assert_eq!(index_account("alice"), "alice#providers");
    }

    #[test]
    fn test_locked_keychain_maps_to_storage_unavailable() {
        let err = map_keyring_error(keyring::Error::NoStorageAccess("locked".into()));
        match err {
            Error::StorageUnavailable { backend, message } => {
                assert_eq!(backend, "keyring");
                assert!(message.contains("locked"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_backend_name() {
        assert_eq!(KeyringStore::new("com.llm-key-vault").backend_name(), "keyring");
    }
}
