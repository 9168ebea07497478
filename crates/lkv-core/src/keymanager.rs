use crate::cipher::Cipher;
use crate::config::ValidationConfig;
use crate::error::{Error, Result};
use crate::liveness::{HttpLivenessChecker, LivenessCheck};
use crate::store::{CredentialKey, CredentialStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

const MAX_USER_ID_LEN: usize = 128;
const MAX_PROVIDER_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Verdict for `validate_api_key` when no liveness checker covers the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingCheckerPolicy {
    /// Present and decryptable is enough.
    Accept,
    /// Without a checker the key is never reported valid.
    Reject,
}

/// Public key entry returned by `list_keys()`.
#[derive(Debug, Clone, Serialize)]
pub struct KeyEntry {
    pub provider: String,
    /// Masked value, e.g. "sk-...abcd"
    pub masked_value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Provider ids: `[a-z0-9][a-z0-9-]*`, at most 64 chars.
pub fn validate_provider(provider: &str) -> Result<()> {
    let well_formed = !provider.is_empty()
        && provider.len() <= MAX_PROVIDER_LEN
        && provider
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && provider.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());

    if !well_formed {
        return Err(Error::InvalidIdentifier {
            value: provider.to_string(),
            reason: format!(
                "Provider must match [a-z0-9][a-z0-9-]* and be at most {} characters (e.g. openai)",
                MAX_PROVIDER_LEN
            ),
        });
    }
    Ok(())
}

/// User ids are opaque but must be non-empty, bounded, and free of control
/// characters and the `/` and `#` separators used by backends.
pub fn validate_user_id(user_id: &str) -> Result<()> {
    let reason = if user_id.is_empty() {
        Some("User id cannot be empty".to_string())
    } else if user_id.chars().count() > MAX_USER_ID_LEN {
        Some(format!("User id must be at most {} characters", MAX_USER_ID_LEN))
    } else if user_id.chars().any(|c| c.is_control() || c == '/' || c == '#') {
        Some("User id cannot contain control characters, '/' or '#'".to_string())
    } else {
        None
    };

    match reason {
        Some(reason) => Err(Error::InvalidIdentifier {
            value: user_id.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Mask an API key for display: "sk-proj-abc...xyz" → "sk-p...wxyz"
/// Uses char-based slicing to avoid panics on non-ASCII input.
pub fn mask_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let len = chars.len();
    if len <= 8 {
        return "*".repeat(len);
    }
    let prefix: String = chars[..4].iter().collect();
    let suffix: String = chars[len - 4..].iter().collect();
    format!("{}...{}", prefix, suffix)
}

// ---------------------------------------------------------------------------
// KeyManager
// ---------------------------------------------------------------------------

/// Store, retrieve, delete, validate and list API keys.
///
/// The cipher and the store are injected; the manager never reaches for
/// ambient key material. Writes to the same `(user, provider)` pair are
/// serialized by a per-pair lock, while different pairs proceed independently.
pub struct KeyManager {
    cipher: Arc<Cipher>,
    store: Arc<dyn CredentialStore>,
    checkers: HashMap<String, Arc<dyn LivenessCheck>>,
    default_checker: Option<Arc<dyn LivenessCheck>>,
    missing_checker: MissingCheckerPolicy,
    check_timeout: Duration,
    write_locks: DashMap<CredentialKey, Arc<Mutex<()>>>,
}

impl KeyManager {
    pub fn new(cipher: Arc<Cipher>, store: Arc<dyn CredentialStore>) -> Self {
        let defaults = ValidationConfig::default();
        Self {
            cipher,
            store,
            checkers: HashMap::new(),
            default_checker: None,
            missing_checker: defaults.missing_checker,
            check_timeout: defaults.timeout(),
            write_locks: DashMap::new(),
        }
    }

    /// Apply validation settings, registering the HTTP checker for every
    /// provider it knows when `http_checks` is on.
    pub fn configure(mut self, config: &ValidationConfig) -> Self {
        self.missing_checker = config.missing_checker;
        self.check_timeout = config.timeout();

        if config.http_checks {
            let mut http = HttpLivenessChecker::new(config.timeout());
            for (provider, base_url) in &config.endpoints {
                http = http.with_base_url(provider, base_url);
            }
            let providers: Vec<String> = http.providers().map(str::to_string).collect();
            let http: Arc<dyn LivenessCheck> = Arc::new(http);
            for provider in providers {
                self.checkers.entry(provider).or_insert_with(|| http.clone());
            }
        }
        self
    }

    /// Use `checker` for `provider`, replacing any earlier registration.
    pub fn with_checker(mut self, provider: &str, checker: Arc<dyn LivenessCheck>) -> Self {
        self.checkers.insert(provider.to_string(), checker);
        self
    }

    /// Fallback checker for providers without a dedicated one.
    pub fn with_default_checker(mut self, checker: Arc<dyn LivenessCheck>) -> Self {
        self.default_checker = Some(checker);
        self
    }

    pub fn with_missing_checker_policy(mut self, policy: MissingCheckerPolicy) -> Self {
        self.missing_checker = policy;
        self
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    fn write_lock(&self, key: &CredentialKey) -> Arc<Mutex<()>> {
        Arc::clone(&self.write_locks.entry(key.clone()).or_default())
    }

    /// Drop the map entry once no other writer holds or waits on it.
    fn release_write_lock(&self, key: &CredentialKey, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.write_locks.remove_if(key, |_, l| Arc::strong_count(l) == 1);
    }

    fn checker_for(&self, provider: &str) -> Option<&Arc<dyn LivenessCheck>> {
        self.checkers.get(provider).or(self.default_checker.as_ref())
    }

    /// Encrypt `api_key` and upsert it for `(user_id, provider)`.
    pub async fn store_api_key(&self, user_id: &str, provider: &str, api_key: &str) -> Result<()> {
        validate_user_id(user_id)?;
        validate_provider(provider)?;
        if api_key.is_empty() {
            return Err(Error::EmptyValue);
        }

        let secret = self.cipher.encrypt(api_key)?;

        let key = CredentialKey::new(user_id, provider);
        let lock = self.write_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.store.put(user_id, provider, secret).await
        };
        self.release_write_lock(&key, lock);
        result?;

        info!(user = user_id, provider, backend = self.store.backend_name(), "api key stored");
        Ok(())
    }

    /// Decrypted key, or `None` when nothing is configured.
    ///
    /// A stored blob that fails verification is an [`Error::Crypto`], never
    /// `None`: it means corruption or a key mismatch, not absence.
    pub async fn get_decrypted_api_key(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<Zeroizing<String>>> {
        validate_user_id(user_id)?;
        validate_provider(provider)?;

        let Some(credential) = self.store.get(user_id, provider).await? else {
            debug!(user = user_id, provider, "no api key configured");
            return Ok(None);
        };

        match self.cipher.decrypt(&credential.encrypted_secret) {
            Ok(plaintext) => Ok(Some(plaintext)),
            Err(e) => {
                warn!(user = user_id, provider, error = %e, "stored api key failed integrity check");
                Err(e)
            }
        }
    }

    /// Remove the key. Deleting a missing key is a no-op.
    pub async fn delete_api_key(&self, user_id: &str, provider: &str) -> Result<()> {
        validate_user_id(user_id)?;
        validate_provider(provider)?;

        let key = CredentialKey::new(user_id, provider);
        let lock = self.write_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.store.delete(user_id, provider).await
        };
        self.release_write_lock(&key, lock);
        result?;

        info!(user = user_id, provider, backend = self.store.backend_name(), "api key deleted");
        Ok(())
    }

    /// `true` iff a key is stored, decrypts, and the provider accepts it.
    ///
    /// Checker errors and timeouts count as `false`. Storage and integrity
    /// failures still propagate.
    pub async fn validate_api_key(&self, user_id: &str, provider: &str) -> Result<bool> {
        let Some(api_key) = self.get_decrypted_api_key(user_id, provider).await? else {
            return Ok(false);
        };

        let Some(checker) = self.checker_for(provider) else {
            let accepted = self.missing_checker == MissingCheckerPolicy::Accept;
            debug!(user = user_id, provider, accepted, "no liveness checker configured");
            return Ok(accepted);
        };

        match tokio::time::timeout(self.check_timeout, checker.check(provider, &api_key)).await {
            Ok(Ok(accepted)) => {
                debug!(user = user_id, provider, accepted, "liveness check finished");
                Ok(accepted)
            }
            Ok(Err(e)) => {
                warn!(user = user_id, provider, error = %e, "liveness check failed");
                Ok(false)
            }
            Err(_) => {
                warn!(
                    user = user_id,
                    provider,
                    timeout_ms = self.check_timeout.as_millis() as u64,
                    "liveness check timed out"
                );
                Ok(false)
            }
        }
    }

    /// Providers with a live credential for `user_id`.
    pub async fn list_user_providers(&self, user_id: &str) -> Result<BTreeSet<String>> {
        validate_user_id(user_id)?;
        self.store.list_providers(user_id).await
    }

    /// Masked listing of every key stored for `user_id`, sorted by provider.
    pub async fn list_keys(&self, user_id: &str) -> Result<Vec<KeyEntry>> {
        validate_user_id(user_id)?;
        let mut entries = Vec::new();
        for credential in self.store.list(user_id).await? {
            let plaintext = self.cipher.decrypt(&credential.encrypted_secret)?;
            entries.push(KeyEntry {
                masked_value: mask_value(&plaintext),
                provider: credential.provider,
                created_at: credential.created_at,
                updated_at: credential.updated_at,
            });
        }
        entries.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
