//! Layered configuration:
//!
//! 1. Programmatic defaults
//! 2. TOML file (`lkv.toml` in the working directory, or an explicit path)
//! 3. `LKV_*` environment variables, `__` separating nested keys
//!    (e.g. `LKV_STORAGE__BACKEND=sqlite`)

use crate::cipher::KeyMaterial;
use crate::error::{Error, Result};
use crate::keymanager::MissingCheckerPolicy;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "lkv.toml";
pub const ENV_PREFIX: &str = "LKV_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// User id assumed when the caller does not name one.
    pub default_user: Option<String>,
    pub storage: StorageConfig,
    pub crypto: CryptoConfig,
    pub validation: ValidationConfig,
    pub logging: LogConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    File,
    Sqlite,
    Keyring,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Credentials document for the `file` backend.
    pub credentials_path: PathBuf,
    /// Usage log for the `file` and `keyring` backends.
    pub usage_path: PathBuf,
    pub database_url: String,
    /// Keychain service name. Never change it once keys are stored.
    pub keyring_service: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            credentials_path: PathBuf::from(".lkv/credentials.json"),
            usage_path: PathBuf::from(".lkv/usage.jsonl"),
            database_url: "sqlite:.lkv/lkv.db".to_string(),
            keyring_service: crate::SERVICE_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Environment variable holding the hex master key.
    pub master_key_env: String,
    /// File holding the hex master key. Takes precedence over the env var.
    pub master_key_file: Option<PathBuf>,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            master_key_env: "LKV_MASTER_KEY".to_string(),
            master_key_file: None,
        }
    }
}

impl CryptoConfig {
    /// Provision the master key. Called once at startup.
    pub fn key_material(&self) -> Result<KeyMaterial> {
        match &self.master_key_file {
            Some(path) => KeyMaterial::from_file(path),
            None => KeyMaterial::from_env(&self.master_key_env),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Upper bound on a single liveness check.
    pub timeout_secs: u64,
    /// Verdict for providers without a liveness checker.
    pub missing_checker: MissingCheckerPolicy,
    /// Register the HTTP checker for known providers.
    pub http_checks: bool,
    /// Base URL overrides, keyed by provider.
    pub endpoints: BTreeMap<String, String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            missing_checker: MissingCheckerPolicy::Accept,
            http_checks: true,
            endpoints: BTreeMap::new(),
        }
    }
}

impl ValidationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load defaults, then the TOML file, then `LKV_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<VaultConfig> {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let config: VaultConfig = Figment::new()
            .merge(Serialized::defaults(VaultConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load defaults and one TOML file, ignoring the environment.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<VaultConfig> {
        let config: VaultConfig = Figment::new()
            .merge(Serialized::defaults(VaultConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .extract()
            .map_err(|e| {
                Error::Config(format!(
                    "Failed to load config from {}: {}",
                    path.as_ref().display(),
                    e
                ))
            })?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &VaultConfig) -> Result<()> {
        let storage = &config.storage;
        match storage.backend {
            StorageBackend::File if storage.credentials_path.as_os_str().is_empty() => {
                return Err(Error::Config("storage.credentials_path cannot be empty".to_string()));
            }
            StorageBackend::Sqlite if !storage.database_url.starts_with("sqlite:") => {
                return Err(Error::Config(format!(
                    "storage.database_url must start with 'sqlite:', got '{}'",
                    storage.database_url
                )));
            }
            StorageBackend::Keyring if storage.keyring_service.is_empty() => {
                return Err(Error::Config("storage.keyring_service cannot be empty".to_string()));
            }
            _ => {}
        }
        if matches!(storage.backend, StorageBackend::File | StorageBackend::Keyring)
            && storage.usage_path.as_os_str().is_empty()
        {
            return Err(Error::Config("storage.usage_path cannot be empty".to_string()));
        }

        if config.crypto.master_key_file.is_none() && config.crypto.master_key_env.is_empty() {
            return Err(Error::Config(
                "crypto.master_key_env cannot be empty when no master_key_file is set".to_string(),
            ));
        }

        if config.validation.timeout_secs == 0 {
            return Err(Error::Config("validation.timeout_secs must be at least 1".to_string()));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            return Err(Error::Config(format!(
                "Invalid log level: {}. Must be one of: {}",
                config.logging.level,
                valid_levels.join(", ")
            )));
        }

        if let Some(user) = &config.default_user {
            crate::keymanager::validate_user_id(user)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_toml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = VaultConfig::default();
        ConfigLoader::validate(&config).unwrap();
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert_eq!(config.validation.missing_checker, MissingCheckerPolicy::Accept);
        assert_eq!(config.validation.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_file_overrides_nested_fields() {
        let file = write_toml(
            r#"
default_user = "alice"

[storage]
backend = "sqlite"
database_url = "sqlite::memory:"

[validation]
missing_checker = "reject"
timeout_secs = 3

[validation.endpoints]
openai = "http://localhost:8080"

[logging]
level = "debug"
"#,
        );
        let config = ConfigLoader::load_from_file(file.path()).unwrap();
        assert_eq!(config.default_user.as_deref(), Some("alice"));
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.validation.missing_checker, MissingCheckerPolicy::Reject);
        assert_eq!(config.validation.timeout_secs, 3);
        assert_eq!(
            config.validation.endpoints.get("openai").map(String::as_str),
            Some("http://localhost:8080")
        );
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Pretty, "unset fields keep defaults");
        assert_eq!(config.storage.keyring_service, crate::SERVICE_NAME);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let file = write_toml("[logging]\nlevel = \"loud\"\n");
        assert!(matches!(ConfigLoader::load_from_file(file.path()), Err(Error::Config(_))));

        let file = write_toml("[validation]\ntimeout_secs = 0\n");
        assert!(matches!(ConfigLoader::load_from_file(file.path()), Err(Error::Config(_))));

        let file = write_toml("[storage]\nbackend = \"sqlite\"\ndatabase_url = \"postgres://x\"\n");
        assert!(matches!(ConfigLoader::load_from_file(file.path()), Err(Error::Config(_))));

        let file = write_toml("[storage]\nbackend = \"cloud\"\n");
        assert!(matches!(ConfigLoader::load_from_file(file.path()), Err(Error::Config(_))));

        let file = write_toml("default_user = \"\"\n");
        assert!(ConfigLoader::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_key_material_from_file_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("master.key");
        std::fs::write(&key_path, &*crate::cipher::Cipher::generate_key()).unwrap();
        let crypto = CryptoConfig {
            master_key_env: "LKV_TEST_UNSET_MASTER_KEY".to_string(),
            master_key_file: Some(key_path),
        };
        assert!(crypto.key_material().is_ok());
    }

    #[test]
    fn test_missing_key_material_is_crypto_error() {
        let crypto = CryptoConfig {
            master_key_env: "LKV_TEST_DEFINITELY_UNSET_KEY".to_string(),
            master_key_file: None,
        };
        assert!(matches!(crypto.key_material(), Err(Error::Crypto(_))));
    }
}
