//! Encrypted vault for third-party LLM API keys with per-user usage tracking.

pub mod cipher;
pub mod config;
pub mod error;
pub mod keymanager;
pub mod liveness;
pub mod store;
pub mod usage;

pub use cipher::{Cipher, EncryptedSecret, KeyMaterial};
pub use config::{ConfigLoader, StorageBackend, VaultConfig};
pub use error::{Error, Result};
pub use keymanager::{KeyEntry, KeyManager, MissingCheckerPolicy, mask_value};
pub use liveness::{CheckError, HttpLivenessChecker, LivenessCheck};
pub use store::{Backends, CredentialStore};
pub use usage::{Period, UsageRecord, UsageStats, UsageStore, UsageTracker, format_cost};
pub use zeroize::Zeroizing;

/// Keychain service name. NEVER change this value once keys are stored.
pub const SERVICE_NAME: &str = "com.llm-key-vault";
