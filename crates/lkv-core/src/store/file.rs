//! File-backed stores.
//!
//! [`FileStore`] keeps every credential in one JSON document that is
//! rewritten through a temp file and an atomic rename. Writers hold an
//! exclusive advisory lock on a sibling `.lock` file and re-read the document
//! before changing it, so several processes can share one vault file.
//! [`FileUsageLog`] is an append-only JSON-lines file.

use super::{Credential, CredentialKey, CredentialStore};
use crate::cipher::EncryptedSecret;
use crate::error::{Error, Result};
use crate::usage::{UsageFilter, UsageRecord, UsageStore, UsageTotals};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const BACKEND: &str = "file";
const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    version: u32,
    credentials: Vec<Credential>,
}

type Entries = BTreeMap<CredentialKey, Credential>;

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// Credential store over a single JSON document.
///
/// Every read goes to disk. Because writes replace the file by rename, a
/// reader sees either the previous document or the next one, never a mix.
pub struct FileStore {
    path: PathBuf,
    /// Keeps this process's writers off the blocking file lock.
    writer: Mutex<()>,
}

impl FileStore {
    /// Open (or lazily create) the credentials file at `path`. An existing
    /// file is checked up front so corruption surfaces at startup.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(()),
        };
        let entries = store.load().await?;
        debug!(path = %store.path.display(), count = entries.len(), "credentials file loaded");
        Ok(store)
    }

    async fn load(&self) -> Result<Entries> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => parse_document(&self.path, &bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Entries::new()),
            Err(e) => Err(Error::storage(BACKEND, format!("{}: {}", self.path.display(), e))),
        }
    }

    /// Apply `change` to the current on-disk document and persist the result
    /// if `change` reports a modification.
    async fn mutate<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Entries) -> bool + Send + 'static,
    {
        let _guard = self.writer.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || locked_update(&path, change))
            .await
            .map_err(|e| Error::storage(BACKEND, e))?
    }
}

fn parse_document(path: &Path, bytes: &[u8]) -> Result<Entries> {
    let doc: Document = serde_json::from_slice(bytes)
        .map_err(|e| Error::storage(BACKEND, format!("{} is corrupt: {}", path.display(), e)))?;
    if doc.version != DOCUMENT_VERSION {
        return Err(Error::storage(
            BACKEND,
            format!("{} has unsupported version {}", path.display(), doc.version),
        ));
    }
    Ok(doc
        .credentials
        .into_iter()
        .map(|c| (CredentialKey::new(&c.user_id, &c.provider), c))
        .collect())
}

/// Read-modify-write under an exclusive lock on `<path>.lock`.
fn locked_update<F>(path: &Path, change: F) -> Result<()>
where
    F: FnOnce(&mut Entries) -> bool,
{
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| Error::storage(BACKEND, e))?;
    }

    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path.with_extension("lock"))
        .map_err(|e| Error::storage(BACKEND, e))?;
    let mut lock = fd_lock::RwLock::new(lock_file);
    let _held = lock.write().map_err(|e| Error::storage(BACKEND, e))?;

    let mut entries = match std::fs::read(path) {
        Ok(bytes) => parse_document(path, &bytes)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Entries::new(),
        Err(e) => return Err(Error::storage(BACKEND, format!("{}: {}", path.display(), e))),
    };
    if change(&mut entries) {
        write_document(path, &entries)?;
    }
    Ok(())
}

fn write_document(path: &Path, entries: &Entries) -> Result<()> {
    let doc = Document {
        version: DOCUMENT_VERSION,
        credentials: entries.values().cloned().collect(),
    };
    let json = serde_json::to_vec_pretty(&doc).map_err(|e| Error::storage(BACKEND, e))?;

    let tmp = path.with_extension("tmp");
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp).map_err(|e| Error::storage(BACKEND, e))?;
    file.write_all(&json).map_err(|e| Error::storage(BACKEND, e))?;
    file.sync_all().map_err(|e| Error::storage(BACKEND, e))?;
    drop(file);

    std::fs::rename(&tmp, path).map_err(|e| Error::storage(BACKEND, e))
}

#[async_trait]
impl CredentialStore for FileStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn put(&self, user_id: &str, provider: &str, secret: EncryptedSecret) -> Result<()> {
        let key = CredentialKey::new(user_id, provider);
        let now = Utc::now();
        self.mutate(move |entries| {
            let next = Credential::upsert(entries.get(&key), &key.user_id, &key.provider, secret, now);
            entries.insert(key, next);
            true
        })
        .await
    }

    async fn get(&self, user_id: &str, provider: &str) -> Result<Option<Credential>> {
        Ok(self.load().await?.remove(&CredentialKey::new(user_id, provider)))
    }

    async fn delete(&self, user_id: &str, provider: &str) -> Result<()> {
        let key = CredentialKey::new(user_id, provider);
        self.mutate(move |entries| entries.remove(&key).is_some()).await
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Credential>> {
        // BTreeMap order is (user, provider), so the result is already sorted.
        Ok(self
            .load()
            .await?
            .into_values()
            .filter(|c| c.user_id == user_id)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// FileUsageLog
// ---------------------------------------------------------------------------

/// Append-only usage log, one JSON record per line.
pub struct FileUsageLog {
    path: PathBuf,
    writer: Mutex<()>,
}

impl FileUsageLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage(BACKEND, e))?;
        }
        Ok(Self {
            path,
            writer: Mutex::new(()),
        })
    }

    async fn read_all(&self) -> Result<Vec<UsageRecord>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::storage(BACKEND, e)),
        };

        let mut records = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<UsageRecord>(line) {
                Ok(record) => records.push(record),
                // A crash mid-append can leave one torn trailing line.
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping unreadable usage record"
                ),
            }
        }
        Ok(records)
    }
}

/// `true` when the log does not end in a newline, i.e. the last append was
/// torn. The next record then starts on a fresh line.
async fn ends_mid_line(file: &mut tokio::fs::File) -> Result<bool> {
    let len = file.metadata().await.map_err(|e| Error::storage(BACKEND, e))?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))
        .await
        .map_err(|e| Error::storage(BACKEND, e))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)
        .await
        .map_err(|e| Error::storage(BACKEND, e))?;
    Ok(last[0] != b'\n')
}

#[async_trait]
impl UsageStore for FileUsageLog {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn append(&self, record: &UsageRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).map_err(|e| Error::storage(BACKEND, e))?;
        line.push('\n');

        let _guard = self.writer.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::storage(BACKEND, e))?;
        if ends_mid_line(&mut file).await? {
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::storage(BACKEND, e))?;
        file.flush().await.map_err(|e| Error::storage(BACKEND, e))?;
        Ok(())
    }

    async fn totals(&self, filter: &UsageFilter) -> Result<UsageTotals> {
        let records = self.read_all().await?;
        Ok(UsageTotals::from_records(
            records.iter().filter(|r| filter.matches(r)),
        ))
    }

    async fn providers(&self, filter: &UsageFilter) -> Result<BTreeSet<String>> {
        let filter = UsageFilter {
            provider: None,
            ..filter.clone()
        };
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| filter.matches(r))
            .map(|r| r.provider)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
