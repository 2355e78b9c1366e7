//! Filesystem cache for interactive OAuth tokens
//!
//! Tokens live in `~/.maestro/<vendor>_oauth_creds.json` for the default
//! session and `<vendor>_oauth_creds.<session>.json` for named ones, written
//! atomically with owner-only permissions. The raw byte layer sits behind
//! [`CacheBackend`] so tests can swap in [`MemoryCache`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;

use super::context::{OAuthTokens, Provider, DEFAULT_SESSION};
use super::store::is_valid_session_name;
use crate::error::Error;
use crate::Result;

/// Raw byte storage keyed by provider and session name
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn load(&self, provider: Provider, session: &str) -> Result<Option<Vec<u8>>>;
    async fn store(&self, provider: Provider, session: &str, bytes: &[u8]) -> Result<()>;
    async fn remove(&self, provider: Provider, session: &str) -> Result<()>;
}

/// One JSON file per provider and session under a directory
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the cache file for a provider's session
    pub fn path(&self, provider: Provider, session: &str) -> Result<PathBuf> {
        if session == DEFAULT_SESSION {
            return Ok(self.dir.join(format!("{}_oauth_creds.json", provider.as_str())));
        }
        if !is_valid_session_name(session) {
            return Err(Error::Validation(format!(
                "Invalid session name '{session}'"
            )));
        }
        Ok(self
            .dir
            .join(format!("{}_oauth_creds.{}.json", provider.as_str(), session)))
    }
}

#[async_trait]
impl CacheBackend for FileCache {
    async fn load(&self, provider: Provider, session: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(provider, session)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, provider: Provider, session: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(provider, session)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        write_private_file(&path, bytes).await
    }

    async fn remove(&self, provider: Provider, session: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(provider, session)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

type Entries = HashMap<(Provider, String), Vec<u8>>;

/// In-memory backend for tests
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<Entries>,
}

impl MemoryCache {
    fn entries(&self) -> Result<std::sync::MutexGuard<'_, Entries>> {
        self.entries
            .lock()
            .map_err(|_| Error::Config("credential cache lock poisoned".to_string()))
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn load(&self, provider: Provider, session: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries()?.get(&(provider, session.to_string())).cloned())
    }

    async fn store(&self, provider: Provider, session: &str, bytes: &[u8]) -> Result<()> {
        self.entries()?
            .insert((provider, session.to_string()), bytes.to_vec());
        Ok(())
    }

    async fn remove(&self, provider: Provider, session: &str) -> Result<()> {
        self.entries()?.remove(&(provider, session.to_string()));
        Ok(())
    }
}

/// Write `bytes` to `path` atomically (temp file + rename), mode 0600 on Unix
pub async fn write_private_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Config(format!("Invalid cache path: {path:?}")))?
        .to_string_lossy();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    // Reapply in case the temp file pre-existed with other bits
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
    }

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Typed OAuth token cache over a [`CacheBackend`]
#[derive(Clone)]
pub struct CredentialCache {
    backend: Arc<dyn CacheBackend>,
}

impl CredentialCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// File-backed cache rooted at `dir`
    pub fn file(dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileCache::new(dir)))
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryCache::default()))
    }

    pub async fn load_raw(&self, provider: Provider, session: &str) -> Result<Option<Vec<u8>>> {
        self.backend.load(provider, session).await
    }

    pub async fn store_raw(&self, provider: Provider, session: &str, bytes: &[u8]) -> Result<()> {
        self.backend.store(provider, session, bytes).await
    }

    /// Load cached tokens for a provider's session
    pub async fn load(&self, provider: Provider, session: &str) -> Result<Option<OAuthTokens>> {
        let Some(bytes) = self.backend.load(provider, session).await? else {
            return Ok(None);
        };
        let tokens = serde_json::from_slice(&bytes).map_err(|e| {
            Error::InvalidCredentialFormat(format!("cached {provider} credentials: {e}"))
        })?;
        Ok(Some(tokens))
    }

    /// Like [`load`](Self::load), but a miss is [`Error::NoCachedCredentials`]
    pub async fn require(&self, provider: Provider, session: &str) -> Result<OAuthTokens> {
        self.load(provider, session)
            .await?
            .ok_or(Error::NoCachedCredentials(provider))
    }

    /// Save tokens for a provider's session, replacing any previous file
    pub async fn save(&self, provider: Provider, session: &str, tokens: &OAuthTokens) -> Result<()> {
        let content = serde_json::to_vec_pretty(tokens)?;
        self.backend.store(provider, session, &content).await?;
        tracing::debug!("Cached {} OAuth credentials for session '{}'", provider, session);
        Ok(())
    }

    /// Delete cached tokens; missing files are not an error
    pub async fn remove(&self, provider: Provider, session: &str) -> Result<()> {
        self.backend.remove(provider, session).await
    }
}
