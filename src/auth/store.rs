//! Key-value backends for the credential slot

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

use super::tokens::KeyValueStore;
use crate::error::{ProxyError, ProxyResult};

/// Process-local store, only correct for a single gateway instance
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> ProxyResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> ProxyResult<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> ProxyResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// JSON document on disk, shared by every instance that can reach the path
///
/// Each read goes back to the file so a refresh written by a sibling process
/// is picked up on the next request.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current document
    ///
    /// A file that no longer parses reads as empty so the next write replaces it.
    async fn read_all(&self) -> ProxyResult<HashMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(HashMap::new()),
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => Ok(entries),
                Err(e) => {
                    tracing::warn!(
                        "Ignoring unreadable store file {}: {}",
                        self.path.display(),
                        e
                    );
                    Ok(HashMap::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(ProxyError::Store(format!(
                "Failed to read store file {}: {e}",
                self.path.display()
            ))),
        }
    }

    async fn write_all(&self, entries: &HashMap<String, String>) -> ProxyResult<()> {
        let content = serde_json::to_string_pretty(entries)
            .map_err(|e| ProxyError::Store(format!("Failed to serialize store: {e}")))?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomically(&path, content.as_bytes()))
            .await
            .map_err(|e| ProxyError::Store(format!("Store writer task failed: {e}")))?
    }
}

/// Replace `path` with `content` through a uniquely named sibling file
fn write_atomically(path: &Path, content: &[u8]) -> ProxyResult<()> {
    use std::io::Write;

    let io_err = |what: &str, e: std::io::Error| {
        ProxyError::Store(format!("Failed to {what} {}: {e}", path.display()))
    };

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| io_err("create directory for", e))?;

    // One temp file per write, so concurrent writers never share a path
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| io_err("stage", e))?;
    tmp.write_all(content).map_err(|e| io_err("write", e))?;
    tmp.as_file().sync_all().map_err(|e| io_err("flush", e))?;

    // Restrictive permissions, the file holds a bearer credential
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(tmp.path(), perms)
            .map_err(|e| io_err("set permissions on", e))?;
    }

    tmp.persist(path).map_err(|e| io_err("replace", e.error))?;
    Ok(())
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> ProxyResult<Option<String>> {
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: String) -> ProxyResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.read_all().await?;
        entries.insert(key.to_string(), value);
        self.write_all(&entries).await
    }

    async fn delete(&self, key: &str) -> ProxyResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.read_all().await?;
        if entries.remove(key).is_some() {
            self.write_all(&entries).await?;
        }
        Ok(())
    }
}

/// Redis-backed store for gateways spread over several hosts
#[cfg(feature = "redis")]
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

#[cfg(feature = "redis")]
impl RedisStore {
    pub async fn connect(url: &str) -> ProxyResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| ProxyError::Store(format!("Invalid Redis URL: {e}")))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| ProxyError::Store(format!("Failed to connect to Redis: {e}")))?;
        Ok(Self { conn })
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> ProxyResult<Option<String>> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| ProxyError::Store(format!("Redis GET failed: {e}")))
    }

    async fn set(&self, key: &str, value: String) -> ProxyResult<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        conn.set(key, value)
            .await
            .map_err(|e| ProxyError::Store(format!("Redis SET failed: {e}")))
    }

    async fn delete(&self, key: &str) -> ProxyResult<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        conn.del(key)
            .await
            .map_err(|e| ProxyError::Store(format!("Redis DEL failed: {e}")))
    }
}
