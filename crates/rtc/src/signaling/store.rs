//! Client-side identity persistence
//!
//! A reconnecting client presents the stable identity the endpoint assigned
//! on a previous connection so the server can recognize it as the same
//! logical participant. The session depends on this small key-value
//! capability, not on any specific storage mechanism.

use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;

/// Storage key for the stable client peer identity.
pub const CLIENT_PEER_ID_KEY: &str = "client_peer_id";

/// Injected key-value persistence capability.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn clear(&self, key: &str) -> Result<()>;
}

/// Volatile store, used by tests and by embedders that manage persistence
/// themselves.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// JSON-file-backed store for desktop embedders.
#[derive(Debug)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn load(&self) -> Result<HashMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| Error::Store(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn save(&self, values: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let content = serde_json::to_string_pretty(values)?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for FileIdentityStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load().await?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.load().await?;
        values.insert(key.to_string(), value.to_string());
        self.save(&values).await
    }

    async fn clear(&self, key: &str) -> Result<()> {
        let mut values = self.load().await?;
        if values.remove(key).is_some() {
            self.save(&values).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryIdentityStore::new();
        assert_eq!(store.get(CLIENT_PEER_ID_KEY).await.unwrap(), None);

        store.set(CLIENT_PEER_ID_KEY, "c-42").await.unwrap();
        assert_eq!(
            store.get(CLIENT_PEER_ID_KEY).await.unwrap().as_deref(),
            Some("c-42")
        );

        store.clear(CLIENT_PEER_ID_KEY).await.unwrap();
        assert_eq!(store.get(CLIENT_PEER_ID_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileIdentityStore::new(dir.path().join("identity.json"));

        store.set(CLIENT_PEER_ID_KEY, "c-7").await.unwrap();
        assert_eq!(
            store.get(CLIENT_PEER_ID_KEY).await.unwrap().as_deref(),
            Some("c-7")
        );

        store.clear(CLIENT_PEER_ID_KEY).await.unwrap();
        assert_eq!(store.get(CLIENT_PEER_ID_KEY).await.unwrap(), None);
    }
}
