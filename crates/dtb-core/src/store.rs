//! Durable per-user session records.
//!
//! The core only needs single-key get/save/delete with last-write-wins
//! semantics; no transactions are assumed.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{domain::UserId, Result};

/// A channel the user picked as a destination for automated messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBinding {
    pub channel_id: i64,
    pub access_hash: i64,
    pub title: String,
    pub enabled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Serialized protocol session. `None` means "not logged in".
    #[serde(default)]
    pub protocol_session: Option<String>,
    /// Named bindings, e.g. `"orders"` and `"reports"`.
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelBinding>,
}

impl SessionRecord {
    pub fn is_logged_in(&self) -> bool {
        self.protocol_session
            .as_deref()
            .is_some_and(|s| !s.is_empty())
    }

    /// Drop the protocol session and every channel bound through it.
    pub fn clear_protocol(&mut self) {
        self.protocol_session = None;
        self.channels.clear();
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, user: UserId) -> Result<Option<SessionRecord>>;
    async fn save(&self, user: UserId, record: &SessionRecord) -> Result<()>;
    async fn delete(&self, user: UserId) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<UserId, SessionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, user: UserId) -> Result<Option<SessionRecord>> {
        Ok(self.records.lock().await.get(&user).cloned())
    }

    async fn save(&self, user: UserId, record: &SessionRecord) -> Result<()> {
        self.records.lock().await.insert(user, record.clone());
        Ok(())
    }

    async fn delete(&self, user: UserId) -> Result<()> {
        self.records.lock().await.remove(&user);
        Ok(())
    }
}

/// All records in one JSON document, cached in memory and rewritten on each change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    cache: Mutex<HashMap<i64, SessionRecord>>,
}

impl JsonFileStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cache = match tokio::fs::read_to_string(&path).await {
            Ok(txt) if txt.trim().is_empty() => HashMap::new(),
            Ok(txt) => serde_json::from_str(&txt)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            cache: Mutex::new(cache),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, records: &HashMap<i64, SessionRecord>) -> Result<()> {
        let txt = serde_json::to_string_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, txt).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for JsonFileStore {
    async fn get(&self, user: UserId) -> Result<Option<SessionRecord>> {
        Ok(self.cache.lock().await.get(&user.0).cloned())
    }

    async fn save(&self, user: UserId, record: &SessionRecord) -> Result<()> {
        let mut cache = self.cache.lock().await;
        cache.insert(user.0, record.clone());
        self.flush(&cache).await
    }

    async fn delete(&self, user: UserId) -> Result<()> {
        let mut cache = self.cache.lock().await;
        if cache.remove(&user.0).is_some() {
            self.flush(&cache).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let pid = std::process::id();
        std::env::temp_dir().join(format!("{prefix}-{pid}-{ts}.json"))
    }

    fn bound_record() -> SessionRecord {
        let mut rec = SessionRecord {
            protocol_session: Some("1BQANOTEuMTA4LjU2LjE4NA".to_string()),
            ..Default::default()
        };
        rec.channels.insert(
            "orders".to_string(),
            ChannelBinding {
                channel_id: 1_234_567_890,
                access_hash: -4_242_424_242,
                title: "Orders".to_string(),
                enabled: true,
            },
        );
        rec
    }

    #[test]
    fn clear_protocol_drops_blob_and_bindings() {
        let mut rec = bound_record();
        assert!(rec.is_logged_in());
        rec.clear_protocol();
        assert!(!rec.is_logged_in());
        assert!(rec.channels.is_empty());
    }

    #[test]
    fn empty_blob_is_not_logged_in() {
        let rec = SessionRecord {
            protocol_session: Some(String::new()),
            ..Default::default()
        };
        assert!(!rec.is_logged_in());
    }

    #[tokio::test]
    async fn memory_store_last_write_wins() {
        let store = MemoryStore::new();
        let user = UserId(7);
        assert_eq!(store.get(user).await.unwrap(), None);
        store.save(user, &bound_record()).await.unwrap();
        store.save(user, &SessionRecord::default()).await.unwrap();
        assert_eq!(store.get(user).await.unwrap(), Some(SessionRecord::default()));
        store.delete(user).await.unwrap();
        assert_eq!(store.get(user).await.unwrap(), None);
    }

    #[tokio::test]
    async fn json_store_survives_reopen() {
        let path = tmp_path("dtb-store-test");
        let user = UserId(42);
        {
            let store = JsonFileStore::open(&path).await.unwrap();
            store.save(user, &bound_record()).await.unwrap();
            store.save(UserId(43), &SessionRecord::default()).await.unwrap();
            store.delete(UserId(43)).await.unwrap();
        }

        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(reopened.get(user).await.unwrap(), Some(bound_record()));
        assert_eq!(reopened.get(UserId(43)).await.unwrap(), None);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn json_store_missing_file_starts_empty() {
        let path = tmp_path("dtb-store-missing");
        let store = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(store.get(UserId(1)).await.unwrap(), None);
        assert!(!path.exists());
    }
}
