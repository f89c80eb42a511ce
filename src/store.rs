//! Cursor and sender-stats persistence
//!
//! The engine only talks to the [`CursorStore`] and [`StatsStore`] traits.
//! [`MemoryStore`] backs tests; [`JsonFileStore`] keeps every account in a
//! single pretty-printed JSON file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::{Result, SyncError};
use crate::models::{SenderKey, SenderStats, SyncCursor};

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load_cursor(&self, account_id: &str) -> Result<Option<SyncCursor>>;
    async fn save_cursor(&self, account_id: &str, cursor: &SyncCursor) -> Result<()>;
    async fn clear_cursor(&self, account_id: &str) -> Result<()>;
}

#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Merge freshly aggregated stats; ids already stored are replaced, not double counted
    async fn merge_sender_stats(&self, account_id: &str, stats: &[SenderStats]) -> Result<()>;

    /// Retract ids from every sender; returns how many were found
    ///
    /// Counts are recomputed and emptied senders dropped. `first_date`,
    /// `last_date` and the stored unsubscribe links are left as they were.
    async fn remove_messages(&self, account_id: &str, ids: &[String]) -> Result<usize>;

    async fn list_senders(&self, account_id: &str) -> Result<Vec<SenderStats>>;

    /// Forget every sender of the account, keeping its cursor
    async fn clear_senders(&self, account_id: &str) -> Result<()>;
}

/// Everything persisted for one account
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountState {
    pub cursor: Option<SyncCursor>,
    #[serde(with = "sender_list", default)]
    senders: BTreeMap<SenderKey, SenderStats>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl AccountState {
    pub fn merge(&mut self, incoming: &[SenderStats]) {
        let ids: HashSet<String> = incoming
            .iter()
            .flat_map(|s| s.message_ids.iter().cloned())
            .collect();
        self.retract(&ids);

        for stats in incoming {
            match self.senders.get_mut(&stats.key) {
                Some(existing) => existing.absorb(stats),
                None => {
                    self.senders.insert(stats.key.clone(), stats.clone());
                }
            }
        }
        self.touch();
    }

    /// Drop ids everywhere and delete senders left with no messages
    pub fn retract(&mut self, ids: &HashSet<String>) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let removed: usize = self.senders.values_mut().map(|s| s.retract(ids)).sum();
        self.senders.retain(|_, s| s.count > 0);
        self.touch();
        removed
    }

    pub fn senders(&self) -> Vec<SenderStats> {
        self.senders.values().cloned().collect()
    }

    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }

    pub fn message_count(&self) -> usize {
        self.senders.values().map(|s| s.count).sum()
    }

    pub fn clear_senders(&mut self) {
        self.senders.clear();
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }
}

/// SenderKey is a struct, so the map is stored as a plain list of stats
mod sender_list {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(map: &BTreeMap<SenderKey, SenderStats>, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(map.values())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<SenderKey, SenderStats>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let list = Vec::<SenderStats>::deserialize(deserializer)?;
        Ok(list.into_iter().map(|s| (s.key.clone(), s)).collect())
    }
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    accounts: Mutex<HashMap<String, AccountState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn account(&self, account_id: &str) -> AccountState {
        self.accounts
            .lock()
            .await
            .get(account_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn load_cursor(&self, account_id: &str) -> Result<Option<SyncCursor>> {
        Ok(self
            .accounts
            .lock()
            .await
            .get(account_id)
            .and_then(|a| a.cursor.clone()))
    }

    async fn save_cursor(&self, account_id: &str, cursor: &SyncCursor) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        accounts.entry(account_id.to_string()).or_default().cursor = Some(cursor.clone());
        Ok(())
    }

    async fn clear_cursor(&self, account_id: &str) -> Result<()> {
        if let Some(account) = self.accounts.lock().await.get_mut(account_id) {
            account.cursor = None;
        }
        Ok(())
    }
}

#[async_trait]
impl StatsStore for MemoryStore {
    async fn merge_sender_stats(&self, account_id: &str, stats: &[SenderStats]) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        accounts.entry(account_id.to_string()).or_default().merge(stats);
        Ok(())
    }

    async fn remove_messages(&self, account_id: &str, ids: &[String]) -> Result<usize> {
        let ids: HashSet<String> = ids.iter().cloned().collect();
        let mut accounts = self.accounts.lock().await;
        Ok(accounts
            .get_mut(account_id)
            .map(|a| a.retract(&ids))
            .unwrap_or(0))
    }

    async fn list_senders(&self, account_id: &str) -> Result<Vec<SenderStats>> {
        Ok(self
            .accounts
            .lock()
            .await
            .get(account_id)
            .map(AccountState::senders)
            .unwrap_or_default())
    }

    async fn clear_senders(&self, account_id: &str) -> Result<()> {
        if let Some(account) = self.accounts.lock().await.get_mut(account_id) {
            account.clear_senders();
        }
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    accounts: BTreeMap<String, AccountState>,
}

/// Single-file JSON store, rewritten on every change
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<StoreFile>,
}

impl JsonFileStore {
    /// Load the file if it exists, otherwise start empty
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let state = if tokio::fs::try_exists(&path).await? {
            let json = tokio::fs::read_to_string(&path).await?;
            let state: StoreFile = serde_json::from_str(&json).map_err(|e| {
                SyncError::StoreError(format!("Corrupt store file {:?}: {}", path, e))
            })?;
            tracing::info!(
                "Loaded store from {:?}: {} accounts",
                path,
                state.accounts.len()
            );
            state
        } else {
            tracing::info!("No existing store at {:?}, starting fresh", path);
            StoreFile::default()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn account(&self, account_id: &str) -> AccountState {
        self.state
            .lock()
            .await
            .accounts
            .get(account_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Written to a temp file, then renamed over the store
    async fn persist(&self, state: &StoreFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!("Saved store to {:?}", self.path);
        Ok(())
    }
}

#[async_trait]
impl CursorStore for JsonFileStore {
    async fn load_cursor(&self, account_id: &str) -> Result<Option<SyncCursor>> {
        Ok(self
            .state
            .lock()
            .await
            .accounts
            .get(account_id)
            .and_then(|a| a.cursor.clone()))
    }

    async fn save_cursor(&self, account_id: &str, cursor: &SyncCursor) -> Result<()> {
        let mut state = self.state.lock().await;
        let account = state.accounts.entry(account_id.to_string()).or_default();
        account.cursor = Some(cursor.clone());
        account.touch();
        self.persist(&state).await
    }

    async fn clear_cursor(&self, account_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(account) = state.accounts.get_mut(account_id) {
            account.cursor = None;
            account.touch();
        }
        self.persist(&state).await
    }
}

#[async_trait]
impl StatsStore for JsonFileStore {
    async fn merge_sender_stats(&self, account_id: &str, stats: &[SenderStats]) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .accounts
            .entry(account_id.to_string())
            .or_default()
            .merge(stats);
        self.persist(&state).await
    }

    async fn remove_messages(&self, account_id: &str, ids: &[String]) -> Result<usize> {
        let ids: HashSet<String> = ids.iter().cloned().collect();
        let mut state = self.state.lock().await;
        let removed = state
            .accounts
            .get_mut(account_id)
            .map(|a| a.retract(&ids))
            .unwrap_or(0);
        if removed > 0 {
            self.persist(&state).await?;
        }
        Ok(removed)
    }

    async fn list_senders(&self, account_id: &str) -> Result<Vec<SenderStats>> {
        Ok(self
            .state
            .lock()
            .await
            .accounts
            .get(account_id)
            .map(AccountState::senders)
            .unwrap_or_default())
    }

    async fn clear_senders(&self, account_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.accounts.get_mut(account_id) {
            Some(account) => account.clear_senders(),
            None => return Ok(()),
        }
        self.persist(&state).await
    }
}
