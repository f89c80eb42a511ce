//! Full vs. incremental synchronization driven by an opaque provider cursor

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::models::{DeltaNext, DeltaPosition, MessageRef, SyncCursor};
use crate::provider::ProviderClient;
use crate::store::CursorStore;

/// Sync state for one account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    /// No cursor stored: a full sync (or a baseline) is required
    Uninitialized,
    /// Baseline captured, full pass not yet finished
    FullSyncInProgress,
    /// Cursor present, incremental sync available
    Established,
}

impl SyncPhase {
    fn from_cursor(cursor: Option<&SyncCursor>) -> Self {
        match cursor {
            None => SyncPhase::Uninitialized,
            Some(c) if c.established => SyncPhase::Established,
            Some(_) => SyncPhase::FullSyncInProgress,
        }
    }
}

/// Changed and removed ids accumulated across pages
///
/// The latest event for an id wins: a removal drops an earlier change and a
/// later change re-adds a removed id.
#[derive(Debug, Default)]
pub struct ChangeSet {
    changed: BTreeMap<String, MessageRef>,
    removed: BTreeSet<String>,
}

impl ChangeSet {
    pub fn mark_changed(&mut self, message: MessageRef) {
        if message.id.is_empty() {
            return;
        }
        self.removed.remove(&message.id);
        self.changed.insert(message.id.clone(), message);
    }

    pub fn mark_removed(&mut self, id: String) {
        if id.is_empty() {
            return;
        }
        self.changed.remove(&id);
        self.removed.insert(id);
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }

    pub fn into_parts(self) -> (Vec<MessageRef>, Vec<String>) {
        (
            self.changed.into_values().collect(),
            self.removed.into_iter().collect(),
        )
    }
}

/// Outcome of one incremental sync, before the cursor is committed
#[derive(Debug, Clone)]
pub struct DeltaResult {
    pub changed: Vec<MessageRef>,
    pub removed_ids: Vec<String>,
    /// Replaces the stored cursor once the caller has persisted the changes
    pub cursor: SyncCursor,
    pub pages: usize,
}

impl DeltaResult {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed_ids.is_empty()
    }
}

pub struct DeltaSyncManager {
    provider: Arc<dyn ProviderClient>,
    cursors: Arc<dyn CursorStore>,
    account_id: String,
    cursor: Option<SyncCursor>,
    phase: SyncPhase,
}

impl DeltaSyncManager {
    /// Restore the phase from the stored cursor
    pub async fn load(
        provider: Arc<dyn ProviderClient>,
        cursors: Arc<dyn CursorStore>,
        account_id: impl Into<String>,
    ) -> Result<Self> {
        let account_id = account_id.into();
        let cursor = cursors.load_cursor(&account_id).await?;
        let phase = SyncPhase::from_cursor(cursor.as_ref());

        if phase == SyncPhase::FullSyncInProgress {
            warn!("Account {} has an unfinished full sync; it will restart", account_id);
        }
        debug!("Loaded sync state for {}: {:?}", account_id, phase);

        Ok(Self {
            provider,
            cursors,
            account_id,
            cursor,
            phase,
        })
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn cursor(&self) -> Option<&SyncCursor> {
        self.cursor.as_ref()
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Jump straight to Established with a "from now on" cursor
    pub async fn establish_baseline(&mut self) -> Result<SyncCursor> {
        let mut cursor = self.provider.establish_baseline().await?;
        cursor.established = true;
        self.store(cursor.clone(), SyncPhase::Established).await?;
        info!("Established baseline cursor for {}", self.account_id);
        Ok(cursor)
    }

    /// Capture the baseline before a full pull so changes made during the
    /// pull are picked up by the first delta
    pub async fn begin_full_sync(&mut self) -> Result<SyncCursor> {
        let mut cursor = self.provider.establish_baseline().await?;
        cursor.established = false;
        self.store(cursor.clone(), SyncPhase::FullSyncInProgress).await?;
        info!("Full sync started for {}", self.account_id);
        Ok(cursor)
    }

    pub async fn finish_full_sync(&mut self) -> Result<()> {
        let mut cursor = match (self.phase, self.cursor.clone()) {
            (SyncPhase::FullSyncInProgress, Some(cursor)) => cursor,
            (phase, _) => {
                return Err(SyncError::StateError(format!(
                    "Cannot finish a full sync in phase {:?}",
                    phase
                )))
            }
        };
        cursor.established = true;
        self.store(cursor, SyncPhase::Established).await?;
        info!("Full sync finished for {}", self.account_id);
        Ok(())
    }

    /// Follow delta pages from the stored cursor to the terminal page
    ///
    /// Nothing is saved; pass the returned cursor to [`commit`](Self::commit)
    /// after the changes are persisted. An expired cursor resets the manager
    /// to Uninitialized before the error is returned.
    pub async fn sync(&mut self) -> Result<DeltaResult> {
        let cursor = match (self.phase, &self.cursor) {
            (SyncPhase::Established, Some(cursor)) => cursor.clone(),
            (phase, _) => {
                return Err(SyncError::StateError(format!(
                    "Incremental sync requires an established cursor (phase {:?})",
                    phase
                )))
            }
        };

        match self.follow_pages(cursor).await {
            Err(SyncError::CursorExpired(msg)) => {
                warn!("Sync cursor for {} expired: {}", self.account_id, msg);
                self.reset().await?;
                Err(SyncError::CursorExpired(msg))
            }
            other => other,
        }
    }

    async fn follow_pages(&self, cursor: SyncCursor) -> Result<DeltaResult> {
        let mut position = DeltaPosition::Cursor(cursor);
        let mut changes = ChangeSet::default();
        let mut pages = 0usize;

        loop {
            let page = self.provider.get_delta(&position).await?;
            pages += 1;
            debug!(
                "Delta page {}: {} changed, {} removed",
                pages,
                page.changed.len(),
                page.removed_ids.len()
            );

            for message in page.changed {
                changes.mark_changed(message);
            }
            for id in page.removed_ids {
                changes.mark_removed(id);
            }

            match page.next {
                DeltaNext::Continue(next) => position = DeltaPosition::Continuation(next),
                DeltaNext::Complete(mut next_cursor) => {
                    next_cursor.established = true;
                    let (changed, removed_ids) = changes.into_parts();
                    info!(
                        "Delta for {}: {} changed, {} removed over {} pages",
                        self.account_id,
                        changed.len(),
                        removed_ids.len(),
                        pages
                    );
                    return Ok(DeltaResult {
                        changed,
                        removed_ids,
                        cursor: next_cursor,
                        pages,
                    });
                }
            }
        }
    }

    /// Replace the stored cursor after a sync's changes are persisted
    pub async fn commit(&mut self, cursor: SyncCursor) -> Result<()> {
        if self.phase != SyncPhase::Established {
            return Err(SyncError::StateError(format!(
                "Cannot commit a cursor in phase {:?}",
                self.phase
            )));
        }
        self.store(cursor, SyncPhase::Established).await
    }

    /// Forget the cursor; the next sync must be a full one
    pub async fn reset(&mut self) -> Result<()> {
        self.cursors.clear_cursor(&self.account_id).await?;
        self.cursor = None;
        self.phase = SyncPhase::Uninitialized;
        info!("Sync state reset for {}", self.account_id);
        Ok(())
    }

    async fn store(&mut self, cursor: SyncCursor, phase: SyncPhase) -> Result<()> {
        self.cursors.save_cursor(&self.account_id, &cursor).await?;
        self.cursor = Some(cursor);
        self.phase = phase;
        Ok(())
    }
}
