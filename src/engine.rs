//! End-to-end synchronization: list or delta, enrich, annotate, aggregate, persist
//!
//! [`SyncEngine`] owns the [`DeltaSyncManager`] for one account and decides
//! between a full pass and an incremental one. Stats and removals are always
//! persisted before the new cursor is committed.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregator::SenderAggregator;
use crate::batch::BatchFetcher;
use crate::bulk::{BulkMutationExecutor, BulkMutationReport, SenderTarget, UnsubscribeOutcome};
use crate::config::Config;
use crate::delta::{DeltaSyncManager, SyncPhase};
use crate::error::{Result, SyncError};
use crate::models::{Message, MutationOp, SenderStats, SyncCursor};
use crate::provider::ProviderClient;
use crate::requester::RateLimitedRequester;
use crate::scanner::InboxScanner;
use crate::store::{CursorStore, StatsStore};
use crate::unsubscribe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    Incremental,
}

/// Summary of one `run`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: String,
    pub account_id: String,
    pub mode: SyncMode,
    /// An incremental sync found its cursor expired and fell back to a full one
    pub cursor_expired: bool,
    pub pages: usize,
    pub messages_fetched: usize,
    /// Enrichment failures other than "message no longer exists"
    pub enrichment_failures: usize,
    pub skipped_messages: usize,
    pub senders_updated: usize,
    pub removed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncReport {
    fn new(account_id: &str, mode: SyncMode) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            mode,
            cursor_expired: false,
            pages: 0,
            messages_fetched: 0,
            enrichment_failures: 0,
            skipped_messages: 0,
            senders_updated: 0,
            removed: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn duration_seconds(&self) -> i64 {
        self.finished_at
            .map(|end| (end - self.started_at).num_seconds())
            .unwrap_or(0)
    }
}

/// Messages that enriched, plus ids the provider no longer has
struct Enriched {
    messages: Vec<Message>,
    gone: Vec<String>,
}

/// Snapshot for `status`
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub account_id: String,
    pub phase: SyncPhase,
    pub cursor: Option<SyncCursor>,
    pub sender_count: usize,
    pub message_count: usize,
}

pub struct SyncEngine {
    provider: Arc<dyn ProviderClient>,
    stats: Arc<dyn StatsStore>,
    fetcher: BatchFetcher,
    manager: DeltaSyncManager,
    mutations: BulkMutationExecutor,
    page_size: Option<u32>,
}

impl SyncEngine {
    pub async fn new(
        provider: Arc<dyn ProviderClient>,
        cursors: Arc<dyn CursorStore>,
        stats: Arc<dyn StatsStore>,
        config: &Config,
    ) -> Result<Self> {
        let fetcher = BatchFetcher::new(provider.clone(), &config.batch);
        let manager =
            DeltaSyncManager::load(provider.clone(), cursors, config.provider.account_id.clone()).await?;
        let mutations = BulkMutationExecutor::new(
            provider.clone(),
            fetcher.clone(),
            config.unsubscribe.clone(),
        );

        Ok(Self {
            provider,
            stats,
            fetcher,
            manager,
            mutations,
            page_size: config.sync.page_size,
        })
    }

    /// Enable RFC 8058 one-click POSTs through `requester`
    pub fn with_one_click_requester(mut self, requester: RateLimitedRequester) -> Self {
        self.mutations = self.mutations.with_one_click_requester(requester);
        self
    }

    pub fn account_id(&self) -> &str {
        self.manager.account_id()
    }

    pub fn phase(&self) -> SyncPhase {
        self.manager.phase()
    }

    /// Incremental when a cursor is established, full otherwise
    ///
    /// An expired cursor during an incremental run falls back to a full one.
    pub async fn run(&mut self, force_full: bool) -> Result<SyncReport> {
        let incremental = !force_full && self.manager.phase() == SyncPhase::Established;

        let mut report = if incremental {
            let mut report = SyncReport::new(self.account_id(), SyncMode::Incremental);
            match self.incremental_sync(&mut report).await {
                Ok(()) => report,
                Err(SyncError::CursorExpired(msg)) => {
                    warn!("Falling back to a full sync: {}", msg);
                    let mut report = SyncReport::new(self.account_id(), SyncMode::Full);
                    report.cursor_expired = true;
                    self.full_sync(&mut report).await?;
                    report
                }
                Err(e) => return Err(e),
            }
        } else {
            let mut report = SyncReport::new(self.account_id(), SyncMode::Full);
            self.full_sync(&mut report).await?;
            report
        };

        report.finished_at = Some(Utc::now());
        info!(
            "Sync {} ({:?}) finished: {} fetched, {} senders updated, {} removed, {} failures",
            report.run_id,
            report.mode,
            report.messages_fetched,
            report.senders_updated,
            report.removed,
            report.enrichment_failures
        );
        Ok(report)
    }

    /// Capture a cursor without pulling content
    pub async fn establish_baseline(&mut self) -> Result<SyncCursor> {
        self.manager.establish_baseline().await
    }

    async fn full_sync(&mut self, report: &mut SyncReport) -> Result<()> {
        self.manager.begin_full_sync().await?;
        let account_id = self.account_id().to_string();
        self.stats.clear_senders(&account_id).await?;

        let scanner = InboxScanner::new(self.provider.clone(), self.page_size);
        let mut pages = scanner.pages();

        while let Some(page) = pages.next().await {
            let page = page?;
            report.pages = page.number;

            let ids = page.ids();
            if ids.is_empty() {
                continue;
            }

            let enriched = self.enrich(ids, report).await?;
            if !enriched.gone.is_empty() {
                info!("{} listed messages disappeared before enrichment", enriched.gone.len());
            }
            self.persist(&account_id, &enriched.messages, report).await?;
        }
        drop(pages);

        self.manager.finish_full_sync().await
    }

    async fn incremental_sync(&mut self, report: &mut SyncReport) -> Result<()> {
        let delta = self.manager.sync().await?;
        report.pages = delta.pages;

        if delta.is_empty() {
            info!("No changes since the last sync");
            return self.manager.commit(delta.cursor).await;
        }

        let account_id = self.account_id().to_string();
        let ids: Vec<String> = delta.changed.into_iter().map(|m| m.id).collect();
        let enriched = if ids.is_empty() {
            Enriched {
                messages: Vec::new(),
                gone: Vec::new(),
            }
        } else {
            self.enrich(ids, report).await?
        };

        let mut removed = delta.removed_ids;
        removed.extend(enriched.gone);
        if !removed.is_empty() {
            report.removed = self.stats.remove_messages(&account_id, &removed).await?;
        }

        self.persist(&account_id, &enriched.messages, report).await?;
        self.manager.commit(delta.cursor).await
    }

    /// Fetch headers and annotate unsubscribe affordances
    ///
    /// A 404 means the message is gone; other item failures are counted.
    async fn enrich(&self, ids: Vec<String>, report: &mut SyncReport) -> Result<Enriched> {
        let outcome = self.fetcher.fetch_messages(ids).await?;

        let mut gone = Vec::new();
        for failure in &outcome.failures {
            match failure.error {
                SyncError::NotFound(_) => gone.push(failure.id.clone()),
                _ => report.enrichment_failures += 1,
            }
        }

        let mut messages = outcome.values();
        for message in &mut messages {
            unsubscribe::annotate(message);
        }
        report.messages_fetched += messages.len();

        Ok(Enriched { messages, gone })
    }

    async fn persist(&self, account_id: &str, messages: &[Message], report: &mut SyncReport) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut aggregator = SenderAggregator::new();
        aggregator.aggregate(messages);
        report.skipped_messages += aggregator.skipped();

        let stats = aggregator.into_stats();
        report.senders_updated += stats.len();
        self.stats.merge_sender_stats(account_id, &stats).await
    }

    pub async fn senders(&self) -> Result<Vec<SenderStats>> {
        self.stats.list_senders(self.account_id()).await
    }

    /// Every sender key sharing `email`, whatever the display name
    pub async fn find_senders(&self, email: &str) -> Result<Vec<SenderStats>> {
        let email = email.trim().to_lowercase();
        Ok(self
            .senders()
            .await?
            .into_iter()
            .filter(|s| s.key.email == email)
            .collect())
    }

    /// Delete or archive every message of `targets`, then retract what succeeded
    pub async fn apply_mutation(&self, op: MutationOp, targets: &[SenderTarget]) -> Result<BulkMutationReport> {
        let report = self.mutations.execute(op, targets).await?;
        if !report.succeeded_ids.is_empty() {
            let retracted = self
                .stats
                .remove_messages(self.account_id(), &report.succeeded_ids)
                .await?;
            info!("Retracted {} messages from sender stats", retracted);
        }
        Ok(report)
    }

    /// Unsubscribe from the sender address, using its most recently seen affordance
    pub async fn unsubscribe(&self, email: &str) -> Result<UnsubscribeOutcome> {
        let sender = self
            .find_senders(email)
            .await?
            .into_iter()
            .max_by_key(|s| s.last_date)
            .ok_or_else(|| SyncError::NotFound(format!("No sender with address {}", email)))?;

        self.mutations.unsubscribe(&sender).await
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let senders = self.senders().await?;
        Ok(EngineStatus {
            account_id: self.account_id().to_string(),
            phase: self.manager.phase(),
            cursor: self.manager.cursor().cloned(),
            sender_count: senders.len(),
            message_count: senders.iter().map(|s| s.count).sum(),
        })
    }
}
