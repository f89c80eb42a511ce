//! Delete/archive across sender message sets, and single-sender unsubscribe

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::batch::BatchFetcher;
use crate::config::UnsubscribeConfig;
use crate::error::Result;
use crate::models::{MutationOp, SenderKey, SenderStats};
use crate::provider::ProviderClient;
use crate::requester::{RateLimitedRequester, RequestDescriptor};

/// One sender's messages to mutate
#[derive(Debug, Clone)]
pub struct SenderTarget {
    pub key: SenderKey,
    pub message_ids: Vec<String>,
}

impl From<&SenderStats> for SenderTarget {
    fn from(stats: &SenderStats) -> Self {
        Self {
            key: stats.key.clone(),
            message_ids: stats.message_ids.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SenderMutationResult {
    pub key: SenderKey,
    pub succeeded: usize,
    pub failed: usize,
    pub failed_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkMutationReport {
    pub operation: MutationOp,
    pub per_sender: Vec<SenderMutationResult>,
    pub total_affected: usize,
    pub total_failed: usize,
    /// Ids the provider accepted, for retracting from the stats store
    #[serde(skip)]
    pub succeeded_ids: Vec<String>,
}

/// What `unsubscribe` did, or what the caller still has to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnsubscribeOutcome {
    /// Visit the link (may need a human in the loop)
    OpenLink { url: String, one_click: bool },
    /// RFC 8058 one-click POST accepted by the sender
    OneClickCompleted { url: String },
    /// Unsubscribe request mailed through the provider
    EmailSent { to: String },
    RequiresManualAction,
}

/// Recipient, subject and body of a `mailto:` unsubscribe link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailtoRequest {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Parse a `mailto:` URI, falling back to the configured subject and body
pub fn parse_mailto(link: &str, defaults: &UnsubscribeConfig) -> Option<MailtoRequest> {
    let url = Url::parse(link.trim()).ok()?;
    if url.scheme() != "mailto" {
        return None;
    }

    let to = url.path().split(',').next()?.trim().to_string();
    if !to.contains('@') {
        return None;
    }

    let mut subject = None;
    let mut body = None;
    for (key, value) in url.query_pairs() {
        match key.to_ascii_lowercase().as_str() {
            "subject" if !value.trim().is_empty() => subject = Some(value.into_owned()),
            "body" if !value.trim().is_empty() => body = Some(value.into_owned()),
            _ => {}
        }
    }

    Some(MailtoRequest {
        to,
        subject: subject.unwrap_or_else(|| defaults.default_subject.clone()),
        body: body.unwrap_or_else(|| defaults.default_body.clone()),
    })
}

pub struct BulkMutationExecutor {
    provider: Arc<dyn ProviderClient>,
    fetcher: BatchFetcher,
    /// Used for one-click POSTs; these never carry the provider credential
    http: Option<RateLimitedRequester>,
    unsubscribe: UnsubscribeConfig,
}

impl BulkMutationExecutor {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        fetcher: BatchFetcher,
        unsubscribe: UnsubscribeConfig,
    ) -> Self {
        Self {
            provider,
            fetcher,
            http: None,
            unsubscribe,
        }
    }

    pub fn with_one_click_requester(mut self, requester: RateLimitedRequester) -> Self {
        self.http = Some(requester);
        self
    }

    /// Apply `op` to every target's messages
    ///
    /// Item failures are reported per sender; only a systemic failure is an
    /// error. An id listed under several senders is attributed to the first.
    pub async fn execute(&self, op: MutationOp, targets: &[SenderTarget]) -> Result<BulkMutationReport> {
        let mut owner: HashMap<&str, usize> = HashMap::new();
        let mut ids = Vec::new();
        for (index, target) in targets.iter().enumerate() {
            for id in &target.message_ids {
                if !owner.contains_key(id.as_str()) {
                    owner.insert(id.as_str(), index);
                    ids.push(id.clone());
                }
            }
        }

        info!("{} {} messages from {} senders", op, ids.len(), targets.len());
        let outcome = self.fetcher.mutate(ids, op).await?;

        let mut per_sender: Vec<SenderMutationResult> = targets
            .iter()
            .map(|t| SenderMutationResult {
                key: t.key.clone(),
                succeeded: 0,
                failed: 0,
                failed_ids: Vec::new(),
            })
            .collect();

        let mut succeeded_ids = Vec::with_capacity(outcome.success_count());
        for (id, _) in outcome.succeeded {
            if let Some(&index) = owner.get(id.as_str()) {
                per_sender[index].succeeded += 1;
            }
            succeeded_ids.push(id);
        }
        for failure in &outcome.failures {
            if let Some(&index) = owner.get(failure.id.as_str()) {
                per_sender[index].failed += 1;
                per_sender[index].failed_ids.push(failure.id.clone());
            }
        }

        let report = BulkMutationReport {
            operation: op,
            total_affected: succeeded_ids.len(),
            total_failed: outcome.failures.len(),
            per_sender,
            succeeded_ids,
        };

        if report.total_failed > 0 {
            warn!(
                "{}: {} affected, {} failed",
                op, report.total_affected, report.total_failed
            );
        } else {
            info!("{}: {} affected", op, report.total_affected);
        }
        Ok(report)
    }

    /// Unsubscribe from one sender
    ///
    /// The HTTP link wins. With one-click enabled and supported, the POST is
    /// sent here; otherwise the link goes back to the caller. A mailto-only
    /// sender gets an email through the provider.
    pub async fn unsubscribe(&self, stats: &SenderStats) -> Result<UnsubscribeOutcome> {
        if let Some(url) = &stats.unsubscribe_link {
            if stats.one_click && self.unsubscribe.one_click_post {
                if let Some(http) = &self.http {
                    let request = RequestDescriptor::post(url.as_str())
                        .unauthenticated()
                        .form(&[("List-Unsubscribe", "One-Click")]);
                    match http.send(&request).await {
                        Ok(()) => {
                            info!("One-click unsubscribe accepted for {}", stats.key);
                            return Ok(UnsubscribeOutcome::OneClickCompleted { url: url.clone() });
                        }
                        Err(e) => warn!("One-click unsubscribe for {} failed: {}", stats.key, e),
                    }
                }
            }
            return Ok(UnsubscribeOutcome::OpenLink {
                url: url.clone(),
                one_click: stats.one_click,
            });
        }

        if let Some(link) = &stats.mailto_link {
            match parse_mailto(link, &self.unsubscribe) {
                Some(mail) => {
                    self.provider
                        .send_mail(&mail.to, &mail.subject, &mail.body)
                        .await?;
                    info!("Sent unsubscribe email to {} for {}", mail.to, stats.key);
                    return Ok(UnsubscribeOutcome::EmailSent { to: mail.to });
                }
                None => warn!("Unusable mailto link for {}: {}", stats.key, link),
            }
        }

        Ok(UnsubscribeOutcome::RequiresManualAction)
    }
}
