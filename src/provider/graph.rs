//! Graph-style provider: Microsoft Graph mail API
//!
//! OData list/get endpoints, `$batch` multiplexing of up to 20 sub-requests,
//! and `/delta` paging via `@odata.nextLink` / `@odata.deltaLink`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::{join_url, ItemResults, ProviderClient};
use crate::config::{ProviderKind, GRAPH_MAX_BATCH};
use crate::error::{parse_retry_after_value, Result, SyncError};
use crate::models::{
    DeltaNext, DeltaPage, DeltaPosition, Message, MessageHeader, MessagePage, MessageRef,
    MutationOp, PageOptions, SyncCursor, UnsubscribeInfo,
};
use crate::requester::{RateLimitedRequester, RequestDescriptor};

pub const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const MAX_PAGE_SIZE: u32 = 1000;

const LIST_SELECT: &str = "id,conversationId";
const MESSAGE_SELECT: &str = "id,conversationId,subject,bodyPreview,receivedDateTime,isRead,from,\
parentFolderId,inferenceClassification,internetMessageHeaders";

const INBOX_MESSAGES: &str = "me/mailFolders/inbox/messages";
const INBOX_DELTA: &str = "me/mailFolders/inbox/messages/delta";

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct GraphPage<T> {
    #[serde(default)]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessageRef {
    id: String,
    conversation_id: Option<String>,
    #[serde(rename = "@removed")]
    removed: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    conversation_id: Option<String>,
    subject: Option<String>,
    body_preview: Option<String>,
    received_date_time: Option<DateTime<Utc>>,
    is_read: Option<bool>,
    from: Option<GraphRecipient>,
    parent_folder_id: Option<String>,
    inference_classification: Option<String>,
    internet_message_headers: Option<Vec<GraphHeader>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: Option<GraphEmailAddress>,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    name: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    responses: Vec<BatchSubResponse>,
}

#[derive(Debug, Deserialize)]
struct BatchSubResponse {
    id: String,
    status: u16,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Value,
}

impl BatchSubResponse {
    fn retry_after(&self) -> Option<u64> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("retry-after"))
            .and_then(|(_, v)| parse_retry_after_value(v))
    }

    fn into_error(self) -> SyncError {
        let retry_after = self.retry_after();
        let message = self
            .body
            .pointer("/error/message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.body.to_string());
        SyncError::from_status(self.status, retry_after, message)
    }
}

pub struct GraphProvider {
    requester: RateLimitedRequester,
    base_url: String,
    chunk_size: usize,
    /// Follow-up `$batch` rounds for throttled sub-requests
    max_batch_rounds: u32,
}

impl GraphProvider {
    pub fn new(
        requester: RateLimitedRequester,
        base_url: String,
        chunk_size: usize,
        max_batch_rounds: u32,
    ) -> Self {
        Self {
            requester,
            base_url,
            chunk_size: chunk_size.clamp(1, GRAPH_MAX_BATCH),
            max_batch_rounds,
        }
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    /// Run sub-requests through `$batch`, re-issuing throttled ones
    ///
    /// `build` maps a message id to its sub-request (method, relative url,
    /// optional body). Every id ends up with exactly one outcome.
    async fn run_batch<F>(&self, ids: &[String], build: F) -> ItemResults<Value>
    where
        F: Fn(&str) -> (&'static str, String, Option<Value>) + Send + Sync,
    {
        let mut results: ItemResults<Value> = Vec::with_capacity(ids.len());
        let mut pending: Vec<String> = ids.to_vec();
        let mut round = 0u32;

        while !pending.is_empty() {
            let requests: Vec<Value> = pending
                .iter()
                .enumerate()
                .map(|(index, id)| {
                    let (method, url, body) = build(id);
                    let mut request = json!({
                        "id": index.to_string(),
                        "method": method,
                        "url": url,
                    });
                    if let Some(body) = body {
                        request["body"] = body;
                        request["headers"] = json!({ "Content-Type": "application/json" });
                    }
                    request
                })
                .collect();

            let descriptor = RequestDescriptor::post(self.url("$batch"))
                .json(json!({ "requests": requests }));

            let response: BatchResponse = match self.requester.send_json(&descriptor).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("$batch call for {} items failed: {}", pending.len(), e);
                    results.extend(pending.drain(..).map(|id| (id, Err(e.duplicate()))));
                    break;
                }
            };

            let mut by_index: HashMap<usize, BatchSubResponse> = response
                .responses
                .into_iter()
                .filter_map(|r| r.id.parse::<usize>().ok().map(|i| (i, r)))
                .collect();

            let mut throttled = Vec::new();
            let mut hint: Option<u64> = None;

            for (index, id) in pending.drain(..).enumerate() {
                match by_index.remove(&index) {
                    Some(sub) if (200..300).contains(&sub.status) => {
                        results.push((id, Ok(sub.body)));
                    }
                    Some(sub) if matches!(sub.status, 429 | 503) && round < self.max_batch_rounds => {
                        hint = hint.max(sub.retry_after());
                        throttled.push(id);
                    }
                    Some(sub) => results.push((id, Err(sub.into_error()))),
                    None => results.push((
                        id,
                        Err(SyncError::MalformedResponse(
                            "$batch response missing sub-response".to_string(),
                        )),
                    )),
                }
            }

            if !throttled.is_empty() {
                let delay = match hint {
                    Some(secs) => Duration::from_secs(secs),
                    None => self.requester.policy().jittered_delay(round),
                };
                warn!(
                    "{} $batch sub-requests throttled (round {}/{}). Retrying in {:?}...",
                    throttled.len(),
                    round + 1,
                    self.max_batch_rounds,
                    delay
                );
                tokio::time::sleep(delay).await;
                round += 1;
            }
            pending = throttled;
        }

        results
    }
}

#[async_trait]
impl ProviderClient for GraphProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Graph
    }

    fn batch_limit(&self) -> usize {
        self.chunk_size
    }

    fn supports_multiplexing(&self) -> bool {
        true
    }

    async fn list_inbox(&self, options: &PageOptions) -> Result<MessagePage> {
        let url = match &options.continuation {
            Some(next) => next.clone(),
            None => {
                let top = options.page_size.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
                format!("{}?$select={}&$top={}", self.url(INBOX_MESSAGES), LIST_SELECT, top)
            }
        };

        let page: GraphPage<GraphMessageRef> =
            self.requester.send_json(&RequestDescriptor::get(url)).await?;

        let messages: Vec<MessageRef> = page
            .value
            .into_iter()
            .map(|m| MessageRef {
                id: m.id,
                thread_id: m.conversation_id,
            })
            .collect();

        debug!("Graph inbox page: {} messages, more={}", messages.len(), page.next_link.is_some());
        Ok(MessagePage {
            messages,
            next_page: page.next_link,
        })
    }

    async fn get_message_with_headers(&self, id: &str) -> Result<Message> {
        let url = format!("{}?$select={}", self.url(&format!("me/messages/{}", id)), MESSAGE_SELECT);
        let raw: GraphMessage = self.requester.send_json(&RequestDescriptor::get(url)).await?;
        Ok(convert_message(raw))
    }

    async fn batch_get_messages(&self, ids: &[String]) -> ItemResults<Message> {
        let outcomes = self
            .run_batch(ids, |id| {
                ("GET", format!("/me/messages/{}?$select={}", id, MESSAGE_SELECT), None)
            })
            .await;

        outcomes
            .into_iter()
            .map(|(id, outcome)| {
                let parsed = outcome.and_then(|body| {
                    serde_json::from_value::<GraphMessage>(body)
                        .map(convert_message)
                        .map_err(|e| SyncError::MalformedResponse(format!("message {}: {}", id, e)))
                });
                (id, parsed)
            })
            .collect()
    }

    async fn move_to_trash(&self, id: &str) -> Result<()> {
        self.move_to(id, MutationOp::Trash).await
    }

    async fn move_to_archive(&self, id: &str) -> Result<()> {
        self.move_to(id, MutationOp::Archive).await
    }

    async fn batch_mutate(&self, ids: &[String], op: MutationOp) -> ItemResults<()> {
        let destination = destination_for(op);
        self.run_batch(ids, |id| {
            (
                "POST",
                format!("/me/messages/{}/move", id),
                Some(json!({ "destinationId": destination })),
            )
        })
        .await
        .into_iter()
        .map(|(id, outcome)| (id, outcome.map(|_| ())))
        .collect()
    }

    async fn send_mail(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let request = RequestDescriptor::post(self.url("me/sendMail")).json(json!({
            "message": {
                "subject": subject,
                "body": { "contentType": "Text", "content": body },
                "toRecipients": [{ "emailAddress": { "address": to } }]
            },
            "saveToSentItems": false
        }));
        self.requester.send(&request).await
    }

    async fn get_delta(&self, position: &DeltaPosition) -> Result<DeltaPage> {
        // Both delta and next links are opaque and replayed as-is
        let url = match position {
            DeltaPosition::Cursor(cursor) => cursor.token.clone(),
            DeltaPosition::Continuation(next) => next.clone(),
        };

        let page: GraphPage<GraphMessageRef> = self
            .requester
            .send_json(&RequestDescriptor::get(url))
            .await
            .map_err(|e| match e {
                SyncError::ApiError { status: 410, message } => SyncError::CursorExpired(message),
                other => other,
            })?;

        let mut changed = Vec::new();
        let mut removed_ids = Vec::new();
        for item in page.value {
            if item.removed.is_some() {
                removed_ids.push(item.id);
            } else {
                changed.push(MessageRef {
                    id: item.id,
                    thread_id: item.conversation_id,
                });
            }
        }

        let next = match (page.next_link, page.delta_link) {
            (Some(next), _) => DeltaNext::Continue(next),
            (None, Some(delta)) => DeltaNext::Complete(SyncCursor::established(delta)),
            (None, None) => {
                return Err(SyncError::MalformedResponse(
                    "Delta page has neither @odata.nextLink nor @odata.deltaLink".to_string(),
                ))
            }
        };

        Ok(DeltaPage {
            changed,
            removed_ids,
            next,
        })
    }

    async fn establish_baseline(&self) -> Result<SyncCursor> {
        let mut next = format!("{}?$select={}&$deltatoken=latest", self.url(INBOX_DELTA), LIST_SELECT);

        // `latest` normally answers with a deltaLink straight away
        loop {
            let page: GraphPage<GraphMessageRef> =
                self.requester.send_json(&RequestDescriptor::get(&next)).await?;
            match (page.next_link, page.delta_link) {
                (_, Some(delta)) => return Ok(SyncCursor::established(delta)),
                (Some(link), None) => next = link,
                (None, None) => {
                    return Err(SyncError::MalformedResponse(
                        "Baseline delta returned no deltaLink".to_string(),
                    ))
                }
            }
        }
    }
}

impl GraphProvider {
    async fn move_to(&self, id: &str, op: MutationOp) -> Result<()> {
        let request = RequestDescriptor::post(self.url(&format!("me/messages/{}/move", id)))
            .json(json!({ "destinationId": destination_for(op) }));
        self.requester.send(&request).await
    }
}

/// Well-known folder names accepted as `destinationId`
fn destination_for(op: MutationOp) -> &'static str {
    match op {
        MutationOp::Trash => "deleteditems",
        MutationOp::Archive => "archive",
    }
}

fn convert_message(raw: GraphMessage) -> Message {
    let (sender_name, sender_email) = raw
        .from
        .and_then(|r| r.email_address)
        .map(|addr| {
            let email = addr.address.unwrap_or_default().trim().to_lowercase();
            let name = addr
                .name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| email.clone());
            (name, email)
        })
        .unwrap_or_default();

    let headers = raw
        .internet_message_headers
        .unwrap_or_default()
        .into_iter()
        .map(|h| MessageHeader::new(h.name, h.value))
        .collect();

    Message {
        id: raw.id,
        thread_id: raw.conversation_id.unwrap_or_default(),
        sender_email,
        sender_name,
        subject: raw.subject.unwrap_or_default(),
        preview: raw.body_preview.unwrap_or_default(),
        // Graph always sends receivedDateTime in UTC; epoch marks a missing value
        received_at: raw.received_date_time.unwrap_or_default(),
        is_read: raw.is_read.unwrap_or(true),
        folders: raw.parent_folder_id.into_iter().collect(),
        is_promotional: raw
            .inference_classification
            .map(|c| c.eq_ignore_ascii_case("other"))
            .unwrap_or(false),
        headers,
        unsubscribe: UnsubscribeInfo::default(),
    }
}
