//! Conversation-style provider: Gmail REST API
//!
//! Wire types come from `google-gmail1`; transport, auth and retry go
//! through [`RateLimitedRequester`]. Continuation handles are full request
//! URLs carrying `pageToken`, replayed verbatim.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use google_gmail1::api::{ListHistoryResponse, ListMessagesResponse, Profile};
use serde_json::json;
use tracing::debug;
use url::Url;

use super::{join_url, mutate_one, parse_from_header, ItemResults, ProviderClient};
use crate::batch::fan_out;
use crate::config::ProviderKind;
use crate::delta::ChangeSet;
use crate::error::{Result, SyncError};
use crate::models::{
    DeltaNext, DeltaPage, DeltaPosition, Message, MessageHeader, MessagePage, MessageRef,
    MutationOp, PageOptions, SyncCursor, UnsubscribeInfo,
};
use crate::requester::{RateLimitedRequester, RequestDescriptor};

pub const DEFAULT_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// `messages.list` rejects `maxResults` above 500
pub const MAX_PAGE_SIZE: u32 = 500;

const METADATA_HEADERS: &[&str] = &[
    "From",
    "Subject",
    "Date",
    "List-Unsubscribe",
    "List-Unsubscribe-Post",
];

const HISTORY_TYPES: &[&str] = &["messageAdded", "messageDeleted", "labelAdded", "labelRemoved"];

const INBOX: &str = "INBOX";
const TRASH: &str = "TRASH";
const SPAM: &str = "SPAM";
const UNREAD: &str = "UNREAD";
const PROMOTIONS: &str = "CATEGORY_PROMOTIONS";

pub struct GmailProvider {
    requester: RateLimitedRequester,
    base_url: String,
    chunk_size: usize,
    concurrency: usize,
}

impl GmailProvider {
    pub fn new(
        requester: RateLimitedRequester,
        base_url: String,
        chunk_size: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            requester,
            base_url,
            chunk_size: chunk_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<String> {
        let url = Url::parse_with_params(&join_url(&self.base_url, path), params)
            .map_err(|e| SyncError::ConfigError(format!("Invalid Gmail URL: {}", e)))?;
        Ok(url.to_string())
    }

    fn message_url(&self, id: &str, action: &str) -> String {
        join_url(&self.base_url, &format!("messages/{}/{}", id, action))
    }
}

#[async_trait]
impl ProviderClient for GmailProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    fn batch_limit(&self) -> usize {
        self.chunk_size
    }

    fn supports_multiplexing(&self) -> bool {
        false
    }

    async fn list_inbox(&self, options: &PageOptions) -> Result<MessagePage> {
        let url = match &options.continuation {
            Some(next) => next.clone(),
            None => {
                let size = options.page_size.unwrap_or(MAX_PAGE_SIZE).min(MAX_PAGE_SIZE);
                self.endpoint(
                    "messages",
                    &[("labelIds", INBOX), ("maxResults", &size.to_string())],
                )?
            }
        };

        let response: ListMessagesResponse =
            self.requester.send_json(&RequestDescriptor::get(&url)).await?;

        let messages: Vec<MessageRef> = response
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| {
                m.id.map(|id| MessageRef {
                    id,
                    thread_id: m.thread_id,
                })
            })
            .collect();

        let next_page = match response.next_page_token {
            Some(token) => Some(with_page_token(&url, &token)?),
            None => None,
        };

        debug!("Gmail inbox page: {} messages, more={}", messages.len(), next_page.is_some());
        Ok(MessagePage { messages, next_page })
    }

    async fn get_message_with_headers(&self, id: &str) -> Result<Message> {
        let mut params: Vec<(&str, &str)> = vec![("format", "metadata")];
        params.extend(METADATA_HEADERS.iter().map(|h| ("metadataHeaders", *h)));
        let url = self.endpoint(&format!("messages/{}", id), &params)?;

        let raw: google_gmail1::api::Message =
            self.requester.send_json(&RequestDescriptor::get(url)).await?;
        convert_message(raw)
    }

    async fn batch_get_messages(&self, ids: &[String]) -> ItemResults<Message> {
        fan_out(ids, self.concurrency, |id| async move {
            self.get_message_with_headers(&id).await
        })
        .await
    }

    async fn move_to_trash(&self, id: &str) -> Result<()> {
        self.requester
            .send(&RequestDescriptor::post(self.message_url(id, "trash")))
            .await
    }

    async fn move_to_archive(&self, id: &str) -> Result<()> {
        let request = RequestDescriptor::post(self.message_url(id, "modify"))
            .json(json!({ "removeLabelIds": [INBOX] }));
        self.requester.send(&request).await
    }

    async fn batch_mutate(&self, ids: &[String], op: MutationOp) -> ItemResults<()> {
        fan_out(ids, self.concurrency, |id| async move {
            mutate_one(self, &id, op).await
        })
        .await
    }

    async fn send_mail(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let raw = URL_SAFE.encode(compose_rfc822(to, subject, body));
        let request = RequestDescriptor::post(join_url(&self.base_url, "messages/send"))
            .json(json!({ "raw": raw }));
        self.requester.send(&request).await
    }

    async fn get_delta(&self, position: &DeltaPosition) -> Result<DeltaPage> {
        let url = match position {
            DeltaPosition::Continuation(next) => next.clone(),
            DeltaPosition::Cursor(cursor) => {
                let mut params: Vec<(&str, &str)> =
                    vec![("startHistoryId", cursor.token.as_str()), ("labelId", INBOX)];
                params.extend(HISTORY_TYPES.iter().map(|t| ("historyTypes", *t)));
                self.endpoint("history", &params)?
            }
        };

        // Gmail answers 404 once a startHistoryId falls out of its retention window
        let response: ListHistoryResponse = self
            .requester
            .send_json(&RequestDescriptor::get(&url))
            .await
            .map_err(|e| match e {
                SyncError::NotFound(msg) => SyncError::CursorExpired(msg),
                other => other,
            })?;

        let (changed, removed_ids) = history_changes(&response).into_parts();

        let next = match (&response.next_page_token, response.history_id) {
            (Some(token), _) => DeltaNext::Continue(with_page_token(&url, token)?),
            (None, Some(history_id)) => {
                DeltaNext::Complete(SyncCursor::established(history_id.to_string()))
            }
            (None, None) => {
                return Err(SyncError::MalformedResponse(
                    "History response has neither nextPageToken nor historyId".to_string(),
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
        let profile: Profile = self
            .requester
            .send_json(&RequestDescriptor::get(join_url(&self.base_url, "profile")))
            .await?;

        profile
            .history_id
            .map(|id| SyncCursor::established(id.to_string()))
            .ok_or_else(|| SyncError::MalformedResponse("Profile has no historyId".to_string()))
    }
}

/// Replace (or add) the `pageToken` query parameter of a request URL
fn with_page_token(url: &str, token: &str) -> Result<String> {
    let mut parsed = Url::parse(url)
        .map_err(|e| SyncError::MalformedResponse(format!("Invalid continuation URL: {}", e)))?;

    let retained: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| k != "pageToken")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    parsed
        .query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair("pageToken", token);

    Ok(parsed.to_string())
}

/// Fold history records, in order, into changed and removed ids
///
/// Only INBOX mail is tracked. A new message outside INBOX is ignored; a
/// label change leaving a message outside INBOX (or in TRASH/SPAM) removes it.
fn history_changes(response: &ListHistoryResponse) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for record in response.history.iter().flatten() {
        for added in record.messages_added.iter().flatten() {
            if let Some(message) = &added.message {
                if in_inbox(message) {
                    changes.mark_changed(message_ref(message));
                }
            }
        }

        for label_added in record.labels_added.iter().flatten() {
            let Some(message) = &label_added.message else { continue };
            let labels = label_added.label_ids.as_deref().unwrap_or_default();
            let discarded = labels.iter().any(|l| l == TRASH || l == SPAM);
            track_label_change(&mut changes, message, discarded);
        }

        for label_removed in record.labels_removed.iter().flatten() {
            let Some(message) = &label_removed.message else { continue };
            let labels = label_removed.label_ids.as_deref().unwrap_or_default();
            let left_inbox = labels.iter().any(|l| l == INBOX);
            track_label_change(&mut changes, message, left_inbox);
        }

        for deleted in record.messages_deleted.iter().flatten() {
            if let Some(id) = deleted.message.as_ref().and_then(|m| m.id.clone()) {
                changes.mark_removed(id);
            }
        }
    }

    changes
}

fn track_label_change(changes: &mut ChangeSet, message: &google_gmail1::api::Message, gone: bool) {
    if !gone && in_inbox(message) {
        changes.mark_changed(message_ref(message));
    } else {
        changes.mark_removed(message.id.clone().unwrap_or_default());
    }
}

/// Current labels include INBOX and neither TRASH nor SPAM
fn in_inbox(message: &google_gmail1::api::Message) -> bool {
    let labels = message.label_ids.as_deref().unwrap_or_default();
    labels.iter().any(|l| l == INBOX) && !labels.iter().any(|l| l == TRASH || l == SPAM)
}

fn message_ref(message: &google_gmail1::api::Message) -> MessageRef {
    MessageRef {
        id: message.id.clone().unwrap_or_default(),
        thread_id: message.thread_id.clone(),
    }
}

/// Convert a `format=metadata` Gmail message into the engine's view
pub fn convert_message(msg: google_gmail1::api::Message) -> Result<Message> {
    let id = msg
        .id
        .ok_or_else(|| SyncError::InvalidMessageFormat("Missing message ID".to_string()))?;

    let thread_id = msg.thread_id.unwrap_or_default();
    let labels = msg.label_ids.unwrap_or_default();

    let headers: Vec<MessageHeader> = msg
        .payload
        .and_then(|p| p.headers)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|h| match (h.name, h.value) {
            (Some(name), Some(value)) => Some(MessageHeader { name, value }),
            _ => None,
        })
        .collect();

    let find = |name: &str| {
        headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
    };

    let (sender_name, sender_email) = find("From")
        .map(|from| parse_from_header(&from))
        .unwrap_or_default();

    let received_at = msg
        .internal_date
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .or_else(|| find("Date").and_then(|d| parse_date(&d)))
        .ok_or_else(|| {
            SyncError::InvalidMessageFormat(format!("Message {} has no usable date", id))
        })?;

    Ok(Message {
        id,
        thread_id,
        sender_email,
        sender_name,
        subject: find("Subject").unwrap_or_default(),
        preview: msg.snippet.unwrap_or_default(),
        received_at,
        is_read: !labels.iter().any(|l| l == UNREAD),
        is_promotional: labels.iter().any(|l| l == PROMOTIONS),
        folders: labels,
        headers,
        unsubscribe: UnsubscribeInfo::default(),
    })
}

/// RFC 2822 first, RFC 3339 as fallback
fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Plain-text RFC 822 message; CR/LF are stripped from header fields
fn compose_rfc822(to: &str, subject: &str, body: &str) -> String {
    let clean = |s: &str| s.replace(['\r', '\n'], " ");
    format!(
        "To: {}\r\nSubject: {}\r\nContent-Type: text/plain; charset=\"UTF-8\"\r\n\r\n{}",
        clean(to),
        clean(subject),
        body
    )
}
