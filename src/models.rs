use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// A single raw header as returned by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub name: String,
    pub value: String,
}

impl MessageHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Unsubscribe affordances found in a message's headers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeInfo {
    pub http_link: Option<String>,
    pub mailto_link: Option<String>,
    pub one_click: bool,
}

impl UnsubscribeInfo {
    pub fn is_empty(&self) -> bool {
        self.http_link.is_none() && self.mailto_link.is_none()
    }
}

/// Message metadata as seen by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    /// Always lowercased
    pub sender_email: String,
    pub sender_name: String,
    pub subject: String,
    pub preview: String,
    /// Normalized to UTC so recency comparisons are exact
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
    pub folders: Vec<String>,
    #[serde(default)]
    pub is_promotional: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<MessageHeader>,
    #[serde(default)]
    pub unsubscribe: UnsubscribeInfo,
}

impl Message {
    /// Case-insensitive header lookup (first occurrence wins)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// A sender address is usable when it looks like `local@domain`
    pub fn has_usable_sender(&self) -> bool {
        match self.sender_email.split_once('@') {
            Some((local, domain)) => !local.is_empty() && !domain.is_empty(),
            None => false,
        }
    }

    pub fn sender_key(&self) -> SenderKey {
        SenderKey::new(&self.sender_name, &self.sender_email)
    }
}

/// Identifier pair returned by list and delta endpoints before enrichment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub id: String,
    pub thread_id: Option<String>,
}

impl MessageRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            thread_id: None,
        }
    }
}

/// Aggregation identity: display name plus lowercased address
///
/// Stored as two fields, so no separator character in a display name can
/// make two different senders collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SenderKey {
    pub name: String,
    pub email: String,
}

impl SenderKey {
    pub fn new(name: &str, email: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            email: email.trim().to_lowercase(),
        }
    }
}

impl fmt::Display for SenderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() || self.name == self.email {
            write!(f, "{}", self.email)
        } else {
            write!(f, "{} <{}>", self.name, self.email)
        }
    }
}

/// Per-sender aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderStats {
    pub key: SenderKey,
    pub count: usize,
    pub unread_count: usize,
    pub first_date: DateTime<Utc>,
    pub last_date: DateTime<Utc>,
    pub unsubscribe_link: Option<String>,
    /// Date of the message that produced `unsubscribe_link`
    pub unsubscribe_link_date: Option<DateTime<Utc>>,
    pub mailto_link: Option<String>,
    /// Date of the message that produced `mailto_link`
    pub mailto_link_date: Option<DateTime<Utc>>,
    pub one_click: bool,
    pub is_newsletter: bool,
    pub is_promotional: bool,
    /// Encounter order
    pub message_ids: Vec<String>,
    /// Subset of `message_ids` that were unread when folded
    #[serde(default)]
    pub unread_ids: Vec<String>,
}

impl SenderStats {
    pub fn new(key: SenderKey, first_seen: DateTime<Utc>) -> Self {
        Self {
            key,
            count: 0,
            unread_count: 0,
            first_date: first_seen,
            last_date: first_seen,
            unsubscribe_link: None,
            unsubscribe_link_date: None,
            mailto_link: None,
            mailto_link_date: None,
            one_click: false,
            is_newsletter: false,
            is_promotional: false,
            message_ids: Vec::new(),
            unread_ids: Vec::new(),
        }
    }

    /// Replace the HTTP link only when `date` is strictly newer than the
    /// date of the currently stored one. One-click travels with the link.
    pub fn offer_http_link(&mut self, link: &str, one_click: bool, date: DateTime<Utc>) -> bool {
        let newer = self.unsubscribe_link_date.map_or(true, |current| date > current);
        if newer {
            self.unsubscribe_link = Some(link.to_string());
            self.unsubscribe_link_date = Some(date);
            self.one_click = one_click;
        }
        self.is_newsletter = true;
        newer
    }

    /// Replace the mailto link only when `date` is strictly newer
    pub fn offer_mailto_link(&mut self, link: &str, date: DateTime<Utc>) -> bool {
        let newer = self.mailto_link_date.map_or(true, |current| date > current);
        if newer {
            self.mailto_link = Some(link.to_string());
            self.mailto_link_date = Some(date);
        }
        newer
    }

    /// Merge another aggregate for the same key into this one
    pub fn absorb(&mut self, other: &SenderStats) {
        debug_assert_eq!(self.key, other.key);

        self.count += other.count;
        self.unread_count += other.unread_count;
        self.first_date = self.first_date.min(other.first_date);
        self.last_date = self.last_date.max(other.last_date);
        self.message_ids.extend(other.message_ids.iter().cloned());
        self.unread_ids.extend(other.unread_ids.iter().cloned());

        if let (Some(link), Some(date)) = (&other.unsubscribe_link, other.unsubscribe_link_date) {
            self.offer_http_link(link, other.one_click, date);
        }
        if let (Some(link), Some(date)) = (&other.mailto_link, other.mailto_link_date) {
            self.offer_mailto_link(link, date);
        }

        self.is_newsletter |= other.is_newsletter;
        self.is_promotional |= other.is_promotional;
    }

    /// Drop the given ids; returns how many were removed
    ///
    /// Dates and links are not recomputed.
    pub fn retract(&mut self, ids: &HashSet<String>) -> usize {
        let before = self.message_ids.len();
        self.message_ids.retain(|id| !ids.contains(id));
        self.unread_ids.retain(|id| !ids.contains(id));
        self.count = self.message_ids.len();
        self.unread_count = self.unread_ids.len();
        before - self.message_ids.len()
    }
}

/// Opaque provider continuation token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub token: String,
    /// False while the first full pass is still running
    pub established: bool,
}

impl SyncCursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            established: false,
        }
    }

    pub fn established(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            established: true,
        }
    }
}

/// Options for one `list_inbox` call
#[derive(Debug, Clone, Default)]
pub struct PageOptions {
    pub page_size: Option<u32>,
    /// Provider continuation handle from the previous page, used verbatim
    pub continuation: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub messages: Vec<MessageRef>,
    pub next_page: Option<String>,
}

/// Where a delta request starts from
#[derive(Debug, Clone)]
pub enum DeltaPosition {
    Cursor(SyncCursor),
    /// Provider-issued next-page handle, used verbatim
    Continuation(String),
}

#[derive(Debug, Clone)]
pub enum DeltaNext {
    Continue(String),
    Complete(SyncCursor),
}

/// One page of provider changes
#[derive(Debug, Clone)]
pub struct DeltaPage {
    pub changed: Vec<MessageRef>,
    pub removed_ids: Vec<String>,
    pub next: DeltaNext,
}

/// Mailbox mutation applied to a single message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOp {
    /// Move to the provider's trash / deleted items
    Trash,
    /// Remove from inbox into the provider's archive
    Archive,
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationOp::Trash => write!(f, "delete"),
            MutationOp::Archive => write!(f, "archive"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOperation {
    FetchHeaders,
    Mutate(MutationOp),
}

/// Ordered id list bound to one operation and the provider's chunk limit
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub ids: Vec<String>,
    pub operation: BatchOperation,
    pub chunk_size: usize,
}

impl BatchJob {
    pub fn new(ids: Vec<String>, operation: BatchOperation, chunk_size: usize) -> Self {
        Self {
            ids,
            operation,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunks(&self) -> std::slice::Chunks<'_, String> {
        self.ids.chunks(self.chunk_size)
    }

    pub fn chunk_count(&self) -> usize {
        (self.ids.len() + self.chunk_size - 1) / self.chunk_size
    }
}
