//! Common test utilities and fixtures
#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use mockall::mock;
use sender_sweep::auth::StaticTokenProvider;
use sender_sweep::config::ProviderKind;
use sender_sweep::error::Result;
use sender_sweep::models::{
    DeltaPage, DeltaPosition, Message, MessageHeader, MessagePage, MutationOp, PageOptions,
    SyncCursor, UnsubscribeInfo,
};
use sender_sweep::provider::{ItemResults, ProviderClient};
use sender_sweep::requester::{RateLimitedRequester, RetryPolicy};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub const TEST_TOKEN: &str = "test-access-token";

/// Backoff small enough that retry tests finish instantly
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
        jitter_ratio: 0.0,
    }
}

pub fn test_requester() -> RateLimitedRequester {
    RateLimitedRequester::with_client(
        reqwest::Client::new(),
        Arc::new(StaticTokenProvider::new(TEST_TOKEN)),
        fast_policy(),
    )
}

pub fn date(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 9, 30, 0).unwrap()
}

/// Create a test message with default values
pub fn create_test_message(id: &str, sender: &str, received_at: DateTime<Utc>) -> Message {
    Message {
        id: id.to_string(),
        thread_id: format!("thread_{}", id),
        sender_email: sender.to_lowercase(),
        sender_name: "Test Sender".to_string(),
        subject: "Test Subject".to_string(),
        preview: String::new(),
        received_at,
        is_read: false,
        folders: vec!["INBOX".to_string()],
        is_promotional: false,
        headers: Vec::new(),
        unsubscribe: UnsubscribeInfo::default(),
    }
}

/// Create a newsletter message exposing a bracketed unsubscribe link
pub fn create_newsletter_message(id: &str, sender: &str, received_at: DateTime<Utc>, link: &str) -> Message {
    let mut message = create_test_message(id, sender, received_at);
    message.headers.push(MessageHeader::new("List-Unsubscribe", format!("<{}>", link)));
    message.unsubscribe.http_link = Some(link.to_string());
    message
}

/// Create mock Gmail API message response (JSON, `format=metadata`)
pub fn mock_gmail_message_response(
    id: &str,
    from: &str,
    internal_date_ms: i64,
    list_unsubscribe: Option<&str>,
) -> serde_json::Value {
    let mut headers = vec![
        json!({"name": "From", "value": from}),
        json!({"name": "Subject", "value": format!("Subject {}", id)}),
    ];
    if let Some(value) = list_unsubscribe {
        headers.push(json!({"name": "List-Unsubscribe", "value": value}));
    }

    json!({
        "id": id,
        "threadId": format!("thread_{}", id),
        "labelIds": ["INBOX", "UNREAD"],
        "snippet": "Email snippet...",
        "payload": { "headers": headers },
        "internalDate": internal_date_ms.to_string()
    })
}

/// Create mock Gmail list messages response (JSON)
pub fn mock_gmail_list_response(message_ids: &[&str], next_page_token: Option<&str>) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = message_ids
        .iter()
        .map(|id| json!({"id": id, "threadId": format!("thread_{}", id)}))
        .collect();

    let mut response = json!({
        "messages": messages,
        "resultSizeEstimate": messages.len()
    });
    if let Some(token) = next_page_token {
        response["nextPageToken"] = json!(token);
    }
    response
}

/// Create mock Graph message (JSON)
pub fn mock_graph_message(id: &str, address: &str, received: &str, list_unsubscribe: Option<&str>) -> serde_json::Value {
    let headers: Vec<serde_json::Value> = list_unsubscribe
        .map(|value| vec![json!({"name": "List-Unsubscribe", "value": value})])
        .unwrap_or_default();

    json!({
        "id": id,
        "conversationId": format!("conv_{}", id),
        "subject": format!("Subject {}", id),
        "bodyPreview": "Preview",
        "receivedDateTime": received,
        "isRead": false,
        "from": { "emailAddress": { "name": "Graph Sender", "address": address } },
        "parentFolderId": "inbox-id",
        "inferenceClassification": "focused",
        "internetMessageHeaders": headers
    })
}

// Mock implementation of ProviderClient for testing
mock! {
    pub Provider {}

    #[async_trait::async_trait]
    impl ProviderClient for Provider {
        fn kind(&self) -> ProviderKind;
        fn batch_limit(&self) -> usize;
        fn supports_multiplexing(&self) -> bool;
        async fn list_inbox(&self, options: &PageOptions) -> Result<MessagePage>;
        async fn get_message_with_headers(&self, id: &str) -> Result<Message>;
        async fn batch_get_messages(&self, ids: &[String]) -> ItemResults<Message>;
        async fn move_to_trash(&self, id: &str) -> Result<()>;
        async fn move_to_archive(&self, id: &str) -> Result<()>;
        async fn batch_mutate(&self, ids: &[String], op: MutationOp) -> ItemResults<()>;
        async fn send_mail(&self, to: &str, subject: &str, body: &str) -> Result<()>;
        async fn get_delta(&self, position: &DeltaPosition) -> Result<DeltaPage>;
        async fn establish_baseline(&self) -> Result<SyncCursor>;
    }
}

/// Mock provider with the capability flags every test needs
pub fn mock_provider(kind: ProviderKind, batch_limit: usize, multiplexed: bool) -> MockProvider {
    let mut mock = MockProvider::new();
    mock.expect_kind().return_const(kind);
    mock.expect_batch_limit().return_const(batch_limit);
    mock.expect_supports_multiplexing().return_const(multiplexed);
    mock
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_newsletter_message() {
        let msg = create_newsletter_message("msg1", "News@Example.com", date(2024, 1, 1), "https://x.test/u");
        assert_eq!(msg.sender_email, "news@example.com");
        assert_eq!(msg.header("list-unsubscribe"), Some("<https://x.test/u>"));
    }

    #[test]
    fn test_mock_gmail_list_response() {
        let response = mock_gmail_list_response(&["msg1", "msg2"], Some("token123"));
        assert_eq!(response["messages"].as_array().unwrap().len(), 2);
        assert_eq!(response["nextPageToken"], "token123");
    }
}
