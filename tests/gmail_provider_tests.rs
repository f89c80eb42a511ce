//! Gmail provider against a fake Gmail REST API

mod common;

use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use common::{mock_gmail_list_response, mock_gmail_message_response, test_requester};
use sender_sweep::batch::BatchFetcher;
use sender_sweep::error::SyncError;
use sender_sweep::models::{DeltaNext, DeltaPosition, PageOptions, SyncCursor};
use sender_sweep::provider::{GmailProvider, ProviderClient};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ROOT: &str = "/gmail/v1/users/me";

fn provider(server: &MockServer) -> GmailProvider {
    GmailProvider::new(test_requester(), format!("{}{}", server.uri(), ROOT), 50, 4)
}

#[tokio::test]
async fn test_list_inbox_follows_page_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(format!("{}/messages", ROOT)))
        .and(query_param("pageToken", "tok2"))
        .and(query_param("labelIds", "INBOX"))
        .respond_with(ResponseTemplate::new(200).set_body_json(mock_gmail_list_response(&["m3"], None)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{}/messages", ROOT)))
        .and(query_param("labelIds", "INBOX"))
        .and(query_param("maxResults", "2"))
        .and(query_param_is_missing("pageToken"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(mock_gmail_list_response(&["m1", "m2"], Some("tok2"))),
        )
        .expect(1)
        .mount(&server)
        .await;

    let gmail = provider(&server);
    let first = gmail
        .list_inbox(&PageOptions {
            page_size: Some(2),
            continuation: None,
        })
        .await
        .unwrap();
    assert_eq!(first.messages.len(), 2);
    assert_eq!(first.messages[0].thread_id.as_deref(), Some("thread_m1"));

    let next = first.next_page.clone().unwrap();
    assert!(next.contains("pageToken=tok2"));
    assert!(next.contains("maxResults=2"));

    let second = gmail
        .list_inbox(&PageOptions {
            page_size: Some(2),
            continuation: Some(next),
        })
        .await
        .unwrap();
    assert_eq!(second.messages[0].id, "m3");
    assert!(second.next_page.is_none());
}

#[tokio::test]
async fn test_get_message_with_headers() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(format!("{}/messages/m1", ROOT)))
        .and(query_param("format", "metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_json(mock_gmail_message_response(
            "m1",
            "\"News Desk\" <News@Paper.test>",
            1_704_124_800_000,
            Some("<https://paper.test/unsub>, <mailto:unsub@paper.test>"),
        )))
        .mount(&server)
        .await;

    let message = provider(&server).get_message_with_headers("m1").await.unwrap();
    assert_eq!(message.sender_email, "news@paper.test");
    assert_eq!(message.sender_name, "News Desk");
    assert!(!message.is_read);
    assert_eq!(
        message.header("List-Unsubscribe"),
        Some("<https://paper.test/unsub>, <mailto:unsub@paper.test>")
    );
}

#[tokio::test]
async fn test_batch_fetch_keeps_successes() {
    let server = MockServer::start().await;

    for (id, day_ms) in [("a", 1_704_124_800_000i64), ("c", 1_704_211_200_000)] {
        Mock::given(method("GET"))
            .and(path(format!("{}/messages/{}", ROOT, id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_gmail_message_response(
                id,
                "s@x.test",
                day_ms,
                None,
            )))
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path(format!("{}/messages/b", ROOT)))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let gmail: Arc<dyn ProviderClient> = Arc::new(provider(&server));
    let fetcher = BatchFetcher::with_limits(gmail, 2, 4, Duration::ZERO);
    let outcome = fetcher
        .fetch_messages(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        .await
        .unwrap();

    assert_eq!(outcome.chunks, 2);
    assert_eq!(outcome.success_count(), 2);
    assert_eq!(outcome.failed_ids(), vec!["b"]);
    assert!(matches!(outcome.failures[0].error, SyncError::NotFound(_)));
}

#[tokio::test]
async fn test_history_delta() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(format!("{}/history", ROOT)))
        .and(query_param("startHistoryId", "100"))
        .and(query_param("labelId", "INBOX"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "history": [
                {
                    "id": "101",
                    "messagesAdded": [{"message": {"id": "m3", "threadId": "t3", "labelIds": ["INBOX"]}}]
                },
                {
                    "id": "102",
                    "labelsRemoved": [{"message": {"id": "m1"}, "labelIds": ["INBOX"]}],
                    "messagesDeleted": [{"message": {"id": "m2"}}]
                },
                {
                    "id": "103",
                    "labelsAdded": [{"message": {"id": "m4", "labelIds": ["INBOX", "STARRED"]}, "labelIds": ["STARRED"]}]
                },
                {
                    "id": "104",
                    "messagesAdded": [{"message": {"id": "s1", "labelIds": ["SENT"]}}]
                }
            ],
            "historyId": "200"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let page = provider(&server)
        .get_delta(&DeltaPosition::Cursor(SyncCursor::established("100")))
        .await
        .unwrap();

    let changed: Vec<&str> = page.changed.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(changed, vec!["m3", "m4"]);
    assert_eq!(page.removed_ids, vec!["m1", "m2"]);
    match page.next {
        DeltaNext::Complete(cursor) => assert_eq!(cursor, SyncCursor::established("200")),
        other => panic!("expected terminal page, got {:?}", other),
    }
}

#[tokio::test]
async fn test_expired_history_id() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(format!("{}/history", ROOT)))
        .respond_with(ResponseTemplate::new(404).set_body_string("Requested entity was not found."))
        .expect(1)
        .mount(&server)
        .await;

    let err = provider(&server)
        .get_delta(&DeltaPosition::Cursor(SyncCursor::established("1")))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::CursorExpired(_)));
}

#[tokio::test]
async fn test_baseline_from_profile() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(format!("{}/profile", ROOT)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "emailAddress": "me@x.test",
            "messagesTotal": 10,
            "historyId": "12345"
        })))
        .mount(&server)
        .await;

    let cursor = provider(&server).establish_baseline().await.unwrap();
    assert_eq!(cursor, SyncCursor::established("12345"));
}

#[tokio::test]
async fn test_trash_and_archive() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("{}/messages/m1/trash", ROOT)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "m1"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{}/messages/m2/modify", ROOT)))
        .and(body_json(json!({"removeLabelIds": ["INBOX"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "m2"})))
        .expect(1)
        .mount(&server)
        .await;

    let gmail = provider(&server);
    gmail.move_to_trash("m1").await.unwrap();
    gmail.move_to_archive("m2").await.unwrap();
}

#[tokio::test]
async fn test_send_mail_encodes_raw_message() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("{}/messages/send", ROOT)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "sent"})))
        .expect(1)
        .mount(&server)
        .await;

    provider(&server)
        .send_mail("unsub@list.test", "Unsubscribe\r\nBcc: evil@x.test", "remove me")
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let raw = URL_SAFE.decode(body["raw"].as_str().unwrap()).unwrap();
    let text = String::from_utf8(raw).unwrap();

    assert!(text.starts_with("To: unsub@list.test\r\n"));
    assert!(text.contains("Subject: Unsubscribe  Bcc: evil@x.test\r\n"));
    assert!(text.ends_with("\r\n\r\nremove me"));
}
