//! SyncEngine end to end: provider, batching, aggregation and the stores together

mod common;

use common::{date, mock_gmail_list_response, mock_gmail_message_response, mock_provider, test_requester};
use sender_sweep::bulk::{SenderTarget, UnsubscribeOutcome};
use sender_sweep::config::{Config, ProviderKind};
use sender_sweep::delta::SyncPhase;
use sender_sweep::engine::{SyncEngine, SyncMode};
use sender_sweep::error::SyncError;
use sender_sweep::models::{MutationOp, SenderKey, SenderStats, SyncCursor};
use sender_sweep::provider::{GmailProvider, ProviderClient};
use sender_sweep::store::{CursorStore, JsonFileStore, MemoryStore, StatsStore};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use wiremock::matchers::{body_string, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ROOT: &str = "/gmail/v1/users/me";
const ACCOUNT: &str = "me@x.test";

const JAN_1: i64 = 1_704_067_200_000;
const MAR_1: i64 = 1_709_251_200_000;
const JUN_1: i64 = 1_717_200_000_000;

fn test_config() -> Config {
    let mut config = Config::default();
    config.provider.account_id = ACCOUNT.to_string();
    config.batch.inter_batch_delay_ms = 0;
    config
}

async fn mount_message(server: &MockServer, id: &str, from: &str, internal_ms: i64, unsubscribe: Option<&str>) {
    Mock::given(method("GET"))
        .and(path(format!("{}/messages/{}", ROOT, id)))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(mock_gmail_message_response(id, from, internal_ms, unsubscribe)),
        )
        .mount(server)
        .await;
}

async fn gmail_engine(server: &MockServer, store: Arc<JsonFileStore>) -> SyncEngine {
    let provider: Arc<dyn ProviderClient> = Arc::new(GmailProvider::new(
        test_requester(),
        format!("{}{}", server.uri(), ROOT),
        50,
        4,
    ));
    SyncEngine::new(provider, store.clone(), store, &test_config())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_full_then_incremental_sync_against_gmail() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("store.json");

    Mock::given(method("GET"))
        .and(path(format!("{}/profile", ROOT)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "emailAddress": ACCOUNT,
            "historyId": "100"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{}/messages", ROOT)))
        .respond_with(ResponseTemplate::new(200).set_body_json(mock_gmail_list_response(&["m1", "m2"], None)))
        .expect(1)
        .mount(&server)
        .await;
    mount_message(&server, "m1", "News <news@paper.test>", JAN_1, Some("<https://paper.test/old>")).await;
    mount_message(&server, "m2", "News <News@Paper.test>", MAR_1, Some("<https://paper.test/new>")).await;

    let store = Arc::new(JsonFileStore::open(&store_path).await.unwrap());
    let mut engine = gmail_engine(&server, store.clone()).await;
    assert_eq!(engine.phase(), SyncPhase::Uninitialized);

    let report = engine.run(false).await.unwrap();
    assert_eq!(report.mode, SyncMode::Full);
    assert_eq!(report.messages_fetched, 2);
    assert_eq!(engine.phase(), SyncPhase::Established);

    let senders = engine.senders().await.unwrap();
    assert_eq!(senders.len(), 1);
    assert_eq!(senders[0].key, SenderKey::new("News", "news@paper.test"));
    assert_eq!(senders[0].count, 2);
    assert_eq!(senders[0].unsubscribe_link.as_deref(), Some("https://paper.test/new"));
    assert!(senders[0].is_newsletter);

    // m3 arrives, m1 leaves the inbox
    Mock::given(method("GET"))
        .and(path(format!("{}/history", ROOT)))
        .and(query_param("startHistoryId", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "history": [
                {"id": "120", "messagesAdded": [{"message": {"id": "m3", "labelIds": ["INBOX"]}}]},
                {"id": "130", "labelsRemoved": [{"message": {"id": "m1"}, "labelIds": ["INBOX"]}]}
            ],
            "historyId": "150"
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_message(&server, "m3", "Shop <deals@shop.test>", JUN_1, None).await;

    // A fresh engine over the reopened file resumes incrementally
    drop(engine);
    let store = Arc::new(JsonFileStore::open(&store_path).await.unwrap());
    let mut engine = gmail_engine(&server, store.clone()).await;
    assert_eq!(engine.phase(), SyncPhase::Established);

    let report = engine.run(false).await.unwrap();
    assert_eq!(report.mode, SyncMode::Incremental);
    assert_eq!(report.removed, 1);
    assert_eq!(report.messages_fetched, 1);

    let news = engine.find_senders("NEWS@paper.test").await.unwrap();
    assert_eq!(news[0].message_ids, vec!["m2"]);
    let shop = engine.find_senders("deals@shop.test").await.unwrap();
    assert_eq!(shop[0].count, 1);

    let cursor = store.load_cursor(ACCOUNT).await.unwrap();
    assert_eq!(cursor, Some(SyncCursor::established("150")));

    let status = engine.status().await.unwrap();
    assert_eq!(status.sender_count, 2);
    assert_eq!(status.message_count, 2);
}

#[tokio::test]
async fn test_bulk_delete_paces_chunks_and_retracts() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let seen = calls.clone();

    let mut mock = mock_provider(ProviderKind::Graph, 20, true);
    mock.expect_batch_mutate().times(3).returning(move |ids, op| {
        assert_eq!(op, MutationOp::Trash);
        seen.lock().unwrap().push(ids.len());
        ids.iter()
            .map(|id| {
                let outcome = if id == "n44" {
                    Err(SyncError::ApiError {
                        status: 403,
                        message: "denied".to_string(),
                    })
                } else {
                    Ok(())
                };
                (id.clone(), outcome)
            })
            .collect()
    });

    let store = Arc::new(MemoryStore::new());
    let mut stats = SenderStats::new(SenderKey::new("Noisy", "noisy@x.test"), date(2024, 1, 1));
    stats.message_ids = (0..45).map(|i| format!("n{}", i)).collect();
    stats.count = 45;
    store.merge_sender_stats(ACCOUNT, &[stats.clone()]).await.unwrap();

    let engine = SyncEngine::new(Arc::new(mock), store.clone(), store.clone(), &test_config())
        .await
        .unwrap();
    let report = engine
        .apply_mutation(MutationOp::Trash, &[SenderTarget::from(&stats)])
        .await
        .unwrap();

    assert_eq!(*calls.lock().unwrap(), vec![20, 20, 5]);
    assert_eq!(report.total_affected, 44);
    assert_eq!(report.total_failed, 1);
    assert_eq!(report.per_sender[0].failed_ids, vec!["n44"]);

    let remaining = store.list_senders(ACCOUNT).await.unwrap();
    assert_eq!(remaining[0].message_ids, vec!["n44"]);
}

#[tokio::test]
async fn test_systemic_failure_leaves_stats_untouched() {
    let mut mock = mock_provider(ProviderKind::Graph, 20, true);
    mock.expect_batch_mutate().times(1).returning(|ids, _| {
        ids.iter()
            .map(|id| (id.clone(), Err(SyncError::AuthError("token revoked".to_string()))))
            .collect()
    });

    let store = Arc::new(MemoryStore::new());
    let mut stats = SenderStats::new(SenderKey::new("S", "s@x.test"), date(2024, 1, 1));
    stats.message_ids = vec!["a".to_string(), "b".to_string()];
    stats.count = 2;
    store.merge_sender_stats(ACCOUNT, &[stats.clone()]).await.unwrap();

    let engine = SyncEngine::new(Arc::new(mock), store.clone(), store.clone(), &test_config())
        .await
        .unwrap();
    let result = engine
        .apply_mutation(MutationOp::Archive, &[SenderTarget::from(&stats)])
        .await;

    assert!(matches!(result, Err(SyncError::AuthError(_))));
    assert_eq!(store.list_senders(ACCOUNT).await.unwrap()[0].count, 2);
}

#[tokio::test]
async fn test_unsubscribe_sends_mailto_request() {
    let mut mock = mock_provider(ProviderKind::Gmail, 50, false);
    mock.expect_send_mail()
        .withf(|to, subject, body| {
            to == "leave@list.test" && subject == "stop" && body.starts_with("Please remove")
        })
        .times(1)
        .returning(|_, _, _| Ok(()));

    let store = Arc::new(MemoryStore::new());
    let mut stats = SenderStats::new(SenderKey::new("List", "list@x.test"), date(2024, 1, 1));
    stats.message_ids = vec!["m1".to_string()];
    stats.count = 1;
    stats.offer_mailto_link("mailto:leave@list.test?subject=stop", date(2024, 1, 1));
    store.merge_sender_stats(ACCOUNT, &[stats]).await.unwrap();

    let engine = SyncEngine::new(Arc::new(mock), store.clone(), store, &test_config())
        .await
        .unwrap();
    let outcome = engine.unsubscribe("List@X.test").await.unwrap();
    assert_eq!(
        outcome,
        UnsubscribeOutcome::EmailSent {
            to: "leave@list.test".to_string()
        }
    );
}

#[tokio::test]
async fn test_one_click_unsubscribe_posts_to_sender() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/unsub"))
        .and(body_string("List-Unsubscribe=One-Click"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let link = format!("{}/unsub", server.uri());
    let store = Arc::new(MemoryStore::new());

    // Two display names for one address: the most recently active one is used
    let mut old = SenderStats::new(SenderKey::new("Old Name", "news@x.test"), date(2023, 1, 1));
    old.message_ids = vec!["o1".to_string()];
    old.count = 1;
    old.offer_http_link("https://stale.test/unsub", false, date(2023, 1, 1));
    let mut current = SenderStats::new(SenderKey::new("News", "news@x.test"), date(2024, 5, 1));
    current.message_ids = vec!["c1".to_string()];
    current.count = 1;
    current.offer_http_link(&link, true, date(2024, 5, 1));
    store.merge_sender_stats(ACCOUNT, &[old, current]).await.unwrap();

    let mut config = test_config();
    config.unsubscribe.one_click_post = true;
    let mock = mock_provider(ProviderKind::Gmail, 50, false);
    let engine = SyncEngine::new(Arc::new(mock), store.clone(), store, &config)
        .await
        .unwrap()
        .with_one_click_requester(test_requester());

    let outcome = engine.unsubscribe("news@x.test").await.unwrap();
    assert_eq!(outcome, UnsubscribeOutcome::OneClickCompleted { url: link });

    let requests = server.received_requests().await.unwrap();
    assert!(!requests[0].headers.contains_key("authorization"));
}
