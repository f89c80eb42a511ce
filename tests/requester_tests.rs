//! RateLimitedRequester against a local HTTP server

mod common;

use common::{fast_policy, test_requester, TEST_TOKEN};
use proptest::prelude::*;
use sender_sweep::error::SyncError;
use sender_sweep::requester::{RequestDescriptor, RetryPolicy};
use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_retries_rate_limit_then_succeeds() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let requester = test_requester();
    let body: Value = requester
        .send_json(&RequestDescriptor::get(format!("{}/items", server.uri())))
        .await
        .unwrap();
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn test_service_unavailable_honors_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    // A long computed backoff would blow the timeout; the zero hint wins
    let requester = sender_sweep::requester::RateLimitedRequester::with_client(
        reqwest::Client::new(),
        std::sync::Arc::new(sender_sweep::auth::StaticTokenProvider::new(TEST_TOKEN)),
        RetryPolicy {
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(60),
            ..fast_policy()
        },
    );

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        requester.send_json::<Value>(&RequestDescriptor::get(format!("{}/items", server.uri()))),
    )
    .await
    .expect("Retry-After should override the computed backoff");
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_rate_limit_exhausts_after_max_retries() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .expect(4)
        .mount(&server)
        .await;

    let err = test_requester()
        .send(&RequestDescriptor::get(format!("{}/items", server.uri())))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::RateLimitExceeded { retry_after: Some(0) }));
}

#[tokio::test]
async fn test_permanent_errors_are_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
        .expect(1)
        .mount(&server)
        .await;

    let err = test_requester()
        .send(&RequestDescriptor::get(format!("{}/items", server.uri())))
        .await
        .unwrap_err();
    match err {
        SyncError::ApiError { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "internal");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_unauthorized_is_systemic() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let err = test_requester()
        .send(&RequestDescriptor::get(format!("{}/items", server.uri())))
        .await
        .unwrap_err();
    assert!(err.is_systemic());
}

#[tokio::test]
async fn test_malformed_body() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let err = test_requester()
        .send_json::<Value>(&RequestDescriptor::get(format!("{}/items", server.uri())))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::MalformedResponse(_)));
}

#[tokio::test]
async fn test_bearer_token_only_when_authenticated() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/private"))
        .and(header("authorization", format!("Bearer {}", TEST_TOKEN).as_str()))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/unsubscribe"))
        .and(body_string("List-Unsubscribe=One-Click"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let requester = test_requester();
    requester
        .send(&RequestDescriptor::get(format!("{}/private", server.uri())))
        .await
        .unwrap();
    requester
        .send(
            &RequestDescriptor::post(format!("{}/unsubscribe", server.uri()))
                .unauthenticated()
                .form(&[("List-Unsubscribe", "One-Click")]),
        )
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let unsubscribe = requests
        .iter()
        .find(|r| r.url.path() == "/unsubscribe")
        .unwrap();
    assert!(!unsubscribe.headers.contains_key("authorization"));
}

proptest! {
    #[test]
    fn prop_base_delay_non_decreasing_and_capped(
        initial_ms in 1u64..5_000,
        extra_ms in 0u64..120_000,
        attempts in 1u32..64,
    ) {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(initial_ms),
            max_backoff: Duration::from_millis(initial_ms + extra_ms),
            jitter_ratio: 0.5,
        };

        let mut previous = Duration::ZERO;
        for attempt in 0..attempts {
            let delay = policy.base_delay(attempt);
            prop_assert!(delay >= previous);
            prop_assert!(delay <= policy.max_backoff);
            previous = delay;
        }
    }

    #[test]
    fn prop_jitter_within_half(initial_ms in 1u64..2_000, attempt in 0u32..10) {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(initial_ms),
            max_backoff: Duration::from_secs(60),
            jitter_ratio: 0.5,
        };
        let base = policy.base_delay(attempt);
        let delay = policy.jittered_delay(attempt);
        prop_assert!(delay >= base);
        prop_assert!(delay <= base + base / 2);
    }
}
