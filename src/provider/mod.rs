//! Mailbox provider clients
//!
//! Both variants expose the same capability surface through
//! [`ProviderClient`]; the engine picks one at construction time.

pub mod gmail;
pub mod graph;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{Config, ProviderKind};
use crate::error::Result;
use crate::models::{DeltaPage, DeltaPosition, Message, MessagePage, MutationOp, PageOptions, SyncCursor};
use crate::requester::RateLimitedRequester;

pub use gmail::GmailProvider;
pub use graph::GraphProvider;

/// Per-item outcome of a multi-item call, keyed by message id
pub type ItemResults<T> = Vec<(String, Result<T>)>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Largest number of items one batch call accepts
    fn batch_limit(&self) -> usize;

    /// True when `batch_*` multiplexes a chunk into one HTTP request
    fn supports_multiplexing(&self) -> bool;

    /// One page of inbox message ids
    async fn list_inbox(&self, options: &PageOptions) -> Result<MessagePage>;

    /// Message metadata plus the headers the engine inspects
    async fn get_message_with_headers(&self, id: &str) -> Result<Message>;

    /// Fetch up to `batch_limit` messages; every id gets its own outcome
    async fn batch_get_messages(&self, ids: &[String]) -> ItemResults<Message>;

    async fn move_to_trash(&self, id: &str) -> Result<()>;

    async fn move_to_archive(&self, id: &str) -> Result<()>;

    /// Apply one mutation to up to `batch_limit` messages
    async fn batch_mutate(&self, ids: &[String], op: MutationOp) -> ItemResults<()>;

    async fn send_mail(&self, to: &str, subject: &str, body: &str) -> Result<()>;

    /// One page of changes since a cursor, or from a continuation handle
    async fn get_delta(&self, position: &DeltaPosition) -> Result<DeltaPage>;

    /// A cursor for "now", without pulling any content
    async fn establish_baseline(&self) -> Result<SyncCursor>;
}

/// Dispatch a single mutation to the matching move call
pub async fn mutate_one(provider: &dyn ProviderClient, id: &str, op: MutationOp) -> Result<()> {
    match op {
        MutationOp::Trash => provider.move_to_trash(id).await,
        MutationOp::Archive => provider.move_to_archive(id).await,
    }
}

/// Build the configured provider variant
pub fn build_provider(config: &Config, requester: RateLimitedRequester) -> Arc<dyn ProviderClient> {
    let base_url = config.provider.base_url.clone();
    match config.provider.kind {
        ProviderKind::Gmail => Arc::new(GmailProvider::new(
            requester,
            base_url.unwrap_or_else(|| gmail::DEFAULT_BASE_URL.to_string()),
            config.batch.gmail_chunk_size,
            config.batch.max_concurrency,
        )),
        ProviderKind::Graph => Arc::new(GraphProvider::new(
            requester,
            base_url.unwrap_or_else(|| graph::DEFAULT_BASE_URL.to_string()),
            config.batch.graph_chunk_size,
            config.retry.max_retries,
        )),
    }
}

/// Join an API root and a path without doubling slashes
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Split `"Name" <addr>` into (name, lowercased address)
///
/// Without a display name the address doubles as the name.
pub(crate) fn parse_from_header(value: &str) -> (String, String) {
    let value = value.trim();
    if let (Some(start), Some(end)) = (value.rfind('<'), value.rfind('>')) {
        if start < end {
            let email = value[start + 1..end].trim().to_lowercase();
            let name = value[..start].trim().trim_matches('"').trim().to_string();
            let name = if name.is_empty() { email.clone() } else { name };
            return (name, email);
        }
    }
    let email = value.trim_matches('"').to_lowercase();
    (email.clone(), email)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("https://x.test/v1/", "/me/messages"), "https://x.test/v1/me/messages");
        assert_eq!(join_url("https://x.test/v1", "me"), "https://x.test/v1/me");
    }

    #[test]
    fn test_parse_from_header() {
        assert_eq!(
            parse_from_header("\"Acme News\" <News@Acme.test>"),
            ("Acme News".to_string(), "news@acme.test".to_string())
        );
        assert_eq!(
            parse_from_header("Plain Name <plain@x.test>"),
            ("Plain Name".to_string(), "plain@x.test".to_string())
        );
        assert_eq!(
            parse_from_header("bare@x.test"),
            ("bare@x.test".to_string(), "bare@x.test".to_string())
        );
        assert_eq!(
            parse_from_header("<only@x.test>"),
            ("only@x.test".to_string(), "only@x.test".to_string())
        );
    }

    #[tokio::test]
    async fn test_mutate_one_dispatches() {
        let mut mock = MockProviderClient::new();
        mock.expect_move_to_trash()
            .withf(|id| id == "m1")
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_move_to_archive()
            .withf(|id| id == "m2")
            .times(1)
            .returning(|_| Ok(()));

        mutate_one(&mock, "m1", MutationOp::Trash).await.unwrap();
        mutate_one(&mock, "m2", MutationOp::Archive).await.unwrap();
    }
}
