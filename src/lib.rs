//! Sender Sweep
//!
//! Synchronizes mailbox metadata from Gmail or Microsoft Graph into
//! per-sender statistics, and applies bulk delete, archive and unsubscribe
//! actions back against the provider.
//!
//! # Overview
//!
//! - **Requests**: every provider call goes through a retrying requester that
//!   honors `Retry-After` and backs off with jitter on 429/503
//! - **Providers**: one [`ProviderClient`] trait, a Gmail and a Graph variant
//! - **Batching**: chunked fetch/mutate with per-item outcomes and pacing
//! - **Delta sync**: full pass once, then incremental pulls from an opaque cursor
//! - **Aggregation**: deterministic per-sender stats, newest unsubscribe link wins
//!
//! # Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use sender_sweep::{auth::StaticTokenProvider, config::Config, provider, store::JsonFileStore};
//! use sender_sweep::requester::{RateLimitedRequester, RetryPolicy};
//! use sender_sweep::SyncEngine;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!
//!     let tokens = Arc::new(StaticTokenProvider::new("access-token"));
//!     let requester = RateLimitedRequester::new(
//!         tokens,
//!         RetryPolicy::from_config(&config.retry),
//!         &config.http,
//!     )?;
//!     let provider = provider::build_provider(&config, requester);
//!     let store = Arc::new(JsonFileStore::open(&config.sync.store_path).await?);
//!
//!     let mut engine = SyncEngine::new(provider, store.clone(), store, &config).await?;
//!     let report = engine.run(false).await?;
//!     println!("{} senders updated", report.senders_updated);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`requester`] - HTTP calls with retry, backoff and jitter
//! - [`provider`] - Gmail and Graph clients behind one trait
//! - [`batch`] - chunked batch fetch and mutation
//! - [`delta`] - full/incremental sync state machine
//! - [`unsubscribe`] - `List-Unsubscribe` header extraction
//! - [`aggregator`] - per-sender statistics
//! - [`bulk`] - delete/archive/unsubscribe execution
//! - [`store`] - cursor and stats persistence
//! - [`scanner`] - inbox page stream for full syncs
//! - [`engine`] - end-to-end sync orchestration
//! - [`cli`] - command-line interface

pub mod aggregator;
pub mod auth;
pub mod batch;
pub mod bulk;
pub mod cli;
pub mod config;
pub mod delta;
pub mod engine;
pub mod error;
pub mod models;
pub mod provider;
pub mod requester;
pub mod scanner;
pub mod store;
pub mod unsubscribe;

pub use error::{Result, SyncError};

// Core data models
pub use models::{Message, MessageRef, MutationOp, SenderKey, SenderStats, SyncCursor};

pub use aggregator::SenderAggregator;
pub use batch::{BatchFetcher, BatchOutcome};
pub use bulk::{BulkMutationExecutor, BulkMutationReport, SenderTarget, UnsubscribeOutcome};
pub use config::{Config, ProviderKind};
pub use delta::{DeltaSyncManager, SyncPhase};
pub use engine::{SyncEngine, SyncMode, SyncReport};
pub use provider::{GmailProvider, GraphProvider, ProviderClient};
pub use requester::{RateLimitedRequester, RequestDescriptor, RetryPolicy};
pub use store::{CursorStore, JsonFileStore, MemoryStore, StatsStore};
