//! Chunked, paced execution of per-message provider calls

use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::BatchConfig;
use crate::error::{Result, SyncError};
use crate::models::{BatchJob, BatchOperation, Message, MutationOp};
use crate::provider::{mutate_one, ItemResults, ProviderClient};

/// One item that did not succeed
#[derive(Debug)]
pub struct ItemFailure {
    pub id: String,
    pub error: SyncError,
}

/// Union of per-item outcomes across all chunks
#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub succeeded: Vec<(String, T)>,
    pub failures: Vec<ItemFailure>,
    pub chunks: usize,
}

impl<T> Default for BatchOutcome<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failures: Vec::new(),
            chunks: 0,
        }
    }
}

impl<T> BatchOutcome<T> {
    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.id.as_str()).collect()
    }

    pub fn values(self) -> Vec<T> {
        self.succeeded.into_iter().map(|(_, v)| v).collect()
    }
}

/// Run `op` for every id with at most `concurrency` in flight
///
/// Every id resolves to its own result; one failure never cancels the rest.
/// Completion order is not preserved.
pub async fn fan_out<T, F, Fut>(ids: &[String], concurrency: usize, op: F) -> ItemResults<T>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    stream::iter(ids.iter().cloned())
        .map(|id| {
            let call = op(id.clone());
            async move { (id, call.await) }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await
}

/// Splits id lists into provider-sized chunks and runs them one after another
#[derive(Clone)]
pub struct BatchFetcher {
    provider: Arc<dyn ProviderClient>,
    chunk_size: usize,
    concurrency: usize,
    inter_batch_delay: Duration,
}

impl BatchFetcher {
    pub fn new(provider: Arc<dyn ProviderClient>, config: &BatchConfig) -> Self {
        let chunk_size = config
            .chunk_size_for(provider.kind())
            .min(provider.batch_limit());
        Self::with_limits(
            provider,
            chunk_size,
            config.max_concurrency,
            config.inter_batch_delay(),
        )
    }

    pub fn with_limits(
        provider: Arc<dyn ProviderClient>,
        chunk_size: usize,
        concurrency: usize,
        inter_batch_delay: Duration,
    ) -> Self {
        Self {
            provider,
            chunk_size: chunk_size.max(1),
            concurrency: concurrency.max(1),
            inter_batch_delay,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Enrich ids with full message headers
    pub async fn fetch_messages(&self, ids: Vec<String>) -> Result<BatchOutcome<Message>> {
        let job = BatchJob::new(ids, BatchOperation::FetchHeaders, self.chunk_size);
        let provider = self.provider.clone();
        let multiplexed = provider.supports_multiplexing();
        let concurrency = self.concurrency;

        self.run(&job, |chunk| {
            let provider = provider.clone();
            async move {
                if multiplexed {
                    provider.batch_get_messages(&chunk).await
                } else {
                    fan_out(&chunk, concurrency, |id| {
                        let provider = provider.clone();
                        async move { provider.get_message_with_headers(&id).await }
                    })
                    .await
                }
            }
        })
        .await
    }

    /// Apply `op` to every id
    pub async fn mutate(&self, ids: Vec<String>, op: MutationOp) -> Result<BatchOutcome<()>> {
        let job = BatchJob::new(ids, BatchOperation::Mutate(op), self.chunk_size);
        let provider = self.provider.clone();
        let multiplexed = provider.supports_multiplexing();
        let concurrency = self.concurrency;

        self.run(&job, |chunk| {
            let provider = provider.clone();
            async move {
                if multiplexed {
                    provider.batch_mutate(&chunk, op).await
                } else {
                    fan_out(&chunk, concurrency, |id| {
                        let provider = provider.clone();
                        async move { mutate_one(provider.as_ref(), &id, op).await }
                    })
                    .await
                }
            }
        })
        .await
    }

    /// Run `execute` once per chunk, sequentially, pausing between chunks
    ///
    /// Item failures are collected; a systemic failure aborts the run.
    pub async fn run<T, F, Fut>(&self, job: &BatchJob, mut execute: F) -> Result<BatchOutcome<T>>
    where
        F: FnMut(Vec<String>) -> Fut,
        Fut: Future<Output = ItemResults<T>>,
    {
        let total_chunks = job.chunk_count();
        let mut outcome = BatchOutcome::default();

        info!(
            "Running {:?} over {} ids in {} chunks of up to {}",
            job.operation,
            job.ids.len(),
            total_chunks,
            job.chunk_size
        );

        for (index, chunk) in job.chunks().enumerate() {
            if index > 0 && !self.inter_batch_delay.is_zero() {
                tokio::time::sleep(self.inter_batch_delay).await;
            }

            debug!("Chunk {}/{}: {} ids", index + 1, total_chunks, chunk.len());
            let results = execute(chunk.to_vec()).await;
            outcome.chunks += 1;

            for (id, result) in results {
                match result {
                    Ok(value) => outcome.succeeded.push((id, value)),
                    Err(e) if e.is_systemic() => {
                        warn!("Aborting batch after systemic failure on {}: {}", id, e);
                        return Err(e);
                    }
                    Err(e) => {
                        warn!("Item {} failed: {}", id, e);
                        outcome.failures.push(ItemFailure { id, error: e });
                    }
                }
            }
        }

        if outcome.failure_count() > 0 {
            warn!(
                "Batch finished with {} succeeded, {} failed",
                outcome.success_count(),
                outcome.failure_count()
            );
        } else {
            info!("Batch finished: {} succeeded", outcome.success_count());
        }

        Ok(outcome)
    }
}
