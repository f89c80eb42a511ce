//! Inbox enumeration for full synchronization

use async_stream::stream;
use futures::stream::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::{MessageRef, PageOptions};
use crate::provider::ProviderClient;

/// One inbox page and its position in the scan
#[derive(Debug, Clone)]
pub struct ScanPage {
    pub messages: Vec<MessageRef>,
    /// 1-based page number
    pub number: usize,
    /// Messages listed so far, this page included
    pub messages_seen: usize,
}

impl ScanPage {
    pub fn ids(&self) -> Vec<String> {
        self.messages.iter().map(|m| m.id.clone()).collect()
    }
}

pub struct InboxScanner {
    provider: Arc<dyn ProviderClient>,
    page_size: Option<u32>,
}

impl InboxScanner {
    pub fn new(provider: Arc<dyn ProviderClient>, page_size: Option<u32>) -> Self {
        Self {
            provider,
            page_size,
        }
    }

    /// Stream inbox pages, following each page's continuation handle
    ///
    /// The stream ends after the last page, or right after yielding the
    /// first error. Dropping it stops the scan; pages already yielded stay
    /// valid.
    pub fn pages(&self) -> Pin<Box<dyn Stream<Item = Result<ScanPage>> + Send + '_>> {
        Box::pin(stream! {
            let mut number = 0;
            let mut messages_seen = 0;
            let mut next_page: Option<String> = None;
            info!("Starting inbox scan");

            loop {
                let options = PageOptions {
                    page_size: self.page_size,
                    continuation: next_page.take(),
                };

                match self.provider.list_inbox(&options).await {
                    Ok(page) => {
                        number += 1;
                        messages_seen += page.messages.len();
                        next_page = page.next_page;
                        debug!(
                            "Inbox page {}: {} messages (total {})",
                            number,
                            page.messages.len(),
                            messages_seen
                        );

                        let done = next_page.is_none();
                        yield Ok(ScanPage {
                            messages: page.messages,
                            number,
                            messages_seen,
                        });

                        if done {
                            info!(
                                "Inbox scan complete: {} messages in {} pages",
                                messages_seen, number
                            );
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Error listing inbox page {}: {}", number + 1, e);
                        yield Err(e);
                        break;
                    }
                }
            }
        })
    }
}
