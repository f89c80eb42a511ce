//! Folds a message stream into per-sender statistics

use std::collections::BTreeMap;
use tracing::debug;

use crate::models::{Message, SenderKey, SenderStats};

/// Sender aggregation table
///
/// Keyed by [`SenderKey`] (display name + lowercased address). Output is
/// ordered by key, so repeated runs over the same input produce identical
/// results.
#[derive(Debug, Default)]
pub struct SenderAggregator {
    senders: BTreeMap<SenderKey, SenderStats>,
    skipped: usize,
}

impl SenderAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one message into its sender's statistics
    pub fn fold(&mut self, message: &Message) {
        if !message.has_usable_sender() {
            self.skipped += 1;
            debug!("Skipping message {} without usable sender", message.id);
            return;
        }

        let key = message.sender_key();
        let date = message.received_at;
        let stats = self
            .senders
            .entry(key.clone())
            .or_insert_with(|| SenderStats::new(key, date));

        stats.count += 1;
        stats.message_ids.push(message.id.clone());
        if !message.is_read {
            stats.unread_count += 1;
            stats.unread_ids.push(message.id.clone());
        }

        stats.first_date = stats.first_date.min(date);
        stats.last_date = stats.last_date.max(date);

        if let Some(link) = &message.unsubscribe.http_link {
            stats.offer_http_link(link, message.unsubscribe.one_click, date);
        }
        if let Some(link) = &message.unsubscribe.mailto_link {
            stats.offer_mailto_link(link, date);
        }

        stats.is_promotional |= message.is_promotional;
    }

    pub fn aggregate<'a, I>(&mut self, messages: I)
    where
        I: IntoIterator<Item = &'a Message>,
    {
        for message in messages {
            self.fold(message);
        }
    }

    pub fn get(&self, key: &SenderKey) -> Option<&SenderStats> {
        self.senders.get(key)
    }

    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }

    /// Messages skipped for lacking a usable sender address
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn into_stats(self) -> Vec<SenderStats> {
        self.senders.into_values().collect()
    }
}

/// Aggregate a slice in one call
pub fn aggregate_messages(messages: &[Message]) -> (Vec<SenderStats>, usize) {
    let mut aggregator = SenderAggregator::new();
    aggregator.aggregate(messages);
    let skipped = aggregator.skipped();
    (aggregator.into_stats(), skipped)
}
