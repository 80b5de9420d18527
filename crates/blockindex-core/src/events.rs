//! Notifications emitted by the indexer, and the chain notifications it consumes.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::schema::TransactionRow;
use crate::types::{Block, BlockHeader};

/// Indexing progress snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStatus {
    pub genesis_height: u64,
    pub current_chain_height: u64,
    /// Highest indexed height; `None` while nothing is indexed.
    pub last_indexed_height: Option<u64>,
    pub indexed_count: u64,
    pub chain_length: u64,
    /// `indexed_count / chain_length * 100`, two decimals.
    pub percentage: f64,
    pub is_ready: bool,
}

/// Job counters of one work queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    pub queue: String,
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
}

/// Events published on the [`EventBus`].
#[derive(Debug, Clone)]
pub enum IndexerEvent {
    /// Transactions whose effects were reverted and rows removed.
    DeleteTransactions(Vec<TransactionRow>),
    /// Periodic progress report.
    IndexStatUpdate(IndexStatus),
    /// The index caught up with the chain. Emitted once per process.
    BlockIndexReady(IndexStatus),
    /// Periodic queue statistics.
    NumJobsInProgressUpdate(Vec<JobCounts>),
}

impl IndexerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeleteTransactions(_) => "deleteTransactions",
            Self::IndexStatUpdate(_) => "indexStatUpdate",
            Self::BlockIndexReady(_) => "blockIndexReady",
            Self::NumJobsInProgressUpdate(_) => "numJobsInProgressUpdate",
        }
    }
}

/// Fan-out channel for [`IndexerEvent`]s. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IndexerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexerEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: IndexerEvent) {
        let name = event.name();
        match self.tx.send(event) {
            Ok(receivers) => tracing::trace!(event = name, receivers, "event emitted"),
            Err(_) => tracing::trace!(event = name, "event dropped, no subscribers"),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Signals from the node's notification stream.
#[derive(Debug, Clone)]
pub enum ChainNotification {
    /// A block was appended to the node's chain.
    NewBlock(Box<Block>),
    /// The node's tip moved; finalized height may have advanced.
    ChainNewBlock { height: u64 },
    /// The node removed a block from its chain.
    DeleteBlock(BlockHeader),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(IndexerEvent::BlockIndexReady(IndexStatus::default()));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.name(), "blockIndexReady");
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        EventBus::default().emit(IndexerEvent::DeleteTransactions(vec![]));
    }
}
