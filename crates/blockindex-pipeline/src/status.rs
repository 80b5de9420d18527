//! Periodic indexing progress reports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use blockindex_core::error::IndexerError;
use blockindex_core::events::{IndexStatus, IndexerEvent};

use crate::engine::Indexer;

/// Computes [`IndexStatus`] and publishes it on the indexer's event bus.
///
/// Readiness is one-way: once reported ready, the process stays ready.
pub struct StatusReporter {
    indexer: Arc<Indexer>,
    ready: AtomicBool,
}

impl StatusReporter {
    pub fn new(indexer: Arc<Indexer>) -> Self {
        Self {
            indexer,
            ready: AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Current progress. Read only.
    pub async fn compute(&self) -> Result<IndexStatus, IndexerError> {
        let current = self.indexer.current_height().await?;
        let genesis = self.indexer.genesis_height().await?;
        let store = self.indexer.store();

        let chain_length = if current >= genesis {
            (current - genesis).saturating_add(1)
        } else {
            0
        };
        let indexed_count = if chain_length > 0 {
            store.count_blocks(genesis, current).await?
        } else {
            0
        };
        let last_indexed_height = store.max_height().await?;
        let percentage = if chain_length == 0 {
            0.0
        } else {
            (indexed_count as f64 * 10_000.0 / chain_length as f64).round() / 100.0
        };
        let lag = self.indexer.config().readiness_lag;

        Ok(IndexStatus {
            genesis_height: genesis,
            current_chain_height: current,
            last_indexed_height,
            indexed_count,
            chain_length,
            percentage,
            is_ready: self.is_ready()
                || (chain_length > 0 && indexed_count.saturating_add(lag) >= chain_length),
        })
    }

    /// Compute the status and publish `IndexStatUpdate`,
    /// `NumJobsInProgressUpdate`, and the first `BlockIndexReady`.
    pub async fn report(&self) -> Result<IndexStatus, IndexerError> {
        let status = self.compute().await?;
        let events = self.indexer.events();

        if status.is_ready && !self.ready.swap(true, Ordering::SeqCst) {
            info!(
                indexed = status.indexed_count,
                chain_length = status.chain_length,
                "block index ready"
            );
            events.emit(IndexerEvent::BlockIndexReady(status.clone()));
        }
        events.emit(IndexerEvent::IndexStatUpdate(status.clone()));
        events.emit(IndexerEvent::NumJobsInProgressUpdate(
            self.indexer.queues().counts(),
        ));
        Ok(status)
    }

    /// Report every `interval` until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.report().await {
                        warn!(error = %e, "status report failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
    }
}
