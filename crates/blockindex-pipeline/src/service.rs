//! The indexer service: queue workers, status loop, and the notification loop.
//!
//! # Phase 1: BACKFILL
//! Register genesis on first start, enqueue every missing height between the
//! verified height and the chain tip, and promote finalized blocks.
//!
//! # Phase 2: LIVE
//! Consume chain notifications until the stream closes:
//!   - `NewBlock` → ingestion decision (index, skip, fork repair)
//!   - `ChainNewBlock` → finality promotion
//!   - `DeleteBlock` → deletion of the block and its descendants

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use blockindex_core::config::IndexerState;
use blockindex_core::error::IndexerError;
use blockindex_core::events::ChainNotification;

use crate::engine::Indexer;
use crate::jobs::QueueRunners;
use crate::status::StatusReporter;

/// Runs an [`Indexer`] against a stream of chain notifications.
pub struct IndexerService {
    indexer: Arc<Indexer>,
    reporter: Arc<StatusReporter>,
    runners: Option<QueueRunners>,
    workers: Vec<JoinHandle<()>>,
    status_task: Option<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    state: IndexerState,
}

impl IndexerService {
    pub fn new(indexer: Arc<Indexer>, runners: QueueRunners) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            reporter: Arc::new(StatusReporter::new(Arc::clone(&indexer))),
            indexer,
            runners: Some(runners),
            workers: Vec::new(),
            status_task: None,
            shutdown,
            state: IndexerState::Idle,
        }
    }

    pub fn indexer(&self) -> &Arc<Indexer> {
        &self.indexer
    }

    pub fn reporter(&self) -> &Arc<StatusReporter> {
        &self.reporter
    }

    pub fn state(&self) -> IndexerState {
        self.state
    }

    /// Spawn the queue workers and the status loop. Idempotent.
    pub fn start(&mut self) {
        let Some(runners) = self.runners.take() else {
            return;
        };
        self.workers = runners.spawn(Arc::clone(&self.indexer));
        let interval = self.indexer.config().status_interval();
        self.status_task = Some(tokio::spawn(
            Arc::clone(&self.reporter).run(interval, self.shutdown.subscribe()),
        ));
        info!(
            chain = %self.indexer.config().chain,
            workers = self.workers.len(),
            "indexer started"
        );
    }

    /// Register genesis if needed and enqueue the missing heights.
    /// Returns the number of heights enqueued.
    pub async fn bootstrap(&mut self) -> Result<u64, IndexerError> {
        self.state = IndexerState::Backfilling;
        if self.indexer.metadata().genesis_height().await?.is_none() {
            let genesis = self.indexer.connector().get_node_info().await?.genesis_height;
            self.indexer.index_genesis(genesis).await?;
        }
        let enqueued = self.indexer.index_missing_blocks().await?;
        self.indexer.refresh_finality().await?;
        info!(enqueued, "backfill phase started");
        Ok(enqueued)
    }

    /// Dispatch one chain notification.
    pub async fn handle_notification(
        &self,
        notification: ChainNotification,
    ) -> Result<(), IndexerError> {
        match notification {
            ChainNotification::NewBlock(block) => {
                let height = block.height();
                let decision = self.indexer.index_new_block(*block).await?;
                debug!(height, %decision, "new block handled");
                Ok(())
            }
            ChainNotification::ChainNewBlock { height } => {
                debug!(height, "chain tip moved");
                self.indexer.refresh_finality().await.map(|_| ())
            }
            ChainNotification::DeleteBlock(header) => {
                self.indexer.delete_block(&header).await.map(|_| ())
            }
        }
    }

    /// Start, backfill, then follow `notifications` until the stream closes.
    /// Outstanding jobs are drained before the service stops.
    pub async fn run(
        &mut self,
        mut notifications: mpsc::Receiver<ChainNotification>,
    ) -> Result<(), IndexerError> {
        self.start();
        self.bootstrap().await?;
        self.state = IndexerState::Live;

        while let Some(notification) = notifications.recv().await {
            if let Err(e) = self.handle_notification(notification).await {
                if e.is_retryable() {
                    warn!(error = %e, "notification handling failed");
                } else {
                    error!(error = %e, "notification rejected");
                }
            }
        }

        info!("notification stream closed, draining queues");
        self.wait_idle().await;
        self.shutdown().await;
        Ok(())
    }

    /// Resolve once every queue is idle.
    pub async fn wait_idle(&self) {
        self.indexer.queues().wait_idle().await;
    }

    /// Close the queues, stop the status loop, and wait for the workers.
    pub async fn shutdown(&mut self) {
        self.state = IndexerState::Stopping;
        self.indexer.queues().close();
        let _ = self.shutdown.send(true);

        for result in join_all(self.workers.drain(..)).await {
            if let Err(e) = result {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
        if let Some(task) = self.status_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "status task ended abnormally");
            }
        }
        self.state = IndexerState::Stopped;
        info!("indexer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::IndexerBuilder;
    use crate::test_support::*;
    use blockindex_core::connector::MemoryConnector;
    use blockindex_core::types::{GenesisValidator, ValidatorStake};

    #[tokio::test]
    async fn run_backfills_then_follows_notifications() {
        let connector = Arc::new(MemoryConnector::new());
        connector.set_genesis(
            vec![GenesisValidator {
                address: GENERATOR.into(),
                name: "genesis_0".into(),
            }],
            vec![],
        );
        connector.set_validator_stake(
            GENERATOR,
            ValidatorStake {
                commission: 0,
                self_stake: 1,
                total_stake: 1,
            },
        );
        for height in 0..=4 {
            connector.push_block(block(height, &format!("b{height}"), vec![]));
        }

        let mut service = IndexerBuilder::new()
            .effect(Arc::new(Transfers))
            .connector(connector.clone())
            .build()
            .unwrap();
        let indexer = Arc::clone(service.indexer());
        assert_eq!(service.state(), IndexerState::Idle);

        let (tx, rx) = mpsc::channel(8);
        let next = block(5, "b5", vec![transfer("t1", "alice", 9)]);
        connector.push_block(next.clone());
        tx.send(ChainNotification::NewBlock(Box::new(next)))
            .await
            .unwrap();
        drop(tx);

        service.run(rx).await.unwrap();
        assert_eq!(service.state(), IndexerState::Stopped);

        let store = indexer.store();
        assert_eq!(store.count_blocks(0, 5).await.unwrap(), 6);
        assert_eq!(credited(store.as_ref(), "alice").await, 9);
        let validator = store.validator(GENERATOR).await.unwrap().unwrap();
        assert_eq!(validator.name, "genesis_0");
        assert_eq!(validator.generated_blocks, 6);
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_fails() {
        let mut service = IndexerBuilder::new()
            .connector(Arc::new(MemoryConnector::new()))
            .build()
            .unwrap();
        service.start();
        service.shutdown().await;
        let err = service
            .indexer()
            .index_new_block(block(1, "b1", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::QueueClosed(_)));
    }
}
