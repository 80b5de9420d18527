//! Job payloads of the named queues, and the queue set owned by the engine.

use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

use blockindex_core::config::{
    QueuesConfig, ACCOUNT_BALANCE_QUEUE, DELETE_BLOCKS_QUEUE, INDEX_BLOCKS_QUEUE,
    UPDATE_FINALITY_QUEUE,
};
use blockindex_core::events::JobCounts;
use blockindex_core::schema::BlockRow;
use blockindex_core::types::Block;

use crate::engine::Indexer;
use crate::queue::{QueueRunner, WorkQueue};

/// Index one block, either already fetched or by height.
#[derive(Debug, Clone)]
pub enum IndexJob {
    Block(Box<Block>),
    Height(u64),
}

impl fmt::Display for IndexJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block(block) => write!(f, "index block {} at {}", block.id(), block.height()),
            Self::Height(height) => write!(f, "index height {height}"),
        }
    }
}

/// Flip a batch of blocks to final.
#[derive(Debug, Clone)]
pub struct FinalityJob {
    pub block_ids: Vec<String>,
}

impl fmt::Display for FinalityJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "finalize {} blocks", self.block_ids.len())
    }
}

/// Revert and remove indexed blocks.
#[derive(Debug, Clone)]
pub struct DeleteJob {
    pub blocks: Vec<BlockRow>,
}

impl fmt::Display for DeleteJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.blocks.first(), self.blocks.last()) {
            (Some(first), Some(last)) => write!(
                f,
                "delete {} blocks ({}..={})",
                self.blocks.len(),
                first.height,
                last.height
            ),
            _ => write!(f, "delete 0 blocks"),
        }
    }
}

/// Refresh the token balances of one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceJob {
    pub address: String,
}

impl fmt::Display for BalanceJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "refresh balances of {}", self.address)
    }
}

/// Producer handles of every named queue.
#[derive(Clone)]
pub struct Queues {
    pub index_blocks: WorkQueue<IndexJob>,
    pub update_finality: WorkQueue<FinalityJob>,
    pub delete_blocks: WorkQueue<DeleteJob>,
    pub account_balance: WorkQueue<BalanceJob>,
}

/// Consumer halves of [`Queues`], spawned once the engine exists.
pub struct QueueRunners {
    index_blocks: QueueRunner<IndexJob>,
    update_finality: QueueRunner<FinalityJob>,
    delete_blocks: QueueRunner<DeleteJob>,
    account_balance: QueueRunner<BalanceJob>,
}

impl Queues {
    pub fn new(config: &QueuesConfig) -> (Self, QueueRunners) {
        let mut config = config.clone();
        for name in config.serialize_block_mutations() {
            warn!(queue = name, "block-mutating queue clamped to one worker");
        }
        let (index_blocks, index_runner) =
            WorkQueue::new(INDEX_BLOCKS_QUEUE, config.index_blocks.clone());
        let (update_finality, finality_runner) =
            WorkQueue::new(UPDATE_FINALITY_QUEUE, config.update_finality.clone());
        let (delete_blocks, delete_runner) =
            WorkQueue::new(DELETE_BLOCKS_QUEUE, config.delete_blocks.clone());
        let (account_balance, balance_runner) =
            WorkQueue::new(ACCOUNT_BALANCE_QUEUE, config.account_balance.clone());
        (
            Self {
                index_blocks,
                update_finality,
                delete_blocks,
                account_balance,
            },
            QueueRunners {
                index_blocks: index_runner,
                update_finality: finality_runner,
                delete_blocks: delete_runner,
                account_balance: balance_runner,
            },
        )
    }

    /// Counters of every queue, in a fixed order.
    pub fn counts(&self) -> Vec<JobCounts> {
        vec![
            self.index_blocks.counts(),
            self.update_finality.counts(),
            self.delete_blocks.counts(),
            self.account_balance.counts(),
        ]
    }

    /// Resolve once every queue is idle at the same time.
    pub async fn wait_idle(&self) {
        loop {
            self.index_blocks.wait_idle().await;
            self.update_finality.wait_idle().await;
            self.delete_blocks.wait_idle().await;
            self.account_balance.wait_idle().await;
            if self.is_idle() {
                return;
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        self.index_blocks.is_idle()
            && self.update_finality.is_idle()
            && self.delete_blocks.is_idle()
            && self.account_balance.is_idle()
    }

    pub fn close(&self) {
        self.index_blocks.close();
        self.update_finality.close();
        self.delete_blocks.close();
        self.account_balance.close();
    }
}

impl QueueRunners {
    /// Start the workers of every queue, all handled by `indexer`.
    pub fn spawn(self, indexer: Arc<Indexer>) -> Vec<JoinHandle<()>> {
        let mut workers = self.index_blocks.spawn(Arc::clone(&indexer));
        workers.extend(self.update_finality.spawn(Arc::clone(&indexer)));
        workers.extend(self.delete_blocks.spawn(Arc::clone(&indexer)));
        workers.extend(self.account_balance.spawn(indexer));
        workers
    }
}
