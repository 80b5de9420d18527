//! Indexer configuration and state types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name of the queue that indexes blocks.
pub const INDEX_BLOCKS_QUEUE: &str = "indexBlocksQueue";
/// Name of the queue that flips blocks to final.
pub const UPDATE_FINALITY_QUEUE: &str = "updateBlockFinalityQueue";
/// Name of the queue that removes forked blocks.
pub const DELETE_BLOCKS_QUEUE: &str = "deleteIndexedBlocksQueue";
/// Name of the queue that refreshes account balances.
pub const ACCOUNT_BALANCE_QUEUE: &str = "updateAccountBalanceQueue";

/// Settings of one work queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Maximum number of jobs executing at once.
    pub concurrency: usize,
    /// Maximum number of waiting jobs before `enqueue` applies backpressure.
    pub capacity: usize,
    /// Attempts per job, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry (milliseconds); doubles per attempt.
    pub backoff_ms: u64,
    /// Upper bound of the retry delay (milliseconds).
    pub max_backoff_ms: u64,
}

impl QueueSettings {
    /// Settings for a queue that serializes block mutations.
    pub fn serial() -> Self {
        Self::default()
    }

    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            capacity: 100_000,
            max_attempts: 5,
            backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

/// Settings for every named queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    pub index_blocks: QueueSettings,
    pub update_finality: QueueSettings,
    pub delete_blocks: QueueSettings,
    pub account_balance: QueueSettings,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            index_blocks: QueueSettings::serial(),
            update_finality: QueueSettings::serial(),
            delete_blocks: QueueSettings::serial(),
            account_balance: QueueSettings::with_concurrency(10),
        }
    }
}

impl QueuesConfig {
    /// The queues that mutate block rows, with their names.
    fn block_mutation_queues(&mut self) -> [(&'static str, &mut QueueSettings); 3] {
        [
            (INDEX_BLOCKS_QUEUE, &mut self.index_blocks),
            (UPDATE_FINALITY_QUEUE, &mut self.update_finality),
            (DELETE_BLOCKS_QUEUE, &mut self.delete_blocks),
        ]
    }

    /// Fails on the first block-mutating queue configured with more than one worker.
    pub fn check_serial(&self) -> Result<(), String> {
        for (name, settings) in [
            (INDEX_BLOCKS_QUEUE, &self.index_blocks),
            (UPDATE_FINALITY_QUEUE, &self.update_finality),
            (DELETE_BLOCKS_QUEUE, &self.delete_blocks),
        ] {
            if settings.concurrency > 1 {
                return Err(format!(
                    "{name} must run with concurrency 1, got {}",
                    settings.concurrency
                ));
            }
        }
        Ok(())
    }

    /// Force the block-mutating queues down to one worker. Returns the names
    /// of the queues that were changed.
    pub fn serialize_block_mutations(&mut self) -> Vec<&'static str> {
        let mut clamped = Vec::new();
        for (name, settings) in self.block_mutation_queues() {
            if settings.concurrency > 1 {
                settings.concurrency = 1;
                clamped.push(name);
            }
        }
        clamped
    }
}

/// Configuration for an indexer instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Chain to index (used in log fields).
    pub chain: String,
    pub queues: QueuesConfig,
    /// Maximum number of blocks flipped to final per finality job.
    pub finality_batch_limit: u32,
    /// Below this many indexed rows a range is reported missing as a whole.
    pub gap_bootstrap_threshold: u64,
    /// Heights enqueued per backfill page.
    pub backfill_page_size: u64,
    /// Upper bound of heights enqueued by one missing-blocks run.
    pub max_missing_blocks_per_run: u64,
    /// Status broadcast interval (seconds).
    pub status_interval_secs: u64,
    /// How many blocks the index may trail the tip and still count as ready.
    pub readiness_lag: u64,
    /// Capacity of the notification broadcast channel.
    pub event_capacity: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chain: "mainnet".into(),
            queues: QueuesConfig::default(),
            finality_batch_limit: 1000,
            gap_bootstrap_threshold: 3,
            backfill_page_size: 1,
            max_missing_blocks_per_run: 10_000,
            status_interval_secs: 15,
            readiness_lag: 1,
            event_capacity: 1024,
        }
    }
}

impl IndexerConfig {
    /// Apply `BLOCKINDEX_*` environment overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(chain) = std::env::var("BLOCKINDEX_CHAIN") {
            self.chain = chain;
        }
        override_from_env("BLOCKINDEX_FINALITY_BATCH_LIMIT", &mut self.finality_batch_limit);
        override_from_env("BLOCKINDEX_GAP_BOOTSTRAP_THRESHOLD", &mut self.gap_bootstrap_threshold);
        override_from_env("BLOCKINDEX_BACKFILL_PAGE_SIZE", &mut self.backfill_page_size);
        override_from_env(
            "BLOCKINDEX_MAX_MISSING_BLOCKS_PER_RUN",
            &mut self.max_missing_blocks_per_run,
        );
        override_from_env("BLOCKINDEX_STATUS_INTERVAL_SECS", &mut self.status_interval_secs);
        override_from_env("BLOCKINDEX_READINESS_LAG", &mut self.readiness_lag);
        override_from_env(
            "BLOCKINDEX_BALANCE_QUEUE_CONCURRENCY",
            &mut self.queues.account_balance.concurrency,
        );
        self
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }
}

fn override_from_env<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Some(value) = std::env::var(key).ok().and_then(|s| s.parse().ok()) {
        *target = value;
    }
}

/// Runtime state of the indexer service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Not yet started.
    Idle,
    /// Catching up on missing heights.
    Backfilling,
    /// Following the chain tip.
    Live,
    /// Shutting down gracefully.
    Stopping,
    /// Terminated.
    Stopped,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Backfilling => write!(f, "backfilling"),
            Self::Live => write!(f, "live"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
