//! Fluent builder API for creating indexers.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use blockindex_core::MemoryConnector;
//! use blockindex_pipeline::IndexerBuilder;
//!
//! let service = IndexerBuilder::new()
//!     .chain("testnet")
//!     .finality_batch_limit(500)
//!     .gap_bootstrap_threshold(10)
//!     .connector(Arc::new(MemoryConnector::new()))
//!     .build()
//!     .expect("connector is set");
//! ```

use std::sync::Arc;

use blockindex_core::config::{IndexerConfig, QueuesConfig};
use blockindex_core::connector::ChainConnector;
use blockindex_core::error::IndexerError;
use blockindex_core::module::{ModuleEffect, ModuleRegistry};
use blockindex_core::store::IndexStore;
use blockindex_storage::MemoryStore;

use crate::engine::Indexer;
use crate::service::IndexerService;

/// Fluent builder for [`IndexerConfig`] and [`IndexerService`].
pub struct IndexerBuilder {
    config: IndexerConfig,
    store: Option<Arc<dyn IndexStore>>,
    connector: Option<Arc<dyn ChainConnector>>,
    registry: ModuleRegistry,
}

impl Default for IndexerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self {
            config: IndexerConfig::default(),
            store: None,
            connector: None,
            registry: ModuleRegistry::new(),
        }
    }

    /// Start from an existing configuration.
    pub fn config(mut self, config: IndexerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the chain name (used in logs).
    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.config.chain = chain.into();
        self
    }

    /// Replace the settings of every named queue.
    pub fn queues(mut self, queues: QueuesConfig) -> Self {
        self.config.queues = queues;
        self
    }

    /// Number of concurrent balance refresh workers.
    pub fn balance_concurrency(mut self, workers: usize) -> Self {
        self.config.queues.account_balance.concurrency = workers;
        self
    }

    /// Set the maximum number of blocks promoted to final per job.
    pub fn finality_batch_limit(mut self, limit: u32) -> Self {
        self.config.finality_batch_limit = limit;
        self
    }

    /// Below this many indexed blocks a range is reported missing as a whole.
    pub fn gap_bootstrap_threshold(mut self, threshold: u64) -> Self {
        self.config.gap_bootstrap_threshold = threshold;
        self
    }

    /// Set the number of heights per backfill page.
    pub fn backfill_page_size(mut self, size: u64) -> Self {
        self.config.backfill_page_size = size;
        self
    }

    pub fn max_missing_blocks_per_run(mut self, limit: u64) -> Self {
        self.config.max_missing_blocks_per_run = limit;
        self
    }

    /// Set the status report interval in seconds.
    pub fn status_interval_secs(mut self, secs: u64) -> Self {
        self.config.status_interval_secs = secs;
        self
    }

    pub fn readiness_lag(mut self, lag: u64) -> Self {
        self.config.readiness_lag = lag;
        self
    }

    /// Set the relational store. Defaults to an in-memory store.
    pub fn store(mut self, store: Arc<dyn IndexStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the node connector. Required by [`build`](Self::build).
    pub fn connector(mut self, connector: Arc<dyn ChainConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Register a module effect.
    pub fn effect(mut self, effect: Arc<dyn ModuleEffect>) -> Self {
        self.registry.register(effect);
        self
    }

    /// Build the `IndexerConfig`.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Build the engine and its service, without starting anything.
    pub fn build(self) -> Result<IndexerService, IndexerError> {
        self.config.queues.check_serial().map_err(IndexerError::Other)?;
        let connector = self
            .connector
            .ok_or_else(|| IndexerError::Other("indexer builder requires a connector".into()))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        tracing::debug!(
            chain = %self.config.chain,
            effects = self.registry.len(),
            "building indexer"
        );
        let (indexer, runners) =
            Indexer::new(self.config, store, connector, Arc::new(self.registry));
        Ok(IndexerService::new(indexer, runners))
    }
}
